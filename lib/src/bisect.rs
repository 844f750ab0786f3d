// Copyright 2023 The Mtn Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bisection: selecting the next revision to test from good/bad/skip
//! marks. The search presupposes a good-to-bad transition: the search
//! set is the descendants of the good revisions intersected with the
//! ancestors of the bad ones.

use std::collections::BTreeSet;

use crate::ancestry;
use crate::ancestry::GraphLoader;
use crate::database::Database;
use crate::database::DbResult;
use crate::object_id::RevisionId;

/// Tag of one persisted bisect entry. `Update` is only used in memory,
/// to re-run selection against the current state; it is never written to
/// the bisect file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BisectType {
    Start,
    Good,
    Bad,
    Skipped,
    Update,
}

impl BisectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Skipped => "skip",
            Self::Update => unreachable!("the update tag is never persisted"),
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "good" => Some(Self::Good),
            "bad" => Some(Self::Bad),
            "skip" => Some(Self::Skipped),
            _ => None,
        }
    }
}

pub type BisectEntry = (BisectType, RevisionId);

/// Outcome of a selection round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BisectSelection {
    /// Not enough marks yet to bound the search.
    Incomplete {
        good: usize,
        bad: usize,
        skipped: usize,
    },
    /// Update to this revision and test it.
    Update {
        rid: RevisionId,
        remaining: usize,
    },
    /// The search has converged on the first bad revision.
    Finished { first_bad: RevisionId },
}

/// Picks the next revision to test: the toposort midpoint of the
/// remaining search set, after removing known-good ancestors, known-bad
/// descendants, skips, and the currently checked-out revision.
pub fn select_bisect_target(
    db: &Database,
    entries: &[BisectEntry],
    current_id: &RevisionId,
) -> DbResult<BisectSelection> {
    let loader = GraphLoader::new(db);

    let mut good = BTreeSet::new();
    let mut bad = BTreeSet::new();
    let mut skipped = BTreeSet::new();
    for (tag, rid) in entries {
        match tag {
            // start is only used by reset, after bisection is complete
            BisectType::Start | BisectType::Update => {}
            BisectType::Good => {
                good.insert(rid.clone());
            }
            BisectType::Bad => {
                bad.insert(rid.clone());
            }
            BisectType::Skipped => {
                skipped.insert(rid.clone());
            }
        }
    }

    if good.is_empty() || bad.is_empty() {
        return Ok(BisectSelection::Incomplete {
            good: good.len(),
            bad: bad.len(),
            skipped: skipped.len(),
        });
    }

    // Clamp the search between the good revisions' descendants and the
    // bad revisions' ancestors.
    let mut good_descendants = good.clone();
    loader.load_descendants(&mut good_descendants)?;
    let mut bad_ancestors = bad.clone();
    loader.load_ancestors(&mut bad_ancestors)?;
    let search: BTreeSet<RevisionId> = good_descendants
        .intersection(&bad_ancestors)
        .cloned()
        .collect();

    let searchable: BTreeSet<RevisionId> = search.difference(&skipped).cloned().collect();

    let mut good_ancestors = good.clone();
    loader.load_ancestors(&mut good_ancestors)?;
    let mut bad_descendants = bad.clone();
    loader.load_descendants(&mut bad_descendants)?;

    let mut remaining: BTreeSet<RevisionId> = searchable
        .iter()
        .filter(|rid| !good_ancestors.contains(rid) && !bad_descendants.contains(rid))
        .cloned()
        .collect();

    // The current revision has been judged already; it must not be
    // chosen as the next target.
    remaining.remove(current_id);

    if remaining.is_empty() {
        // The first bad revision is the bad revision all other bad
        // revisions descend from.
        let bad_sorted = ancestry::toposort(db, &bad)?;
        let first_bad = bad_sorted.first().unwrap().clone();
        return Ok(BisectSelection::Finished { first_bad });
    }

    let candidates = ancestry::toposort(db, &remaining)?;
    Ok(BisectSelection::Update {
        rid: candidates[candidates.len() / 2].clone(),
        remaining: remaining.len(),
    })
}
