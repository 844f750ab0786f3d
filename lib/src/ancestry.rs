// Copyright 2022 The Mtn Authors
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

//! Ancestry queries over the stored revision graph, pruned by
//! rev-heights wherever a height comparison can cut a walk short.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::database::Database;
use crate::database::DbResult;
use crate::object_id::RevisionId;

/// Frontier walker over the parent/child edges.
pub struct GraphLoader<'a> {
    db: &'a Database,
}

impl<'a> GraphLoader<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn load_parents(&self, rid: &RevisionId) -> DbResult<BTreeSet<RevisionId>> {
        let mut parents = self.db.get_revision_parents(rid)?;
        parents.remove(&RevisionId::null());
        Ok(parents)
    }

    pub fn load_children(&self, rid: &RevisionId) -> DbResult<BTreeSet<RevisionId>> {
        self.db.get_revision_children(rid)
    }

    /// Extends `revs` with every ancestor of its members.
    pub fn load_ancestors(&self, revs: &mut BTreeSet<RevisionId>) -> DbResult<()> {
        self.load_closure(revs, false)
    }

    /// Extends `revs` with every descendant of its members.
    pub fn load_descendants(&self, revs: &mut BTreeSet<RevisionId>) -> DbResult<()> {
        self.load_closure(revs, true)
    }

    fn load_closure(&self, revs: &mut BTreeSet<RevisionId>, down: bool) -> DbResult<()> {
        let mut frontier: VecDeque<RevisionId> = revs.iter().cloned().collect();
        while let Some(rid) = frontier.pop_front() {
            let next = if down {
                self.load_children(&rid)?
            } else {
                self.load_parents(&rid)?
            };
            for rid in next {
                if revs.insert(rid.clone()) {
                    frontier.push_back(rid);
                }
            }
        }
        Ok(())
    }
}

/// Whether `ancestor` is a proper ancestor of `child`. Returns false for
/// equal arguments. The walk goes down from `ancestor` through children,
/// pruning any revision whose height is not below the child's.
pub fn is_ancestor(db: &Database, ancestor: &RevisionId, child: &RevisionId) -> DbResult<bool> {
    if ancestor == child {
        return Ok(false);
    }
    let child_height = db.get_rev_height(child)?;
    if db.get_rev_height(ancestor)? > child_height {
        return Ok(false);
    }

    let mut todo = vec![ancestor.clone()];
    let mut seen = BTreeSet::new();
    while let Some(anc) = todo.pop() {
        for next in db.get_revision_children(&anc)? {
            if next == *child {
                return Ok(true);
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if child_height > db.get_rev_height(&next)? {
                todo.push(next);
            }
        }
    }
    Ok(false)
}

/// Ancestry-compatible total order: ascending height, which is unique
/// per revision, so the result is deterministic.
pub fn toposort(db: &Database, revs: &BTreeSet<RevisionId>) -> DbResult<Vec<RevisionId>> {
    let mut keyed = Vec::with_capacity(revs.len());
    for rid in revs {
        keyed.push((db.get_rev_height(rid)?, rid.clone()));
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, rid)| rid).collect())
}

/// Removes from `revs` every revision that is a proper ancestor of
/// another member.
pub fn erase_ancestors(db: &Database, revs: &mut BTreeSet<RevisionId>) -> DbResult<()> {
    let loader = GraphLoader::new(db);
    let mut proper_ancestors = BTreeSet::new();
    for rid in revs.iter() {
        let mut above = loader.load_parents(rid)?;
        loader.load_ancestors(&mut above)?;
        proper_ancestors.extend(above);
    }
    revs.retain(|rid| !proper_ancestors.contains(rid));
    Ok(())
}

/// Removes from `revs` every revision that is a proper descendant of
/// another member.
pub fn erase_descendants(db: &Database, revs: &mut BTreeSet<RevisionId>) -> DbResult<()> {
    let loader = GraphLoader::new(db);
    let mut proper_descendants = BTreeSet::new();
    for rid in revs.iter() {
        let mut below = loader.load_children(rid)?;
        loader.load_descendants(&mut below)?;
        proper_descendants.extend(below);
    }
    revs.retain(|rid| !proper_descendants.contains(rid));
    Ok(())
}

/// The intersection of the (self-inclusive) ancestor sets of `revs`.
pub fn common_ancestors(
    db: &Database,
    revs: &BTreeSet<RevisionId>,
) -> DbResult<BTreeSet<RevisionId>> {
    let loader = GraphLoader::new(db);
    let mut result: Option<BTreeSet<RevisionId>> = None;
    for rid in revs {
        let mut ancestors = BTreeSet::from([rid.clone()]);
        loader.load_ancestors(&mut ancestors)?;
        result = Some(match result {
            None => ancestors,
            Some(acc) => acc.intersection(&ancestors).cloned().collect(),
        });
    }
    Ok(result.unwrap_or_default())
}

/// The single merge base of `left` and `right`: a common ancestor
/// maximal under the ancestry order, ties broken by height then id.
///
/// Histories with genuine multi-LCA shapes have a whole set of maximal
/// common ancestors; picking one is deliberate, and which one is picked
/// can influence the marks a merge produces.
pub fn find_common_ancestor_for_merge(
    db: &Database,
    left: &RevisionId,
    right: &RevisionId,
) -> DbResult<Option<RevisionId>> {
    let candidates = common_ancestors(db, &BTreeSet::from([left.clone(), right.clone()]))?;
    let mut best: Option<(crate::rev_height::RevHeight, RevisionId)> = None;
    for rid in candidates {
        let height = db.get_rev_height(&rid)?;
        let key = (height, rid);
        if best.as_ref().is_none_or(|b| *b < key) {
            best = Some(key);
        }
    }
    Ok(best.map(|(_, rid)| rid))
}

/// The two uncommon-ancestor sets of a merge: ancestors (self included)
/// of each side that are not ancestors of the other side.
pub fn get_uncommon_ancestors(
    db: &Database,
    left: &RevisionId,
    right: &RevisionId,
) -> DbResult<(BTreeSet<RevisionId>, BTreeSet<RevisionId>)> {
    let loader = GraphLoader::new(db);
    let mut left_ancestors = BTreeSet::from([left.clone()]);
    loader.load_ancestors(&mut left_ancestors)?;
    let mut right_ancestors = BTreeSet::from([right.clone()]);
    loader.load_ancestors(&mut right_ancestors)?;
    let left_uncommon = left_ancestors
        .difference(&right_ancestors)
        .cloned()
        .collect();
    let right_uncommon = right_ancestors
        .difference(&left_ancestors)
        .cloned()
        .collect();
    Ok((left_uncommon, right_uncommon))
}
