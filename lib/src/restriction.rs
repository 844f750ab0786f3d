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

//! Restrictions: include/exclude path predicates over rosters.
//!
//! Destructive commands (commit, revert) and their read-only previews
//! (status, diff, ls) must agree on which nodes a set of path arguments
//! selects, so the selection logic lives here, once. An empty
//! restriction includes everything. Exclusion wins over inclusion when
//! its matching prefix is at least as specific.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use thiserror::Error;

use crate::repo_path::RepoPathBuf;
use crate::roster::NodeId;
use crate::roster::Roster;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestrictionError {
    #[error("restriction includes deletion of {parent:?} but excludes deletion of {child:?}")]
    IncludedDelete {
        parent: RepoPathBuf,
        child: RepoPathBuf,
    },
    #[error("restriction excludes addition of {parent:?} but includes addition of {child:?}")]
    ExcludedAdd {
        parent: RepoPathBuf,
        child: RepoPathBuf,
    },
    #[error("restriction excludes addition of the root directory")]
    ExcludedRoot,
}

/// Longest matching prefix length in components, or `None`.
fn longest_prefix_match(paths: &BTreeSet<RepoPathBuf>, path: &RepoPathBuf) -> Option<usize> {
    paths
        .iter()
        .filter(|candidate| path.starts_with(candidate))
        .map(|candidate| candidate.components().count())
        .max()
}

#[derive(Clone, Debug, Default)]
pub struct PathRestriction {
    included: BTreeSet<RepoPathBuf>,
    excluded: BTreeSet<RepoPathBuf>,
    /// Levels below an include root (or below the workspace root when
    /// everything is included) that still match.
    depth: Option<usize>,
}

impl PathRestriction {
    /// Includes everything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(
        included: impl IntoIterator<Item = RepoPathBuf>,
        excluded: impl IntoIterator<Item = RepoPathBuf>,
        depth: Option<usize>,
    ) -> Self {
        Self {
            included: included.into_iter().collect(),
            excluded: excluded.into_iter().collect(),
            depth,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty() && self.depth.is_none()
    }

    pub fn includes(&self, path: &RepoPathBuf) -> bool {
        let include_match = if self.included.is_empty() {
            Some(0)
        } else if path.is_root() {
            // the root is always part of any selection with includes
            Some(0)
        } else {
            longest_prefix_match(&self.included, path)
        };
        let Some(include_len) = include_match else {
            return false;
        };
        if let Some(exclude_len) = longest_prefix_match(&self.excluded, path) {
            if exclude_len >= include_len {
                return false;
            }
        }
        if let Some(depth) = self.depth {
            let below = path.components().count().saturating_sub(include_len);
            if below > depth {
                return false;
            }
        }
        true
    }
}

/// A [`PathRestriction`] applied to roster nodes through their paths.
#[derive(Clone, Debug, Default)]
pub struct NodeRestriction {
    paths: PathRestriction,
}

impl NodeRestriction {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(paths: PathRestriction) -> Self {
        Self { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn includes(&self, roster: &Roster, nid: NodeId) -> bool {
        self.paths.includes(&roster.get_name(nid))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    From,
    To,
}

/// Builds the roster that equals `from` on excluded nodes and `to` on
/// included ones. Fails when the restriction cuts between a directory
/// and its children in a way that would orphan one side.
pub fn make_restricted_roster(
    from: &Roster,
    to: &Roster,
    mask: &NodeRestriction,
) -> Result<Roster, RestrictionError> {
    use itertools::EitherOrBoth;
    use itertools::Itertools as _;

    let mut selected: BTreeMap<NodeId, Side> = BTreeMap::new();
    for pair in from
        .all_nodes()
        .merge_join_by(to.all_nodes(), |(a, _), (b, _)| a.cmp(b))
    {
        match pair {
            EitherOrBoth::Left((nid, _)) => {
                // deleted; an excluded deletion keeps the node
                if !mask.includes(from, nid) {
                    selected.insert(nid, Side::From);
                }
            }
            EitherOrBoth::Right((nid, _)) => {
                if mask.includes(to, nid) {
                    selected.insert(nid, Side::To);
                }
            }
            EitherOrBoth::Both((nid, _), _) => {
                let side = if mask.includes(from, nid) || mask.includes(to, nid) {
                    Side::To
                } else {
                    Side::From
                };
                selected.insert(nid, side);
            }
        }
    }

    let roster_for = |side: Side| match side {
        Side::From => from,
        Side::To => to,
    };

    let mut restricted = Roster::new();
    while let Some((&first, _)) = selected.iter().next() {
        let mut nid = first;
        let mut missing_parent = false;
        // climb until the node's parent is already placed
        loop {
            let side = selected[&nid];
            let node = roster_for(side).node(nid);
            let parent = node.parent();
            if parent.is_null() || restricted.has_node(parent) {
                break;
            }
            if selected.contains_key(&parent) {
                nid = parent;
            } else {
                missing_parent = true;
                break;
            }
        }

        let side = selected[&nid];
        let source = roster_for(side);
        let node = source.node(nid);
        if !missing_parent {
            if node.is_file() {
                restricted.create_file_node_with_id(node.content().clone(), nid);
            } else {
                restricted.create_dir_node_with_id(nid);
            }
            for (key, entry) in &node.attrs {
                restricted.set_attr_unknown_to_dead_ok(nid, key, entry.clone());
            }
            restricted.attach_node(nid, node.parent(), node.name().cloned());
        } else {
            let parent = node.parent();
            if from.has_node(parent) && !to.has_node(parent) {
                // included a delete that must be excluded
                return Err(RestrictionError::IncludedDelete {
                    parent: from.get_name(parent),
                    child: from.get_name(nid),
                });
            } else if !from.has_node(parent) && to.has_node(parent) {
                // excluded an add that must be included
                return Err(RestrictionError::ExcludedAdd {
                    parent: to.get_name(parent),
                    child: to.get_name(nid),
                });
            } else {
                unreachable!("parent of a selected node is in neither roster");
            }
        }
        selected.remove(&nid);
    }

    // An entirely empty restricted roster is legitimate (an unversioned
    // directory); anything else must have picked up a root.
    if !restricted.is_empty() && !restricted.has_root() {
        return Err(RestrictionError::ExcludedRoot);
    }
    if !restricted.is_empty() {
        restricted.check_sane(true);
    }
    Ok(restricted)
}
