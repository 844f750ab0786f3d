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

//! Three-way roster merge driven by markings.
//!
//! Merging proceeds in two steps. The shape step applies each parent's
//! cset to a copy of that parent's roster and unifies the results: new
//! nodes that land on the same path on both sides get one id, and attr
//! corpses present on one side only are introduced on the other, after
//! which the two rosters must be identical. The mark step then rebuilds
//! the marking map for the merged roster from the two parents' markings
//! and their uncommon-ancestor sets.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::cset::Cset;
use crate::cset::EditError;
use crate::cset::EditResult;
use crate::cset::EditableTree;
use crate::marking::drop_extra_markings;
use crate::marking::mark_merged_scalar;
use crate::marking::mark_new_node;
use crate::marking::mark_unmerged_node;
use crate::marking::mark_unmerged_scalar;
use crate::marking::Marking;
use crate::marking::MarkingMap;
use crate::object_id::FileId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::repo_path::RepoPathBuf;
use crate::roster::AttrKey;
use crate::roster::AttrValue;
use crate::roster::EditableRoster;
use crate::roster::Node;
use crate::roster::NodeId;
use crate::roster::NodeIdSource;
use crate::roster::Roster;
use crate::roster::TempNodeIdSource;

#[derive(Debug, Error)]
pub enum MergeError {
    /// Both sides created different nodes at the same path.
    #[error("conflicting additions at {path:?}")]
    DuplicateName { path: RepoPathBuf },
    #[error(transparent)]
    Edit(#[from] EditError),
}

/// One side of a merge.
pub struct MergeParent<'a> {
    pub rid: &'a RevisionId,
    pub roster: &'a Roster,
    pub markings: &'a MarkingMap,
    pub cs: &'a Cset,
    pub uncommon_ancestors: &'a BTreeSet<RevisionId>,
}

/// Editable roster that records the node ids it creates, so unification
/// can find the nodes new on each side.
struct EditableRosterForMerge<'a> {
    inner: EditableRoster<'a>,
    new_nodes: BTreeSet<NodeId>,
}

impl<'a> EditableRosterForMerge<'a> {
    fn new(roster: &'a mut Roster, nis: &'a mut dyn NodeIdSource) -> Self {
        Self {
            inner: EditableRoster::new(roster, nis),
            new_nodes: BTreeSet::new(),
        }
    }
}

impl EditableTree for EditableRosterForMerge<'_> {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId> {
        self.inner.detach_node(src)
    }

    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()> {
        self.inner.drop_detached_node(nid)
    }

    fn create_dir_node(&mut self) -> EditResult<NodeId> {
        let nid = self.inner.create_dir_node()?;
        self.new_nodes.insert(nid);
        Ok(nid)
    }

    fn create_file_node(&mut self, content: &FileId) -> EditResult<NodeId> {
        let nid = self.inner.create_file_node(content)?;
        self.new_nodes.insert(nid);
        Ok(nid)
    }

    fn attach_node(&mut self, nid: NodeId, dst: &RepoPathBuf) -> EditResult<()> {
        self.inner.attach_node(nid, dst)
    }

    fn apply_delta(
        &mut self,
        path: &RepoPathBuf,
        old_id: &FileId,
        new_id: &FileId,
    ) -> EditResult<()> {
        self.inner.apply_delta(path, old_id, new_id)
    }

    fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) -> EditResult<()> {
        self.inner.clear_attr(path, key)
    }

    fn set_attr(&mut self, path: &RepoPathBuf, key: &AttrKey, value: &AttrValue) -> EditResult<()> {
        self.inner.set_attr(path, key, value)
    }

    fn commit(&mut self) -> EditResult<()> {
        self.inner.commit()
    }
}

/// Gives the nodes new on side `a` their final ids: the id of the node at
/// the same path on side `b` when that node already has one, or a fresh
/// permanent id when both sides minted temporaries for the same path.
fn unify_roster_oneway(
    a: &mut Roster,
    a_new: &BTreeSet<NodeId>,
    b: &mut Roster,
    b_new: &mut BTreeSet<NodeId>,
    nis: &mut dyn NodeIdSource,
) -> Result<(), MergeError> {
    for &aid in a_new {
        let path = a.get_name(aid);
        let Some(b_node) = b.node_at(&path) else {
            return Err(MergeError::DuplicateName { path });
        };
        if b_node.is_dir() != a.node(aid).is_dir() {
            return Err(MergeError::DuplicateName { path });
        }
        let bid = b_node.self_id();
        if b_new.contains(&bid) {
            assert!(bid.is_temp());
            let mut new_nid = nis.allocate();
            while a.has_node(new_nid) || b.has_node(new_nid) {
                new_nid = nis.allocate();
            }
            a.replace_node_id(aid, new_nid);
            b.replace_node_id(bid, new_nid);
            b_new.remove(&bid);
        } else {
            a.replace_node_id(aid, bid);
        }
    }
    Ok(())
}

/// Introduces every attr corpse present on one side only into the other
/// side, so both rosters carry the same key sets.
fn union_corpses(left: &mut Roster, right: &mut Roster) {
    let node_ids: Vec<NodeId> = left
        .all_nodes()
        .map(|(nid, _)| nid)
        .filter(|&nid| right.has_node(nid))
        .collect();
    for nid in node_ids {
        let left_dead: Vec<AttrKey> = left
            .node(nid)
            .attrs
            .iter()
            .filter(|(_, (live, _))| !*live)
            .map(|(key, _)| key.clone())
            .collect();
        let right_dead: Vec<AttrKey> = right
            .node(nid)
            .attrs
            .iter()
            .filter(|(_, (live, _))| !*live)
            .map(|(key, _)| key.clone())
            .collect();
        for key in left_dead {
            if !right.node(nid).attrs.contains_key(&key) {
                right.set_attr_unknown_to_dead_ok(nid, &key, (false, AttrValue::default()));
            }
        }
        for key in right_dead {
            if !left.node(nid).attrs.contains_key(&key) {
                left.set_attr_unknown_to_dead_ok(nid, &key, (false, AttrValue::default()));
            }
        }
    }
}

fn unify_rosters(
    left: &mut Roster,
    left_new: &BTreeSet<NodeId>,
    right: &mut Roster,
    right_new: &BTreeSet<NodeId>,
    nis: &mut dyn NodeIdSource,
) -> Result<(), MergeError> {
    // If a node is new on one side only, the other side already has its
    // permanent id: the "add" was not really an add, and the temp id is
    // replaced with the other side's id. If it is new on both sides it
    // really is a new node, and both temporaries get one fresh id.
    let mut right_new = right_new.clone();
    unify_roster_oneway(left, left_new, right, &mut right_new, nis)?;
    // Whatever is still new on the right was not an add at all on the
    // left, so the second pass only copies permanent ids across.
    let remaining = right_new.clone();
    let mut none_left = BTreeSet::new();
    unify_roster_oneway(right, &remaining, left, &mut none_left, nis)?;

    // Live attrs are made identical by the csets, but an attr added and
    // then deleted on one side of the fork leaves a corpse only there.
    union_corpses(left, right);
    Ok(())
}

fn mark_merged_node(
    left_marking: &Marking,
    left_uncommon: &BTreeSet<RevisionId>,
    ln: &Node,
    right_marking: &Marking,
    right_uncommon: &BTreeSet<RevisionId>,
    rn: &Node,
    new_rid: &RevisionId,
    n: &Node,
    markings: &mut MarkingMap,
) {
    let same_nodes = ln.shallow_equal(rn, true) && ln.shallow_equal(n, true);
    if same_nodes && left_marking == right_marking {
        // The child marking equals both parents'; it is already whichever
        // parent map the merge started from.
        return;
    }

    assert_eq!(ln.is_dir(), n.is_dir());
    assert_eq!(rn.is_dir(), n.is_dir());
    assert_eq!(left_marking.birth_revision, right_marking.birth_revision);

    let mut new_marking = Marking {
        birth_revision: left_marking.birth_revision.clone(),
        parent_name: mark_merged_scalar(
            &left_marking.parent_name,
            left_uncommon,
            &ln.location(),
            &right_marking.parent_name,
            right_uncommon,
            &rn.location(),
            new_rid,
            &n.location(),
        ),
        file_content: BTreeSet::new(),
        attrs: BTreeMap::new(),
    };
    if n.is_file() {
        new_marking.file_content = mark_merged_scalar(
            &left_marking.file_content,
            left_uncommon,
            ln.content(),
            &right_marking.file_content,
            right_uncommon,
            rn.content(),
            new_rid,
            n.content(),
        );
    }
    for (key, entry) in &n.attrs {
        let li = ln.attrs.get(key);
        let ri = rn.attrs.get(key);
        let marks = match (li, ri) {
            // a brand new attribute, never before seen
            (None, None) => BTreeSet::from([new_rid.clone()]),
            (Some(left_entry), None) => mark_unmerged_scalar(
                left_marking
                    .attrs
                    .get(key)
                    .unwrap_or_else(|| panic!("attr {key} has no left marks")),
                left_entry,
                new_rid,
                entry,
            ),
            (None, Some(right_entry)) => mark_unmerged_scalar(
                right_marking
                    .attrs
                    .get(key)
                    .unwrap_or_else(|| panic!("attr {key} has no right marks")),
                right_entry,
                new_rid,
                entry,
            ),
            (Some(left_entry), Some(right_entry)) => mark_merged_scalar(
                left_marking
                    .attrs
                    .get(key)
                    .unwrap_or_else(|| panic!("attr {key} has no left marks")),
                left_uncommon,
                left_entry,
                right_marking
                    .attrs
                    .get(key)
                    .unwrap_or_else(|| panic!("attr {key} has no right marks")),
                right_uncommon,
                right_entry,
                new_rid,
                entry,
            ),
        };
        new_marking.attrs.insert(key.clone(), marks);
    }

    // Attributes are not allowed to disappear across a merge: every key a
    // parent carries must still be present (possibly as a corpse).
    for key in ln.attrs.keys().chain(rn.attrs.keys()) {
        assert!(
            n.attrs.contains_key(key),
            "attr {key} resurrected away by merge"
        );
    }

    markings.put_or_replace(n.self_id(), Arc::new(new_marking));
}

/// Rebuilds the marking map of `merge` from its two parents. Also
/// verifies the ancestry invariants that involve the parents: a node
/// present on one side only must be unborn (not dead) on the other.
pub fn mark_merge_roster(
    left: &MergeParent<'_>,
    right: &MergeParent<'_>,
    new_rid: &RevisionId,
    merge: &Roster,
) -> MarkingMap {
    // Start from whichever parent's map is closer in size to the result.
    let node_count = merge.node_count() as isize;
    let left_err = left.markings.len() as isize - node_count;
    let right_err = right.markings.len() as isize - node_count;
    let mut new_markings = if left_err * left_err > right_err * right_err {
        right.markings.clone()
    } else {
        left.markings.clone()
    };

    for (nid, node) in merge.all_nodes() {
        let left_node = left.roster.get(nid);
        let right_node = right.roster.get(nid);
        match (left_node, right_node) {
            (None, None) => mark_new_node(new_rid, node, &mut new_markings),
            (None, Some(rn)) => {
                let right_marking = right.markings.marking(nid).clone();
                // must be unborn on the left (as opposed to dead)
                assert!(
                    right.uncommon_ancestors.contains(&right_marking.birth_revision),
                    "node {nid} was deleted on the other side, not unborn"
                );
                mark_unmerged_node(&right_marking, rn, new_rid, node, &mut new_markings);
            }
            (Some(ln), None) => {
                let left_marking = left.markings.marking(nid).clone();
                assert!(
                    left.uncommon_ancestors.contains(&left_marking.birth_revision),
                    "node {nid} was deleted on the other side, not unborn"
                );
                mark_unmerged_node(&left_marking, ln, new_rid, node, &mut new_markings);
            }
            (Some(ln), Some(rn)) => {
                mark_merged_node(
                    &left.markings.marking(nid).clone(),
                    left.uncommon_ancestors,
                    ln,
                    &right.markings.marking(nid).clone(),
                    right.uncommon_ancestors,
                    rn,
                    new_rid,
                    node,
                    &mut new_markings,
                );
            }
        }
    }

    drop_extra_markings(merge, &mut new_markings);
    new_markings
}

/// Builds the merged roster and markings for a two-parent revision.
#[instrument(skip_all, fields(new_rid = %new_rid.hex()))]
pub fn make_roster_for_merge(
    left: &MergeParent<'_>,
    right: &MergeParent<'_>,
    new_rid: &RevisionId,
    nis: &mut dyn NodeIdSource,
) -> Result<(Roster, MarkingMap), MergeError> {
    assert!(!left.rid.is_null() && !right.rid.is_null());
    assert!(left.uncommon_ancestors.contains(left.rid));
    assert!(!left.uncommon_ancestors.contains(right.rid));
    assert!(right.uncommon_ancestors.contains(right.rid));
    assert!(!right.uncommon_ancestors.contains(left.rid));

    let mut new_roster = left.roster.clone();
    let mut from_right = right.roster.clone();
    {
        let mut temp_nis = TempNodeIdSource::new();
        let left_new = {
            let mut er = EditableRosterForMerge::new(&mut new_roster, &mut temp_nis);
            left.cs.apply_to(&mut er)?;
            er.new_nodes
        };
        let right_new = {
            let mut er = EditableRosterForMerge::new(&mut from_right, &mut temp_nis);
            right.cs.apply_to(&mut er)?;
            er.new_nodes
        };

        unify_rosters(&mut new_roster, &left_new, &mut from_right, &right_new, nis)?;
        assert_eq!(new_roster, from_right, "parent csets disagree on the merge");
    }

    let new_markings = mark_merge_roster(left, right, new_rid, &new_roster);
    Ok((new_roster, new_markings))
}

/// Applies the shape of a merge without computing markings; used by the
/// workspace to materialize the current roster shape of a two-parent
/// pending revision. Content ids may legitimately differ between the two
/// parents, so only the shapes are compared.
pub fn make_roster_shape_for_merge(
    left_roster: &Roster,
    left_cs: &Cset,
    right_roster: &Roster,
    right_cs: &Cset,
    nis: &mut dyn NodeIdSource,
) -> Result<Roster, MergeError> {
    let mut new_roster = left_roster.clone();
    let mut from_right = right_roster.clone();
    let mut temp_nis = TempNodeIdSource::new();
    let left_new = {
        let mut er = EditableRosterForMerge::new(&mut new_roster, &mut temp_nis);
        left_cs.apply_to(&mut er)?;
        er.new_nodes
    };
    let right_new = {
        let mut er = EditableRosterForMerge::new(&mut from_right, &mut temp_nis);
        right_cs.apply_to(&mut er)?;
        er.new_nodes
    };
    unify_rosters(&mut new_roster, &left_new, &mut from_right, &right_new, nis)?;
    assert!(
        left_cs.deltas_applied.is_empty() && right_cs.deltas_applied.is_empty(),
        "shape csets must not carry content deltas"
    );
    assert!(
        new_roster.equal_shapes(&from_right),
        "parent csets disagree on the merge shape"
    );
    Ok(new_roster)
}

/// Editable roster that maintains the markings of a one-parent child
/// alongside the edits. The marking map starts as a copy of the parent's.
pub struct EditableRosterForNonmerge<'a> {
    roster: &'a mut Roster,
    nis: &'a mut dyn NodeIdSource,
    rid: &'a RevisionId,
    markings: &'a mut MarkingMap,
}

impl<'a> EditableRosterForNonmerge<'a> {
    pub fn new(
        roster: &'a mut Roster,
        nis: &'a mut dyn NodeIdSource,
        rid: &'a RevisionId,
        markings: &'a mut MarkingMap,
    ) -> Self {
        Self {
            roster,
            nis,
            rid,
            markings,
        }
    }

    fn mark_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) {
        let nid = self.roster.node_at(path).unwrap().self_id();
        let marking = self.markings.marking_mut(nid);
        let marks = marking.attrs.entry(key.clone()).or_default();
        marks.clear();
        marks.insert(self.rid.clone());
    }
}

impl EditableTree for EditableRosterForNonmerge<'_> {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId> {
        let nid = self.roster.detach_node_at(src);
        let marking = self.markings.marking_mut(nid);
        marking.parent_name.clear();
        marking.parent_name.insert(self.rid.clone());
        Ok(nid)
    }

    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()> {
        self.roster.drop_detached_node(nid);
        self.markings.remove(nid);
        Ok(())
    }

    fn create_dir_node(&mut self) -> EditResult<NodeId> {
        let nid = self.roster.create_dir_node(self.nis);
        mark_new_node(self.rid, self.roster.node(nid), self.markings);
        Ok(nid)
    }

    fn create_file_node(&mut self, content: &FileId) -> EditResult<NodeId> {
        let nid = self.roster.create_file_node(content.clone(), self.nis);
        mark_new_node(self.rid, self.roster.node(nid), self.markings);
        Ok(nid)
    }

    fn attach_node(&mut self, nid: NodeId, dst: &RepoPathBuf) -> EditResult<()> {
        self.roster.attach_node_at(nid, dst);
        Ok(())
    }

    fn apply_delta(
        &mut self,
        path: &RepoPathBuf,
        old_id: &FileId,
        new_id: &FileId,
    ) -> EditResult<()> {
        self.roster.apply_delta(path, old_id, new_id);
        let nid = self.roster.node_at(path).unwrap().self_id();
        let marking = self.markings.marking_mut(nid);
        marking.file_content.clear();
        marking.file_content.insert(self.rid.clone());
        Ok(())
    }

    fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) -> EditResult<()> {
        self.roster.clear_attr(path, key);
        self.mark_attr(path, key);
        Ok(())
    }

    fn set_attr(&mut self, path: &RepoPathBuf, key: &AttrKey, value: &AttrValue) -> EditResult<()> {
        self.roster.set_attr(path, key, value);
        self.mark_attr(path, key);
        Ok(())
    }

    fn commit(&mut self) -> EditResult<()> {
        Ok(())
    }
}

/// Destructively turns a parent's roster and markings into the child's by
/// applying `cs` and maintaining marks along the way. Equivalent to
/// recomputing the child markings from scratch with the one-parent rule.
pub fn make_roster_for_nonmerge(
    cs: &Cset,
    new_rid: &RevisionId,
    roster: &mut Roster,
    markings: &mut MarkingMap,
    nis: &mut dyn NodeIdSource,
) -> EditResult<()> {
    let mut er = EditableRosterForNonmerge::new(roster, nis, new_rid, markings);
    cs.apply_to(&mut er)
}
