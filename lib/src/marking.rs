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

//! The marking algebra: per-node, per-scalar records of which revisions
//! last changed each scalar. Mark sets are what drive three-way merge
//! without replaying history: a scalar's mark set is the set of least
//! upper bounds of the ancestry where that scalar changed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::roster::AttrKey;
use crate::roster::Node;
use crate::roster::NodeId;
use crate::roster::Roster;

/// Mark set of one scalar: revisions that last changed it.
pub type MarkSet = BTreeSet<RevisionId>;

/// Provenance record of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Marking {
    /// Revision in which this node id first appeared.
    pub birth_revision: RevisionId,
    /// Last changes to the `(parent, name)` scalar.
    pub parent_name: MarkSet,
    /// Last changes to the content id; empty for directories.
    pub file_content: MarkSet,
    /// Last changes per attribute key ever present on the node.
    pub attrs: BTreeMap<AttrKey, MarkSet>,
}

/// One marking per roster node, shared copy-on-write like the nodes
/// themselves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkingMap {
    map: BTreeMap<NodeId, Arc<Marking>>,
}

impl MarkingMap {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, nid: NodeId) -> bool {
        self.map.contains_key(&nid)
    }

    pub fn get(&self, nid: NodeId) -> Option<&Arc<Marking>> {
        self.map.get(&nid)
    }

    /// Panics if the node has no marking.
    pub fn marking(&self, nid: NodeId) -> &Arc<Marking> {
        self.get(nid)
            .unwrap_or_else(|| panic!("node {nid} has no marking"))
    }

    /// Clone-on-write access.
    pub fn marking_mut(&mut self, nid: NodeId) -> &mut Marking {
        let arc = self
            .map
            .get_mut(&nid)
            .unwrap_or_else(|| panic!("node {nid} has no marking"));
        Arc::make_mut(arc)
    }

    pub fn put(&mut self, nid: NodeId, marking: Arc<Marking>) {
        let prior = self.map.insert(nid, marking);
        assert!(prior.is_none(), "node {nid} marked twice");
    }

    pub fn put_or_replace(&mut self, nid: NodeId, marking: Arc<Marking>) {
        self.map.insert(nid, marking);
    }

    pub fn remove(&mut self, nid: NodeId) {
        self.map.remove(&nid);
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Arc<Marking>)> {
        self.map.iter().map(|(&nid, marking)| (nid, marking))
    }

    /// Renames a node id, keeping its marking; used when merge
    /// unification replaces temporary ids.
    pub fn rename_node(&mut self, from: NodeId, to: NodeId) {
        if let Some(marking) = self.map.remove(&from) {
            self.put(to, marking);
        }
    }
}

/// Unmerged-scalar rule: unchanged keeps the parent's marks, changed
/// marks the new revision.
pub fn mark_unmerged_scalar<T: PartialEq>(
    parent_marks: &MarkSet,
    parent_val: &T,
    new_rid: &RevisionId,
    new_val: &T,
) -> MarkSet {
    if parent_val == new_val {
        parent_marks.clone()
    } else {
        BTreeSet::from([new_rid.clone()])
    }
}

// This implements the case
//   a   b1
//    \ /
//     b2
fn mark_won_merge(
    a_marks: &MarkSet,
    a_uncommon_ancestors: &BTreeSet<RevisionId>,
    b1_marks: &MarkSet,
    new_rid: &RevisionId,
) -> MarkSet {
    for mark in a_marks {
        if a_uncommon_ancestors.contains(mark) {
            // at least one element of *(a) is not an ancestor of b1
            return BTreeSet::from([new_rid.clone()]);
        }
    }
    // all elements of *(a) are ancestors of b1; this was a clean merge
    // to b, so copy the marks forward
    b1_marks.clone()
}

/// Merged-scalar rule for a node present in both parents.
pub fn mark_merged_scalar<T: PartialEq>(
    left_marks: &MarkSet,
    left_uncommon_ancestors: &BTreeSet<RevisionId>,
    left_val: &T,
    right_marks: &MarkSet,
    right_uncommon_ancestors: &BTreeSet<RevisionId>,
    right_val: &T,
    new_rid: &RevisionId,
    new_val: &T,
) -> MarkSet {
    let diff_from_left = new_val != left_val;
    let diff_from_right = new_val != right_val;

    for mark in left_marks {
        assert!(
            !right_uncommon_ancestors.contains(mark),
            "left mark is uncommon on the right"
        );
    }
    for mark in right_marks {
        assert!(
            !left_uncommon_ancestors.contains(mark),
            "right mark is uncommon on the left"
        );
    }

    if diff_from_left && diff_from_right {
        BTreeSet::from([new_rid.clone()])
    } else if diff_from_left {
        mark_won_merge(left_marks, left_uncommon_ancestors, right_marks, new_rid)
    } else if diff_from_right {
        mark_won_merge(right_marks, right_uncommon_ancestors, left_marks, new_rid)
    } else {
        // Unchanged on both sides: union the mark sets. The union may
        // carry marks that are ancestors of other marks, which never
        // changes the outcome of the "is every mark an ancestor" test.
        left_marks.union(right_marks).cloned().collect()
    }
}

/// Marks a node that first appears in `new_rid`: every scalar gets the
/// singleton mark set, birth is `new_rid`.
pub fn mark_new_node(new_rid: &RevisionId, node: &Node, markings: &mut MarkingMap) {
    let singleton = BTreeSet::from([new_rid.clone()]);
    let marking = Marking {
        birth_revision: new_rid.clone(),
        parent_name: singleton.clone(),
        file_content: if node.is_file() {
            singleton.clone()
        } else {
            BTreeSet::new()
        },
        attrs: node
            .attrs
            .keys()
            .map(|key| (key.clone(), singleton.clone()))
            .collect(),
    };
    markings.put(node.self_id(), Arc::new(marking));
}

/// Marks a node carried over from a single parent.
pub fn mark_unmerged_node(
    parent_marking: &Marking,
    parent_node: &Node,
    new_rid: &RevisionId,
    node: &Node,
    markings: &mut MarkingMap,
) {
    if node.shallow_equal(parent_node, true) {
        if !markings.contains(node.self_id()) {
            markings.put(node.self_id(), Arc::new(parent_marking.clone()));
        }
        return;
    }

    assert_eq!(parent_node.is_dir(), node.is_dir());
    assert_eq!(parent_node.self_id(), node.self_id());

    let mut new_marking = Marking {
        birth_revision: parent_marking.birth_revision.clone(),
        parent_name: mark_unmerged_scalar(
            &parent_marking.parent_name,
            &parent_node.location(),
            new_rid,
            &node.location(),
        ),
        file_content: BTreeSet::new(),
        attrs: BTreeMap::new(),
    };
    if node.is_file() {
        new_marking.file_content = mark_unmerged_scalar(
            &parent_marking.file_content,
            parent_node.content(),
            new_rid,
            node.content(),
        );
    }
    for (key, entry) in &node.attrs {
        let marks = match parent_node.attrs.get(key) {
            None => BTreeSet::from([new_rid.clone()]),
            Some(parent_entry) => mark_unmerged_scalar(
                parent_marking
                    .attrs
                    .get(key)
                    .unwrap_or_else(|| panic!("attr {key} of parent has no marks")),
                parent_entry,
                new_rid,
                entry,
            ),
        };
        new_marking.attrs.insert(key.clone(), marks);
    }

    markings.put_or_replace(node.self_id(), Arc::new(new_marking));
}

/// Root-revision marking: every scalar of every node is marked with
/// `rid`.
pub fn mark_roster_with_no_parents(
    rid: &RevisionId,
    roster: &Roster,
    markings: &mut MarkingMap,
) {
    let mock_parent = Roster::new();
    let mock_markings = MarkingMap::default();
    mark_roster_with_one_parent(&mock_parent, &mock_markings, rid, roster, markings);
}

/// One-parent marking: unchanged scalars keep the parent's marks.
pub fn mark_roster_with_one_parent(
    parent: &Roster,
    parent_markings: &MarkingMap,
    child_rid: &RevisionId,
    child: &Roster,
    child_markings: &mut MarkingMap,
) {
    assert!(!child_rid.is_null());
    *child_markings = parent_markings.clone();

    for (nid, node) in child.all_nodes() {
        match parent.get(nid) {
            Some(parent_node) => mark_unmerged_node(
                parent_markings.marking(nid),
                parent_node,
                child_rid,
                node,
                child_markings,
            ),
            None => mark_new_node(child_rid, node, child_markings),
        }
    }
    drop_extra_markings(child, child_markings);

    child.check_sane_against(child_markings, true);
}

/// Prunes marking entries whose node is absent from the roster. The
/// merge algorithm can mark nodes that do not survive unification.
pub fn drop_extra_markings(roster: &Roster, markings: &mut MarkingMap) {
    if markings.len() > roster.node_count() {
        let to_drop: Vec<NodeId> = markings
            .iter()
            .map(|(nid, _)| nid)
            .filter(|&nid| !roster.has_node(nid))
            .collect();
        for nid in to_drop {
            markings.remove(nid);
        }
    }
    assert_eq!(markings.len(), roster.node_count());
}
