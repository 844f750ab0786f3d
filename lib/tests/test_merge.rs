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

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use mtn_lib::cset::Cset;
use mtn_lib::database::Database;
use mtn_lib::marking::mark_roster_with_no_parents;
use mtn_lib::marking::MarkingMap;
use mtn_lib::merge::make_roster_for_merge;
use mtn_lib::merge::MergeError;
use mtn_lib::merge::MergeParent;
use mtn_lib::object_id::RevisionId;
use mtn_lib::roster::NodeId;
use mtn_lib::roster::Roster;
use mtn_lib::roster::TempNodeIdSource;
use pretty_assertions::assert_eq;
use testutils::content_id;
use testutils::repo_path;
use testutils::SequentialNodeIdSource;
use testutils::TestGraph;

fn rid(byte: u8) -> RevisionId {
    RevisionId::from_bytes(&[byte; 20]).unwrap()
}

// Scenario: parents make disjoint content edits; the merge takes both,
// and each file's content mark points at the side that changed it.
#[test]
fn disjoint_edits_merge_cleanly() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let p = graph.commit(&[], &[("x", "x1"), ("y", "y1")]);
    let l = graph.commit(&[&p], &[("x", "x2"), ("y", "y1")]);
    let r = graph.commit(&[&p], &[("x", "x1"), ("y", "y2")]);
    let m = graph.commit(&[&l, &r], &[("x", "x2"), ("y", "y2")]);

    let (p_roster, p_markings) = db.get_roster_version(&p).unwrap();
    let (m_roster, m_markings) = db.get_roster_version(&m).unwrap();

    let x = m_roster.node_at(&repo_path("x")).unwrap();
    let y = m_roster.node_at(&repo_path("y")).unwrap();
    assert_eq!(x.content(), &content_id(b"x2"));
    assert_eq!(y.content(), &content_id(b"y2"));

    assert_eq!(
        m_markings.marking(x.self_id()).file_content,
        [l.clone()].into()
    );
    assert_eq!(
        m_markings.marking(y.self_id()).file_content,
        [r.clone()].into()
    );

    // names were never touched: marks are the union of the parents'
    // (both inherited p's), with no mention of the merge revision
    for nid in [x.self_id(), y.self_id()] {
        assert_eq!(
            m_markings.marking(nid).parent_name,
            p_markings.marking(nid).parent_name
        );
        assert!(!m_markings.marking(nid).parent_name.contains(&m));
    }

    // the merge's cset from p carries both deltas
    let cs = mtn_lib::roster::make_cset(&p_roster, &m_roster);
    assert_eq!(cs.deltas_applied.len(), 2);
}

fn one_file_setup() -> (Roster, MarkingMap) {
    let mut nis = SequentialNodeIdSource::new();
    let mut roster = Roster::new();
    let root = roster.create_dir_node(&mut nis);
    roster.attach_node(root, NodeId::NULL, None);
    let file = roster.create_file_node(content_id(b"shared"), &mut nis);
    roster.attach_node_at(file, &repo_path("f"));
    let mut markings = MarkingMap::default();
    mark_roster_with_no_parents(&rid(1), &roster, &mut markings);
    (roster, markings)
}

// Law: merging identical parents with empty csets is the identity and
// leaves every mark set untouched.
#[test]
fn merge_of_identical_parents_is_identity() {
    let (roster, markings) = one_file_setup();
    let empty = Cset::default();
    let left_uncommon: BTreeSet<RevisionId> = [rid(2)].into();
    let right_uncommon: BTreeSet<RevisionId> = [rid(3)].into();
    let left = MergeParent {
        rid: &rid(2),
        roster: &roster,
        markings: &markings,
        cs: &empty,
        uncommon_ancestors: &left_uncommon,
    };
    let right = MergeParent {
        rid: &rid(3),
        roster: &roster,
        markings: &markings,
        cs: &empty,
        uncommon_ancestors: &right_uncommon,
    };
    let mut nis = TempNodeIdSource::new();
    let (merged, merged_markings) = make_roster_for_merge(&left, &right, &rid(9), &mut nis).unwrap();
    assert_eq!(merged, roster);
    assert_eq!(merged_markings, markings);
}

// Law: the merge is symmetric in its arguments.
#[test]
fn merge_is_symmetric() {
    let (base, base_markings) = one_file_setup();

    // left renames f -> g, right patches the content
    let mut left_roster = base.clone();
    let nid = left_roster.detach_node_at(&repo_path("f"));
    left_roster.attach_node_at(nid, &repo_path("g"));
    let mut left_markings = base_markings.clone();
    left_markings.marking_mut(nid).parent_name = [rid(2)].into();

    let mut right_roster = base.clone();
    right_roster.set_content(nid, &content_id(b"patched"));
    let mut right_markings = base_markings.clone();
    right_markings.marking_mut(nid).file_content = [rid(3)].into();

    let mut left_cs = Cset::default();
    left_cs
        .deltas_applied
        .insert(repo_path("g"), (content_id(b"shared"), content_id(b"patched")));
    let mut right_cs = Cset::default();
    right_cs
        .nodes_renamed
        .insert(repo_path("f"), repo_path("g"));

    let left_uncommon: BTreeSet<RevisionId> = [rid(2)].into();
    let right_uncommon: BTreeSet<RevisionId> = [rid(3)].into();
    let left = MergeParent {
        rid: &rid(2),
        roster: &left_roster,
        markings: &left_markings,
        cs: &left_cs,
        uncommon_ancestors: &left_uncommon,
    };
    let right = MergeParent {
        rid: &rid(3),
        roster: &right_roster,
        markings: &right_markings,
        cs: &right_cs,
        uncommon_ancestors: &right_uncommon,
    };

    let mut nis_a = TempNodeIdSource::new();
    let (merged_a, marks_a) = make_roster_for_merge(&left, &right, &rid(9), &mut nis_a).unwrap();
    let mut nis_b = TempNodeIdSource::new();
    let (merged_b, marks_b) = make_roster_for_merge(&right, &left, &rid(9), &mut nis_b).unwrap();

    assert_eq!(merged_a, merged_b);
    assert_eq!(marks_a, marks_b);
    // each scalar's mark follows the side that changed it
    let marking = marks_a.marking(nid);
    assert_eq!(marking.parent_name, [rid(2)].into());
    assert_eq!(marking.file_content, [rid(3)].into());
}

// Both sides adding different kinds of node at one path is a
// duplicate-name conflict, surfaced as an error rather than a panic.
#[test]
fn conflicting_additions_are_a_duplicate_name_conflict() {
    let (base, base_markings) = one_file_setup();

    let mut left_cs = Cset::default();
    left_cs.dirs_added.insert(repo_path("new"));
    let mut right_cs = Cset::default();
    right_cs
        .files_added
        .insert(repo_path("new"), content_id(b"a file"));

    let left_uncommon: BTreeSet<RevisionId> = [rid(2)].into();
    let right_uncommon: BTreeSet<RevisionId> = [rid(3)].into();
    let left = MergeParent {
        rid: &rid(2),
        roster: &base,
        markings: &base_markings,
        cs: &left_cs,
        uncommon_ancestors: &left_uncommon,
    };
    let right = MergeParent {
        rid: &rid(3),
        roster: &base,
        markings: &base_markings,
        cs: &right_cs,
        uncommon_ancestors: &right_uncommon,
    };
    let mut nis = TempNodeIdSource::new();
    let result = make_roster_for_merge(&left, &right, &rid(9), &mut nis);
    assert_matches!(result, Err(MergeError::DuplicateName { path }) if path == repo_path("new"));
}

// An attr dropped on one side of a fork leaves a corpse there; the merge
// introduces the corpse on the other side so the attr cannot come back.
#[test]
fn merge_unifies_attr_corpses() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let p = graph.commit(&[], &[("f", "v")]);

    // left: set and then clear an attr on f (leaving a corpse); right:
    // change the content so the merge is nontrivial
    let (p_roster, p_markings) = db.get_roster_version(&p).unwrap();
    let f_nid = p_roster.node_at(&repo_path("f")).unwrap().self_id();

    let mut left_roster = p_roster.as_ref().clone();
    left_roster.set_attr(
        &repo_path("f"),
        &mtn_lib::roster::AttrKey::from("mtn:execute"),
        &mtn_lib::roster::AttrValue::from("true"),
    );
    left_roster.clear_attr(&repo_path("f"), &mtn_lib::roster::AttrKey::from("mtn:execute"));
    let l_rev = mtn_lib::revision::make_revision(&p, &p_roster, &left_roster);
    // set-then-clear nets out to nothing in the cset, so fabricate the
    // corpse through two revisions
    assert!(l_rev.edges[&p].is_empty());

    let mut mid_roster = p_roster.as_ref().clone();
    mid_roster.set_attr(
        &repo_path("f"),
        &mtn_lib::roster::AttrKey::from("mtn:execute"),
        &mtn_lib::roster::AttrValue::from("true"),
    );
    let mid_rev = mtn_lib::revision::make_revision(&p, &p_roster, &mid_roster);
    let mid = mid_rev.ident();
    {
        let guard = db.begin_transaction(false).unwrap();
        assert!(db.put_revision(&mid, &mid_rev).unwrap());
        guard.commit().unwrap();
    }
    let (mid_stored, _) = db.get_roster_version(&mid).unwrap();
    let mut cleared_roster = mid_stored.as_ref().clone();
    cleared_roster.clear_attr(&repo_path("f"), &mtn_lib::roster::AttrKey::from("mtn:execute"));
    let l_rev = mtn_lib::revision::make_revision(&mid, &mid_stored, &cleared_roster);
    let l = l_rev.ident();
    {
        let guard = db.begin_transaction(false).unwrap();
        assert!(db.put_revision(&l, &l_rev).unwrap());
        guard.commit().unwrap();
    }

    let r = graph.commit(&[&p], &[("f", "v2")]);
    // merge l and r
    let (l_roster, _) = db.get_roster_version(&l).unwrap();
    let (r_roster, _) = db.get_roster_version(&r).unwrap();
    let merged_files = [("f", "v2")];
    let mut merged = graph.build_roster(&merged_files);
    // carry the corpse into the intended merge result
    merged.set_attr_unknown_to_dead_ok(
        f_nid,
        &mtn_lib::roster::AttrKey::from("mtn:execute"),
        (false, mtn_lib::roster::AttrValue::default()),
    );
    let pairs = [
        (l.clone(), l_roster.as_ref()),
        (r.clone(), r_roster.as_ref()),
    ];
    let m_rev = mtn_lib::revision::make_revision_from_parents(&pairs, &merged);
    let m = m_rev.ident();
    {
        let guard = db.begin_transaction(false).unwrap();
        assert!(db.put_revision(&m, &m_rev).unwrap());
        guard.commit().unwrap();
    }

    let (m_roster, m_markings) = db.get_roster_version(&m).unwrap();
    let f = m_roster.node_at(&repo_path("f")).unwrap();
    assert_eq!(
        f.attrs.get(&mtn_lib::roster::AttrKey::from("mtn:execute")),
        Some(&(false, mtn_lib::roster::AttrValue::default()))
    );
    // the corpse keeps its mark set
    assert!(m_markings
        .marking(f.self_id())
        .attrs
        .contains_key(&mtn_lib::roster::AttrKey::from("mtn:execute")));
    drop(p_markings);
}
