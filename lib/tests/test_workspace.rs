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
use std::fs;

use assert_matches::assert_matches;
use mtn_lib::inodeprint::inodeprint_of;
use mtn_lib::object_id::RevisionId;
use mtn_lib::repo_path::RepoPathBuf;
use mtn_lib::restriction::NodeRestriction;
use mtn_lib::revision::make_revision_for_workspace;
use mtn_lib::revision::make_revision_from_parents;
use mtn_lib::roster::make_cset;
use mtn_lib::roster::Roster;
use mtn_lib::roster::TempNodeIdSource;
use mtn_lib::workspace::DefaultHooks;
use mtn_lib::working_copy::MemoryContentSource;
use mtn_lib::working_copy::WorkError;
use mtn_lib::working_copy::WorkingCopy;
use mtn_lib::xdelta;
use pretty_assertions::assert_eq;
use testutils::content_id;
use testutils::repo_path;
use testutils::TestWorkspace;

fn paths(values: &[&str]) -> BTreeSet<RepoPathBuf> {
    values.iter().map(|value| repo_path(value)).collect()
}

/// The commit data flow: scan the workspace, hash the roster, store
/// contents and the revision, move the workspace onto the new parent.
fn commit_workspace(tw: &TestWorkspace) -> RevisionId {
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    let mut nis = TempNodeIdSource::new();
    let mut roster = wc.get_current_roster_shape(&mut nis).unwrap();
    wc.update_current_roster_from_filesystem(&mut roster, &NodeRestriction::empty())
        .unwrap();

    let parents = wc.get_parent_rosters().unwrap();
    let pairs: Vec<(RevisionId, &Roster)> = parents
        .iter()
        .map(|parent| (parent.rid.clone(), parent.roster.0.as_ref()))
        .collect();
    let rev = make_revision_from_parents(&pairs, &roster);
    let rid = rev.ident();

    let guard = tw.db.begin_transaction(false).unwrap();
    for cs in rev.edges.values() {
        for (path, fid) in &cs.files_added {
            let data = fs::read(path.to_fs_path(tw.root())).unwrap();
            assert_eq!(&content_id(&data), fid);
            tw.db.put_file(fid, &data).unwrap();
        }
        for (path, (old_id, new_id)) in &cs.deltas_applied {
            let new_data = fs::read(path.to_fs_path(tw.root())).unwrap();
            assert_eq!(&content_id(&new_data), new_id);
            let old_data = tw.db.get_file_version(old_id).unwrap();
            tw.db
                .put_file_version(old_id, new_id, &xdelta::compute_delta(&old_data, &new_data))
                .unwrap();
        }
    }
    assert!(tw.db.put_revision(&rid, &rev).unwrap());
    guard.commit().unwrap();

    let (stored, _) = tw.db.get_roster_version(&rid).unwrap();
    tw.workspace
        .put_work_rev(&make_revision_for_workspace(
            &[(rid.clone(), stored.as_ref())],
            &stored,
        ))
        .unwrap();
    rid
}

#[test]
fn additions_magic_add_missing_parents() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("a", b"a\n");
    tw.write_working_file("dir/sub/b", b"b\n");

    wc.perform_additions(&paths(&["a", "dir/sub/b"]), false, true)
        .unwrap();

    let rev = tw.workspace.get_work_rev().unwrap();
    let cs = rev.edges.values().next().unwrap();
    assert!(cs.files_added.contains_key(&repo_path("a")));
    assert!(cs.files_added.contains_key(&repo_path("dir/sub/b")));
    assert!(cs.dirs_added.contains(&repo_path("dir")));
    assert!(cs.dirs_added.contains(&repo_path("dir/sub")));
    // the root is new too: this workspace has never been committed
    assert!(cs.dirs_added.contains(&RepoPathBuf::root()));

    assert!(wc.has_changes().unwrap());
}

#[test]
fn recursive_addition_walks_the_tree() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("dir/one", b"1");
    tw.write_working_file("dir/two", b"2");
    tw.write_working_file("dir/nested/three", b"3");

    wc.perform_additions(&paths(&["dir"]), true, true).unwrap();
    let rev = tw.workspace.get_work_rev().unwrap();
    let cs = rev.edges.values().next().unwrap();
    assert_eq!(cs.files_added.len(), 3);
    assert!(cs.files_added.contains_key(&repo_path("dir/nested/three")));
}

#[test]
fn deletions_remove_unchanged_files_from_disk() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("keep.txt", b"keep");
    tw.write_working_file("drop.txt", b"drop");
    tw.write_working_file("edited.txt", b"original");
    wc.perform_additions(&paths(&["keep.txt", "drop.txt", "edited.txt"]), false, true)
        .unwrap();
    commit_workspace(&tw);

    // unchanged tracked file: dropped from the roster and deleted
    wc.perform_deletions(&paths(&["drop.txt"]), false, false)
        .unwrap();
    assert!(!tw.working_file_exists("drop.txt"));

    // locally edited file: dropped from the roster but left on disk
    tw.write_working_file("edited.txt", b"edited since commit");
    wc.perform_deletions(&paths(&["edited.txt"]), false, false)
        .unwrap();
    assert!(tw.working_file_exists("edited.txt"));

    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(!shape.has_node_at(&repo_path("drop.txt")));
    assert!(!shape.has_node_at(&repo_path("edited.txt")));
    assert!(shape.has_node_at(&repo_path("keep.txt")));
}

#[test]
fn deleting_a_non_empty_directory_needs_recursive() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("dir/a", b"a");
    wc.perform_additions(&paths(&["dir/a"]), false, true).unwrap();

    assert_matches!(
        wc.perform_deletions(&paths(&["dir"]), false, false),
        Err(WorkError::DropNonEmpty(path)) if path == repo_path("dir")
    );
    wc.perform_deletions(&paths(&["dir"]), true, false).unwrap();
    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(!shape.has_node_at(&repo_path("dir")));
}

#[test]
fn rename_moves_tree_entry_and_file() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("a.txt", b"contents");
    wc.perform_additions(&paths(&["a.txt"]), false, true).unwrap();

    wc.perform_rename(&paths(&["a.txt"]), &repo_path("b.txt"), false)
        .unwrap();
    assert!(!tw.working_file_exists("a.txt"));
    assert_eq!(tw.read_working_file("b.txt"), b"contents");
    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(shape.has_node_at(&repo_path("b.txt")));
    assert!(!shape.has_node_at(&repo_path("a.txt")));
}

#[test]
fn rename_into_tracked_directory_appends_basename() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("a.txt", b"contents");
    fs::create_dir(tw.root().join("dest")).unwrap();
    wc.perform_additions(&paths(&["a.txt", "dest"]), false, true)
        .unwrap();

    wc.perform_rename(&paths(&["a.txt"]), &repo_path("dest"), false)
        .unwrap();
    assert_eq!(tw.read_working_file("dest/a.txt"), b"contents");
    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(shape.has_node_at(&repo_path("dest/a.txt")));
}

#[test]
fn rename_with_missing_source_still_updates_the_tree() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("a.txt", b"contents");
    wc.perform_additions(&paths(&["a.txt"]), false, true).unwrap();
    fs::remove_file(tw.root().join("a.txt")).unwrap();

    wc.perform_rename(&paths(&["a.txt"]), &repo_path("b.txt"), false)
        .unwrap();
    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(shape.has_node_at(&repo_path("b.txt")));
    assert!(!tw.working_file_exists("b.txt"));
}

#[test]
fn untracked_rename_source_is_an_error() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    assert_matches!(
        wc.perform_rename(&paths(&["ghost"]), &repo_path("b"), true),
        Err(WorkError::NotVersioned(path)) if path == repo_path("ghost")
    );
}

// Scenario: the cached inodeprint matches, so the scan must not re-read
// the file; the roster keeps the tracked content id even though the
// bytes on disk differ.
#[test]
fn matching_inodeprint_suppresses_rehashing() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("p", b"v1");
    wc.perform_additions(&paths(&["p"]), false, true).unwrap();
    commit_workspace(&tw);

    tw.write_working_file("p", b"v2");
    let mut cache = mtn_lib::inodeprint::InodeprintMap::new();
    cache.insert(
        repo_path("p"),
        inodeprint_of(&tw.root().join("p")).unwrap(),
    );
    tw.workspace.write_inodeprints(&cache).unwrap();

    let mut nis = TempNodeIdSource::new();
    let mut roster = wc.get_current_roster_shape(&mut nis).unwrap();
    wc.update_current_roster_from_filesystem(&mut roster, &NodeRestriction::empty())
        .unwrap();
    assert_eq!(
        roster.node_at(&repo_path("p")).unwrap().content(),
        &content_id(b"v1"),
        "the scan trusted the inodeprint and skipped the changed bytes"
    );

    // without the cache entry the scan re-hashes
    tw.workspace
        .write_inodeprints(&mtn_lib::inodeprint::InodeprintMap::new())
        .unwrap();
    let mut roster = wc.get_current_roster_shape(&mut nis).unwrap();
    wc.update_current_roster_from_filesystem(&mut roster, &NodeRestriction::empty())
        .unwrap();
    assert_eq!(
        roster.node_at(&repo_path("p")).unwrap().content(),
        &content_id(b"v2")
    );
}

#[test]
fn missing_tracked_files_fail_the_scan() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("gone", b"x");
    wc.perform_additions(&paths(&["gone"]), false, true).unwrap();
    fs::remove_file(tw.root().join("gone")).unwrap();

    let mut nis = TempNodeIdSource::new();
    let mut roster = wc.get_current_roster_shape(&mut nis).unwrap();
    assert_matches!(
        wc.update_current_roster_from_filesystem(&mut roster, &NodeRestriction::empty()),
        Err(WorkError::MissingItems { count: 1 })
    );
    assert_eq!(
        wc.find_missing(&roster, &NodeRestriction::empty()).unwrap(),
        paths(&["gone"])
    );
}

// Checkout: materialize a stored revision into an empty workspace
// through the content-update machinery.
#[test]
fn checkout_materializes_a_stored_revision() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("src/lib.rs", b"pub fn lib() {}\n");
    tw.write_working_file("README.md", b"# hello\n");
    wc.perform_additions(&paths(&["src/lib.rs", "README.md"]), false, true)
        .unwrap();
    let rid = commit_workspace(&tw);

    // second workspace, fresh checkout from the same database
    let target = TestWorkspace::init();
    let stored = tw.db.get_roster_version(&rid).unwrap().0;
    let target_wc = WorkingCopy::new(&target.workspace, &tw.db, &DefaultHooks);
    let mut nis = TempNodeIdSource::new();
    let old = target_wc.get_current_roster_shape(&mut nis).unwrap();
    let cs = make_cset(&old, &stored);
    target_wc
        .perform_content_update(&old, &stored, &cs, &tw.db, true, false)
        .unwrap();

    assert_eq!(target.read_working_file("src/lib.rs"), b"pub fn lib() {}\n");
    assert_eq!(target.read_working_file("README.md"), b"# hello\n");
    // the staging directory is gone after a clean run
    assert!(!target.workspace.detached_dir().exists());
}

// Scenario: an unversioned path blocks an incoming attach; without
// --move-conflicting-paths the update fails listing it, with the flag
// the path moves under _MTN/resolutions and the update proceeds.
#[test]
fn conflicting_unversioned_path_blocks_or_moves() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    fs::create_dir(tw.root().join("foo")).unwrap();
    wc.perform_additions(&paths(&["foo"]), false, true).unwrap();
    // unversioned file sitting where the update wants to put one
    tw.write_working_file("foo/bar", b"unversioned");

    let mut nis = TempNodeIdSource::new();
    let old = wc.get_current_roster_shape(&mut nis).unwrap();
    let mut new = old.clone();
    let mut source = MemoryContentSource::new(None);
    let incoming = source.insert(b"incoming".to_vec());
    let nid = new.create_file_node(incoming, &mut nis);
    new.attach_node_at(nid, &repo_path("foo/bar"));
    let cs = make_cset(&old, &new);

    let err = wc
        .perform_content_update(&old, &new, &cs, &source, true, false)
        .unwrap_err();
    assert_matches!(err, WorkError::Conflicts(paths) if paths == vec![repo_path("foo/bar")]);
    assert_eq!(tw.read_working_file("foo/bar"), b"unversioned");

    wc.perform_content_update(&old, &new, &cs, &source, true, true)
        .unwrap();
    assert_eq!(tw.read_working_file("foo/bar"), b"incoming");
    let moved = tw
        .workspace
        .resolutions_dir()
        .join("foo")
        .join("bar");
    assert_eq!(fs::read(moved).unwrap(), b"unversioned");
    assert!(!tw.workspace.detached_dir().exists());
}

#[test]
fn locally_changed_file_aborts_content_update() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("f", b"v1");
    wc.perform_additions(&paths(&["f"]), false, true).unwrap();
    commit_workspace(&tw);

    // the update expects to patch v1 -> v2, but the file now holds v9
    tw.write_working_file("f", b"v9");
    let mut nis = TempNodeIdSource::new();
    let old = wc.get_current_roster_shape(&mut nis).unwrap();
    let mut new = old.clone();
    let mut source = MemoryContentSource::new(None);
    let v2 = source.insert(b"v2".to_vec());
    new.apply_delta(&repo_path("f"), &content_id(b"v1"), &v2);
    let cs = make_cset(&old, &new);

    let result = wc.perform_content_update(&old, &new, &cs, &source, true, false);
    assert!(result.is_err());
    // the interrupted run leaves the staging directory as a lock
    assert!(tw.workspace.detached_dir().exists());
    assert_matches!(
        wc.perform_content_update(&old, &new, &cs, &source, true, false),
        Err(WorkError::WorkspaceLocked(_))
    );
}

#[test]
fn pivot_root_rotates_the_tree() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.write_working_file("sub/inner.txt", b"inner");
    tw.write_working_file("top.txt", b"top");
    wc.perform_additions(&paths(&["sub/inner.txt", "top.txt"]), false, true)
        .unwrap();

    wc.perform_pivot_root(&repo_path("sub"), &repo_path("old"), false, false)
        .unwrap();

    assert_eq!(tw.read_working_file("inner.txt"), b"inner");
    assert_eq!(tw.read_working_file("old/top.txt"), b"top");
    assert!(!tw.working_file_exists("sub/inner.txt"));

    let mut nis = TempNodeIdSource::new();
    let shape = wc.get_current_roster_shape(&mut nis).unwrap();
    assert!(shape.has_node_at(&repo_path("inner.txt")));
    assert!(shape.has_node_at(&repo_path("old/top.txt")));
    assert!(!shape.has_node_at(&repo_path("sub")));
}

#[test]
fn unknown_and_ignored_listing() {
    struct IgnoreDotLog;
    impl mtn_lib::workspace::WorkspaceHooks for IgnoreDotLog {
        fn ignore_file(&self, path: &RepoPathBuf) -> bool {
            path.as_internal_string().ends_with(".log")
        }
    }

    let tw = TestWorkspace::init();
    let hooks = IgnoreDotLog;
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &hooks);
    tw.write_working_file("tracked.txt", b"t");
    wc.perform_additions(&paths(&["tracked.txt"]), false, true)
        .unwrap();
    tw.write_working_file("stray.txt", b"s");
    tw.write_working_file("noise.log", b"n");

    let (unknown, ignored) = wc
        .find_unknown_and_ignored(
            &[RepoPathBuf::root()],
            &mtn_lib::restriction::PathRestriction::empty(),
        )
        .unwrap();
    assert!(unknown.contains(&repo_path("stray.txt")));
    assert!(!unknown.contains(&repo_path("tracked.txt")));
    assert_eq!(ignored, paths(&["noise.log"]));
}

#[test]
fn inodeprints_refresh_after_commit() {
    let tw = TestWorkspace::init();
    let wc = WorkingCopy::new(&tw.workspace, &tw.db, &DefaultHooks);
    tw.workspace.enable_inodeprints().unwrap();
    tw.write_working_file("f", b"v1");
    wc.perform_additions(&paths(&["f"]), false, true).unwrap();
    commit_workspace(&tw);

    wc.maybe_update_inodeprints(&NodeRestriction::empty()).unwrap();
    let cache = tw.workspace.read_inodeprints().unwrap();
    assert_eq!(
        cache.get(&repo_path("f")),
        Some(&inodeprint_of(&tw.root().join("f")).unwrap())
    );
}
