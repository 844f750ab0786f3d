// Copyright 2021 The Mtn Authors
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

#![allow(missing_docs)]

//! Shared fixtures for mtn-lib's integration tests: temp dirs, canned
//! rosters, a revision-graph builder over a real database, and a
//! workspace wired to one.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use mtn_lib::database::Database;
use mtn_lib::object_id::FileId;
use mtn_lib::object_id::RevisionId;
use mtn_lib::repo_path::RepoPathBuf;
use mtn_lib::revision::make_revision_from_parents;
use mtn_lib::roster::NodeId;
use mtn_lib::roster::NodeIdSource;
use mtn_lib::roster::Roster;
use mtn_lib::workspace::Options;
use mtn_lib::workspace::Workspace;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("mtn-test-")
        .tempdir()
        .unwrap()
}

pub fn repo_path(value: &str) -> RepoPathBuf {
    RepoPathBuf::from_internal_string(value).unwrap()
}

pub fn content_id(data: &[u8]) -> FileId {
    FileId::hash_of(data)
}

/// Node id source that hands out sequential persistent-range ids; tests
/// build rosters with predictable numbering.
#[derive(Debug)]
pub struct SequentialNodeIdSource {
    next: u32,
}

impl Default for SequentialNodeIdSource {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SequentialNodeIdSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeIdSource for SequentialNodeIdSource {
    fn allocate(&mut self) -> NodeId {
        let nid = NodeId::from_raw(self.next);
        self.next += 1;
        nid
    }
}

/// Builds revision graphs against a real database, keeping node ids
/// stable per path so that csets between consecutive trees come out the
/// way a workspace would produce them.
pub struct TestGraph<'a> {
    pub db: &'a Database,
    ids: BTreeMap<RepoPathBuf, NodeId>,
    nis: SequentialNodeIdSource,
}

impl<'a> TestGraph<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            ids: BTreeMap::new(),
            nis: SequentialNodeIdSource::new(),
        }
    }

    fn node_id_for(&mut self, path: &RepoPathBuf) -> NodeId {
        if let Some(&nid) = self.ids.get(path) {
            return nid;
        }
        let nid = self.nis.allocate();
        self.ids.insert(path.clone(), nid);
        nid
    }

    /// A roster holding exactly the given files (plus implied
    /// directories). Node ids are stable across calls, and ids for paths
    /// not seen before are handed out in sorted-path order, matching the
    /// order the database allocator would use when storing the same
    /// change.
    pub fn build_roster(&mut self, files: &[(&str, &str)]) -> Roster {
        let mut dirs: std::collections::BTreeSet<RepoPathBuf> =
            [RepoPathBuf::root()].into_iter().collect();
        let mut contents: BTreeMap<RepoPathBuf, FileId> = BTreeMap::new();
        for (path, data) in files {
            let path = repo_path(path);
            let mut cursor = path.parent();
            while let Some(dir) = cursor {
                cursor = dir.parent();
                dirs.insert(dir);
            }
            contents.insert(path, content_id(data.as_bytes()));
        }

        let mut all_paths: Vec<RepoPathBuf> = dirs.iter().cloned().collect();
        all_paths.extend(contents.keys().cloned());
        all_paths.sort();
        for path in &all_paths {
            self.node_id_for(path);
        }

        let mut roster = Roster::new();
        for path in &all_paths {
            let nid = self.ids[path];
            match contents.get(path) {
                None => roster.create_dir_node_with_id(nid),
                Some(fid) => roster.create_file_node_with_id(fid.clone(), nid),
            }
            if path.is_root() {
                roster.attach_node(nid, NodeId::NULL, None);
            } else {
                roster.attach_node_at(nid, path);
            }
        }
        roster.check_sane(false);
        roster
    }

    /// Stores file contents, builds the revision against the given
    /// parents, writes it, and returns its id.
    pub fn commit(&mut self, parents: &[&RevisionId], files: &[(&str, &str)]) -> RevisionId {
        let guard = self.db.begin_transaction(false).unwrap();
        let roster = self.build_roster(files);
        for (_, contents) in files {
            self.db
                .put_file(&content_id(contents.as_bytes()), contents.as_bytes())
                .unwrap();
        }
        let parent_rosters: Vec<(RevisionId, std::sync::Arc<Roster>)> = if parents.is_empty() {
            vec![(RevisionId::null(), std::sync::Arc::new(Roster::new()))]
        } else {
            parents
                .iter()
                .map(|rid| ((*rid).clone(), self.db.get_roster_version(rid).unwrap().0))
                .collect()
        };
        let pairs: Vec<(RevisionId, &Roster)> = parent_rosters
            .iter()
            .map(|(rid, roster)| (rid.clone(), roster.as_ref()))
            .collect();
        let rev = make_revision_from_parents(&pairs, &roster);
        let rid = rev.ident();
        assert!(self.db.put_revision(&rid, &rev).unwrap());
        guard.commit().unwrap();
        rid
    }
}

/// A workspace in a temp dir with its own database next to it.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub db: Database,
    pub workspace: Workspace,
}

impl TestWorkspace {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let db_path = temp_dir.path().join("test.mtn");
        let db = Database::create(&db_path).unwrap();
        let options = Options {
            database: Some(db_path),
            branch: Some("testbranch".to_owned()),
            key: None,
            keydir: None,
        };
        let workspace = Workspace::create(&temp_dir.path().join("ws"), &options).unwrap();
        Self {
            temp_dir,
            db,
            workspace,
        }
    }

    pub fn root(&self) -> &Path {
        self.workspace.root()
    }

    /// Writes a file inside the working copy, creating parents.
    pub fn write_working_file(&self, path: &str, contents: &[u8]) {
        let fs_path = repo_path(path).to_fs_path(self.root());
        fs::create_dir_all(fs_path.parent().unwrap()).unwrap();
        fs::write(fs_path, contents).unwrap();
    }

    pub fn read_working_file(&self, path: &str) -> Vec<u8> {
        fs::read(repo_path(path).to_fs_path(self.root())).unwrap()
    }

    pub fn working_file_exists(&self, path: &str) -> bool {
        repo_path(path).to_fs_path(self.root()).exists()
    }
}
