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

//! The working-copy engine: everything that touches the tree on disk.
//!
//! The current roster is built in two steps. Applying the pending cset
//! to the parent roster(s) yields the *shape*: node ids and structure
//! are authoritative, file content ids are stale. A filesystem scan then
//! refreshes the content ids, consulting the inodeprint cache to avoid
//! re-reading unchanged files.
//!
//! Content updates (checkout, update, applying a merge result) run
//! twice: first simulated against a roster of what is actually on disk,
//! which collects conflicts without touching anything, then for real
//! through a staging directory under `_MTN/detached`. The staging
//! directory doubles as an advisory lock: if it already exists, a
//! previous run was interrupted and the engine refuses to start.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cset::Cset;
use crate::cset::EditError;
use crate::cset::EditResult;
use crate::cset::EditableTree;
use crate::database::CachedRoster;
use crate::database::Database;
use crate::database::DatabaseError;
use crate::file_util;
use crate::file_util::PathError;
use crate::file_util::PathStatus;
use crate::inodeprint::inodeprint_of;
use crate::inodeprint::inodeprint_unchanged;
use crate::inodeprint::InodeprintMap;
use crate::marking::MarkingMap;
use crate::merge::make_roster_shape_for_merge;
use crate::merge::MergeError;
use crate::object_id::FileId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::repo_path::RepoPathBuf;
use crate::repo_path::BOOKKEEPING_DIR_NAME;
use crate::restriction::NodeRestriction;
use crate::restriction::PathRestriction;
use crate::revision::make_revision_for_workspace;
use crate::roster::AttrKey;
use crate::roster::AttrValue;
use crate::roster::EditableRoster;
use crate::roster::NodeId;
use crate::roster::Roster;
use crate::roster::TempNodeIdSource;
use crate::workspace::Workspace;
use crate::workspace::WorkspaceError;
use crate::workspace::WorkspaceHooks;
use crate::Origin;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error(transparent)]
    Db(#[from] DatabaseError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("{count} missing items; drop or revert them to restore consistency")]
    MissingItems { count: usize },
    #[error("no such file or directory: {0:?}")]
    NoSuchPath(RepoPathBuf),
    #[error("cannot add {goal:?}, because {blocking:?} is recorded as a file in the workspace manifest")]
    AddBlockedByFile {
        goal: RepoPathBuf,
        blocking: RepoPathBuf,
    },
    #[error("unable to drop the root directory")]
    DropRoot,
    #[error("cannot remove {0:?}, it is not empty")]
    DropNonEmpty(RepoPathBuf),
    #[error("cannot rename the workspace root (try pivot_root instead)")]
    RenameRoot,
    #[error("source file {0:?} is not versioned")]
    NotVersioned(RepoPathBuf),
    #[error("destination {0:?} already exists in the workspace manifest")]
    DestinationExists(RepoPathBuf),
    #[error("destination {0:?} is not a directory")]
    DestinationNotDirectory(RepoPathBuf),
    #[error("destination path's parent directory {0:?} does not exist")]
    MissingDestinationParent(RepoPathBuf),
    #[error("proposed new root directory {0:?} is not versioned or does not exist")]
    BadNewRoot(RepoPathBuf),
    #[error("proposed new root directory {0:?} is not a directory")]
    NewRootNotDirectory(RepoPathBuf),
    #[error("proposed new root directory {0:?} contains illegal path {BOOKKEEPING_DIR_NAME}")]
    NewRootContainsBookkeeping(RepoPathBuf),
    #[error("{0:?} is in the way")]
    PathInTheWay(RepoPathBuf),
    #[error("workspace is locked: {0} exists; remove it after cleaning up any interrupted update")]
    WorkspaceLocked(PathBuf),
    #[error("content of file {0:?} has changed, not overwriting")]
    ContentChangedOnDisk(RepoPathBuf),
    #[error("workspace conflicts: {}", paths_for_display(.0))]
    Conflicts(Vec<RepoPathBuf>),
}

fn paths_for_display(paths: &[RepoPathBuf]) -> String {
    let strings: Vec<&str> = paths.iter().map(|p| p.as_internal_string()).collect();
    strings.join(", ")
}

impl WorkError {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Db(err) => err.origin(),
            Self::Workspace(err) => err.origin(),
            Self::Path(_) => Origin::System,
            Self::Edit(_) | Self::Merge(_) => Origin::Internal,
            _ => Origin::User,
        }
    }
}

type Result<T> = std::result::Result<T, WorkError>;

/// How the working-copy engine obtains file payloads during a content
/// update: from the database, or from a merge result held in memory.
pub trait ContentSource {
    fn get_version(&self, id: &FileId) -> Result<Vec<u8>>;
}

impl ContentSource for Database {
    fn get_version(&self, id: &FileId) -> Result<Vec<u8>> {
        Ok(self.get_file_version(id)?)
    }
}

/// In-memory content source layered over another one; merge results park
/// freshly created file contents here before commit.
#[derive(Default)]
pub struct MemoryContentSource<'a> {
    contents: BTreeMap<FileId, Vec<u8>>,
    fallback: Option<&'a dyn ContentSource>,
}

impl<'a> MemoryContentSource<'a> {
    pub fn new(fallback: Option<&'a dyn ContentSource>) -> Self {
        Self {
            contents: BTreeMap::new(),
            fallback,
        }
    }

    pub fn insert(&mut self, data: Vec<u8>) -> FileId {
        let id = FileId::hash_of(&data);
        self.contents.insert(id.clone(), data);
        id
    }
}

impl ContentSource for MemoryContentSource<'_> {
    fn get_version(&self, id: &FileId) -> Result<Vec<u8>> {
        if let Some(data) = self.contents.get(id) {
            return Ok(data.clone());
        }
        match self.fallback {
            Some(source) => source.get_version(id),
            None => Err(WorkError::Db(DatabaseError::NotFound {
                object_type: "file",
                hex: id.hex(),
            })),
        }
    }
}

/// A parent of the workspace: its revision id and its stored roster.
pub struct WorkspaceParent {
    pub rid: RevisionId,
    pub roster: CachedRoster,
}

/// The working copy: a workspace plus the database its parents live in.
pub struct WorkingCopy<'a> {
    workspace: &'a Workspace,
    db: &'a Database,
    hooks: &'a dyn WorkspaceHooks,
}

impl<'a> WorkingCopy<'a> {
    pub fn new(workspace: &'a Workspace, db: &'a Database, hooks: &'a dyn WorkspaceHooks) -> Self {
        Self {
            workspace,
            db,
            hooks,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        self.workspace
    }

    /// One (revision id, roster) pair per parent of the pending
    /// revision. The null parent maps to an empty roster.
    pub fn get_parent_rosters(&self) -> Result<Vec<WorkspaceParent>> {
        let rev = self.workspace.get_work_rev()?;
        let mut parents = Vec::new();
        for rid in rev.edges.keys() {
            let roster = if rid.is_null() {
                (
                    std::sync::Arc::new(Roster::new()),
                    std::sync::Arc::new(MarkingMap::default()),
                )
            } else {
                self.db.get_roster_version(rid)?
            };
            parents.push(WorkspaceParent {
                rid: rid.clone(),
                roster,
            });
        }
        Ok(parents)
    }

    /// The current roster *shape*: parent roster(s) plus the pending
    /// cset. Structure and node ids are authoritative, file content ids
    /// are stale until refreshed from the filesystem.
    pub fn get_current_roster_shape(&self, nis: &mut TempNodeIdSource) -> Result<Roster> {
        let rev = self.workspace.get_work_rev()?;
        if rev.edges.len() == 2 {
            let mut edges = rev.edges.iter();
            let (left_rid, left_cs) = edges.next().unwrap();
            let (right_rid, right_cs) = edges.next().unwrap();
            let left = self.db.get_roster_version(left_rid)?;
            let right = self.db.get_roster_version(right_rid)?;
            Ok(make_roster_shape_for_merge(
                &left.0, left_cs, &right.0, right_cs, nis,
            )?)
        } else {
            assert_eq!(rev.edges.len(), 1, "a workspace has one or two parents");
            let (rid, cs) = rev.edges.iter().next().unwrap();
            let mut roster = if rid.is_null() {
                Roster::new()
            } else {
                self.db.get_roster_version(rid)?.0.as_ref().clone()
            };
            let mut er = EditableRoster::new(&mut roster, nis);
            cs.apply_to(&mut er)?;
            Ok(roster)
        }
    }

    /// Refreshes the file content ids of `roster` from the filesystem.
    ///
    /// Files whose cached inodeprint still matches keep the stale (=
    /// parent) content id without being read. Missing or type-mismatched
    /// entries are reported all together at the end; the scan itself
    /// never aborts early.
    #[instrument(skip_all)]
    pub fn update_current_roster_from_filesystem(
        &self,
        roster: &mut Roster,
        mask: &NodeRestriction,
    ) -> Result<()> {
        if !roster.has_root() {
            return Ok(());
        }
        let ipm: InodeprintMap = self.workspace.read_inodeprints()?;

        let mut missing_items = 0usize;
        let mut new_contents: Vec<(NodeId, FileId)> = Vec::new();
        for (path, nid) in roster.dfs() {
            if !mask.includes(roster, nid) {
                continue;
            }
            let node = roster.node(nid);
            let fs_path = self.workspace.fs_path(&path);

            if node.is_dir() {
                match file_util::path_status(&fs_path)? {
                    PathStatus::Directory => {}
                    PathStatus::Nonexistent => {
                        warn!("missing directory '{path}'");
                        missing_items += 1;
                    }
                    PathStatus::File => {
                        warn!("not a directory '{path}'");
                        missing_items += 1;
                    }
                }
                continue;
            }

            // Only read changed files; an unchanged inodeprint is a
            // witness that the content id is still right.
            if let Ok(current) = inodeprint_of(&fs_path) {
                if inodeprint_unchanged(&ipm, &path, &current) {
                    continue;
                }
            }

            match file_util::path_status(&fs_path)? {
                PathStatus::Nonexistent => {
                    warn!("missing file '{path}'");
                    missing_items += 1;
                    continue;
                }
                PathStatus::Directory => {
                    warn!("not a file '{path}'");
                    missing_items += 1;
                    continue;
                }
                PathStatus::File => {}
            }
            let fid = file_util::ident_existing_file(&fs_path)?;
            if node.content() != &fid {
                new_contents.push((nid, fid));
            }
        }
        for (nid, fid) in new_contents {
            roster.set_content(nid, &fid);
        }

        if missing_items > 0 {
            return Err(WorkError::MissingItems {
                count: missing_items,
            });
        }
        Ok(())
    }

    /// Tracked paths that do not exist on disk.
    pub fn find_missing(
        &self,
        roster: &Roster,
        mask: &NodeRestriction,
    ) -> Result<BTreeSet<RepoPathBuf>> {
        let mut missing = BTreeSet::new();
        for (path, nid) in roster.dfs() {
            if path.is_root() || !mask.includes(roster, nid) {
                continue;
            }
            if file_util::path_status(&self.workspace.fs_path(&path))? == PathStatus::Nonexistent {
                missing.insert(path);
            }
        }
        Ok(missing)
    }

    /// On-disk paths that are neither tracked nor ignored, and the
    /// ignored ones.
    pub fn find_unknown_and_ignored(
        &self,
        roots: &[RepoPathBuf],
        mask: &PathRestriction,
    ) -> Result<(BTreeSet<RepoPathBuf>, BTreeSet<RepoPathBuf>)> {
        let mut nis = TempNodeIdSource::new();
        let shape = self.get_current_roster_shape(&mut nis)?;
        let known = shape.extract_path_set();

        let mut unknown = BTreeSet::new();
        let mut ignored = BTreeSet::new();
        for root in roots {
            self.walk_tree(root, &mut |path, _is_dir| {
                if path.is_root() || known.contains(path) || !mask.includes(path) {
                    return Ok(true);
                }
                if self.hooks.ignore_file(path) {
                    ignored.insert(path.clone());
                    Ok(false)
                } else {
                    unknown.insert(path.clone());
                    Ok(true)
                }
            })?;
        }
        Ok((unknown, ignored))
    }

    /// Depth-first filesystem walk in name order, skipping the
    /// bookkeeping directory. The visitor decides whether to descend
    /// into each directory.
    fn walk_tree(
        &self,
        start: &RepoPathBuf,
        visit: &mut dyn FnMut(&RepoPathBuf, bool) -> Result<bool>,
    ) -> Result<()> {
        let fs_start = self.workspace.fs_path(start);
        let status = file_util::path_status(&fs_start)?;
        if status == PathStatus::Nonexistent {
            return Err(WorkError::NoSuchPath(start.clone()));
        }
        let descend = visit(start, status == PathStatus::Directory)?;
        if status != PathStatus::Directory || !descend {
            return Ok(());
        }
        let mut entries: Vec<String> = Vec::new();
        for entry in fs_start
            .read_dir()
            .map_err(|error| PathError {
                path: fs_start.clone(),
                error,
            })?
        {
            let entry = entry.map_err(|error| PathError {
                path: fs_start.clone(),
                error,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if start.is_root() && name == BOOKKEEPING_DIR_NAME {
                continue;
            }
            entries.push(name);
        }
        entries.sort();
        for name in entries {
            let child = start.join(
                &crate::repo_path::RepoPathComponentBuf::new(name)
                    .map_err(|err| EditError::message(err.to_string()))?,
            );
            self.walk_tree(&child, visit)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // additions

    /// Adds paths (and, with `recursive`, everything beneath them) to
    /// the workspace manifest. Missing intermediate directories are
    /// added implicitly; already-tracked and ignorable paths are
    /// skipped.
    #[instrument(skip(self, paths))]
    pub fn perform_additions(
        &self,
        paths: &BTreeSet<RepoPathBuf>,
        recursive: bool,
        respect_ignore: bool,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut nis = TempNodeIdSource::new();
        let mut roster = self.get_current_roster_shape(&mut nis)?;
        {
            let mut er = EditableRoster::new(&mut roster, &mut nis);
            if !er.roster.has_root() {
                let root = er.create_dir_node().map_err(WorkError::Edit)?;
                er.attach_node(root, &RepoPathBuf::root())
                    .map_err(WorkError::Edit)?;
            }

            for path in paths {
                if recursive {
                    self.walk_tree(path, &mut |path, is_dir| {
                        if is_dir {
                            self.add_visit_dir(&mut er, path, respect_ignore)
                        } else {
                            self.add_visit_file(&mut er, path, respect_ignore)?;
                            Ok(true)
                        }
                    })?;
                } else {
                    match file_util::path_status(&self.workspace.fs_path(path))? {
                        PathStatus::Nonexistent => {
                            return Err(WorkError::NoSuchPath(path.clone()));
                        }
                        _ => {
                            self.add_visit_file(&mut er, path, respect_ignore)?;
                        }
                    }
                }
            }
        }

        self.put_work_rev_for(&roster)
    }

    fn add_visit_dir(
        &self,
        er: &mut EditableRoster<'_>,
        path: &RepoPathBuf,
        respect_ignore: bool,
    ) -> Result<bool> {
        self.add_visit_file(er, path, respect_ignore)?;
        // don't recurse into ignored directories, it would just waste
        // time
        Ok(!self.hooks.ignore_file(path))
    }

    fn add_visit_file(
        &self,
        er: &mut EditableRoster<'_>,
        path: &RepoPathBuf,
        respect_ignore: bool,
    ) -> Result<()> {
        if respect_ignore && self.hooks.ignore_file(path) {
            info!("skipping ignorable file '{path}'");
            return Ok(());
        }
        if self.db.is_dbfile(&self.workspace.fs_path(path)) {
            info!("skipping database file '{path}'");
            return Ok(());
        }
        if er.roster.has_node_at(path) {
            if !path.is_root() {
                info!("skipping '{path}', already accounted for in workspace");
            }
            return Ok(());
        }
        self.add_nodes_for(er, path, path)
    }

    /// Materializes `path` and any missing ancestors, shallowest first.
    fn add_nodes_for(
        &self,
        er: &mut EditableRoster<'_>,
        path: &RepoPathBuf,
        goal: &RepoPathBuf,
    ) -> Result<()> {
        if let Some(node) = er.roster.node_at(path) {
            if !node.is_dir() {
                return Err(WorkError::AddBlockedByFile {
                    goal: goal.clone(),
                    blocking: path.clone(),
                });
            }
            return Ok(());
        }
        let parent = path.parent().expect("the root is always in the roster");
        self.add_nodes_for(er, &parent, goal)?;

        info!("adding '{path}' to workspace manifest");
        let nid = match file_util::path_status(&self.workspace.fs_path(path))? {
            PathStatus::Nonexistent => return Ok(()),
            PathStatus::File => {
                let fid = file_util::ident_existing_file(&self.workspace.fs_path(path))?;
                er.create_file_node(&fid).map_err(WorkError::Edit)?
            }
            PathStatus::Directory => er.create_dir_node().map_err(WorkError::Edit)?,
        };
        er.attach_node(nid, path).map_err(WorkError::Edit)?;

        for (key, value) in self.hooks.init_attributes(path) {
            er.set_attr(path, &key, &value).map_err(WorkError::Edit)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // deletions

    /// Drops paths from the workspace manifest, children before parents.
    /// Files whose on-disk content still matches the tracked content are
    /// also deleted from disk; changed files are left with a warning.
    #[instrument(skip(self, paths))]
    pub fn perform_deletions(
        &self,
        paths: &BTreeSet<RepoPathBuf>,
        recursive: bool,
        bookkeep_only: bool,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut nis = TempNodeIdSource::new();
        let mut roster = self.get_current_roster_shape(&mut nis)?;
        let parents = self.get_parent_rosters()?;

        // Deep paths first, so emptiness checks on directories see the
        // effect of dropping their children.
        let mut todo: Vec<RepoPathBuf> = paths.iter().cloned().collect();
        while let Some(path) = todo.pop() {
            if path.is_root() {
                return Err(WorkError::DropRoot);
            }
            let Some(node) = roster.node_at(&path) else {
                info!("skipping '{path}', not currently tracked");
                continue;
            };
            if node.is_dir() && !node.children().is_empty() {
                if !recursive {
                    return Err(WorkError::DropNonEmpty(path.clone()));
                }
                let children: Vec<RepoPathBuf> =
                    node.children().keys().map(|name| path.join(name)).collect();
                todo.push(path);
                todo.extend(children);
                continue;
            }

            let fs_path = self.workspace.fs_path(&path);
            let in_parent = parents
                .iter()
                .any(|parent| parent.roster.0.has_node(node.self_id()));
            if !bookkeep_only
                && file_util::path_status(&fs_path)? != PathStatus::Nonexistent
                && in_parent
            {
                if node.is_dir() {
                    if file_util::directory_empty(&fs_path)? {
                        file_util::delete_file_or_dir_shallow(&fs_path)?;
                    } else {
                        warn!("directory '{path}' not empty - it will be dropped but not deleted");
                    }
                } else {
                    let fid = file_util::ident_existing_file(&fs_path)?;
                    if node.content() == &fid {
                        file_util::delete_file_or_dir_shallow(&fs_path)?;
                    } else {
                        warn!("file '{path}' changed - it will be dropped but not deleted");
                    }
                }
            }
            info!("dropping '{path}' from workspace manifest");
            let nid = roster.detach_node_at(&path);
            roster.drop_detached_node(nid);
        }

        self.put_work_rev_for(&roster)
    }

    // ---------------------------------------------------------------
    // renames

    /// Renames `SRC DST`, or `SRC... DSTDIR` when the destination is a
    /// tracked directory. Missing destination parents are added
    /// implicitly; the on-disk move is best-effort.
    #[instrument(skip(self, srcs))]
    pub fn perform_rename(
        &self,
        srcs: &BTreeSet<RepoPathBuf>,
        dst: &RepoPathBuf,
        bookkeep_only: bool,
    ) -> Result<()> {
        assert!(!srcs.is_empty());
        let mut nis = TempNodeIdSource::new();
        let mut roster = self.get_current_roster_shape(&mut nis)?;
        let mut renames: BTreeSet<(RepoPathBuf, RepoPathBuf)> = BTreeSet::new();

        if srcs.len() == 1 && !roster.has_node_at(dst) {
            // rename SRC DST, DST names the new file
            let src = srcs.iter().next().unwrap();
            if src.is_root() {
                return Err(WorkError::RenameRoot);
            }
            if !roster.has_node_at(src) {
                return Err(WorkError::NotVersioned(src.clone()));
            }
            if src == dst || dst.starts_with(src) {
                warn!("cannot move '{src}' to a subdirectory of itself, '{dst}/{src}'");
            } else {
                let parent = dst.parent().unwrap_or_else(RepoPathBuf::root);
                if file_util::path_status(&self.workspace.fs_path(&parent))?
                    != PathStatus::Directory
                {
                    return Err(WorkError::MissingDestinationParent(parent));
                }
                renames.insert((src.clone(), dst.clone()));
                self.add_parent_dirs(&mut roster, &mut nis, dst)?;
            }
        } else {
            // rename SRC1 [SRC2 ...] DSTDIR
            if file_util::path_status(&self.workspace.fs_path(dst))? != PathStatus::Directory {
                return Err(WorkError::DestinationNotDirectory(dst.clone()));
            }
            for src in srcs {
                if src.is_root() {
                    return Err(WorkError::RenameRoot);
                }
                if !roster.has_node_at(src) {
                    return Err(WorkError::NotVersioned(src.clone()));
                }
                let basename = src.basename().expect("non-root path has a basename");
                let d = dst.join(&basename);
                if roster.has_node_at(&d) {
                    return Err(WorkError::DestinationExists(d));
                }
                if src == dst || dst.starts_with(src) {
                    warn!("cannot move '{src}' to a subdirectory of itself, '{dst}/{src}'");
                } else {
                    renames.insert((src.clone(), d.clone()));
                    self.add_parent_dirs(&mut roster, &mut nis, &d)?;
                }
            }
        }

        for (src, d) in &renames {
            let nid = roster.detach_node_at(src);
            roster.attach_node_at(nid, d);
            info!("renaming '{src}' to '{d}' in workspace manifest");
        }

        self.put_work_rev_for(&roster)?;

        if !bookkeep_only {
            for (src, d) in &renames {
                let have_src =
                    file_util::path_status(&self.workspace.fs_path(src))? != PathStatus::Nonexistent;
                let have_dst =
                    file_util::path_status(&self.workspace.fs_path(d))? != PathStatus::Nonexistent;
                match (have_src, have_dst) {
                    (true, false) => {
                        file_util::move_path(
                            &self.workspace.fs_path(src),
                            &self.workspace.fs_path(d),
                        )?;
                    }
                    (false, false) => {
                        warn!("'{src}' doesn't exist in workspace, skipping");
                    }
                    (true, true) => {
                        warn!(
                            "destination '{d}' already exists in workspace, \
                             skipping filesystem rename"
                        );
                    }
                    (false, true) => {
                        warn!(
                            "'{src}' doesn't exist in workspace and '{d}' does, \
                             skipping filesystem rename"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn add_parent_dirs(
        &self,
        roster: &mut Roster,
        nis: &mut TempNodeIdSource,
        dst: &RepoPathBuf,
    ) -> Result<()> {
        let mut er = EditableRoster::new(roster, nis);
        let parent = dst.parent().unwrap_or_else(RepoPathBuf::root);
        self.add_nodes_for(&mut er, &parent, &parent)
    }

    // ---------------------------------------------------------------
    // pivot root

    /// Makes `new_root` the root of the tree and moves the old root to
    /// `put_old` (interpreted relative to the new root).
    #[instrument(skip(self))]
    pub fn perform_pivot_root(
        &self,
        new_root: &RepoPathBuf,
        put_old: &RepoPathBuf,
        bookkeep_only: bool,
        move_conflicting_paths: bool,
    ) -> Result<()> {
        let mut nis = TempNodeIdSource::new();
        let old_roster = self.get_current_roster_shape(&mut nis)?;
        assert!(old_roster.has_root());

        let Some(new_root_node) = old_roster.node_at(new_root) else {
            return Err(WorkError::BadNewRoot(new_root.clone()));
        };
        if !new_root_node.is_dir() {
            return Err(WorkError::NewRootNotDirectory(new_root.clone()));
        }
        if new_root_node
            .children()
            .keys()
            .any(|name| name.as_str() == BOOKKEEPING_DIR_NAME)
        {
            return Err(WorkError::NewRootContainsBookkeeping(new_root.clone()));
        }

        // where the old root will land, expressed in current paths
        let current_path_to_put_old = put_old
            .components()
            .fold(new_root.clone(), |path, component| {
                path.join(&crate::repo_path::RepoPathComponentBuf::new(component).unwrap())
            });
        let put_old_parent = current_path_to_put_old
            .parent()
            .unwrap_or_else(RepoPathBuf::root);
        match old_roster.node_at(&put_old_parent) {
            None => return Err(WorkError::BadNewRoot(put_old_parent)),
            Some(node) if !node.is_dir() => {
                return Err(WorkError::NewRootNotDirectory(put_old_parent));
            }
            Some(_) => {}
        }
        if old_roster.has_node_at(&current_path_to_put_old) {
            return Err(WorkError::PathInTheWay(current_path_to_put_old));
        }

        let mut cs = Cset::default();
        cs.nodes_renamed
            .insert(RepoPathBuf::root(), put_old.clone());
        cs.nodes_renamed.insert(new_root.clone(), RepoPathBuf::root());

        let mut new_roster = old_roster.clone();
        {
            let mut er = EditableRoster::new(&mut new_roster, &mut nis);
            cs.apply_to(&mut er)?;
        }

        self.put_work_rev_for(&new_roster)?;

        if !bookkeep_only {
            self.perform_content_update(
                &old_roster,
                &new_roster,
                &cs,
                self.db,
                true,
                move_conflicting_paths,
            )?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // content update

    /// Applies `update` to the tree on disk: simulate first to collect
    /// conflicts, optionally move offending unversioned paths into
    /// `_MTN/resolutions`, then run for real through the staging
    /// directory.
    #[instrument(skip_all)]
    pub fn perform_content_update(
        &self,
        old_roster: &Roster,
        new_roster: &Roster,
        update: &Cset,
        source: &dyn ContentSource,
        messages: bool,
        move_conflicting_paths: bool,
    ) -> Result<()> {
        let detached = self.workspace.detached_dir();
        if detached.exists() {
            return Err(WorkError::WorkspaceLocked(detached));
        }

        // Simulated run against what is actually on disk. Unknown paths
        // are part of the model so they can block attaches.
        let known = old_roster.extract_path_set();
        let mut test_nis = TempNodeIdSource::new();
        let mut test_roster = Roster::new();
        let root = test_roster.create_dir_node(&mut test_nis);
        test_roster.attach_node(root, NodeId::NULL, None);
        self.walk_tree(&RepoPathBuf::root(), &mut |path, is_dir| {
            if path.is_root() {
                return Ok(true);
            }
            if is_dir {
                let nid = test_roster.create_dir_node(&mut test_nis);
                test_roster.attach_node_at(nid, path);
                // unknown directories block as a unit; don't look inside
                Ok(known.contains(path))
            } else {
                let nid = test_roster.create_file_node(FileId::null(), &mut test_nis);
                test_roster.attach_node_at(nid, path);
                Ok(true)
            }
        })?;

        let mut simulated = SimulatedWorkingTree {
            roster: test_roster,
            nis: test_nis,
            blocked_paths: BTreeSet::new(),
            conflicting_paths: BTreeSet::new(),
            nid_map: BTreeMap::new(),
        };
        update.apply_to(&mut simulated)?;
        if !simulated.conflicting_paths.is_empty() {
            let paths: Vec<RepoPathBuf> = simulated.conflicting_paths.iter().cloned().collect();
            if move_conflicting_paths {
                self.move_conflicting_paths_into_bookkeeping(&paths)?;
            } else {
                return Err(WorkError::Conflicts(paths));
            }
        }

        // The staging directory also acts as the workspace lock: it is
        // deleted only after a fully successful run.
        file_util::mkdir_p(&detached)?;
        {
            let mut real = EditableWorkingTree {
                wc: self,
                source,
                next_nid: 1,
                rename_add_drop_map: BTreeMap::new(),
                root_dir_attached: true,
                messages,
            };
            update.apply_to(&mut real)?;
        }

        // Reset attributes on everything the update created or touched.
        let mut touched: BTreeSet<&RepoPathBuf> = BTreeSet::new();
        touched.extend(update.dirs_added.iter());
        touched.extend(update.files_added.keys());
        touched.extend(update.nodes_renamed.values());
        touched.extend(update.deltas_applied.keys());
        touched.extend(update.attrs_set.keys().map(|(path, _)| path));
        for (path, key) in &update.attrs_cleared {
            self.hooks.clear_attribute(key, path);
            touched.insert(path);
        }
        for path in touched {
            if let Some(node) = new_roster.node_at(path) {
                for (key, (live, value)) in &node.attrs {
                    if *live {
                        self.hooks.set_attribute(key, path, value);
                    }
                }
            }
        }

        file_util::delete_file_or_dir_shallow(&detached)?;
        Ok(())
    }

    fn move_conflicting_paths_into_bookkeeping(&self, paths: &[RepoPathBuf]) -> Result<()> {
        assert!(!paths.is_empty());
        let resolutions = self.workspace.resolutions_dir();
        file_util::mkdir_p(&resolutions)?;
        for path in paths {
            if let Some(parent) = path.parent() {
                if !parent.is_root() {
                    file_util::mkdir_p(&parent.to_fs_path(&resolutions))?;
                }
            }
            let from = self.workspace.fs_path(path);
            let to = path.to_fs_path(&resolutions);
            file_util::move_path(&from, &to)?;
            info!("moved conflicting path '{path}' to '{}'", to.display());
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // inodeprints

    /// After commit, refreshes cached inodeprints for files whose
    /// on-disk content provably matches a parent's tracked content, and
    /// only within the given restriction.
    pub fn maybe_update_inodeprints(&self, mask: &NodeRestriction) -> Result<()> {
        if !self.workspace.in_inodeprints_mode() {
            return Ok(());
        }
        let parents = self.get_parent_rosters()?;
        let mut nis = TempNodeIdSource::new();
        let mut roster = self.get_current_roster_shape(&mut nis)?;
        self.update_current_roster_from_filesystem(&mut roster, mask)?;

        let mut ipm = self.workspace.read_inodeprints()?;
        for (path, nid) in roster.dfs() {
            let node = roster.node(nid);
            if !node.is_file() || !mask.includes(&roster, nid) {
                continue;
            }
            let mut in_any_parent = false;
            let mut matches_all = true;
            for parent in &parents {
                if let Some(parent_node) = parent.roster.0.get(nid) {
                    in_any_parent = true;
                    if !parent_node.is_file() || parent_node.content() != node.content() {
                        matches_all = false;
                    }
                }
            }
            if in_any_parent && matches_all {
                if let Ok(print) = inodeprint_of(&self.workspace.fs_path(&path)) {
                    ipm.insert(path, print);
                }
            }
        }
        self.workspace.write_inodeprints(&ipm)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // misc

    /// Whether the workspace differs from its parent(s) at all.
    pub fn has_changes(&self) -> Result<bool> {
        let parents = self.get_parent_rosters()?;
        if parents.len() != 1 {
            return Ok(true);
        }
        let mut nis = TempNodeIdSource::new();
        let shape = self.get_current_roster_shape(&mut nis)?;
        Ok(*parents[0].roster.0 != shape)
    }

    fn put_work_rev_for(&self, roster: &Roster) -> Result<()> {
        let parents = self.get_parent_rosters()?;
        let pairs: Vec<(RevisionId, &Roster)> = parents
            .iter()
            .map(|parent| (parent.rid.clone(), parent.roster.0.as_ref()))
            .collect();
        let rev = make_revision_for_workspace(&pairs, roster);
        self.workspace.put_work_rev(&rev)?;
        Ok(())
    }
}

/// Dry run of a cset against a roster of what is on disk. Conflicts are
/// recorded instead of failing: an attach blocked by an unversioned
/// path, or a drop of a directory with unversioned contents.
struct SimulatedWorkingTree {
    roster: Roster,
    nis: TempNodeIdSource,
    blocked_paths: BTreeSet<RepoPathBuf>,
    conflicting_paths: BTreeSet<RepoPathBuf>,
    nid_map: BTreeMap<NodeId, RepoPathBuf>,
}

impl EditableTree for SimulatedWorkingTree {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId> {
        if !self.roster.has_node_at(src) {
            return Err(EditError::message(format!(
                "cannot update: '{src}' is missing from the workspace"
            )));
        }
        let nid = self.roster.detach_node_at(src);
        self.nid_map.insert(nid, src.clone());
        Ok(nid)
    }

    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()> {
        let node = self.roster.node(nid);
        if node.is_dir() && !node.children().is_empty() {
            let path = self.nid_map.get(&nid).expect("dropped node was detached");
            warn!("cannot drop non-empty directory '{path}'");
            for name in node.children().keys() {
                self.conflicting_paths.insert(path.join(name));
            }
        }
        Ok(())
    }

    fn create_dir_node(&mut self) -> EditResult<NodeId> {
        Ok(self.roster.create_dir_node(&mut self.nis))
    }

    fn create_file_node(&mut self, _content: &FileId) -> EditResult<NodeId> {
        Ok(self.roster.create_file_node(FileId::null(), &mut self.nis))
    }

    fn attach_node(&mut self, nid: NodeId, dst: &RepoPathBuf) -> EditResult<()> {
        // checkout attaches a root over the model's synthetic root;
        // that is never a real conflict
        if dst.is_root() && self.roster.has_root() {
            return Ok(());
        }
        if self.roster.has_node_at(dst) {
            warn!("attach node {nid} blocked by unversioned path '{dst}'");
            self.blocked_paths.insert(dst.clone());
            self.conflicting_paths.insert(dst.clone());
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            if self.blocked_paths.contains(&parent) {
                warn!("attach node {nid} blocked by blocked parent '{parent}'");
                self.blocked_paths.insert(dst.clone());
                return Ok(());
            }
        }
        self.roster.attach_node_at(nid, dst);
        Ok(())
    }

    fn apply_delta(&mut self, _: &RepoPathBuf, _: &FileId, _: &FileId) -> EditResult<()> {
        // a non-file at the path is caught by the earlier filesystem scan
        Ok(())
    }

    fn clear_attr(&mut self, _: &RepoPathBuf, _: &AttrKey) -> EditResult<()> {
        Ok(())
    }

    fn set_attr(&mut self, _: &RepoPathBuf, _: &AttrKey, _: &AttrValue) -> EditResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> EditResult<()> {
        if !self.conflicting_paths.is_empty() {
            warn!("{} workspace conflicts", self.conflicting_paths.len());
        }
        Ok(())
    }
}

// Attaching and detaching the root directory is special: the root is the
// working directory itself and cannot be moved. Detaching it moves its
// contents (minus the bookkeeping directory) into the staging entry and
// flags the root as logically detached; attaching moves contents back.
struct EditableWorkingTree<'a> {
    wc: &'a WorkingCopy<'a>,
    source: &'a dyn ContentSource,
    next_nid: u32,
    rename_add_drop_map: BTreeMap<PathBuf, RepoPathBuf>,
    root_dir_attached: bool,
    messages: bool,
}

impl EditableWorkingTree<'_> {
    fn staging_path(&self, nid: NodeId) -> PathBuf {
        self.wc.workspace.detached_dir().join(nid.to_string())
    }

    fn move_dir_contents(&self, from: &PathBuf, to: &PathBuf, skip_bookkeeping: bool) -> Result<()> {
        let mut names = Vec::new();
        for entry in from.read_dir().map_err(|error| PathError {
            path: from.clone(),
            error,
        })? {
            let entry = entry.map_err(|error| PathError {
                path: from.clone(),
                error,
            })?;
            let name = entry.file_name();
            if skip_bookkeeping && name.to_string_lossy() == BOOKKEEPING_DIR_NAME {
                continue;
            }
            names.push(name);
        }
        names.sort();
        for name in names {
            file_util::move_path(&from.join(&name), &to.join(&name))?;
        }
        Ok(())
    }
}

impl EditableTree for EditableWorkingTree<'_> {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId> {
        assert!(self.root_dir_attached);
        let nid = NodeId::from_raw(self.next_nid);
        self.next_nid += 1;
        let staging = self.staging_path(nid);
        self.rename_add_drop_map.insert(staging.clone(), src.clone());
        if src.is_root() {
            // detach the root by moving its contents, not the dir itself
            file_util::mkdir_p(&staging).map_err(EditError::other)?;
            self.move_dir_contents(&self.wc.workspace.root().to_path_buf(), &staging, true)
                .map_err(EditError::other)?;
            self.root_dir_attached = false;
        } else {
            file_util::move_path(&self.wc.workspace.fs_path(src), &staging)
                .map_err(EditError::other)?;
        }
        Ok(nid)
    }

    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()> {
        let staging = self.staging_path(nid);
        let src = self
            .rename_add_drop_map
            .remove(&staging)
            .expect("dropped node was never detached");
        if self.messages {
            info!("dropping '{src}'");
        }
        file_util::delete_file_or_dir_shallow(&staging).map_err(EditError::other)
    }

    fn create_dir_node(&mut self) -> EditResult<NodeId> {
        let nid = NodeId::from_raw(self.next_nid);
        self.next_nid += 1;
        let staging = self.staging_path(nid);
        assert!(!staging.exists(), "staging entry {nid} already exists");
        file_util::mkdir_p(&staging).map_err(EditError::other)?;
        Ok(nid)
    }

    fn create_file_node(&mut self, content: &FileId) -> EditResult<NodeId> {
        let nid = NodeId::from_raw(self.next_nid);
        self.next_nid += 1;
        let staging = self.staging_path(nid);
        assert!(!staging.exists(), "staging entry {nid} already exists");
        let data = self.source.get_version(content).map_err(EditError::other)?;
        file_util::write_data(&staging, &data).map_err(EditError::other)?;
        Ok(nid)
    }

    fn attach_node(&mut self, nid: NodeId, dst: &RepoPathBuf) -> EditResult<()> {
        let staging = self.staging_path(nid);
        match self.rename_add_drop_map.remove(&staging) {
            Some(src) => {
                if self.messages {
                    info!("renaming '{src}' to '{dst}'");
                }
            }
            None => {
                if self.messages {
                    info!("adding '{dst}'");
                }
            }
        }
        if dst.is_root() {
            // root attach: move the staged contents back into place
            self.move_dir_contents(&staging, &self.wc.workspace.root().to_path_buf(), false)
                .map_err(EditError::other)?;
            file_util::delete_file_or_dir_shallow(&staging).map_err(EditError::other)?;
            self.root_dir_attached = true;
        } else {
            file_util::move_path(&staging, &self.wc.workspace.fs_path(dst))
                .map_err(EditError::other)?;
        }
        Ok(())
    }

    fn apply_delta(&mut self, path: &RepoPathBuf, old_id: &FileId, new_id: &FileId) -> EditResult<()> {
        let fs_path = self.wc.workspace.fs_path(path);
        let current = file_util::ident_existing_file(&fs_path).map_err(EditError::other)?;
        if current != *old_id {
            return Err(EditError::other(WorkError::ContentChangedOnDisk(
                path.clone(),
            )));
        }
        if self.messages {
            info!("updating '{path}'");
        }
        let data = self.source.get_version(new_id).map_err(EditError::other)?;
        file_util::write_data(&fs_path, &data).map_err(EditError::other)
    }

    fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) -> EditResult<()> {
        self.wc.hooks.clear_attribute(key, path);
        Ok(())
    }

    fn set_attr(&mut self, path: &RepoPathBuf, key: &AttrKey, value: &AttrValue) -> EditResult<()> {
        self.wc.hooks.set_attribute(key, path, value);
        Ok(())
    }

    fn commit(&mut self) -> EditResult<()> {
        assert!(
            self.rename_add_drop_map.is_empty(),
            "content update left staged entries behind"
        );
        assert!(self.root_dir_attached, "content update left the root detached");
        Ok(())
    }
}
