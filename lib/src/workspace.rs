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

//! The bookkeeping half of the workspace: the `_MTN` directory and every
//! file in it.
//!
//! `_MTN/revision` holds the pending revision: the parent id(s) plus a
//! shape-only cset. Files changed solely in content never appear there;
//! recovering them is the job of the filesystem scan in
//! [`crate::working_copy`].

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::basic_io;
use crate::basic_io::BasicIoError;
use crate::basic_io::Printer;
use crate::basic_io::Stanza;
use crate::basic_io::Value;
use crate::bisect::BisectEntry;
use crate::bisect::BisectType;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::inodeprint::read_inodeprint_map;
use crate::inodeprint::write_inodeprint_map;
use crate::inodeprint::InodeprintMap;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::repo_path::RepoPathBuf;
use crate::repo_path::BOOKKEEPING_DIR_NAME;
use crate::revision::MadeFor;
use crate::revision::Revision;
use crate::roster::AttrKey;
use crate::roster::AttrValue;
use crate::Origin;

const REVISION_FILE: &str = "revision";
const OPTIONS_FILE: &str = "options";
const LOG_FILE: &str = "log";
const COMMIT_FILE: &str = "commit";
const INODEPRINTS_FILE: &str = "inodeprints";
const BISECT_FILE: &str = "bisect";
const UPDATE_FILE: &str = "update";
const FORMAT_FILE: &str = "format";
const LOCAL_DUMP_FILE: &str = "debug";
pub(crate) const DETACHED_DIR: &str = "detached";
pub(crate) const RESOLUTIONS_DIR: &str = "resolutions";

/// The workspace format this implementation reads and writes.
pub const CURRENT_WORKSPACE_FORMAT: u32 = 2;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("directory {0} is not a workspace (no {BOOKKEEPING_DIR_NAME} directory)")]
    NotAWorkspace(PathBuf),
    #[error("directory {0} is already a workspace")]
    AlreadyAWorkspace(PathBuf),
    #[error(
        "workspace is in format {found}, this program understands format \
         {CURRENT_WORKSPACE_FORMAT}"
    )]
    UnsupportedFormat { found: String },
    #[error("malformed {file} file: {reason}")]
    Malformed { file: &'static str, reason: String },
    #[error(transparent)]
    Path(#[from] PathError),
}

impl WorkspaceError {
    pub fn origin(&self) -> Origin {
        match self {
            Self::NotAWorkspace(_) | Self::AlreadyAWorkspace(_) => Origin::User,
            Self::UnsupportedFormat { .. } | Self::Malformed { .. } => Origin::Workspace,
            Self::Path(_) => Origin::System,
        }
    }
}

type Result<T> = std::result::Result<T, WorkspaceError>;

fn malformed(file: &'static str, err: impl ToString) -> WorkspaceError {
    WorkspaceError::Malformed {
        file,
        reason: err.to_string(),
    }
}

/// Persistent per-workspace options: where the database lives, which
/// branch the workspace follows, which key signs commits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    pub database: Option<PathBuf>,
    pub branch: Option<String>,
    pub key: Option<String>,
    pub keydir: Option<PathBuf>,
}

impl Options {
    fn print(&self) -> String {
        let mut stanza = Stanza::new();
        if let Some(database) = &self.database {
            stanza.push_str("database", database.display().to_string());
        }
        if let Some(branch) = &self.branch {
            stanza.push_str("branch", branch.clone());
        }
        if let Some(key) = &self.key {
            stanza.push_str("key", key.clone());
        }
        if let Some(keydir) = &self.keydir {
            stanza.push_str("keydir", keydir.display().to_string());
        }
        let mut printer = Printer::new();
        printer.stanza(&stanza);
        printer.finish()
    }

    fn parse(text: &str) -> std::result::Result<Options, BasicIoError> {
        let mut parser = basic_io::Parser::new(text)?;
        let mut options = Options::default();
        while parser.at_symbol() {
            let symbol = parser.symbol()?;
            let value = parser.str_value()?;
            match symbol.as_str() {
                "database" => options.database = Some(PathBuf::from(value)),
                "branch" => options.branch = Some(value),
                "key" => options.key = Some(value),
                "keydir" => options.keydir = Some(PathBuf::from(value)),
                other => debug!("ignoring unknown workspace option {other:?}"),
            }
        }
        parser.expect_eof()?;
        Ok(options)
    }
}

/// Whether `dir` has a bookkeeping directory at its root.
pub fn directory_is_workspace(dir: &Path) -> bool {
    dir.join(BOOKKEEPING_DIR_NAME).is_dir()
}

/// Walks up from `start` looking for a workspace root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        if directory_is_workspace(dir) {
            return Some(dir.to_owned());
        }
        dir = dir.parent()?;
    }
}

/// An open workspace: the tree root plus its `_MTN` directory.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Turns `dir` into a workspace: creates `_MTN`, the format file,
    /// and the options file.
    pub fn create(dir: &Path, options: &Options) -> Result<Workspace> {
        if directory_is_workspace(dir) {
            return Err(WorkspaceError::AlreadyAWorkspace(dir.to_owned()));
        }
        file_util::mkdir_p(dir)?;
        let bookkeeping = dir.join(BOOKKEEPING_DIR_NAME);
        fs::create_dir(&bookkeeping).context(&bookkeeping)?;
        let workspace = Workspace {
            root: dir.to_owned(),
        };
        workspace.write_format()?;
        workspace.set_options(options)?;
        // A fresh workspace hangs off the null revision with no pending
        // changes.
        workspace.put_work_rev(&Revision {
            new_manifest: crate::revision::fake_manifest_id(),
            edges: [(RevisionId::null(), Default::default())].into(),
            made_for: MadeFor::Workspace,
        })?;
        Ok(workspace)
    }

    /// Opens an existing workspace and checks its format.
    pub fn open(root: &Path) -> Result<Workspace> {
        if !directory_is_workspace(root) {
            return Err(WorkspaceError::NotAWorkspace(root.to_owned()));
        }
        let workspace = Workspace {
            root: root.to_owned(),
        };
        workspace.check_format()?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bookkeeping_root(&self) -> PathBuf {
        self.root.join(BOOKKEEPING_DIR_NAME)
    }

    pub fn bookkeeping_path(&self, name: &str) -> PathBuf {
        self.bookkeeping_root().join(name)
    }

    /// On-disk location of a repository path.
    pub fn fs_path(&self, path: &RepoPathBuf) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    pub fn detached_dir(&self) -> PathBuf {
        self.bookkeeping_path(DETACHED_DIR)
    }

    pub fn resolutions_dir(&self) -> PathBuf {
        self.bookkeeping_path(RESOLUTIONS_DIR)
    }

    pub fn local_dump_path(&self) -> PathBuf {
        self.bookkeeping_path(LOCAL_DUMP_FILE)
    }

    fn read_bookkeeping_string(&self, name: &'static str) -> Result<String> {
        let path = self.bookkeeping_path(name);
        let bytes = file_util::read_data(&path)?;
        String::from_utf8(bytes).map_err(|err| malformed(name, err))
    }

    fn write_bookkeeping_string(&self, name: &'static str, contents: &str) -> Result<()> {
        let path = self.bookkeeping_path(name);
        file_util::write_data(&path, contents.as_bytes())?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // format

    pub fn write_format(&self) -> Result<()> {
        self.write_bookkeeping_string(FORMAT_FILE, &format!("{CURRENT_WORKSPACE_FORMAT}\n"))
    }

    pub fn check_format(&self) -> Result<()> {
        let raw = self.read_bookkeeping_string(FORMAT_FILE)?;
        let found = raw.trim();
        if found != CURRENT_WORKSPACE_FORMAT.to_string() {
            return Err(WorkspaceError::UnsupportedFormat {
                found: found.to_owned(),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // options

    pub fn get_options(&self) -> Result<Options> {
        let text = self.read_bookkeeping_string(OPTIONS_FILE)?;
        Options::parse(&text).map_err(|err| malformed(OPTIONS_FILE, err))
    }

    pub fn set_options(&self, options: &Options) -> Result<()> {
        self.write_bookkeeping_string(OPTIONS_FILE, &options.print())
    }

    /// Fills in options that are unset in the file without clobbering
    /// ones already persisted; the branch is only made sticky by the
    /// caller passing it here.
    pub fn maybe_set_options(&self, options: &Options) -> Result<()> {
        let mut current = self.get_options().unwrap_or_default();
        if current.database.is_none() {
            current.database.clone_from(&options.database);
        }
        if current.branch.is_none() {
            current.branch.clone_from(&options.branch);
        }
        if current.key.is_none() {
            current.key.clone_from(&options.key);
        }
        if current.keydir.is_none() {
            current.keydir.clone_from(&options.keydir);
        }
        self.set_options(&current)
    }

    // ---------------------------------------------------------------
    // the pending revision

    /// Reads the pending workspace revision.
    pub fn get_work_rev(&self) -> Result<Revision> {
        let text = self.read_bookkeeping_string(REVISION_FILE)?;
        let mut rev = Revision::parse(&text).map_err(|err| malformed(REVISION_FILE, err))?;
        rev.made_for = MadeFor::Workspace;
        for cs in rev.edges.values() {
            cs.check_sane().map_err(|err| malformed(REVISION_FILE, err))?;
        }
        Ok(rev)
    }

    /// Writes the pending revision; refuses one not made for the
    /// workspace.
    pub fn put_work_rev(&self, rev: &Revision) -> Result<()> {
        assert_eq!(rev.made_for, MadeFor::Workspace);
        rev.check_sane();
        self.write_bookkeeping_string(REVISION_FILE, &rev.print())
    }

    // ---------------------------------------------------------------
    // update id

    pub fn get_update_id(&self) -> Result<Option<RevisionId>> {
        let path = self.bookkeeping_path(UPDATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = self.read_bookkeeping_string(UPDATE_FILE)?;
        let rid = RevisionId::try_from_hex(raw.trim())
            .map_err(|err| malformed(UPDATE_FILE, err))?;
        Ok(Some(rid))
    }

    pub fn put_update_id(&self, update_id: &RevisionId) -> Result<()> {
        self.write_bookkeeping_string(UPDATE_FILE, &format!("{}\n", update_id.hex()))
    }

    // ---------------------------------------------------------------
    // user log and commit text

    pub fn read_user_log(&self) -> Result<String> {
        let path = self.bookkeeping_path(LOG_FILE);
        if !path.exists() {
            return Ok(String::new());
        }
        self.read_bookkeeping_string(LOG_FILE)
    }

    pub fn write_user_log(&self, text: &str) -> Result<()> {
        self.write_bookkeeping_string(LOG_FILE, text)
    }

    pub fn blank_user_log(&self) -> Result<()> {
        self.write_user_log("")
    }

    pub fn has_contents_user_log(&self) -> bool {
        self.read_user_log()
            .map(|text| !text.is_empty())
            .unwrap_or(false)
    }

    /// The commit message backup, written before commit proceeds so an
    /// aborted commit does not lose the text.
    pub fn save_commit_text(&self, text: &str) -> Result<()> {
        self.write_bookkeeping_string(COMMIT_FILE, text)
    }

    pub fn load_commit_text(&self) -> Result<String> {
        let path = self.bookkeeping_path(COMMIT_FILE);
        if !path.exists() {
            return Ok(String::new());
        }
        self.read_bookkeeping_string(COMMIT_FILE)
    }

    pub fn clear_commit_text(&self) -> Result<()> {
        let path = self.bookkeeping_path(COMMIT_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkspaceError::Path(PathError { path, error: err })),
        }
    }

    // ---------------------------------------------------------------
    // inodeprints

    pub fn in_inodeprints_mode(&self) -> bool {
        self.bookkeeping_path(INODEPRINTS_FILE).exists()
    }

    pub fn enable_inodeprints(&self) -> Result<()> {
        self.write_bookkeeping_string(INODEPRINTS_FILE, "")
    }

    pub fn read_inodeprints(&self) -> Result<InodeprintMap> {
        if !self.in_inodeprints_mode() {
            return Ok(InodeprintMap::new());
        }
        let text = self.read_bookkeeping_string(INODEPRINTS_FILE)?;
        read_inodeprint_map(&text).map_err(|err| malformed(INODEPRINTS_FILE, err))
    }

    pub fn write_inodeprints(&self, map: &InodeprintMap) -> Result<()> {
        self.write_bookkeeping_string(INODEPRINTS_FILE, &write_inodeprint_map(map))
    }

    // ---------------------------------------------------------------
    // bisect state

    pub fn get_bisect_info(&self) -> Result<Vec<BisectEntry>> {
        let path = self.bookkeeping_path(BISECT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = self.read_bookkeeping_string(BISECT_FILE)?;
        let mut parser =
            basic_io::Parser::new(&text).map_err(|err| malformed(BISECT_FILE, err))?;
        let mut entries = Vec::new();
        while parser.at("bisect") {
            parser
                .expect("bisect")
                .map_err(|err| malformed(BISECT_FILE, err))?;
            let tag_raw = parser.str_value().map_err(|err| malformed(BISECT_FILE, err))?;
            let tag = BisectType::from_str(&tag_raw)
                .ok_or_else(|| malformed(BISECT_FILE, format!("unknown tag {tag_raw:?}")))?;
            let hex = parser.hex_value().map_err(|err| malformed(BISECT_FILE, err))?;
            let rid =
                RevisionId::try_from_hex(&hex).map_err(|err| malformed(BISECT_FILE, err))?;
            entries.push((tag, rid));
        }
        parser
            .expect_eof()
            .map_err(|err| malformed(BISECT_FILE, err))?;
        Ok(entries)
    }

    pub fn put_bisect_info(&self, entries: &[BisectEntry]) -> Result<()> {
        let mut printer = Printer::new();
        for (tag, rid) in entries {
            printer.stanza(Stanza::new().push_values(
                "bisect",
                vec![
                    Value::Str(tag.as_str().to_owned()),
                    Value::Hex(rid.hex()),
                ],
            ));
        }
        self.write_bookkeeping_string(BISECT_FILE, &printer.finish())
    }

    pub fn remove_bisect_info(&self) -> Result<()> {
        let path = self.bookkeeping_path(BISECT_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkspaceError::Path(PathError { path, error: err })),
        }
    }
}

/// The Lua seam: ignore decisions, attribute initialization for new
/// files, and attribute application notifications.
pub trait WorkspaceHooks {
    fn ignore_file(&self, _path: &RepoPathBuf) -> bool {
        false
    }

    /// Initial attrs for a newly added path (e.g. `mtn:execute` for an
    /// executable file).
    fn init_attributes(&self, _path: &RepoPathBuf) -> Vec<(AttrKey, AttrValue)> {
        Vec::new()
    }

    fn set_attribute(&self, _key: &AttrKey, _path: &RepoPathBuf, _value: &AttrValue) {}

    fn clear_attribute(&self, _key: &AttrKey, _path: &RepoPathBuf) {}
}

/// Hook implementation that ignores nothing and sets nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl WorkspaceHooks for DefaultHooks {}
