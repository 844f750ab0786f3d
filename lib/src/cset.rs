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

//! Changesets: the difference between two trees.
//!
//! A [`Cset`] is a pure value; applying one to an actual tree goes through
//! the [`EditableTree`] seam, which is implemented by in-memory rosters,
//! by the merge adapters, and by the working-copy engine (both its
//! simulated dry run and the real filesystem run).

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use thiserror::Error;

use crate::basic_io;
use crate::basic_io::BasicIoError;
use crate::basic_io::Printer;
use crate::basic_io::Stanza;
use crate::object_id::FileId;
use crate::object_id::ObjectId as _;
use crate::repo_path::RepoPathBuf;
use crate::roster::AttrKey;
use crate::roster::AttrValue;
use crate::roster::NodeId;

/// Error produced by an [`EditableTree`] implementation. The underlying
/// cause depends on the tree: a roster edit fails on inconsistent input,
/// a working-copy edit fails on filesystem state.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct EditError(pub Box<dyn std::error::Error + Send + Sync>);

impl EditError {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }
}

pub type EditResult<T> = Result<T, EditError>;

/// The tree-mutation seam a cset is applied through.
///
/// Node ids handed out by `detach_node`/`create_*_node` are only
/// meaningful to the same tree; the working-copy implementation uses them
/// to name staging entries rather than roster nodes.
pub trait EditableTree {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId>;
    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()>;

    fn create_dir_node(&mut self) -> EditResult<NodeId>;
    fn create_file_node(&mut self, content: &FileId) -> EditResult<NodeId>;
    fn attach_node(&mut self, nid: NodeId, dst: &RepoPathBuf) -> EditResult<()>;

    fn apply_delta(
        &mut self,
        path: &RepoPathBuf,
        old_id: &FileId,
        new_id: &FileId,
    ) -> EditResult<()>;
    fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) -> EditResult<()>;
    fn set_attr(
        &mut self,
        path: &RepoPathBuf,
        key: &AttrKey,
        value: &AttrValue,
    ) -> EditResult<()>;

    fn commit(&mut self) -> EditResult<()>;
}

/// A set-valued change description between two rosters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cset {
    pub nodes_deleted: BTreeSet<RepoPathBuf>,
    pub dirs_added: BTreeSet<RepoPathBuf>,
    pub files_added: BTreeMap<RepoPathBuf, FileId>,
    pub nodes_renamed: BTreeMap<RepoPathBuf, RepoPathBuf>,
    pub deltas_applied: BTreeMap<RepoPathBuf, (FileId, FileId)>,
    pub attrs_cleared: BTreeSet<(RepoPathBuf, AttrKey)>,
    pub attrs_set: BTreeMap<(RepoPathBuf, AttrKey), AttrValue>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsetError {
    #[error("changeset names path {0:?} both as deleted and as added")]
    DeleteAddOverlap(RepoPathBuf),
    #[error("changeset renames {0:?} to two destinations")]
    RenameFanout(RepoPathBuf),
    #[error("changeset patches added file {0:?}")]
    PatchedAddition(RepoPathBuf),
    #[error(transparent)]
    Io(#[from] BasicIoError),
}

impl Cset {
    pub fn is_empty(&self) -> bool {
        self.nodes_deleted.is_empty()
            && self.dirs_added.is_empty()
            && self.files_added.is_empty()
            && self.nodes_renamed.is_empty()
            && self.deltas_applied.is_empty()
            && self.attrs_cleared.is_empty()
            && self.attrs_set.is_empty()
    }

    /// Internal consistency checks that do not need a roster.
    pub fn check_sane(&self) -> Result<(), CsetError> {
        for path in self.dirs_added.iter().chain(self.files_added.keys()) {
            if self.nodes_deleted.contains(path) {
                return Err(CsetError::DeleteAddOverlap(path.clone()));
            }
        }
        let mut rename_dsts = BTreeSet::new();
        for dst in self.nodes_renamed.values() {
            if !rename_dsts.insert(dst) {
                return Err(CsetError::RenameFanout(dst.clone()));
            }
        }
        for path in self.deltas_applied.keys() {
            if self.files_added.contains_key(path) {
                return Err(CsetError::PatchedAddition(path.clone()));
            }
        }
        Ok(())
    }

    /// Plays the changeset into a tree.
    ///
    /// Deleted paths and rename sources are detached bottom-up, then
    /// deletions are dropped, then creations and reattachments happen
    /// top-down, then content deltas and attribute edits are applied.
    pub fn apply_to(&self, tree: &mut dyn EditableTree) -> EditResult<()> {
        // src -> rename destination (None for a deletion)
        let mut detaches: BTreeMap<&RepoPathBuf, Option<&RepoPathBuf>> = BTreeMap::new();
        for src in &self.nodes_deleted {
            detaches.insert(src, None);
        }
        for (src, dst) in &self.nodes_renamed {
            detaches.insert(src, Some(dst));
        }

        let mut attaches: Vec<(RepoPathBuf, NodeId)> = Vec::new();
        let mut drops = Vec::new();
        for (src, dst) in detaches.iter().rev() {
            let nid = tree.detach_node(src)?;
            match dst {
                Some(dst) => attaches.push(((*dst).clone(), nid)),
                None => drops.push(nid),
            }
        }
        for nid in drops {
            tree.drop_detached_node(nid)?;
        }

        for path in &self.dirs_added {
            let nid = tree.create_dir_node()?;
            attaches.push((path.clone(), nid));
        }
        for (path, content) in &self.files_added {
            let nid = tree.create_file_node(content)?;
            attaches.push((path.clone(), nid));
        }

        attaches.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (path, nid) in &attaches {
            tree.attach_node(*nid, path)?;
        }

        for (path, (old_id, new_id)) in &self.deltas_applied {
            tree.apply_delta(path, old_id, new_id)?;
        }
        for (path, key) in &self.attrs_cleared {
            tree.clear_attr(path, key)?;
        }
        for ((path, key), value) in &self.attrs_set {
            tree.set_attr(path, key, value)?;
        }

        tree.commit()
    }

    /// Appends the canonical stanza sequence to `printer`.
    pub fn print_to(&self, printer: &mut Printer) {
        for path in &self.nodes_deleted {
            printer.stanza(Stanza::new().push_str("delete", path.as_internal_string()));
        }
        for (src, dst) in &self.nodes_renamed {
            printer.stanza(
                Stanza::new()
                    .push_str("rename", src.as_internal_string())
                    .push_str("to", dst.as_internal_string()),
            );
        }
        for path in &self.dirs_added {
            printer.stanza(Stanza::new().push_str("add_dir", path.as_internal_string()));
        }
        for (path, content) in &self.files_added {
            printer.stanza(
                Stanza::new()
                    .push_str("add_file", path.as_internal_string())
                    .push_hex("content", content.hex()),
            );
        }
        for (path, (old_id, new_id)) in &self.deltas_applied {
            printer.stanza(
                Stanza::new()
                    .push_str("patch", path.as_internal_string())
                    .push_hex("from", old_id.hex())
                    .push_hex("to", new_id.hex()),
            );
        }
        for (path, key) in &self.attrs_cleared {
            printer.stanza(
                Stanza::new()
                    .push_str("clear", path.as_internal_string())
                    .push_str("attr", key.as_str()),
            );
        }
        for ((path, key), value) in &self.attrs_set {
            printer.stanza(
                Stanza::new()
                    .push_str("set", path.as_internal_string())
                    .push_str("attr", key.as_str())
                    .push_str("value", value.as_str()),
            );
        }
    }

    /// Parses cset stanzas until a non-cset symbol (or end of input).
    pub fn parse_from(parser: &mut basic_io::Parser<'_>) -> Result<Self, CsetError> {
        let mut cs = Self::default();
        loop {
            if parser.at("delete") {
                parser.expect("delete")?;
                cs.nodes_deleted.insert(parse_path(parser)?);
            } else if parser.at("rename") {
                parser.expect("rename")?;
                let src = parse_path(parser)?;
                parser.expect("to")?;
                cs.nodes_renamed.insert(src, parse_path(parser)?);
            } else if parser.at("add_dir") {
                parser.expect("add_dir")?;
                cs.dirs_added.insert(parse_path(parser)?);
            } else if parser.at("add_file") {
                parser.expect("add_file")?;
                let path = parse_path(parser)?;
                parser.expect("content")?;
                cs.files_added.insert(path, parse_file_id(parser)?);
            } else if parser.at("patch") {
                parser.expect("patch")?;
                let path = parse_path(parser)?;
                parser.expect("from")?;
                let old_id = parse_file_id(parser)?;
                parser.expect("to")?;
                cs.deltas_applied
                    .insert(path, (old_id, parse_file_id(parser)?));
            } else if parser.at("clear") {
                parser.expect("clear")?;
                let path = parse_path(parser)?;
                parser.expect("attr")?;
                cs.attrs_cleared
                    .insert((path, AttrKey::from(parser.str_value()?)));
            } else if parser.at("set") {
                parser.expect("set")?;
                let path = parse_path(parser)?;
                parser.expect("attr")?;
                let key = AttrKey::from(parser.str_value()?);
                parser.expect("value")?;
                cs.attrs_set
                    .insert((path, key), AttrValue::from(parser.str_value()?));
            } else {
                break;
            }
        }
        Ok(cs)
    }
}

fn parse_path(parser: &mut basic_io::Parser<'_>) -> Result<RepoPathBuf, CsetError> {
    let raw = parser.str_value()?;
    RepoPathBuf::from_internal_string(raw).map_err(|err| {
        CsetError::Io(BasicIoError::Syntax {
            line: 0,
            reason: err.to_string(),
        })
    })
}

fn parse_file_id(parser: &mut basic_io::Parser<'_>) -> Result<FileId, CsetError> {
    let hex = parser.hex_value()?;
    FileId::try_from_hex(&hex).map_err(|err| {
        CsetError::Io(BasicIoError::Syntax {
            line: 0,
            reason: err.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn repo_path(value: &str) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(value).unwrap()
    }

    fn sample_cset() -> Cset {
        let mut cs = Cset::default();
        cs.nodes_deleted.insert(repo_path("gone"));
        cs.nodes_renamed.insert(repo_path("old"), repo_path("new"));
        cs.dirs_added.insert(repo_path("dir"));
        cs.files_added
            .insert(repo_path("dir/f"), FileId::hash_of(b"hello\n"));
        cs.deltas_applied.insert(
            repo_path("patched"),
            (FileId::hash_of(b"a"), FileId::hash_of(b"b")),
        );
        cs.attrs_cleared
            .insert((repo_path("new"), AttrKey::from("mtn:execute")));
        cs.attrs_set.insert(
            (repo_path("dir/f"), AttrKey::from("mtn:manual_merge")),
            AttrValue::from("true"),
        );
        cs
    }

    #[test]
    fn print_parse_round_trip() {
        let cs = sample_cset();
        let mut printer = Printer::new();
        cs.print_to(&mut printer);
        let text = printer.finish();
        let mut parser = basic_io::Parser::new(&text).unwrap();
        let parsed = Cset::parse_from(&mut parser).unwrap();
        parser.expect_eof().unwrap();
        assert_eq!(parsed, cs);
    }

    #[test]
    fn canonical_text() {
        let mut cs = Cset::default();
        cs.nodes_renamed.insert(repo_path("a"), repo_path("b"));
        let mut printer = Printer::new();
        cs.print_to(&mut printer);
        assert_eq!(
            printer.finish(),
            indoc! {r#"
                rename "a"
                    to "b"
            "#}
        );
    }

    #[test]
    fn sanity_rejects_overlap() {
        let mut cs = Cset::default();
        cs.nodes_deleted.insert(repo_path("x"));
        cs.dirs_added.insert(repo_path("x"));
        assert_eq!(
            cs.check_sane(),
            Err(CsetError::DeleteAddOverlap(repo_path("x")))
        );
    }
}
