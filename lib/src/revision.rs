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

//! Revisions: `(new manifest id, {parent revision id -> cset})`.
//!
//! A revision is fundamentally a text object with a canonical serialized
//! form; its id is the hash of those bytes. A root revision has a single
//! edge from the null id. A merge has two edges, and applying each edge's
//! cset to its parent's roster must produce the same tree.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::basic_io;
use crate::basic_io::BasicIoError;
use crate::basic_io::Printer;
use crate::basic_io::Stanza;
use crate::cset::Cset;
use crate::cset::CsetError;
use crate::object_id::ManifestId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::roster::make_cset;
use crate::roster::Roster;

/// What a revision object was constructed for. The workspace refuses to
/// persist database revisions and vice versa: workspace revisions carry a
/// fake manifest id and a shape-only cset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MadeFor {
    #[default]
    Nobody,
    Workspace,
    Database,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error(transparent)]
    Io(#[from] BasicIoError),
    #[error(transparent)]
    Cset(#[from] CsetError),
    #[error("bad value in revision: {0}")]
    BadValue(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Revision {
    pub new_manifest: ManifestId,
    pub edges: BTreeMap<RevisionId, Cset>,
    pub made_for: MadeFor,
}

/// The manifest id recorded in workspace revisions, where the real one is
/// not yet known.
pub fn fake_manifest_id() -> ManifestId {
    ManifestId::from_bytes(&[0xff; 20]).unwrap()
}

impl Revision {
    pub fn is_merge(&self) -> bool {
        self.edges.len() > 1
    }

    /// Trivial revisions have no effect; commit refuses them.
    pub fn is_nontrivial(&self) -> bool {
        self.is_merge() || self.edges.values().any(|cs| !cs.is_empty())
    }

    pub fn parent_ids(&self) -> impl Iterator<Item = &RevisionId> {
        self.edges.keys()
    }

    pub fn check_sane(&self) {
        assert!(!self.edges.is_empty(), "revision without edges");
        if self.is_merge() {
            for parent in self.edges.keys() {
                assert!(!parent.is_null(), "merge edge from the null revision");
            }
        }
        for cs in self.edges.values() {
            cs.check_sane().expect("insane cset in revision");
        }
    }

    /// Canonical serialization; the hash of these bytes is the revision
    /// id.
    pub fn print(&self) -> String {
        let mut printer = Printer::new();
        printer.stanza(Stanza::new().push_str("format_version", "1"));
        printer.stanza(Stanza::new().push_hex("new_manifest", self.new_manifest.hex()));
        for (parent, cs) in &self.edges {
            printer.stanza(Stanza::new().push_hex("old_revision", parent.hex()));
            cs.print_to(&mut printer);
        }
        printer.finish()
    }

    pub fn parse(text: &str) -> Result<Self, RevisionError> {
        let mut parser = basic_io::Parser::new(text)?;
        parser.expect("format_version")?;
        let version = parser.str_value()?;
        if version != "1" {
            return Err(RevisionError::BadValue(format!(
                "unknown format version {version:?}"
            )));
        }
        parser.expect("new_manifest")?;
        let new_manifest = ManifestId::try_from_hex(&parser.hex_value()?)
            .map_err(|err| RevisionError::BadValue(err.to_string()))?;
        let mut edges = BTreeMap::new();
        while parser.at("old_revision") {
            parser.expect("old_revision")?;
            let parent = RevisionId::try_from_hex(&parser.hex_value()?)
                .map_err(|err| RevisionError::BadValue(err.to_string()))?;
            let cs = Cset::parse_from(&mut parser)?;
            if edges.insert(parent.clone(), cs).is_some() {
                return Err(RevisionError::BadValue(format!(
                    "duplicate edge from {}",
                    parent.hex()
                )));
            }
        }
        parser.expect_eof()?;
        Ok(Self {
            new_manifest,
            edges,
            made_for: MadeFor::Nobody,
        })
    }

    pub fn ident(&self) -> RevisionId {
        RevisionId::hash_of(self.print().as_bytes())
    }
}

/// A one-parent revision from two rosters.
pub fn make_revision(old_rev_id: &RevisionId, old_roster: &Roster, new_roster: &Roster) -> Revision {
    let mut edges = BTreeMap::new();
    edges.insert(old_rev_id.clone(), make_cset(old_roster, new_roster));
    Revision {
        new_manifest: new_roster.manifest_id(),
        edges,
        made_for: MadeFor::Database,
    }
}

/// A revision from any number of parent rosters.
pub fn make_revision_from_parents(
    parents: &[(RevisionId, &Roster)],
    new_roster: &Roster,
) -> Revision {
    let mut edges = BTreeMap::new();
    for (old_rev_id, old_roster) in parents {
        edges.insert(old_rev_id.clone(), make_cset(old_roster, new_roster));
    }
    Revision {
        new_manifest: new_roster.manifest_id(),
        edges,
        made_for: MadeFor::Database,
    }
}

/// A workspace revision: fake manifest id, shape-only csets. Content-only
/// changes never appear in the bookkeeping revision.
pub fn make_revision_for_workspace(
    parents: &[(RevisionId, &Roster)],
    new_roster: &Roster,
) -> Revision {
    let mut edges = BTreeMap::new();
    for (old_rev_id, old_roster) in parents {
        let mut cs = make_cset(old_roster, new_roster);
        cs.deltas_applied.clear();
        edges.insert(old_rev_id.clone(), cs);
    }
    if edges.is_empty() {
        edges.insert(RevisionId::null(), make_cset(&Roster::new(), new_roster));
    }
    Revision {
        new_manifest: fake_manifest_id(),
        edges,
        made_for: MadeFor::Workspace,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::object_id::FileId;
    use crate::repo_path::RepoPathBuf;
    use crate::roster::NodeId;
    use crate::roster::NodeIdSource as _;
    use crate::roster::Roster;
    use crate::roster::TempNodeIdSource;

    fn root_only_roster() -> Roster {
        let mut nis = TempNodeIdSource::new();
        let mut roster = Roster::new();
        let root = roster.create_dir_node(&mut nis);
        roster.attach_node(root, NodeId::NULL, None);
        roster
    }

    #[test]
    fn print_parse_round_trip() {
        let r0 = root_only_roster();
        let mut r1 = r0.clone();
        let mut nis = TempNodeIdSource::new();
        nis.allocate();
        let file = r1.create_file_node(FileId::hash_of(b"hello\n"), &mut nis);
        r1.attach_node_at(file, &RepoPathBuf::from_internal_string("a").unwrap());

        let rev = make_revision(&RevisionId::from_bytes(&[9; 20]).unwrap(), &r0, &r1);
        let text = rev.print();
        let parsed = Revision::parse(&text).unwrap();
        assert_eq!(parsed.new_manifest, rev.new_manifest);
        assert_eq!(parsed.edges, rev.edges);
        assert_eq!(parsed.ident(), rev.ident());
    }

    #[test]
    fn root_revision_serializes_null_parent() {
        let r1 = root_only_roster();
        let rev = make_revision(&RevisionId::null(), &root_only_roster(), &r1);
        let text = rev.print();
        assert!(text.contains("old_revision []"));
        let parsed = Revision::parse(&text).unwrap();
        assert!(parsed.edges.keys().next().unwrap().is_null());
    }

    #[test]
    fn workspace_revision_drops_content_deltas() {
        let r0 = root_only_roster();
        let mut r1 = r0.clone();
        let mut nis = TempNodeIdSource::new();
        nis.allocate();
        let file = r1.create_file_node(FileId::hash_of(b"v1"), &mut nis);
        r1.attach_node_at(file, &RepoPathBuf::from_internal_string("a").unwrap());
        let mut r2 = r1.clone();
        r2.set_content(file, &FileId::hash_of(b"v2"));

        let rid = RevisionId::from_bytes(&[1; 20]).unwrap();
        let rev = make_revision_for_workspace(&[(rid, &r1)], &r2);
        assert!(rev.edges.values().next().unwrap().is_empty());
        let db_rev = make_revision(&RevisionId::from_bytes(&[1; 20]).unwrap(), &r1, &r2);
        assert_eq!(db_rev.edges.values().next().unwrap().deltas_applied.len(), 1);
        assert_eq!(rev.new_manifest, fake_manifest_id());
        assert_eq!(rev.made_for, MadeFor::Workspace);
    }
}
