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

//! Compact differences between two (roster, marking) pairs, keyed by node
//! id. This is the storage format for delta-compressed rosters: the
//! database keeps one full (roster, marking) blob per chain and a
//! roster-delta per edge.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::EitherOrBoth;
use itertools::Itertools as _;
use thiserror::Error;

use crate::basic_io;
use crate::basic_io::BasicIoError;
use crate::basic_io::Printer;
use crate::basic_io::Stanza;
use crate::basic_io::Value;
use crate::marking::Marking;
use crate::marking::MarkingMap;
use crate::object_id::FileId;
use crate::object_id::ObjectId as _;
use crate::repo_path::RepoPathComponentBuf;
use crate::roster::AttrEntry;
use crate::roster::AttrKey;
use crate::roster::AttrValue;
use crate::roster::NodeId;
use crate::roster::Roster;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterDeltaError {
    #[error(transparent)]
    Io(#[from] BasicIoError),
    #[error("bad value in roster delta: {0}")]
    BadValue(String),
}

/// Where a node sits: its parent's id and its name, or the root slot.
type Location = (NodeId, Option<RepoPathComponentBuf>);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RosterDelta {
    nodes_deleted: BTreeSet<NodeId>,
    dirs_added: BTreeMap<NodeId, Location>,
    files_added: BTreeMap<NodeId, (Location, FileId)>,
    nodes_relocated: BTreeMap<NodeId, Location>,
    deltas_applied: BTreeMap<NodeId, FileId>,
    attrs_cleared: BTreeSet<(NodeId, AttrKey)>,
    attrs_set: BTreeMap<(NodeId, AttrKey), AttrEntry>,
    markings_changed: BTreeMap<NodeId, Marking>,
}

fn location_of(roster: &Roster, nid: NodeId) -> Location {
    let node = roster.node(nid);
    (node.parent(), node.name().cloned())
}

/// Computes the delta that turns `(from, from_markings)` into
/// `(to, to_markings)`.
pub fn delta_rosters(
    from: &Roster,
    from_markings: &MarkingMap,
    to: &Roster,
    to_markings: &MarkingMap,
) -> RosterDelta {
    let mut delta = RosterDelta::default();
    for pair in from
        .all_nodes()
        .merge_join_by(to.all_nodes(), |(a, _), (b, _)| a.cmp(b))
    {
        match pair {
            EitherOrBoth::Left((nid, _)) => {
                delta.nodes_deleted.insert(nid);
            }
            EitherOrBoth::Right((nid, node)) => {
                let location = location_of(to, nid);
                if node.is_file() {
                    delta
                        .files_added
                        .insert(nid, (location, node.content().clone()));
                } else {
                    delta.dirs_added.insert(nid, location);
                }
                for (key, entry) in &node.attrs {
                    delta.attrs_set.insert((nid, key.clone()), entry.clone());
                }
            }
            EitherOrBoth::Both((nid, from_node), (_, to_node)) => {
                if from_node.location() != to_node.location() {
                    delta.nodes_relocated.insert(nid, location_of(to, nid));
                }
                if to_node.is_file() && from_node.content() != to_node.content() {
                    delta.deltas_applied.insert(nid, to_node.content().clone());
                }
                for attr_pair in from_node
                    .attrs
                    .iter()
                    .merge_join_by(to_node.attrs.iter(), |(a, _), (b, _)| a.cmp(b))
                {
                    match attr_pair {
                        EitherOrBoth::Left((key, _)) => {
                            delta.attrs_cleared.insert((nid, key.clone()));
                        }
                        EitherOrBoth::Right((key, entry)) => {
                            delta.attrs_set.insert((nid, key.clone()), entry.clone());
                        }
                        EitherOrBoth::Both((key, from_entry), (_, to_entry)) => {
                            if from_entry != to_entry {
                                delta.attrs_set.insert((nid, key.clone()), to_entry.clone());
                            }
                        }
                    }
                }
            }
        }
    }
    for (nid, marking) in to_markings.iter() {
        if from_markings.get(nid) != Some(marking) {
            delta.markings_changed.insert(nid, (**marking).clone());
        }
    }
    delta
}

/// Applies a delta in place. Panics if the delta does not match the
/// roster (the store detects that earlier through checksums).
pub fn apply_roster_delta(delta: &RosterDelta, roster: &mut Roster, markings: &mut MarkingMap) {
    // Detach everything that moves or dies; order does not matter because
    // detaching only unlinks one parent/child edge.
    for &nid in delta.nodes_relocated.keys() {
        roster.detach_node(nid);
    }
    for &nid in &delta.nodes_deleted {
        roster.detach_node(nid);
    }
    for &nid in &delta.nodes_deleted {
        roster.drop_detached_node(nid);
        markings.remove(nid);
    }

    for (&nid, _) in &delta.dirs_added {
        roster.create_dir_node_with_id(nid);
    }
    for (&nid, (_, content)) in &delta.files_added {
        roster.create_file_node_with_id(content.clone(), nid);
    }
    let attach = |roster: &mut Roster, nid: NodeId, (parent, name): &Location| {
        roster.attach_node(nid, *parent, name.clone());
    };
    for (&nid, location) in &delta.dirs_added {
        attach(roster, nid, location);
    }
    for (&nid, (location, _)) in &delta.files_added {
        attach(roster, nid, location);
    }
    for (&nid, location) in &delta.nodes_relocated {
        attach(roster, nid, location);
    }

    for (&nid, content) in &delta.deltas_applied {
        roster.set_content(nid, content);
    }
    for (nid, key) in &delta.attrs_cleared {
        roster.erase_attr(*nid, key);
    }
    for ((nid, key), entry) in &delta.attrs_set {
        roster.set_attr_unknown_to_dead_ok(*nid, key, entry.clone());
    }
    for (&nid, marking) in &delta.markings_changed {
        markings.put_or_replace(nid, Arc::new(marking.clone()));
    }
}

fn push_location(stanza: &mut Stanza, location: &Location) {
    let (parent, name) = location;
    stanza.push_values(
        "location",
        vec![
            Value::Str(parent.to_string()),
            Value::Str(name.as_ref().map(|n| n.as_str().to_owned()).unwrap_or_default()),
        ],
    );
}

fn push_marking(stanza: &mut Stanza, marking: &Marking) {
    stanza.push_hex("birth", marking.birth_revision.hex());
    for rev in &marking.parent_name {
        stanza.push_hex("path_mark", rev.hex());
    }
    for rev in &marking.file_content {
        stanza.push_hex("content_mark", rev.hex());
    }
    for (key, revs) in &marking.attrs {
        for rev in revs {
            stanza.push_values(
                "attr_mark",
                vec![Value::Str(key.as_str().to_owned()), Value::Hex(rev.hex())],
            );
        }
    }
}

impl RosterDelta {
    /// Canonical text form, gzipped and checksummed by the store.
    pub fn print(&self) -> String {
        let mut printer = Printer::new();
        for nid in &self.nodes_deleted {
            printer.stanza(Stanza::new().push_str("drop_node", nid.to_string()));
        }
        for (nid, location) in &self.nodes_relocated {
            let mut stanza = Stanza::new();
            stanza.push_str("relocate", nid.to_string());
            push_location(&mut stanza, location);
            printer.stanza(&stanza);
        }
        for (nid, location) in &self.dirs_added {
            let mut stanza = Stanza::new();
            stanza.push_str("add_dir", nid.to_string());
            push_location(&mut stanza, location);
            printer.stanza(&stanza);
        }
        for (nid, (location, content)) in &self.files_added {
            let mut stanza = Stanza::new();
            stanza.push_str("add_file", nid.to_string());
            push_location(&mut stanza, location);
            stanza.push_hex("content", content.hex());
            printer.stanza(&stanza);
        }
        for (nid, content) in &self.deltas_applied {
            printer.stanza(
                Stanza::new()
                    .push_str("patch_node", nid.to_string())
                    .push_hex("content", content.hex()),
            );
        }
        for (nid, key) in &self.attrs_cleared {
            printer.stanza(
                Stanza::new()
                    .push_str("clear_attr", nid.to_string())
                    .push_str("attr", key.as_str()),
            );
        }
        for ((nid, key), (live, value)) in &self.attrs_set {
            let mut stanza = Stanza::new();
            if *live {
                stanza.push_str("set_attr", nid.to_string());
                stanza.push_str("attr", key.as_str());
                stanza.push_str("value", value.as_str());
            } else {
                stanza.push_str("set_dormant_attr", nid.to_string());
                stanza.push_str("attr", key.as_str());
            }
            printer.stanza(&stanza);
        }
        for (nid, marking) in &self.markings_changed {
            let mut stanza = Stanza::new();
            stanza.push_str("marking", nid.to_string());
            push_marking(&mut stanza, marking);
            printer.stanza(&stanza);
        }
        printer.finish()
    }

    pub fn parse(text: &str) -> Result<Self, RosterDeltaError> {
        let mut parser = basic_io::Parser::new(text)?;
        let mut delta = Self::default();
        while parser.at_symbol() {
            if parser.at("drop_node") {
                parser.expect("drop_node")?;
                delta.nodes_deleted.insert(parse_nid(&mut parser)?);
            } else if parser.at("relocate") {
                parser.expect("relocate")?;
                let nid = parse_nid(&mut parser)?;
                delta
                    .nodes_relocated
                    .insert(nid, parse_location(&mut parser)?);
            } else if parser.at("add_dir") {
                parser.expect("add_dir")?;
                let nid = parse_nid(&mut parser)?;
                delta.dirs_added.insert(nid, parse_location(&mut parser)?);
            } else if parser.at("add_file") {
                parser.expect("add_file")?;
                let nid = parse_nid(&mut parser)?;
                let location = parse_location(&mut parser)?;
                parser.expect("content")?;
                let content = parse_file_id(&mut parser)?;
                delta.files_added.insert(nid, (location, content));
            } else if parser.at("patch_node") {
                parser.expect("patch_node")?;
                let nid = parse_nid(&mut parser)?;
                parser.expect("content")?;
                delta.deltas_applied.insert(nid, parse_file_id(&mut parser)?);
            } else if parser.at("clear_attr") {
                parser.expect("clear_attr")?;
                let nid = parse_nid(&mut parser)?;
                parser.expect("attr")?;
                delta
                    .attrs_cleared
                    .insert((nid, AttrKey::from(parser.str_value()?)));
            } else if parser.at("set_attr") {
                parser.expect("set_attr")?;
                let nid = parse_nid(&mut parser)?;
                parser.expect("attr")?;
                let key = AttrKey::from(parser.str_value()?);
                parser.expect("value")?;
                delta
                    .attrs_set
                    .insert((nid, key), (true, AttrValue::from(parser.str_value()?)));
            } else if parser.at("set_dormant_attr") {
                parser.expect("set_dormant_attr")?;
                let nid = parse_nid(&mut parser)?;
                parser.expect("attr")?;
                let key = AttrKey::from(parser.str_value()?);
                delta
                    .attrs_set
                    .insert((nid, key), (false, AttrValue::default()));
            } else if parser.at("marking") {
                parser.expect("marking")?;
                let nid = parse_nid(&mut parser)?;
                let marking = crate::roster::parse_marking(&mut parser)?;
                delta.markings_changed.insert(nid, marking);
            } else {
                return Err(RosterDeltaError::BadValue(format!(
                    "unexpected stanza {:?}",
                    parser.symbol()?
                )));
            }
        }
        parser.expect_eof()?;
        Ok(delta)
    }
}

fn parse_nid(parser: &mut basic_io::Parser<'_>) -> Result<NodeId, RosterDeltaError> {
    let raw = parser.str_value()?;
    let value: u32 = raw
        .parse()
        .map_err(|_| RosterDeltaError::BadValue(format!("bad node id {raw:?}")))?;
    Ok(NodeId::from_raw(value))
}

fn parse_location(parser: &mut basic_io::Parser<'_>) -> Result<Location, RosterDeltaError> {
    parser.expect("location")?;
    let parent_raw = parser.str_value()?;
    let parent: u32 = parent_raw
        .parse()
        .map_err(|_| RosterDeltaError::BadValue(format!("bad parent id {parent_raw:?}")))?;
    let name = parser.str_value()?;
    let name = if name.is_empty() {
        None
    } else {
        Some(
            RepoPathComponentBuf::new(name)
                .map_err(|err| RosterDeltaError::BadValue(err.to_string()))?,
        )
    };
    Ok((NodeId::from_raw(parent), name))
}

fn parse_file_id(parser: &mut basic_io::Parser<'_>) -> Result<FileId, RosterDeltaError> {
    let hex = parser.hex_value()?;
    FileId::try_from_hex(&hex).map_err(|err| RosterDeltaError::BadValue(err.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::marking::mark_roster_with_no_parents;
    use crate::marking::mark_roster_with_one_parent;
    use crate::object_id::RevisionId;
    use crate::repo_path::RepoPathBuf;
    use crate::roster::NodeIdSource as _;
    use crate::roster::TempNodeIdSource;

    fn repo_path(value: &str) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(value).unwrap()
    }

    fn rid(byte: u8) -> RevisionId {
        RevisionId::from_bytes(&[byte; 20]).unwrap()
    }

    fn base_roster() -> (Roster, MarkingMap) {
        let mut nis = TempNodeIdSource::new();
        let mut roster = Roster::new();
        let root = roster.create_dir_node(&mut nis);
        roster.attach_node(root, NodeId::NULL, None);
        let dir = roster.create_dir_node(&mut nis);
        roster.attach_node_at(dir, &repo_path("src"));
        let file = roster.create_file_node(FileId::hash_of(b"v1"), &mut nis);
        roster.attach_node_at(file, &repo_path("src/a.rs"));
        let mut markings = MarkingMap::default();
        mark_roster_with_no_parents(&rid(1), &roster, &mut markings);
        (roster, markings)
    }

    #[test]
    fn round_trip_through_text() {
        let (from, from_markings) = base_roster();
        // rename src/a.rs -> src/b.rs and change its content
        let mut to = from.clone();
        let nid = to.detach_node_at(&repo_path("src/a.rs"));
        to.attach_node_at(nid, &repo_path("src/b.rs"));
        to.set_content(nid, &FileId::hash_of(b"v2"));
        let mut to_markings = MarkingMap::default();
        mark_roster_with_one_parent(&from, &from_markings, &rid(2), &to, &mut to_markings);

        let delta = delta_rosters(&from, &from_markings, &to, &to_markings);
        let parsed = RosterDelta::parse(&delta.print()).unwrap();
        assert_eq!(parsed, delta);

        let mut rebuilt = from.clone();
        let mut rebuilt_markings = from_markings.clone();
        apply_roster_delta(&parsed, &mut rebuilt, &mut rebuilt_markings);
        assert_eq!(rebuilt, to);
        assert_eq!(rebuilt_markings, to_markings);
    }

    #[test]
    fn delta_covers_adds_and_drops() {
        let (from, from_markings) = base_roster();
        let mut to = from.clone();
        let dropped = to.detach_node_at(&repo_path("src/a.rs"));
        to.drop_detached_node(dropped);
        let mut nis = TempNodeIdSource::new();
        for _ in 0..4 {
            nis.allocate();
        }
        let added = to.create_file_node(FileId::hash_of(b"new"), &mut nis);
        to.attach_node_at(added, &repo_path("src/new.rs"));
        let mut to_markings = MarkingMap::default();
        mark_roster_with_one_parent(&from, &from_markings, &rid(3), &to, &mut to_markings);

        let delta = delta_rosters(&from, &from_markings, &to, &to_markings);
        let mut rebuilt = from.clone();
        let mut rebuilt_markings = from_markings.clone();
        apply_roster_delta(&delta, &mut rebuilt, &mut rebuilt_markings);
        assert_eq!(rebuilt, to);
        assert_eq!(rebuilt_markings, to_markings);
    }
}
