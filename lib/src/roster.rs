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

//! Rosters: node-identified snapshots of a tree.
//!
//! A roster maps stable node ids to nodes. A node knows its parent, its
//! name, its attributes, and either its children (directories) or its
//! content id (files). Node ids survive renames and content edits, which
//! is what lets the marking algebra track per-scalar provenance without
//! replaying history.
//!
//! Rosters between generations share nodes through `Arc`; every mutator
//! goes through [`Roster::node_mut`], which clones a shared node before
//! writing (`Arc::make_mut`). Mutating operations panic when fed input
//! that violates the structural invariants; `check_sane` re-verifies the
//! whole structure.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::basic_io;
use crate::basic_io::BasicIoError;
use crate::cset::Cset;
use crate::cset::EditError;
use crate::cset::EditResult;
use crate::cset::EditableTree;
use crate::marking::Marking;
use crate::marking::MarkingMap;
use crate::object_id::FileId;
use crate::object_id::ManifestId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::repo_path::RepoPathBuf;
use crate::repo_path::RepoPathComponentBuf;
use crate::repo_path::BOOKKEEPING_DIR_NAME;

/// Stable identifier of a tree node. Ids at or above
/// [`NodeId::FIRST_TEMP`] are temporary: they exist only during one
/// in-memory construction and are never persisted.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// "Detached"/"no such node".
    pub const NULL: NodeId = NodeId(0);
    /// First persistent node id.
    pub const FIRST: NodeId = NodeId(1);
    /// First temporary node id.
    pub const FIRST_TEMP: NodeId = NodeId(0x8000_0000);

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn is_temp(self) -> bool {
        self >= Self::FIRST_TEMP
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints node ids. The workspace uses a temporary source; the database
/// implements a persistent one backed by a counter table.
pub trait NodeIdSource {
    fn allocate(&mut self) -> NodeId;
}

/// Hands out ids from the temporary range.
#[derive(Debug)]
pub struct TempNodeIdSource {
    next: u32,
}

impl Default for TempNodeIdSource {
    fn default() -> Self {
        Self {
            next: NodeId::FIRST_TEMP.as_raw(),
        }
    }
}

impl TempNodeIdSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeIdSource for TempNodeIdSource {
    fn allocate(&mut self) -> NodeId {
        let nid = NodeId::from_raw(self.next);
        self.next = self.next.checked_add(1).expect("temp node ids exhausted");
        nid
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrKey(String);

impl AttrKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttrKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AttrKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrValue(String);

impl AttrValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(live, value)`. `(false, "")` is a dormant attr corpse: evidence the
/// attribute once existed, so a merge cannot resurrect it.
pub type AttrEntry = (bool, AttrValue);

/// Attribute map of one node.
pub type AttrMap = BTreeMap<AttrKey, AttrEntry>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Dir {
        children: BTreeMap<RepoPathComponentBuf, NodeId>,
    },
    File {
        content: FileId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    self_id: NodeId,
    parent: NodeId,
    name: Option<RepoPathComponentBuf>,
    pub attrs: AttrMap,
    kind: NodeKind,
}

impl Node {
    fn new_dir(self_id: NodeId) -> Self {
        Self {
            self_id,
            parent: NodeId::NULL,
            name: None,
            attrs: AttrMap::new(),
            kind: NodeKind::Dir {
                children: BTreeMap::new(),
            },
        }
    }

    fn new_file(self_id: NodeId, content: FileId) -> Self {
        Self {
            self_id,
            parent: NodeId::NULL,
            name: None,
            attrs: AttrMap::new(),
            kind: NodeKind::File { content },
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn parent(&self) -> NodeId {
        self.parent
    }

    pub fn name(&self) -> Option<&RepoPathComponentBuf> {
        self.name.as_ref()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_detached(&self) -> bool {
        self.parent.is_null() && self.name.is_none()
    }

    pub fn children(&self) -> &BTreeMap<RepoPathComponentBuf, NodeId> {
        match &self.kind {
            NodeKind::Dir { children } => children,
            NodeKind::File { .. } => panic!("node {} is not a directory", self.self_id),
        }
    }

    fn children_mut(&mut self) -> &mut BTreeMap<RepoPathComponentBuf, NodeId> {
        match &mut self.kind {
            NodeKind::Dir { children } => children,
            NodeKind::File { .. } => panic!("node {} is not a directory", self.self_id),
        }
    }

    pub fn content(&self) -> &FileId {
        match &self.kind {
            NodeKind::File { content } => content,
            NodeKind::Dir { .. } => panic!("node {} is not a file", self.self_id),
        }
    }

    /// `(parent, name)` — the scalar tracked by the `parent_name` mark.
    pub fn location(&self) -> (NodeId, Option<&RepoPathComponentBuf>) {
        (self.parent, self.name.as_ref())
    }

    /// Field equality, optionally ignoring children (which are derived
    /// from the other nodes' locations anyway).
    pub fn shallow_equal(&self, other: &Node, compare_children: bool) -> bool {
        if self.self_id != other.self_id
            || self.parent != other.parent
            || self.name != other.name
            || self.attrs != other.attrs
        {
            return false;
        }
        match (&self.kind, &other.kind) {
            (NodeKind::File { content: a }, NodeKind::File { content: b }) => a == b,
            (NodeKind::Dir { children: a }, NodeKind::Dir { children: b }) => {
                !compare_children || a == b
            }
            _ => false,
        }
    }
}

/// A tree snapshot: an ordered node-id map plus a root pointer.
///
/// `old_locations` remembers where detached nodes used to live, so that a
/// rename cannot be undone by reattaching a node to its old slot; entries
/// are discharged on attach or drop. A roster with a pending detach is
/// transient and fails `check_sane`.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    nodes: BTreeMap<NodeId, Arc<Node>>,
    root: NodeId,
    old_locations: BTreeMap<NodeId, (NodeId, Option<RepoPathComponentBuf>)>,
}

impl PartialEq for Roster {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.nodes == other.nodes
    }
}

impl Eq for Roster {}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_root(&self) -> bool {
        !self.root.is_null()
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = (NodeId, &Arc<Node>)> {
        self.nodes.iter().map(|(&nid, node)| (nid, node))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_node(&self, nid: NodeId) -> bool {
        self.nodes.contains_key(&nid)
    }

    pub fn get(&self, nid: NodeId) -> Option<&Node> {
        self.nodes.get(&nid).map(Arc::as_ref)
    }

    /// Panics if the node is absent.
    pub fn node(&self, nid: NodeId) -> &Node {
        self.get(nid)
            .unwrap_or_else(|| panic!("node {nid} is not in the roster"))
    }

    /// Clone-on-write access to a node.
    fn node_mut(&mut self, nid: NodeId) -> &mut Node {
        let arc = self
            .nodes
            .get_mut(&nid)
            .unwrap_or_else(|| panic!("node {nid} is not in the roster"));
        Arc::make_mut(arc)
    }

    pub fn is_root(&self, nid: NodeId) -> bool {
        self.has_root() && self.root == nid
    }

    pub fn is_attached(&self, nid: NodeId) -> bool {
        let node = self.node(nid);
        !node.parent.is_null() || self.root == nid
    }

    /// Resolves a path to a node id; `None` if any component is missing
    /// or crosses a file.
    pub fn node_id_at(&self, path: &RepoPathBuf) -> Option<NodeId> {
        if !self.has_root() {
            return None;
        }
        let mut nid = self.root;
        for component in path.components() {
            let node = self.node(nid);
            match &node.kind {
                NodeKind::Dir { children } => {
                    nid = *children.get(component)?;
                }
                NodeKind::File { .. } => return None,
            }
        }
        Some(nid)
    }

    pub fn has_node_at(&self, path: &RepoPathBuf) -> bool {
        self.node_id_at(path).is_some()
    }

    pub fn node_at(&self, path: &RepoPathBuf) -> Option<&Node> {
        self.node_id_at(path).map(|nid| self.node(nid))
    }

    /// Reconstructs the path of an attached node by walking parents.
    /// Panics if the node is absent or detached.
    pub fn get_name(&self, nid: NodeId) -> RepoPathBuf {
        let mut components = Vec::new();
        let mut cursor = self.node(nid);
        while !cursor.parent.is_null() {
            let name = cursor
                .name
                .as_ref()
                .unwrap_or_else(|| panic!("node {} has a parent but no name", cursor.self_id));
            components.push(name.as_str().to_owned());
            cursor = self.node(cursor.parent);
        }
        assert_eq!(
            cursor.self_id, self.root,
            "node {nid} is not reachable from the root"
        );
        let mut path = RepoPathBuf::root();
        for component in components.iter().rev() {
            path = path.join(&RepoPathComponentBuf::new(component.clone()).unwrap());
        }
        path
    }

    /// Removes the node at `path` from its parent's children, leaving it
    /// in memory detached. Detaching the root is allowed and clears the
    /// root pointer. The old location is recorded so the node cannot be
    /// reattached to the same slot.
    pub fn detach_node_at(&mut self, path: &RepoPathBuf) -> NodeId {
        let nid = self
            .node_id_at(path)
            .unwrap_or_else(|| panic!("no node at {path:?} to detach"));
        self.detach_node(nid);
        nid
    }

    pub fn detach_node(&mut self, nid: NodeId) {
        let (parent, name) = {
            let node = self.node(nid);
            (node.parent, node.name.clone())
        };
        if parent.is_null() {
            assert!(name.is_none(), "node {nid} has a name but no parent");
            assert_eq!(self.root, nid, "detached node {nid} detached again");
            self.root = NodeId::NULL;
        } else {
            let name = name.clone().expect("attached node without a name");
            let detached = self
                .node_mut(parent)
                .children_mut()
                .remove(&name)
                .expect("child missing from parent directory");
            assert_eq!(detached, nid);
            let node = self.node_mut(nid);
            node.parent = NodeId::NULL;
            node.name = None;
        }
        let prior = self.old_locations.insert(nid, (parent, name));
        assert!(prior.is_none(), "node {nid} detached twice");
    }

    /// Attaches a detached node below `parent` under `name`, or as the
    /// root when both are absent. Panics if the slot is occupied, if the
    /// node is attached, or if this would restore the location recorded
    /// at detach time (a no-op rename).
    pub fn attach_node(&mut self, nid: NodeId, parent: NodeId, name: Option<RepoPathComponentBuf>) {
        {
            let node = self.node(nid);
            assert!(!node.self_id.is_null());
            assert!(node.is_detached(), "node {nid} is already attached");
        }
        if let Some((old_parent, old_name)) = self.old_locations.get(&nid) {
            assert!(
                (old_parent, old_name) != (&parent, &name),
                "node {nid} reattached to its old location"
            );
        }
        if parent.is_null() {
            assert!(name.is_none(), "root attach must not carry a name");
            assert!(!self.has_root(), "roster already has a root");
            assert!(self.node(nid).is_dir(), "the root must be a directory");
            self.root = nid;
        } else {
            let name = name.expect("non-root attach must carry a name");
            let occupied = self
                .node_mut(parent)
                .children_mut()
                .insert(name.clone(), nid);
            assert!(
                occupied.is_none(),
                "slot {name:?} in node {parent} is occupied"
            );
            let node = self.node_mut(nid);
            node.parent = parent;
            node.name = Some(name);
        }
        self.old_locations.remove(&nid);
    }

    /// Attach by destination path; parents are resolved in the roster.
    pub fn attach_node_at(&mut self, nid: NodeId, path: &RepoPathBuf) {
        match path.split() {
            None => self.attach_node(nid, NodeId::NULL, None),
            Some((dir, base)) => {
                let parent = self
                    .node_id_at(&dir)
                    .unwrap_or_else(|| panic!("no directory at {dir:?} to attach under"));
                self.attach_node(nid, parent, Some(base));
            }
        }
    }

    /// Removes a detached node from memory. Panics unless the node is
    /// detached and, if a directory, empty.
    pub fn drop_detached_node(&mut self, nid: NodeId) {
        {
            let node = self.node(nid);
            assert!(node.is_detached(), "node {nid} is still attached");
            if let NodeKind::Dir { children } = &node.kind {
                assert!(children.is_empty(), "detached directory {nid} is not empty");
            }
        }
        self.nodes.remove(&nid);
        // Merge conflict resolution can drop nodes that were never
        // attached, so the old location entry may legitimately be absent.
        self.old_locations.remove(&nid);
    }

    pub fn create_dir_node(&mut self, nis: &mut dyn NodeIdSource) -> NodeId {
        let nid = nis.allocate();
        self.create_dir_node_with_id(nid);
        nid
    }

    pub fn create_dir_node_with_id(&mut self, nid: NodeId) {
        assert!(!nid.is_null());
        let prior = self.nodes.insert(nid, Arc::new(Node::new_dir(nid)));
        assert!(prior.is_none(), "node id {nid} allocated twice");
    }

    pub fn create_file_node(&mut self, content: FileId, nis: &mut dyn NodeIdSource) -> NodeId {
        let nid = nis.allocate();
        self.create_file_node_with_id(content, nid);
        nid
    }

    pub fn create_file_node_with_id(&mut self, content: FileId, nid: NodeId) {
        assert!(!nid.is_null());
        let prior = self
            .nodes
            .insert(nid, Arc::new(Node::new_file(nid, content)));
        assert!(prior.is_none(), "node id {nid} allocated twice");
    }

    /// Replaces a (temporary) node id with another id everywhere.
    pub fn replace_node_id(&mut self, from: NodeId, to: NodeId) {
        assert!(!to.is_null());
        let mut node = Arc::unwrap_or_clone(
            self.nodes
                .remove(&from)
                .unwrap_or_else(|| panic!("node {from} is not in the roster")),
        );
        node.self_id = to;
        let parent = node.parent;
        let name = node.name.clone();
        let children = match &node.kind {
            NodeKind::Dir { children } => children.clone(),
            NodeKind::File { .. } => BTreeMap::new(),
        };
        let prior = self.nodes.insert(to, Arc::new(node));
        assert!(prior.is_none(), "node id {to} already present");
        if self.root == from {
            self.root = to;
        } else if !parent.is_null() {
            let name = name.expect("attached node without a name");
            let slot = self
                .node_mut(parent)
                .children_mut()
                .get_mut(&name)
                .expect("child missing from parent directory");
            *slot = to;
        }
        for (_, child) in children {
            self.node_mut(child).parent = to;
        }
        if let Some(loc) = self.old_locations.remove(&from) {
            self.old_locations.insert(to, loc);
        }
    }

    pub fn apply_delta(&mut self, path: &RepoPathBuf, old_id: &FileId, new_id: &FileId) {
        let nid = self
            .node_id_at(path)
            .unwrap_or_else(|| panic!("no node at {path:?} to patch"));
        self.set_content_checked(nid, old_id, new_id);
    }

    /// Replaces a file's content id without a precondition on the old
    /// value; roster-delta application patches by node id.
    pub fn set_content(&mut self, nid: NodeId, new_id: &FileId) {
        let node = self.node_mut(nid);
        match &mut node.kind {
            NodeKind::File { content } => {
                assert_ne!(content, new_id, "no-op content change on node {nid}");
                *content = new_id.clone();
            }
            NodeKind::Dir { .. } => panic!("node {nid} is not a file"),
        }
    }

    fn set_content_checked(&mut self, nid: NodeId, old_id: &FileId, new_id: &FileId) {
        let node = self.node_mut(nid);
        match &mut node.kind {
            NodeKind::File { content } => {
                assert_eq!(content, old_id, "delta precondition failed on node {nid}");
                assert_ne!(content, new_id, "no-op delta on node {nid}");
                *content = new_id.clone();
            }
            NodeKind::Dir { .. } => panic!("node {nid} is not a file"),
        }
    }

    pub fn set_attr(&mut self, path: &RepoPathBuf, key: &AttrKey, value: &AttrValue) {
        self.set_attr_entry(path, key, (true, value.clone()));
    }

    /// Clearing writes a corpse, it never erases the key.
    pub fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) {
        self.set_attr_entry(path, key, (false, AttrValue::default()));
    }

    fn set_attr_entry(&mut self, path: &RepoPathBuf, key: &AttrKey, entry: AttrEntry) {
        assert!(entry.0 || entry.1.is_empty(), "dead attr with a value");
        let nid = self
            .node_id_at(path)
            .unwrap_or_else(|| panic!("no node at {path:?} for attr edit"));
        let node = self.node_mut(nid);
        let slot = node
            .attrs
            .entry(key.clone())
            .or_insert_with(|| (false, AttrValue::default()));
        assert_ne!(*slot, entry, "no-op attr edit on {path:?}");
        *slot = entry;
    }

    /// Writes an attr entry without the prior-state checks; used when
    /// introducing corpses during merge unification.
    pub fn set_attr_unknown_to_dead_ok(&mut self, nid: NodeId, key: &AttrKey, entry: AttrEntry) {
        assert!(entry.0 || entry.1.is_empty(), "dead attr with a value");
        let node = self.node_mut(nid);
        if let Some(existing) = node.attrs.get(key) {
            assert_ne!(*existing, entry);
        }
        node.attrs.insert(key.clone(), entry);
    }

    pub fn erase_attr(&mut self, nid: NodeId, key: &AttrKey) {
        let node = self.node_mut(nid);
        let removed = node.attrs.remove(key);
        assert!(removed.is_some(), "erasing unknown attr on node {nid}");
    }

    pub fn get_attr(&self, path: &RepoPathBuf, key: &AttrKey) -> Option<&AttrValue> {
        let node = self.node_at(path)?;
        match node.attrs.get(key) {
            Some((true, value)) => Some(value),
            _ => None,
        }
    }

    /// Depth-first preorder walk from the root: `(path, node id)` pairs,
    /// children in name order, root first.
    pub fn dfs(&self) -> Vec<(RepoPathBuf, NodeId)> {
        let mut result = Vec::with_capacity(self.nodes.len());
        if !self.has_root() {
            return result;
        }
        let mut stack = vec![(RepoPathBuf::root(), self.root)];
        while let Some((path, nid)) = stack.pop() {
            let node = self.node(nid);
            if let NodeKind::Dir { children } = &node.kind {
                // Reverse so the stack pops in name order.
                for (name, &child) in children.iter().rev() {
                    stack.push((path.join(name), child));
                }
            }
            result.push((path, nid));
        }
        result
    }

    /// The set of attached paths, excluding the root.
    pub fn extract_path_set(&self) -> BTreeSet<RepoPathBuf> {
        self.dfs()
            .into_iter()
            .filter(|(path, _)| !path.is_root())
            .map(|(path, _)| path)
            .collect()
    }

    /// Verifies the structural invariants; panics on violation.
    pub fn check_sane(&self, temp_nodes_ok: bool) {
        assert!(
            self.old_locations.is_empty(),
            "a renamed node is still detached"
        );
        assert!(self.has_root(), "roster has no root");
        let walked = self.dfs();
        assert_eq!(
            walked.len(),
            self.nodes.len(),
            "some node is not attached under the root"
        );
        for (path, nid) in &walked {
            let node = self.node(*nid);
            assert!(!node.self_id.is_null());
            assert_eq!(node.self_id, *nid);
            if path.is_root() {
                assert!(node.parent.is_null() && node.name.is_none());
                assert!(node.is_dir(), "the root is not a directory");
            } else {
                assert!(!node.parent.is_null() && node.name.is_some());
                let parent = self.node(node.parent);
                assert_eq!(
                    parent.children().get(node.name.as_ref().unwrap()),
                    Some(nid)
                );
                if node.parent == self.root {
                    assert_ne!(
                        node.name.as_ref().unwrap().as_str(),
                        BOOKKEEPING_DIR_NAME,
                        "tree shadows the bookkeeping directory"
                    );
                }
            }
            for (key, (live, value)) in &node.attrs {
                assert!(
                    *live || value.is_empty(),
                    "dead attr {key} on {path:?} carries a value"
                );
            }
            if let NodeKind::File { content } = &node.kind {
                assert!(!content.is_null(), "file {path:?} has a null content id");
            }
            if !temp_nodes_ok {
                assert!(!nid.is_temp(), "temporary node {nid} in a final roster");
            }
        }
    }

    /// `check_sane` plus the marking invariants: exactly one marking per
    /// node, non-empty mark sets, directory content marks empty, attr
    /// keys in step with the node's attrs.
    pub fn check_sane_against(&self, markings: &MarkingMap, temp_nodes_ok: bool) {
        self.check_sane(temp_nodes_ok);
        assert_eq!(markings.len(), self.nodes.len());
        for (nid, node) in self.all_nodes() {
            let marking = markings
                .get(nid)
                .unwrap_or_else(|| panic!("node {nid} has no marking"));
            assert!(!marking.birth_revision.is_null());
            assert!(!marking.parent_name.is_empty());
            if node.is_file() {
                assert!(!marking.file_content.is_empty());
            } else {
                assert!(marking.file_content.is_empty());
            }
            assert_eq!(
                node.attrs.keys().collect::<Vec<_>>(),
                marking.attrs.keys().collect::<Vec<_>>()
            );
            for marks in marking.attrs.values() {
                assert!(!marks.is_empty());
            }
        }
    }

    /// Structural equality that ignores file content ids. The workspace
    /// shape computation compares rosters whose content ids are stale.
    pub fn equal_shapes(&self, other: &Roster) -> bool {
        if self.root != other.root || self.nodes.len() != other.nodes.len() {
            return false;
        }
        self.all_nodes().all(|(nid, node)| match other.get(nid) {
            Some(other_node) => {
                node.parent == other_node.parent
                    && node.name == other_node.name
                    && node.attrs == other_node.attrs
                    && node.is_dir() == other_node.is_dir()
            }
            None => false,
        })
    }

    /// Serializes the roster. With `print_local_parts` the output is the
    /// full local form (node idents, dormant attrs, markings); without it
    /// the output is the manifest, whose hash is the manifest id.
    pub fn print_to(&self, markings: &MarkingMap, print_local_parts: bool) -> String {
        let mut out = String::new();
        out.push_str("format_version \"1\"\n");
        for (path, nid) in self.dfs() {
            out.push('\n');
            let node = self.node(nid);
            let has_dormant = node.attrs.values().any(|(live, _)| !*live);
            let has_live = node.attrs.values().any(|(live, _)| *live);
            let width = if node.is_dir() {
                match (print_local_parts, has_dormant, has_live) {
                    (true, true, _) => 12,
                    (true, false, _) => 9,
                    (false, _, true) => 4,
                    (false, _, false) => 3,
                }
            } else if print_local_parts {
                12
            } else {
                7
            };
            let mut line = |sym: &str, rest: &str| {
                for _ in 0..width - sym.len() {
                    out.push(' ');
                }
                out.push_str(sym);
                out.push_str(rest);
                out.push('\n');
            };
            match &node.kind {
                NodeKind::Dir { .. } => {
                    line(
                        "dir",
                        &format!(" \"{}\"", basic_io::escape(path.as_internal_string())),
                    );
                }
                NodeKind::File { content } => {
                    line(
                        "file",
                        &format!(" \"{}\"", basic_io::escape(path.as_internal_string())),
                    );
                    line("content", &format!(" [{}]", content.hex()));
                }
            }
            if print_local_parts {
                line("ident", &format!(" \"{nid}\""));
            }
            for (key, (live, value)) in &node.attrs {
                if *live {
                    line(
                        "attr",
                        &format!(
                            " \"{}\" \"{}\"",
                            basic_io::escape(key.as_str()),
                            basic_io::escape(value.as_str())
                        ),
                    );
                }
            }
            if print_local_parts {
                for (key, (live, _)) in &node.attrs {
                    if !*live {
                        line(
                            "dormant_attr",
                            &format!(" \"{}\"", basic_io::escape(key.as_str())),
                        );
                    }
                }
                let marking = markings
                    .get(nid)
                    .unwrap_or_else(|| panic!("node {nid} has no marking"));
                print_marking(&mut out, width, node.is_file(), marking);
            }
        }
        out
    }

    /// The manifest id: the hash of the public serialization. An empty
    /// roster hashes the empty byte sequence.
    pub fn manifest_id(&self) -> ManifestId {
        if self.nodes.is_empty() {
            ManifestId::hash_of(b"")
        } else {
            ManifestId::hash_of(self.print_to(&MarkingMap::default(), false).as_bytes())
        }
    }

    /// Parses the local serialization back into a roster and markings.
    pub fn parse_from(text: &str) -> Result<(Roster, MarkingMap), BasicIoError> {
        let mut parser = basic_io::Parser::new(text)?;
        let syntax = |reason: String| BasicIoError::Syntax { line: 0, reason };

        parser.expect("format_version")?;
        let version = parser.str_value()?;
        if version != "1" {
            return Err(syntax(format!("unknown format version {version:?}")));
        }

        let mut roster = Roster::new();
        let mut markings = MarkingMap::default();
        while parser.at_symbol() {
            let (path, nid, is_file) = if parser.at("file") {
                parser.expect("file")?;
                let path = parser.str_value()?;
                parser.expect("content")?;
                let content = FileId::try_from_hex(&parser.hex_value()?)
                    .map_err(|err| syntax(err.to_string()))?;
                parser.expect("ident")?;
                let nid = parse_node_id(&parser.str_value()?).map_err(syntax)?;
                roster.create_file_node_with_id(content, nid);
                (path, nid, true)
            } else if parser.at("dir") {
                parser.expect("dir")?;
                let path = parser.str_value()?;
                parser.expect("ident")?;
                let nid = parse_node_id(&parser.str_value()?).map_err(syntax)?;
                roster.create_dir_node_with_id(nid);
                (path, nid, false)
            } else {
                return Err(syntax(format!("unexpected stanza {:?}", parser.symbol()?)));
            };

            let path =
                RepoPathBuf::from_internal_string(path).map_err(|err| syntax(err.to_string()))?;
            if path.is_root() {
                if is_file || roster.has_root() {
                    return Err(syntax("bad root stanza".into()));
                }
                roster.root = nid;
            } else {
                if roster.node_id_at(&path).is_some() {
                    return Err(syntax(format!("duplicate path {path:?}")));
                }
                let Some((dir, base)) = path.split() else {
                    unreachable!()
                };
                let Some(parent) = roster.node_id_at(&dir) else {
                    return Err(syntax(format!("stanza for {path:?} before its parent")));
                };
                roster.attach_node(nid, parent, Some(base));
            }

            while parser.at("attr") {
                parser.expect("attr")?;
                let key = AttrKey::from(parser.str_value()?);
                let value = AttrValue::from(parser.str_value()?);
                roster.node_mut(nid).attrs.insert(key, (true, value));
            }
            while parser.at("dormant_attr") {
                parser.expect("dormant_attr")?;
                let key = AttrKey::from(parser.str_value()?);
                roster
                    .node_mut(nid)
                    .attrs
                    .insert(key, (false, AttrValue::default()));
            }

            let marking = parse_marking(&mut parser)?;
            markings.put(nid, Arc::new(marking));
        }
        parser.expect_eof()?;
        Ok((roster, markings))
    }
}

fn print_marking(out: &mut String, width: usize, is_file: bool, marking: &Marking) {
    assert!(!marking.birth_revision.is_null());
    let mut line = |sym: &str, rest: &str| {
        for _ in 0..width - sym.len() {
            out.push(' ');
        }
        out.push_str(sym);
        out.push_str(rest);
        out.push('\n');
    };
    line("birth", &format!(" [{}]", marking.birth_revision.hex()));
    for rev in &marking.parent_name {
        line("path_mark", &format!(" [{}]", rev.hex()));
    }
    if is_file {
        for rev in &marking.file_content {
            line("content_mark", &format!(" [{}]", rev.hex()));
        }
    } else {
        assert!(marking.file_content.is_empty());
    }
    for (key, revs) in &marking.attrs {
        for rev in revs {
            line(
                "attr_mark",
                &format!(" \"{}\" [{}]", basic_io::escape(key.as_str()), rev.hex()),
            );
        }
    }
}

pub(crate) fn parse_marking(parser: &mut basic_io::Parser<'_>) -> Result<Marking, BasicIoError> {
    let syntax = |reason: String| BasicIoError::Syntax { line: 0, reason };
    let parse_rev = |hex: String| {
        RevisionId::try_from_hex(&hex).map_err(|err| BasicIoError::Syntax {
            line: 0,
            reason: err.to_string(),
        })
    };
    let mut marking = Marking::default();
    loop {
        if parser.at("birth") {
            parser.expect("birth")?;
            marking.birth_revision = parse_rev(parser.hex_value()?)?;
        } else if parser.at("path_mark") {
            parser.expect("path_mark")?;
            marking.parent_name.insert(parse_rev(parser.hex_value()?)?);
        } else if parser.at("content_mark") {
            parser.expect("content_mark")?;
            marking.file_content.insert(parse_rev(parser.hex_value()?)?);
        } else if parser.at("attr_mark") {
            parser.expect("attr_mark")?;
            let key = AttrKey::from(parser.str_value()?);
            let rev = parse_rev(parser.hex_value()?)?;
            marking.attrs.entry(key).or_default().insert(rev);
        } else {
            break;
        }
    }
    if marking.birth_revision.is_null() {
        return Err(syntax("marking without a birth revision".into()));
    }
    Ok(marking)
}

fn parse_node_id(raw: &str) -> Result<NodeId, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("bad node ident {raw:?}"))?;
    if value == 0 {
        return Err("node ident 0 is reserved".into());
    }
    Ok(NodeId::from_raw(value))
}

/// Computes the changeset turning `from` into `to`, by parallel iteration
/// over the two node maps keyed by node id.
pub fn make_cset(from: &Roster, to: &Roster) -> Cset {
    use itertools::EitherOrBoth;
    use itertools::Itertools as _;

    let mut cs = Cset::default();
    for pair in from
        .all_nodes()
        .merge_join_by(to.all_nodes(), |(a, _), (b, _)| a.cmp(b))
    {
        match pair {
            EitherOrBoth::Left((nid, _)) => {
                cs.nodes_deleted.insert(from.get_name(nid));
            }
            EitherOrBoth::Right((nid, node)) => {
                let path = to.get_name(nid);
                match &node.kind {
                    NodeKind::File { content } => {
                        cs.files_added.insert(path.clone(), content.clone());
                    }
                    NodeKind::Dir { .. } => {
                        cs.dirs_added.insert(path.clone());
                    }
                }
                for (key, (live, value)) in &node.attrs {
                    if *live {
                        cs.attrs_set
                            .insert((path.clone(), key.clone()), value.clone());
                    }
                }
            }
            EitherOrBoth::Both((nid, from_node), (_, to_node)) => {
                assert_eq!(from_node.is_dir(), to_node.is_dir());
                if from_node.shallow_equal(to_node, false) {
                    continue;
                }
                let from_path = from.get_name(nid);
                let to_path = to.get_name(nid);
                if from_node.location() != to_node.location() {
                    cs.nodes_renamed.insert(from_path, to_path.clone());
                }
                if let (NodeKind::File { content: from_id }, NodeKind::File { content: to_id }) =
                    (&from_node.kind, &to_node.kind)
                {
                    if from_id != to_id {
                        cs.deltas_applied
                            .insert(to_path.clone(), (from_id.clone(), to_id.clone()));
                    }
                }
                for pair in from_node
                    .attrs
                    .iter()
                    .merge_join_by(to_node.attrs.iter(), |(a, _), (b, _)| a.cmp(b))
                {
                    match pair {
                        EitherOrBoth::Left((key, (live, _))) => {
                            if *live {
                                cs.attrs_cleared.insert((to_path.clone(), key.clone()));
                            }
                        }
                        EitherOrBoth::Right((key, (live, value))) => {
                            if *live {
                                cs.attrs_set
                                    .insert((to_path.clone(), key.clone()), value.clone());
                            }
                        }
                        EitherOrBoth::Both((key, (from_live, from_value)), (_, (to_live, to_value))) => {
                            if *from_live && !*to_live {
                                cs.attrs_cleared.insert((to_path.clone(), key.clone()));
                            } else if *to_live && (!*from_live || from_value != to_value) {
                                cs.attrs_set
                                    .insert((to_path.clone(), key.clone()), to_value.clone());
                            }
                        }
                    }
                }
            }
        }
    }
    cs
}

/// The node ids a cset touches: pre-state damage resolved in the old
/// roster, post-state damage in the new one. Restricted commits use this
/// to decide which nodes a path selection actually covers.
pub fn select_nodes_modified_by_cset(
    cs: &Cset,
    old_roster: &Roster,
    new_roster: &Roster,
) -> BTreeSet<NodeId> {
    let mut prestate: BTreeSet<&RepoPathBuf> = BTreeSet::new();
    prestate.extend(cs.nodes_deleted.iter());
    prestate.extend(cs.nodes_renamed.keys());

    let mut poststate: BTreeSet<&RepoPathBuf> = BTreeSet::new();
    poststate.extend(cs.dirs_added.iter());
    poststate.extend(cs.files_added.keys());
    poststate.extend(cs.nodes_renamed.values());
    poststate.extend(cs.deltas_applied.keys());
    poststate.extend(cs.attrs_cleared.iter().map(|(path, _)| path));
    poststate.extend(cs.attrs_set.keys().map(|(path, _)| path));

    let mut modified = BTreeSet::new();
    for path in prestate {
        let node = old_roster
            .node_at(path)
            .unwrap_or_else(|| panic!("cset names {path:?}, absent from the old roster"));
        modified.insert(node.self_id());
    }
    for path in poststate {
        let node = new_roster
            .node_at(path)
            .unwrap_or_else(|| panic!("cset names {path:?}, absent from the new roster"));
        modified.insert(node.self_id());
    }
    modified
}

/// Roster+marking comparison that ignores node id numbering: the trees
/// must coincide path-for-path in type, attrs, content, and markings.
pub fn equal_up_to_renumbering(
    a: &Roster,
    a_markings: &MarkingMap,
    b: &Roster,
    b_markings: &MarkingMap,
) -> bool {
    if a.node_count() != b.node_count() {
        return false;
    }
    for (nid, node) in a.all_nodes() {
        let path = a.get_name(nid);
        let Some(b_node) = b.node_at(&path) else {
            return false;
        };
        if node.is_dir() != b_node.is_dir() || node.attrs != b_node.attrs {
            return false;
        }
        if node.is_file() && node.content() != b_node.content() {
            return false;
        }
        if a_markings.get(nid) != b_markings.get(b_node.self_id()) {
            return false;
        }
    }
    true
}

/// Adapter that applies csets to an in-memory roster. The marking-aware
/// and merge-aware variants in [`crate::merge`] wrap the same roster
/// operations.
pub struct EditableRoster<'a> {
    pub(crate) roster: &'a mut Roster,
    pub(crate) nis: &'a mut dyn NodeIdSource,
}

impl<'a> EditableRoster<'a> {
    pub fn new(roster: &'a mut Roster, nis: &'a mut dyn NodeIdSource) -> Self {
        Self { roster, nis }
    }
}

impl EditableTree for EditableRoster<'_> {
    fn detach_node(&mut self, src: &RepoPathBuf) -> EditResult<NodeId> {
        Ok(self.roster.detach_node_at(src))
    }

    fn drop_detached_node(&mut self, nid: NodeId) -> EditResult<()> {
        self.roster.drop_detached_node(nid);
        Ok(())
    }

    fn create_dir_node(&mut self) -> EditResult<NodeId> {
        Ok(self.roster.create_dir_node(self.nis))
    }

    fn create_file_node(&mut self, content: &FileId) -> EditResult<NodeId> {
        Ok(self.roster.create_file_node(content.clone(), self.nis))
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
        Ok(())
    }

    fn clear_attr(&mut self, path: &RepoPathBuf, key: &AttrKey) -> EditResult<()> {
        self.roster.clear_attr(path, key);
        Ok(())
    }

    fn set_attr(&mut self, path: &RepoPathBuf, key: &AttrKey, value: &AttrValue) -> EditResult<()> {
        self.roster.set_attr(path, key, value);
        Ok(())
    }

    fn commit(&mut self) -> EditResult<()> {
        if self.roster.old_locations.is_empty() {
            Ok(())
        } else {
            Err(EditError::message("changeset left detached nodes behind"))
        }
    }
}
