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

//! Generic shortest-path reconstruction over a (base, delta-chain) store.
//!
//! The file store and the roster store share this one BFS: starting from
//! the wanted identifier, follow base-of edges until a node with a full
//! blob (or a cached one) is found, then the caller replays the path in
//! reverse, applying one delta per hop.

use std::collections::BTreeSet;
use std::collections::VecDeque;

/// The delta graph as seen from one store table.
pub trait ReconstructionGraph {
    type Id: Clone + Ord;
    type Error;

    /// Whether a full blob for `id` is available (stored or cached).
    fn is_base(&self, id: &Self::Id) -> Result<bool, Self::Error>;

    /// The bases of the deltas that produce `id`.
    fn next_bases(&self, id: &Self::Id) -> Result<Vec<Self::Id>, Self::Error>;
}

/// Finds a path `[start, ..., base]` such that every adjacent pair is a
/// delta edge and `base` has a full blob. Returns `None` when no chain
/// terminates in a base, which callers surface as store corruption.
pub fn reconstruction_path<G: ReconstructionGraph>(
    graph: &G,
    start: &G::Id,
) -> Result<Option<Vec<G::Id>>, G::Error> {
    if graph.is_base(start)? {
        return Ok(Some(vec![start.clone()]));
    }
    let mut seen: BTreeSet<G::Id> = BTreeSet::new();
    let mut queue: VecDeque<Vec<G::Id>> = VecDeque::new();
    seen.insert(start.clone());
    queue.push_back(vec![start.clone()]);
    while let Some(path) = queue.pop_front() {
        let tip = path.last().unwrap();
        for base in graph.next_bases(tip)? {
            if !seen.insert(base.clone()) {
                continue;
            }
            let mut next_path = path.clone();
            next_path.push(base.clone());
            if graph.is_base(&base)? {
                return Ok(Some(next_path));
            }
            queue.push_back(next_path);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    struct TestGraph {
        bases: BTreeSet<u32>,
        edges: BTreeMap<u32, Vec<u32>>,
    }

    impl ReconstructionGraph for TestGraph {
        type Id = u32;
        type Error = std::convert::Infallible;

        fn is_base(&self, id: &u32) -> Result<bool, Self::Error> {
            Ok(self.bases.contains(id))
        }

        fn next_bases(&self, id: &u32) -> Result<Vec<u32>, Self::Error> {
            Ok(self.edges.get(id).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn finds_shortest_chain() {
        // 5 -> 4 -> 3 -> 1 (base), and a shortcut 5 -> 2 (base)
        let graph = TestGraph {
            bases: BTreeSet::from([1, 2]),
            edges: BTreeMap::from([(5, vec![4, 2]), (4, vec![3]), (3, vec![1])]),
        };
        let path = reconstruction_path(&graph, &5).unwrap().unwrap();
        assert_eq!(path, vec![5, 2]);
    }

    #[test]
    fn base_is_its_own_path() {
        let graph = TestGraph {
            bases: BTreeSet::from([7]),
            edges: BTreeMap::new(),
        };
        assert_eq!(reconstruction_path(&graph, &7).unwrap(), Some(vec![7]));
    }

    #[test]
    fn detects_unreachable_base() {
        let graph = TestGraph {
            bases: BTreeSet::new(),
            edges: BTreeMap::from([(5, vec![4]), (4, vec![5])]),
        };
        assert_eq!(reconstruction_path(&graph, &5).unwrap(), None);
    }
}
