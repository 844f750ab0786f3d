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

//! Rev-heights: variable-length integer tuples totally ordering the
//! revision graph consistent with ancestry.
//!
//! The first child of a revision extends the parent's height by
//! incrementing its last element; the n-th child (n > 0) appends
//! `(n - 1, 0)`. Comparing tuples lexicographically then guarantees that
//! `h(a) < h(b)` whenever `a` cannot be a descendant of `b`, and that no
//! two revisions share a height.

use std::fmt;

use smallvec::SmallVec;
use smallvec::smallvec;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed height bytes (length {0} is not a multiple of 4)")]
pub struct HeightDecodeError(usize);

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevHeight(SmallVec<[u32; 4]>);

impl RevHeight {
    /// The height of a root revision (one with the null parent).
    pub fn root_height() -> Self {
        Self(smallvec![0])
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    /// The height of this revision's `nr`-th child.
    ///
    /// Returns `None` on child-index exhaustion instead of wrapping; the
    /// allocator's retry loop treats that as an invariant failure.
    pub fn child_height(&self, nr: u32) -> Option<Self> {
        assert!(self.is_valid());
        let mut tuple = self.0.clone();
        if nr == 0 {
            let last = tuple.last_mut().unwrap();
            *last = last.checked_add(1)?;
        } else {
            tuple.push(nr - 1);
            tuple.push(0);
        }
        Some(Self(tuple))
    }

    /// Big-endian byte encoding, as stored in the heights table. The
    /// byte order equals the tuple order, so the column is directly
    /// comparable.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for value in &self.0 {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeightDecodeError> {
        if bytes.len() % 4 != 0 || bytes.is_empty() {
            return Err(HeightDecodeError(bytes.len()));
        }
        let tuple = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(Self(tuple))
    }
}

impl fmt::Debug for RevHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevHeight({self})")
    }
}

impl fmt::Display for RevHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for value in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            write!(f, "{value}")?;
        }
        Ok(())
    }
}
