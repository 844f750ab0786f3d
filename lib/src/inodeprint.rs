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

//! Inodeprints: cheap unchanged-file witnesses.
//!
//! An inodeprint hashes the filesystem metadata that is expected to
//! change whenever a file's content changes. The invariant is strictly
//! one-directional: an equal print means the content is unchanged, an
//! unequal print means nothing except that the file must be re-hashed.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::Path;

use digest::Digest as _;
use sha1::Sha1;
use thiserror::Error;

use crate::repo_path::RepoPathBuf;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Inodeprint([u8; 20]);

impl Inodeprint {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn try_from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Debug for Inodeprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inodeprint({})", self.hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed inodeprints line {line}: {reason}")]
pub struct InodeprintParseError {
    pub line: usize,
    pub reason: String,
}

pub type InodeprintMap = BTreeMap<RepoPathBuf, Inodeprint>;

fn hash_fields(fields: &[u64]) -> Inodeprint {
    let mut hasher = Sha1::new();
    for field in fields {
        hasher.update(field.to_le_bytes());
    }
    Inodeprint(hasher.finalize().into())
}

#[cfg(unix)]
fn print_of_metadata(metadata: &Metadata) -> Inodeprint {
    use std::os::unix::fs::MetadataExt as _;
    hash_fields(&[
        metadata.mtime() as u64,
        u64::from(metadata.mtime_nsec() as u32),
        metadata.ctime() as u64,
        u64::from(metadata.ctime_nsec() as u32),
        metadata.size(),
        metadata.ino(),
        metadata.dev(),
    ])
}

#[cfg(not(unix))]
fn print_of_metadata(metadata: &Metadata) -> Inodeprint {
    use std::time::UNIX_EPOCH;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    hash_fields(&[mtime, metadata.len()])
}

/// The current inodeprint of a file on disk.
pub fn inodeprint_of(path: &Path) -> io::Result<Inodeprint> {
    Ok(print_of_metadata(&path.metadata()?))
}

/// Whether the cached print witnesses the file as unchanged.
pub fn inodeprint_unchanged(map: &InodeprintMap, path: &RepoPathBuf, current: &Inodeprint) -> bool {
    map.get(path) == Some(current)
}

/// The `_MTN/inodeprints` line format: `path\thex`, sorted by path.
pub fn write_inodeprint_map(map: &InodeprintMap) -> String {
    let mut out = String::new();
    for (path, print) in map {
        out.push_str(path.as_internal_string());
        out.push('\t');
        out.push_str(&print.hex());
        out.push('\n');
    }
    out
}

pub fn read_inodeprint_map(text: &str) -> Result<InodeprintMap, InodeprintParseError> {
    let mut map = InodeprintMap::new();
    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let error = |reason: &str| InodeprintParseError {
            line: index + 1,
            reason: reason.to_owned(),
        };
        let (path, hex) = line.split_once('\t').ok_or_else(|| error("missing tab"))?;
        let path = RepoPathBuf::from_internal_string(path)
            .map_err(|err| error(&err.to_string()))?;
        let print = Inodeprint::try_from_hex(hex).ok_or_else(|| error("bad fingerprint"))?;
        map.insert(path, print);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::tests::new_temp_dir;

    fn repo_path(value: &str) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(value).unwrap()
    }

    #[test]
    fn map_codec_round_trip() {
        let dir = new_temp_dir();
        let file = dir.path().join("f");
        fs::write(&file, b"contents").unwrap();
        let mut map = InodeprintMap::new();
        map.insert(repo_path("f"), inodeprint_of(&file).unwrap());
        map.insert(repo_path("dir/g"), inodeprint_of(&file).unwrap());
        let text = write_inodeprint_map(&map);
        assert_eq!(read_inodeprint_map(&text).unwrap(), map);
    }

    #[test]
    fn stable_for_untouched_file() {
        let dir = new_temp_dir();
        let file = dir.path().join("f");
        fs::write(&file, b"contents").unwrap();
        let a = inodeprint_of(&file).unwrap();
        let b = inodeprint_of(&file).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(read_inodeprint_map("no-tab-here\n").is_err());
        assert!(read_inodeprint_map("f\tnothex\n").is_err());
    }
}
