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

//! Repository-relative paths.
//!
//! A [`RepoPathBuf`] is a normalized path below the workspace root, stored
//! as components joined by `/`. The empty path denotes the root directory
//! itself. These paths never contain `.`, `..`, empty components, or
//! absolute prefixes; conversion from filesystem paths validates all of
//! that up front so the rest of the engine can treat paths as opaque
//! ordered strings.

use std::borrow::Borrow;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

/// Name of the bookkeeping directory at the workspace root. No tracked
/// top-level entry may shadow it.
pub const BOOKKEEPING_DIR_NAME: &str = "_MTN";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid repository path {path:?}: {reason}")]
pub struct InvalidRepoPathError {
    pub path: String,
    pub reason: &'static str,
}

/// A single path component: non-empty, no separators, not `.` or `..`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPathComponentBuf(String);

impl RepoPathComponentBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidRepoPathError> {
        let value = value.into();
        if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
            return Err(InvalidRepoPathError {
                path: value,
                reason: "not a valid path component",
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RepoPathComponentBuf {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Debug for RepoPathComponentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.0)
    }
}

impl fmt::Display for RepoPathComponentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

/// An owned repository-relative path. The root is the empty path.
///
/// Ordering is the byte order of the internal string, which sorts every
/// directory immediately before the paths beneath it. Code that needs to
/// visit children before parents iterates in reverse.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPathBuf(String);

impl Debug for RepoPathBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.0)
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl RepoPathBuf {
    /// The workspace root directory.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parses an internal `a/b/c` string. `""` is the root.
    pub fn from_internal_string(value: impl Into<String>) -> Result<Self, InvalidRepoPathError> {
        let value = value.into();
        if value.is_empty() {
            return Ok(Self(value));
        }
        for component in value.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(InvalidRepoPathError {
                    path: value,
                    reason: "empty, dot, or dot-dot component",
                });
            }
        }
        Ok(Self(value))
    }

    /// Converts a relative filesystem path (as produced by a workspace
    /// walk) into a repository path.
    pub fn from_relative_path(path: &Path) -> Result<Self, InvalidRepoPathError> {
        let mut result = Self::root();
        for c in path.components() {
            match c {
                Component::CurDir => {}
                Component::Normal(name) => {
                    let name = name.to_str().ok_or(InvalidRepoPathError {
                        path: path.display().to_string(),
                        reason: "not valid UTF-8",
                    })?;
                    result = result.join(&RepoPathComponentBuf::new(name)?);
                }
                _ => {
                    return Err(InvalidRepoPathError {
                        path: path.display().to_string(),
                        reason: "not a normalized relative path",
                    });
                }
            }
        }
        Ok(result)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_internal_string(&self) -> &str {
        &self.0
    }

    pub fn join(&self, entry: &RepoPathComponentBuf) -> Self {
        if self.is_root() {
            Self(entry.as_str().to_owned())
        } else {
            Self(format!("{}/{}", self.0, entry.as_str()))
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Splits into (dirname, basename). The root splits into
    /// (root, None).
    pub fn split(&self) -> Option<(RepoPathBuf, RepoPathComponentBuf)> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((dir, base)) => Some((
                Self(dir.to_owned()),
                RepoPathComponentBuf(base.to_owned()),
            )),
            None => Some((Self::root(), RepoPathComponentBuf(self.0.clone()))),
        }
    }

    pub fn parent(&self) -> Option<RepoPathBuf> {
        self.split().map(|(dir, _)| dir)
    }

    pub fn basename(&self) -> Option<RepoPathComponentBuf> {
        self.split().map(|(_, base)| base)
    }

    /// Whether `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &RepoPathBuf) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0
            || (self.0.len() > other.0.len()
                && self.0.starts_with(&other.0)
                && self.0.as_bytes()[other.0.len()] == b'/')
    }

    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut result = base.to_path_buf();
        for c in self.components() {
            result.push(c);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_path(value: &str) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(value).unwrap()
    }

    #[test]
    fn parse_and_split() {
        assert!(repo_path("").is_root());
        let p = repo_path("foo/bar/baz");
        let (dir, base) = p.split().unwrap();
        assert_eq!(dir, repo_path("foo/bar"));
        assert_eq!(base.as_str(), "baz");
        assert_eq!(repo_path("foo").parent(), Some(RepoPathBuf::root()));
        assert_eq!(RepoPathBuf::root().split(), None);
    }

    #[test]
    fn rejects_non_normalized() {
        assert!(RepoPathBuf::from_internal_string("/abs").is_err());
        assert!(RepoPathBuf::from_internal_string("a//b").is_err());
        assert!(RepoPathBuf::from_internal_string("a/./b").is_err());
        assert!(RepoPathBuf::from_internal_string("a/../b").is_err());
        assert!(RepoPathComponentBuf::new("a/b").is_err());
        assert!(RepoPathComponentBuf::new("").is_err());
    }

    #[test]
    fn prefix_relation() {
        assert!(repo_path("foo/bar").starts_with(&repo_path("foo")));
        assert!(repo_path("foo/bar").starts_with(&RepoPathBuf::root()));
        assert!(!repo_path("foobar").starts_with(&repo_path("foo")));
        assert!(repo_path("foo").starts_with(&repo_path("foo")));
    }

    #[test]
    fn fs_path() {
        assert_eq!(
            repo_path("a/b").to_fs_path(Path::new("base")),
            Path::new("base").join("a").join("b")
        );
        assert_eq!(
            RepoPathBuf::from_relative_path(Path::new("a/b")).unwrap(),
            repo_path("a/b")
        );
    }
}
