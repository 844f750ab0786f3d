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

#![allow(missing_docs)]

//! Filesystem helpers for the working-copy engine: path-tagged errors,
//! atomic writes, and the small set of move/delete primitives that
//! content update is built from.

use std::fs;
use std::fs::File;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use digest::Digest as _;
use sha1::Sha1;
use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

use crate::object_id::FileId;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    #[source]
    pub error: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            error,
        })
    }
}

/// What a path currently is on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStatus {
    Nonexistent,
    File,
    Directory,
}

pub fn path_status(path: &Path) -> Result<PathStatus, PathError> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => Ok(PathStatus::Directory),
        Ok(_) => Ok(PathStatus::File),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PathStatus::Nonexistent),
        Err(err) => Err(PathError {
            path: path.to_path_buf(),
            error: err,
        }),
    }
}

/// Creates a directory or does nothing if the directory already exists.
///
/// The function will fail if intermediate directories on the path do not
/// already exist.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// `mkdir -p`.
pub fn mkdir_p(dirname: &Path) -> Result<(), PathError> {
    fs::create_dir_all(dirname).context(dirname)
}

/// Consumes as much `..` and `.` as possible without considering
/// symlinks.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir
                if matches!(result.components().next_back(), Some(Component::Normal(_))) =>
            {
                // Do not pop ".."
                let popped = result.pop();
                assert!(popped);
            }
            _ => {
                result.push(c);
            }
        }
    }

    if result.as_os_str().is_empty() {
        ".".into()
    } else {
        result
    }
}

pub fn read_data(path: &Path) -> Result<Vec<u8>, PathError> {
    fs::read(path).context(path)
}

/// The content id of a file on disk.
pub fn ident_existing_file(path: &Path) -> Result<FileId, PathError> {
    let mut hasher = Sha1::new();
    let mut file = File::open(path).context(path)?;
    io::copy(&mut file, &mut hasher).context(path)?;
    Ok(FileId::from_bytes(&hasher.finalize()).expect("sha1 digests are id-sized"))
}

/// Like `NamedTempFile::persist()`, but doesn't try to overwrite the
/// existing target on Windows.
pub fn persist_temp_file<P: AsRef<Path>>(temp_file: NamedTempFile, new_path: P) -> io::Result<()> {
    if cfg!(windows) {
        // On Windows, overwriting can fail if the file is opened without
        // FILE_SHARE_DELETE; fall back to a copy-over.
        match temp_file.persist(&new_path) {
            Ok(_) => Ok(()),
            Err(PersistError { error: _, file }) => {
                fs::copy(file.path(), &new_path)?;
                Ok(())
            }
        }
    } else {
        // On Unix, rename() is atomic and succeeds even if the
        // destination exists.
        temp_file
            .persist(new_path)
            .map(|_| ())
            .map_err(|PersistError { error, file: _ }| error)
    }
}

/// Writes a file atomically: temp file in the same directory, then
/// rename over the destination.
pub fn write_data(path: &Path, data: &[u8]) -> Result<(), PathError> {
    use std::io::Write as _;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(dir).context(dir)?;
    temp_file.write_all(data).context(path)?;
    persist_temp_file(temp_file, path).context(path)
}

/// Renames a file or directory tree, crossing filesystems if the plain
/// rename fails for a file.
pub fn move_path(src: &Path, dst: &Path) -> Result<(), PathError> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) if src.is_file() => {
            fs::copy(src, dst).context(dst)?;
            fs::remove_file(src).context(src)
        }
        Err(err) => Err(PathError {
            path: src.to_path_buf(),
            error: err,
        }),
    }
}

/// Deletes a file, or an empty directory.
pub fn delete_file_or_dir_shallow(path: &Path) -> Result<(), PathError> {
    if path.is_dir() {
        fs::remove_dir(path).context(path)
    } else {
        fs::remove_file(path).context(path)
    }
}

pub fn directory_empty(path: &Path) -> Result<bool, PathError> {
    Ok(path.read_dir().context(path)?.next().is_none())
}
