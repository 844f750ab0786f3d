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

//! Library for mtn — the versioned-tree storage engine of the mtn
//! version control system.
//!
//! The crate covers four tightly coupled subsystems: the roster (a
//! node-identified snapshot of a tree), the marking algebra (per-scalar
//! provenance that drives three-way merge without history replay), the
//! content-addressed delta-compressed store over SQLite, and the
//! working-copy engine with its `_MTN` bookkeeping directory.

#![warn(unused_qualifications)]
#![deny(unused_must_use)]

/// Whose fault an error is; every error type in this crate can report
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Bad argument, missing workspace, conflict the user must resolve.
    User,
    /// OS error at the filesystem layer.
    System,
    /// Corrupt blob, hash mismatch, missing prerequisite.
    Database,
    /// Failure while checking data that arrived from a peer.
    Network,
    /// Malformed metadata under the bookkeeping directory.
    Workspace,
    /// Invariant violation; not supposed to happen.
    Internal,
}

pub mod ancestry;
pub mod basic_io;
pub mod bisect;
pub mod cert;
pub mod cset;
pub mod database;
pub mod file_util;
pub mod inodeprint;
pub mod marking;
pub mod merge;
pub mod object_id;
pub mod reconstruction;
pub mod repo_path;
pub mod restriction;
pub mod rev_height;
pub mod revision;
pub mod roster;
pub mod roster_delta;
pub mod working_copy;
pub mod workspace;
pub mod writeback;
pub mod xdelta;
