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

//! The SQL-backed persistence layer: content-addressed blobs, delta
//! chains, rosters with markings, revisions, ancestry, heights, certs,
//! keys, vars, and epochs, all in one SQLite file (or `:memory:`).
//!
//! Every blob is gzip-compressed. Roster and roster-delta rows carry an
//! embedded SHA-1 checksum of the compressed payload, separate from the
//! row key, so corruption of either is detectable. Reconstruction of a
//! delta-compressed version BFSes the delta graph to the nearest full
//! blob and replays deltas, verifying the final hash.
//!
//! Transactions nest: only the outermost `BEGIN`s and `COMMIT`s. Commit
//! flushes the delayed-file buffer and cleans the roster write-back
//! cache; rollback discards both.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::Read as _;
use std::io::Write as _;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use clru::CLruCache;
use clru::CLruCacheConfig;
use clru::WeightScale;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension as _;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::ancestry;
use crate::cert::Cert;
use crate::cert::CertName;
use crate::cert::BRANCH_CERT_NAME;
use crate::marking::MarkingMap;
use crate::merge::make_roster_for_merge;
use crate::merge::make_roster_for_nonmerge;
use crate::merge::MergeParent;
use crate::object_id::FileId;
use crate::object_id::KeyId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;
use crate::reconstruction::reconstruction_path;
use crate::reconstruction::ReconstructionGraph;
use crate::rev_height::RevHeight;
use crate::revision::MadeFor;
use crate::revision::Revision;
use crate::roster::NodeId;
use crate::roster::NodeIdSource;
use crate::roster::Roster;
use crate::roster_delta::apply_roster_delta;
use crate::roster_delta::delta_rosters;
use crate::roster_delta::RosterDelta;
use crate::writeback::LruWritebackCache;
use crate::xdelta;
use crate::Origin;

/// Tag written into SQLite's `user_version` when a database is created;
/// opening a file with a different tag fails.
pub const CREATOR_CODE: i32 = 0x6d74_6e01;

const SCHEMA_VERSION: &str = "mtn-schema-1";

const DB_ROSTER_CACHE_BYTES: usize = 7 * 1024 * 1024;
const DB_ROSTER_CACHE_MIN_COUNT: usize = 4;
const DB_VERSION_CACHE_BYTES: usize = 7 * 1024 * 1024;
const DB_MAX_DELAYED_FILE_BYTES: usize = 16 * 1024 * 1024;
/// Estimated serialized weight of one roster node.
const ROSTER_NODE_WEIGHT: usize = 320;

const CHECKPOINT_BATCH_BYTES: usize = 10 * 1024 * 1024;
const CHECKPOINT_BATCH_CALLS: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE files (id BLOB PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE file_deltas (id BLOB NOT NULL, base BLOB NOT NULL, delta BLOB NOT NULL,
                          UNIQUE(id, base));
CREATE TABLE rosters (id BLOB PRIMARY KEY, checksum BLOB NOT NULL, data BLOB NOT NULL);
CREATE TABLE roster_deltas (id BLOB NOT NULL, base BLOB NOT NULL, checksum BLOB NOT NULL,
                            delta BLOB NOT NULL, UNIQUE(id, base));
CREATE TABLE revisions (id BLOB PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE revision_ancestry (parent BLOB NOT NULL, child BLOB NOT NULL,
                                UNIQUE(parent, child));
CREATE INDEX revision_ancestry__child ON revision_ancestry (child);
CREATE TABLE heights (revision BLOB PRIMARY KEY, height BLOB NOT NULL UNIQUE);
CREATE TABLE revision_certs (hash BLOB PRIMARY KEY, revision_id BLOB NOT NULL,
                             name TEXT NOT NULL, value BLOB NOT NULL,
                             keypair_id BLOB NOT NULL, signature BLOB NOT NULL);
CREATE INDEX revision_certs__revision_id ON revision_certs (revision_id);
CREATE TABLE branch_leaves (branch BLOB NOT NULL, revision_id BLOB NOT NULL,
                            UNIQUE(branch, revision_id));
CREATE TABLE public_keys (id BLOB PRIMARY KEY, name TEXT NOT NULL, keydata BLOB NOT NULL);
CREATE TABLE branch_epochs (hash BLOB PRIMARY KEY, branch BLOB NOT NULL UNIQUE,
                            epoch BLOB NOT NULL);
CREATE TABLE db_vars (domain TEXT NOT NULL, name BLOB NOT NULL, value BLOB NOT NULL,
                      UNIQUE(domain, name));
CREATE TABLE next_roster_node_number (n INTEGER NOT NULL);
CREATE TABLE schema_version (version TEXT NOT NULL);
";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("error compressing or decompressing a stored blob: {0}")]
    Compression(#[from] std::io::Error),
    #[error("database {path} does not exist")]
    Missing { path: PathBuf },
    #[error("{path} was not created by this program (creator code {actual:#x})")]
    WrongCreator { path: PathBuf, actual: i32 },
    #[error("{path} has unknown schema {actual:?}")]
    WrongSchema { path: PathBuf, actual: String },
    #[error("{object_type} {hex} does not exist in the database")]
    NotFound {
        object_type: &'static str,
        hex: String,
    },
    #[error("{table} entry {hex} is corrupt: {reason}")]
    Corrupt {
        table: &'static str,
        hex: String,
        reason: String,
    },
    #[error("revision {hex} does not match the roster produced by its edges")]
    ManifestMismatch { hex: String },
}

impl DatabaseError {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Missing { .. } | Self::WrongCreator { .. } | Self::WrongSchema { .. } => {
                Origin::User
            }
            Self::Compression(_) => Origin::System,
            _ => Origin::Database,
        }
    }
}

pub type DbResult<T> = Result<T, DatabaseError>;

/// Delta storage policy, recorded in the `database/delta-direction` var.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaDirection {
    /// Store the newest version full, rewrite its parent as a delta.
    Reverse,
    /// Keep the old version full, store a forward delta for the child.
    Forward,
    /// Both deltas, plus the new full version.
    Both,
}

/// A reconstructed roster with its markings, shared copy-on-write.
pub type CachedRoster = (Arc<Roster>, Arc<MarkingMap>);

#[derive(Debug)]
struct BlobWeight;

impl WeightScale<FileId, Arc<Vec<u8>>> for BlobWeight {
    fn weight(&self, _key: &FileId, value: &Arc<Vec<u8>>) -> usize {
        value.len()
    }
}

#[derive(Debug)]
struct Caches {
    roster_cache: LruWritebackCache<RevisionId, CachedRoster>,
    vcache: CLruCache<FileId, Arc<Vec<u8>>, std::collections::hash_map::RandomState, BlobWeight>,
    height_cache: BTreeMap<RevisionId, RevHeight>,
    delayed_files: BTreeMap<FileId, Arc<Vec<u8>>>,
    delayed_size: usize,
}

impl Caches {
    fn new() -> Self {
        Self {
            roster_cache: LruWritebackCache::new(DB_ROSTER_CACHE_BYTES, DB_ROSTER_CACHE_MIN_COUNT),
            vcache: CLruCache::with_config(
                CLruCacheConfig::new(NonZeroUsize::new(DB_VERSION_CACHE_BYTES).unwrap())
                    .with_scale(BlobWeight),
            ),
            height_cache: BTreeMap::new(),
            delayed_files: BTreeMap::new(),
            delayed_size: 0,
        }
    }
}

#[derive(Debug)]
pub struct Database {
    conn: Connection,
    path: PathBuf,
    caches: RefCell<Caches>,
    transaction_level: Cell<u32>,
    transaction_exclusive: Cell<bool>,
}

fn encode_gzip(data: &[u8]) -> DbResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decode_gzip(data: &[u8]) -> DbResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn checksum_of(payload: &[u8]) -> Vec<u8> {
    crate::object_id::sha1_digest(payload).to_vec()
}

thread_local! {
    static OPEN_HANDLES: RefCell<BTreeMap<PathBuf, Weak<Database>>> =
        RefCell::new(BTreeMap::new());
}

impl Database {
    /// Creates a new database file (or an in-memory one for the
    /// `:memory:` sentinel) and installs the schema.
    pub fn create(path: &Path) -> DbResult<Database> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", CREATOR_CODE)?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        conn.execute(
            "INSERT INTO next_roster_node_number (n) VALUES (?1)",
            params![NodeId::FIRST.as_raw()],
        )?;
        Ok(Self::from_connection(conn, path))
    }

    /// Opens an existing database, checking both the creator code and
    /// the schema version.
    pub fn open(path: &Path) -> DbResult<Database> {
        if !Self::is_memory(path) && !path.exists() {
            return Err(DatabaseError::Missing {
                path: path.to_owned(),
            });
        }
        let conn = Connection::open(path)?;
        let creator: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if creator != CREATOR_CODE {
            return Err(DatabaseError::WrongCreator {
                path: path.to_owned(),
                actual: creator,
            });
        }
        let version: String =
            conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;
        if version != SCHEMA_VERSION {
            return Err(DatabaseError::WrongSchema {
                path: path.to_owned(),
                actual: version,
            });
        }
        Ok(Self::from_connection(conn, path))
    }

    /// Opens through the process-wide handle cache: a second open of the
    /// same canonical path yields the same handle.
    pub fn open_shared(path: &Path) -> DbResult<Rc<Database>> {
        if Self::is_memory(path) {
            return Ok(Rc::new(Self::open(path)?));
        }
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_owned());
        OPEN_HANDLES.with(|handles| {
            let mut handles = handles.borrow_mut();
            if let Some(existing) = handles.get(&canonical).and_then(Weak::upgrade) {
                return Ok(existing);
            }
            let db = Rc::new(Self::open(&canonical)?);
            handles.insert(canonical, Rc::downgrade(&db));
            Ok(db)
        })
    }

    /// A fresh in-memory database, mostly for tests.
    pub fn open_memory() -> DbResult<Database> {
        Self::create(Path::new(":memory:"))
    }

    fn is_memory(path: &Path) -> bool {
        path.as_os_str() == ":memory:"
    }

    fn from_connection(conn: Connection, path: &Path) -> Database {
        Database {
            conn,
            path: path.to_owned(),
            caches: RefCell::new(Caches::new()),
            transaction_level: Cell::new(0),
            transaction_exclusive: Cell::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `path` names this database's backing file; the workspace
    /// never tracks it.
    pub fn is_dbfile(&self, path: &Path) -> bool {
        if Self::is_memory(&self.path) {
            return false;
        }
        match (path.canonicalize(), self.path.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => path == self.path,
        }
    }

    /// Drops every in-memory cache; the store is unaffected.
    pub fn reset_cache(&self) {
        assert!(
            self.caches.borrow().roster_cache.all_clean(),
            "cache reset with dirty rosters pending"
        );
        *self.caches.borrow_mut() = Caches::new();
    }

    // ---------------------------------------------------------------
    // transactions

    pub fn begin_transaction(&self, exclusive: bool) -> DbResult<TransactionGuard<'_>> {
        let level = self.transaction_level.get();
        if level == 0 {
            {
                let caches = self.caches.borrow();
                assert!(caches.delayed_files.is_empty());
                assert!(caches.roster_cache.all_clean());
            }
            if exclusive {
                self.conn.execute_batch("BEGIN EXCLUSIVE")?;
            } else {
                self.conn.execute_batch("BEGIN DEFERRED")?;
            }
            self.transaction_exclusive.set(exclusive);
        } else {
            // You can't start an exclusive transaction within a
            // non-exclusive transaction.
            assert!(!exclusive || self.transaction_exclusive.get());
        }
        self.transaction_level.set(level + 1);
        Ok(TransactionGuard {
            db: self,
            committed: false,
            exclusive,
            checkpoint_bytes: 0,
            checkpoint_calls: 0,
        })
    }

    fn commit_transaction(&self) -> DbResult<()> {
        let level = self.transaction_level.get();
        assert!(level > 0);
        if level == 1 {
            self.flush_delayed_files()?;
            let mut caches = self.caches.borrow_mut();
            caches
                .roster_cache
                .clean_all(|rid, cr| self.write_delayed_roster(rid, cr))?;
            drop(caches);
            self.conn.execute_batch("COMMIT")?;
        }
        self.transaction_level.set(level - 1);
        Ok(())
    }

    fn rollback_transaction(&self) -> DbResult<()> {
        let level = self.transaction_level.get();
        assert!(level > 0);
        if level == 1 {
            let mut caches = self.caches.borrow_mut();
            caches.delayed_files.clear();
            caches.delayed_size = 0;
            caches.roster_cache.clear_and_drop_writes();
            drop(caches);
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.transaction_level.set(level - 1);
        Ok(())
    }

    // ---------------------------------------------------------------
    // delayed file buffer

    fn have_delayed_file(&self, id: &FileId) -> bool {
        self.caches.borrow().delayed_files.contains_key(id)
    }

    fn schedule_delayed_file(&self, id: &FileId, data: Arc<Vec<u8>>) -> DbResult<()> {
        {
            let mut caches = self.caches.borrow_mut();
            if caches.delayed_files.contains_key(id) {
                return Ok(());
            }
            caches.delayed_size += id.as_bytes().len() + data.len();
            caches.delayed_files.insert(id.clone(), data);
            if caches.delayed_size <= DB_MAX_DELAYED_FILE_BYTES {
                return Ok(());
            }
        }
        self.flush_delayed_files()
    }

    fn cancel_delayed_file(&self, id: &FileId) {
        let mut caches = self.caches.borrow_mut();
        if let Some(data) = caches.delayed_files.remove(id) {
            caches.delayed_size -= id.as_bytes().len() + data.len();
        }
    }

    fn drop_or_cancel_file(&self, id: &FileId) -> DbResult<()> {
        if self.have_delayed_file(id) {
            self.cancel_delayed_file(id);
        } else {
            self.conn
                .execute("DELETE FROM files WHERE id = ?1", params![id.as_bytes()])?;
        }
        Ok(())
    }

    fn flush_delayed_files(&self) -> DbResult<()> {
        let pending: Vec<(FileId, Arc<Vec<u8>>)> = {
            let caches = self.caches.borrow();
            caches
                .delayed_files
                .iter()
                .map(|(id, data)| (id.clone(), data.clone()))
                .collect()
        };
        for (id, data) in pending {
            self.write_delayed_file(&id, &data)?;
        }
        let mut caches = self.caches.borrow_mut();
        caches.delayed_files.clear();
        caches.delayed_size = 0;
        Ok(())
    }

    fn write_delayed_file(&self, id: &FileId, data: &[u8]) -> DbResult<()> {
        let packed = encode_gzip(data)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO files (id, data) VALUES (?1, ?2)",
            params![id.as_bytes(), packed],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // file versions

    fn file_base_exists(&self, id: &FileId) -> DbResult<bool> {
        if self.have_delayed_file(id) {
            return Ok(true);
        }
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM files WHERE id = ?1")?
            .query_row(params![id.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn file_delta_exists(&self, id: &FileId, base: &FileId) -> DbResult<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM file_deltas WHERE id = ?1 AND base = ?2 LIMIT 1")?
            .query_row(params![id.as_bytes(), base.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn any_file_delta_exists(&self, id: &FileId) -> DbResult<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM file_deltas WHERE id = ?1 LIMIT 1")?
            .query_row(params![id.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn file_version_exists(&self, id: &FileId) -> DbResult<bool> {
        Ok(self.file_base_exists(id)? || self.any_file_delta_exists(id)?)
    }

    fn get_file_base(&self, id: &FileId) -> DbResult<Vec<u8>> {
        if let Some(data) = self.caches.borrow().delayed_files.get(id) {
            return Ok(data.as_ref().clone());
        }
        let packed: Vec<u8> = self
            .conn
            .prepare_cached("SELECT data FROM files WHERE id = ?1")?
            .query_row(params![id.as_bytes()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "file",
                hex: id.hex(),
            })?;
        decode_gzip(&packed)
    }

    fn get_file_delta(&self, id: &FileId, base: &FileId) -> DbResult<Vec<u8>> {
        let packed: Vec<u8> = self
            .conn
            .prepare_cached("SELECT delta FROM file_deltas WHERE id = ?1 AND base = ?2")?
            .query_row(params![id.as_bytes(), base.as_bytes()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "file delta",
                hex: id.hex(),
            })?;
        decode_gzip(&packed)
    }

    /// Reconstructs a file's contents, following the delta graph to the
    /// nearest full blob and verifying the final hash.
    #[instrument(skip(self), fields(id = %id.hex()))]
    pub fn get_file_version(&self, id: &FileId) -> DbResult<Vec<u8>> {
        if let Some(data) = self.caches.borrow_mut().vcache.get(id) {
            return Ok(data.as_ref().clone());
        }

        struct FileGraph<'a> {
            db: &'a Database,
        }
        impl ReconstructionGraph for FileGraph<'_> {
            type Id = FileId;
            type Error = DatabaseError;

            fn is_base(&self, id: &FileId) -> DbResult<bool> {
                if self.db.caches.borrow_mut().vcache.get(id).is_some() {
                    return Ok(true);
                }
                self.db.file_base_exists(id)
            }

            fn next_bases(&self, id: &FileId) -> DbResult<Vec<FileId>> {
                let mut stmt = self
                    .db
                    .conn
                    .prepare_cached("SELECT base FROM file_deltas WHERE id = ?1")?;
                let rows = stmt.query_map(params![id.as_bytes()], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?;
                let mut bases = Vec::new();
                for row in rows {
                    bases.push(FileId::from_bytes(&row?).map_err(|err| {
                        DatabaseError::Corrupt {
                            table: "file_deltas",
                            hex: id.hex(),
                            reason: err.to_string(),
                        }
                    })?);
                }
                Ok(bases)
            }
        }

        let path = reconstruction_path(&FileGraph { db: self }, id)?.ok_or_else(|| {
            DatabaseError::Corrupt {
                table: "file_deltas",
                hex: id.hex(),
                reason: "no reconstruction path to a full version".into(),
            }
        })?;

        // The path runs [wanted, ..., base]; replay it backwards.
        let base = path.last().unwrap();
        let mut data = if let Some(cached) = self.caches.borrow_mut().vcache.get(base) {
            cached.as_ref().clone()
        } else {
            self.get_file_base(base)?
        };
        self.cache_blob(base, &data);
        for (i, next) in path.iter().enumerate().rev().skip(1) {
            let delta = self.get_file_delta(next, &path[i + 1])?;
            data = xdelta::apply_delta(&data, &delta).map_err(|err| DatabaseError::Corrupt {
                table: "file_deltas",
                hex: next.hex(),
                reason: err.to_string(),
            })?;
            self.cache_blob(next, &data);
        }

        if FileId::hash_of(&data) != *id {
            return Err(DatabaseError::Corrupt {
                table: "files",
                hex: id.hex(),
                reason: "delta-reconstructed item does not match hash".into(),
            });
        }
        Ok(data)
    }

    fn cache_blob(&self, id: &FileId, data: &[u8]) {
        let _ = self
            .caches
            .borrow_mut()
            .vcache
            .put_with_weight(id.clone(), Arc::new(data.to_vec()));
    }

    /// Stores a new full file version (queued in the delayed buffer).
    pub fn put_file(&self, id: &FileId, data: &[u8]) -> DbResult<()> {
        if self.file_version_exists(id)? {
            debug!(id = %id.hex(), "file version already exists");
            return Ok(());
        }
        debug_assert_eq!(FileId::hash_of(data), *id);
        self.schedule_delayed_file(id, Arc::new(data.to_vec()))
    }

    fn delta_direction(&self) -> DbResult<DeltaDirection> {
        match self.get_var("database", "delta-direction")? {
            None => Ok(DeltaDirection::Reverse),
            Some(value) => match value.as_str() {
                "reverse" => Ok(DeltaDirection::Reverse),
                "forward" => Ok(DeltaDirection::Forward),
                "both" => Ok(DeltaDirection::Both),
                other => {
                    warn!(
                        "unknown delta direction {other:?}; assuming 'reverse'. \
                         Valid values are 'reverse', 'forward', 'both'."
                    );
                    Ok(DeltaDirection::Reverse)
                }
            },
        }
    }

    fn put_file_delta(&self, id: &FileId, base: &FileId, delta: &[u8]) -> DbResult<()> {
        let packed = encode_gzip(delta)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO file_deltas (id, base, delta) VALUES (?1, ?2, ?3)",
            params![id.as_bytes(), base.as_bytes(), packed],
        )?;
        Ok(())
    }

    /// Stores version `new_id` given its parent `old_id` and the forward
    /// delta `old -> new`, applying the configured delta direction
    /// policy. With the default reverse policy the new version is stored
    /// full and the old full text is replaced by an inverted delta.
    pub fn put_file_version(
        &self,
        old_id: &FileId,
        new_id: &FileId,
        forward_delta: &[u8],
    ) -> DbResult<()> {
        assert_ne!(old_id, new_id);

        if !self.file_version_exists(old_id)? {
            warn!(old = %old_id.hex(), "file preimage missing in db");
            warn!(new = %new_id.hex(), "dropping delta");
            return Ok(());
        }

        let direction = self.delta_direction()?;
        let make_reverse = matches!(direction, DeltaDirection::Reverse | DeltaDirection::Both);
        let make_forward = matches!(direction, DeltaDirection::Forward | DeltaDirection::Both);

        let old_data = self.get_file_version(old_id)?;
        let new_data =
            xdelta::apply_delta(&old_data, forward_delta).map_err(|err| DatabaseError::Corrupt {
                table: "file_deltas",
                hex: new_id.hex(),
                reason: err.to_string(),
            })?;
        let reverse_delta = xdelta::invert_delta(&old_data, forward_delta).map_err(|err| {
            DatabaseError::Corrupt {
                table: "file_deltas",
                hex: old_id.hex(),
                reason: err.to_string(),
            }
        })?;
        // We already have the real old data, so compare the inverted
        // application to it directly rather than by hash.
        assert_eq!(
            xdelta::apply_delta(&new_data, &reverse_delta).as_ref(),
            Ok(&old_data)
        );

        let guard = self.begin_transaction(false)?;
        if make_reverse {
            if !self.file_base_exists(new_id)? {
                self.schedule_delayed_file(new_id, Arc::new(new_data.clone()))?;
            }
            if !self.file_delta_exists(old_id, new_id)? {
                self.put_file_delta(old_id, new_id, &reverse_delta)?;
            }
        }
        if make_forward {
            if !self.file_delta_exists(new_id, old_id)? {
                self.put_file_delta(new_id, old_id, forward_delta)?;
            }
        } else {
            self.conn.execute(
                "DELETE FROM file_deltas WHERE id = ?1",
                params![new_id.as_bytes()],
            )?;
        }
        if self.file_base_exists(old_id)? && self.any_file_delta_exists(old_id)? {
            // a descendant replaces the old head, so the old full text
            // goes away
            self.drop_or_cancel_file(old_id)?;
        }
        guard.commit()
    }

    /// A delta `src -> dst`, taken from the store in either direction or
    /// computed on the fly.
    pub fn get_arbitrary_file_delta(&self, src_id: &FileId, dst_id: &FileId) -> DbResult<Vec<u8>> {
        let stored: Option<Vec<u8>> = self
            .conn
            .prepare_cached("SELECT delta FROM file_deltas WHERE base = ?1 AND id = ?2")?
            .query_row(params![src_id.as_bytes(), dst_id.as_bytes()], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(packed) = stored {
            return decode_gzip(&packed);
        }
        let reverse: Option<Vec<u8>> = self
            .conn
            .prepare_cached("SELECT delta FROM file_deltas WHERE base = ?1 AND id = ?2")?
            .query_row(params![dst_id.as_bytes(), src_id.as_bytes()], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(packed) = reverse {
            let dst_to_src = decode_gzip(&packed)?;
            let dst_data = self.get_file_version(dst_id)?;
            return xdelta::invert_delta(&dst_data, &dst_to_src).map_err(|err| {
                DatabaseError::Corrupt {
                    table: "file_deltas",
                    hex: dst_id.hex(),
                    reason: err.to_string(),
                }
            });
        }
        let src_data = self.get_file_version(src_id)?;
        let dst_data = self.get_file_version(dst_id)?;
        Ok(xdelta::compute_delta(&src_data, &dst_data))
    }

    // ---------------------------------------------------------------
    // rosters

    fn roster_base_stored(&self, rid: &RevisionId) -> DbResult<bool> {
        {
            let caches = self.caches.borrow();
            if caches.roster_cache.exists(rid) && caches.roster_cache.is_dirty(rid) {
                return Ok(true);
            }
        }
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM rosters WHERE id = ?1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn roster_base_available(&self, rid: &RevisionId) -> DbResult<bool> {
        if self.caches.borrow().roster_cache.exists(rid) {
            return Ok(true);
        }
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM rosters WHERE id = ?1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn roster_version_exists(&self, rid: &RevisionId) -> DbResult<bool> {
        if self.roster_base_available(rid)? {
            return Ok(true);
        }
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM roster_deltas WHERE id = ?1 LIMIT 1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn roster_weight(roster: &Roster) -> usize {
        roster.node_count().max(1) * ROSTER_NODE_WEIGHT
    }

    fn write_delayed_roster(&self, rid: &RevisionId, cr: &CachedRoster) -> DbResult<()> {
        let (roster, markings) = cr;
        let text = roster.print_to(markings, true);
        let packed = encode_gzip(text.as_bytes())?;
        let checksum = checksum_of(&packed);
        self.conn.execute(
            "INSERT OR REPLACE INTO rosters (id, checksum, data) VALUES (?1, ?2, ?3)",
            params![rid.as_bytes(), checksum, packed],
        )?;
        Ok(())
    }

    fn get_roster_base(&self, rid: &RevisionId) -> DbResult<CachedRoster> {
        if let Some(cr) = self.caches.borrow_mut().roster_cache.fetch(rid) {
            return Ok(cr);
        }
        let (checksum, packed): (Vec<u8>, Vec<u8>) = self
            .conn
            .prepare_cached("SELECT checksum, data FROM rosters WHERE id = ?1")?
            .query_row(params![rid.as_bytes()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "roster",
                hex: rid.hex(),
            })?;
        if checksum_of(&packed) != checksum {
            return Err(DatabaseError::Corrupt {
                table: "rosters",
                hex: rid.hex(),
                reason: "checksum mismatch".into(),
            });
        }
        let text = decode_gzip(&packed)?;
        let text = String::from_utf8(text).map_err(|err| DatabaseError::Corrupt {
            table: "rosters",
            hex: rid.hex(),
            reason: err.to_string(),
        })?;
        let (roster, markings) = Roster::parse_from(&text).map_err(|err| DatabaseError::Corrupt {
            table: "rosters",
            hex: rid.hex(),
            reason: err.to_string(),
        })?;
        roster.check_sane_against(&markings, false);
        Ok((Arc::new(roster), Arc::new(markings)))
    }

    fn get_roster_delta(&self, rid: &RevisionId, base: &RevisionId) -> DbResult<RosterDelta> {
        let (checksum, packed): (Vec<u8>, Vec<u8>) = self
            .conn
            .prepare_cached("SELECT checksum, delta FROM roster_deltas WHERE id = ?1 AND base = ?2")?
            .query_row(params![rid.as_bytes(), base.as_bytes()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "roster delta",
                hex: rid.hex(),
            })?;
        if checksum_of(&packed) != checksum {
            return Err(DatabaseError::Corrupt {
                table: "roster_deltas",
                hex: rid.hex(),
                reason: "checksum mismatch".into(),
            });
        }
        let text = String::from_utf8(decode_gzip(&packed)?).map_err(|err| {
            DatabaseError::Corrupt {
                table: "roster_deltas",
                hex: rid.hex(),
                reason: err.to_string(),
            }
        })?;
        RosterDelta::parse(&text).map_err(|err| DatabaseError::Corrupt {
            table: "roster_deltas",
            hex: rid.hex(),
            reason: err.to_string(),
        })
    }

    fn put_roster_delta(
        &self,
        rid: &RevisionId,
        base: &RevisionId,
        delta: &RosterDelta,
    ) -> DbResult<()> {
        let packed = encode_gzip(delta.print().as_bytes())?;
        let checksum = checksum_of(&packed);
        self.conn.execute(
            "INSERT OR REPLACE INTO roster_deltas (id, base, checksum, delta) \
             VALUES (?1, ?2, ?3, ?4)",
            params![rid.as_bytes(), base.as_bytes(), checksum, packed],
        )?;
        Ok(())
    }

    /// Materializes the roster and markings of a revision, delta chains
    /// and all. The result lands in the write-back cache clean.
    #[instrument(skip(self), fields(rid = %rid.hex()))]
    pub fn get_roster_version(&self, rid: &RevisionId) -> DbResult<CachedRoster> {
        if let Some(cr) = self.caches.borrow_mut().roster_cache.fetch(rid) {
            return Ok(cr);
        }

        struct RosterGraph<'a> {
            db: &'a Database,
        }
        impl ReconstructionGraph for RosterGraph<'_> {
            type Id = RevisionId;
            type Error = DatabaseError;

            fn is_base(&self, id: &RevisionId) -> DbResult<bool> {
                self.db.roster_base_available(id)
            }

            fn next_bases(&self, id: &RevisionId) -> DbResult<Vec<RevisionId>> {
                let mut stmt = self
                    .db
                    .conn
                    .prepare_cached("SELECT base FROM roster_deltas WHERE id = ?1")?;
                let rows = stmt.query_map(params![id.as_bytes()], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?;
                let mut bases = Vec::new();
                for row in rows {
                    bases.push(RevisionId::from_bytes(&row?).map_err(|err| {
                        DatabaseError::Corrupt {
                            table: "roster_deltas",
                            hex: id.hex(),
                            reason: err.to_string(),
                        }
                    })?);
                }
                Ok(bases)
            }
        }

        let path = reconstruction_path(&RosterGraph { db: self }, rid)?.ok_or_else(|| {
            DatabaseError::Corrupt {
                table: "roster_deltas",
                hex: rid.hex(),
                reason: "no reconstruction path to a full roster".into(),
            }
        })?;

        let base = path.last().unwrap();
        let (roster, markings) = self.get_roster_base(base)?;
        let mut roster = roster.as_ref().clone();
        let mut markings = markings.as_ref().clone();
        for (i, next) in path.iter().enumerate().rev().skip(1) {
            let delta = self.get_roster_delta(next, &path[i + 1])?;
            apply_roster_delta(&delta, &mut roster, &mut markings);
        }
        roster.check_sane_against(&markings, false);

        let cr: CachedRoster = (Arc::new(roster), Arc::new(markings));
        let weight = Self::roster_weight(&cr.0);
        self.caches
            .borrow_mut()
            .roster_cache
            .insert_clean(rid.clone(), cr.clone(), weight, |key, value| {
                self.write_delayed_roster(key, value)
            })?;
        Ok(cr)
    }

    /// Writes a roster for `rid` (dirty, in cache) and rewrites each
    /// stored parent roster as a delta against it.
    pub fn put_roster(
        &self,
        rid: &RevisionId,
        rev: &Revision,
        roster: Arc<Roster>,
        markings: Arc<MarkingMap>,
    ) -> DbResult<()> {
        let guard = self.begin_transaction(false)?;

        let weight = Self::roster_weight(&roster);
        let cr: CachedRoster = (roster, markings);
        self.caches.borrow_mut().roster_cache.insert_dirty(
            rid.clone(),
            cr.clone(),
            weight,
            |key, value| self.write_delayed_roster(key, value),
        )?;

        for old_rev in rev.edges.keys() {
            if old_rev.is_null() {
                continue;
            }
            if self.roster_base_stored(old_rev)? {
                let (old_roster, old_markings) = self.get_roster_version(old_rev)?;
                let reverse_delta = delta_rosters(&cr.0, &cr.1, &old_roster, &old_markings);
                self.caches.borrow_mut().roster_cache.mark_clean(old_rev);
                self.conn.execute(
                    "DELETE FROM rosters WHERE id = ?1",
                    params![old_rev.as_bytes()],
                )?;
                self.put_roster_delta(old_rev, rid, &reverse_delta)?;
            }
        }
        guard.commit()
    }

    // ---------------------------------------------------------------
    // revisions

    pub fn revision_exists(&self, rid: &RevisionId) -> DbResult<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM revisions WHERE id = ?1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_revision(&self, rid: &RevisionId) -> DbResult<Revision> {
        assert!(!rid.is_null());
        let packed: Vec<u8> = self
            .conn
            .prepare_cached("SELECT data FROM revisions WHERE id = ?1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "revision",
                hex: rid.hex(),
            })?;
        let text = String::from_utf8(decode_gzip(&packed)?).map_err(|err| {
            DatabaseError::Corrupt {
                table: "revisions",
                hex: rid.hex(),
                reason: err.to_string(),
            }
        })?;
        if RevisionId::hash_of(text.as_bytes()) != *rid {
            return Err(DatabaseError::Corrupt {
                table: "revisions",
                hex: rid.hex(),
                reason: "revision does not match hash".into(),
            });
        }
        let mut rev = Revision::parse(&text).map_err(|err| DatabaseError::Corrupt {
            table: "revisions",
            hex: rid.hex(),
            reason: err.to_string(),
        })?;
        rev.made_for = MadeFor::Database;
        Ok(rev)
    }

    /// Writes a revision, its ancestry edges, its roster, file deltas
    /// for its edges, and its height. Returns `false` (writing nothing)
    /// when the revision already exists or a prerequisite is missing.
    #[instrument(skip(self, rev), fields(rid = %new_id.hex()))]
    pub fn put_revision(&self, new_id: &RevisionId, rev: &Revision) -> DbResult<bool> {
        assert!(!new_id.is_null());

        if self.revision_exists(new_id)? {
            debug!("revision already exists in db");
            return Ok(false);
        }

        assert_eq!(rev.made_for, MadeFor::Database);
        rev.check_sane();

        // Phase 1: confirm the revision makes sense and the files it
        // requires actually exist.
        for (old_rev, changes) in &rev.edges {
            if !old_rev.is_null() && !self.revision_exists(old_rev)? {
                warn!(parent = %old_rev.hex(), "missing prerequisite revision");
                warn!("dropping revision {}", new_id.hex());
                return Ok(false);
            }
            for content in changes.files_added.values() {
                if !self.file_version_exists(content)? {
                    warn!(file = %content.hex(), "missing prerequisite file");
                    warn!("dropping revision {}", new_id.hex());
                    return Ok(false);
                }
            }
            for (src, dst) in changes.deltas_applied.values() {
                assert!(!src.is_null() && !dst.is_null());
                for endpoint in [src, dst] {
                    if !self.file_version_exists(endpoint)? {
                        warn!(file = %endpoint.hex(), "missing prerequisite file delta endpoint");
                        warn!("dropping revision {}", new_id.hex());
                        return Ok(false);
                    }
                }
            }
        }

        let guard = self.begin_transaction(false)?;

        // Phase 2: revision data and ancestry.
        let text = rev.print();
        debug_assert_eq!(RevisionId::hash_of(text.as_bytes()), *new_id);
        let packed = encode_gzip(text.as_bytes())?;
        self.conn.execute(
            "INSERT INTO revisions (id, data) VALUES (?1, ?2)",
            params![new_id.as_bytes(), packed],
        )?;
        for old_rev in rev.edges.keys() {
            self.conn.execute(
                "INSERT INTO revision_ancestry (parent, child) VALUES (?1, ?2)",
                params![old_rev.as_bytes(), new_id.as_bytes()],
            )?;
        }

        // Phase 3: construct and write the roster, unless one was left
        // over by a local kill.
        if !self.roster_version_exists(new_id)? {
            self.put_roster_for_revision(new_id, rev)?;
        } else {
            debug!("roster for revision already exists in db");
        }

        // Phase 4: deltify the incoming file versions.
        self.deltify_revision(new_id)?;

        // Phase 5: the height.
        self.put_height_for_revision(new_id, rev)?;

        guard.commit()?;
        Ok(true)
    }

    fn put_roster_for_revision(&self, new_id: &RevisionId, rev: &Revision) -> DbResult<()> {
        let mut nis = DbNodeIdSource::new(self);
        let (roster, markings) = if rev.is_merge() {
            let mut edges = rev.edges.iter();
            let (left_rid, left_cs) = edges.next().unwrap();
            let (right_rid, right_cs) = edges.next().unwrap();
            let (left_roster, left_markings) = self.get_roster_version(left_rid)?;
            let (right_roster, right_markings) = self.get_roster_version(right_rid)?;
            let (left_uncommon, right_uncommon) =
                ancestry::get_uncommon_ancestors(self, left_rid, right_rid)?;
            let left = MergeParent {
                rid: left_rid,
                roster: &left_roster,
                markings: &left_markings,
                cs: left_cs,
                uncommon_ancestors: &left_uncommon,
            };
            let right = MergeParent {
                rid: right_rid,
                roster: &right_roster,
                markings: &right_markings,
                cs: right_cs,
                uncommon_ancestors: &right_uncommon,
            };
            let (roster, markings) = make_roster_for_merge(&left, &right, new_id, &mut nis)
                .map_err(|err| DatabaseError::Corrupt {
                    table: "revisions",
                    hex: new_id.hex(),
                    reason: err.to_string(),
                })?;
            (roster, markings)
        } else {
            let (old_rev, changes) = rev.edges.iter().next().unwrap();
            let (mut roster, mut markings) = if old_rev.is_null() {
                (Roster::new(), MarkingMap::default())
            } else {
                let (roster, markings) = self.get_roster_version(old_rev)?;
                (roster.as_ref().clone(), markings.as_ref().clone())
            };
            make_roster_for_nonmerge(changes, new_id, &mut roster, &mut markings, &mut nis)
                .map_err(|err| DatabaseError::Corrupt {
                    table: "revisions",
                    hex: new_id.hex(),
                    reason: err.to_string(),
                })?;
            (roster, markings)
        };
        nis.finish()?;

        roster.check_sane_against(&markings, false);
        if roster.manifest_id() != rev.new_manifest {
            return Err(DatabaseError::ManifestMismatch { hex: new_id.hex() });
        }
        self.put_roster(new_id, rev, Arc::new(roster), Arc::new(markings))
    }

    /// Replaces parent-side full texts with deltas against this
    /// revision's files, per the delta direction policy.
    pub fn deltify_revision(&self, rid: &RevisionId) -> DbResult<()> {
        let guard = self.begin_transaction(false)?;
        let rev = self.get_revision(rid)?;
        for changes in rev.edges.values() {
            for (src, dst) in changes.deltas_applied.values() {
                if self.file_version_exists(src)? && self.file_version_exists(dst)? {
                    let src_data = self.get_file_version(src)?;
                    let dst_data = self.get_file_version(dst)?;
                    let forward = xdelta::compute_delta(&src_data, &dst_data);
                    self.put_file_version(src, dst, &forward)?;
                }
            }
        }
        guard.commit()
    }

    /// Deletes a child-less revision together with its certs, ancestry
    /// rows, and height. Its roster blobs stay; reachable revisions stay
    /// reconstructible.
    pub fn delete_existing_rev_and_certs(&self, rid: &RevisionId) -> DbResult<()> {
        let guard = self.begin_transaction(false)?;

        assert!(self.revision_exists(rid)?);
        assert!(
            self.get_revision_children(rid)?.is_empty(),
            "cannot delete a revision with children"
        );

        debug!(rid = %rid.hex(), "killing revision locally");

        let branches: Vec<Vec<u8>> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT branch FROM branch_leaves WHERE revision_id = ?1")?;
            let rows = stmt.query_map(params![rid.as_bytes()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        self.conn.execute(
            "DELETE FROM revision_certs WHERE revision_id = ?1",
            params![rid.as_bytes()],
        )?;
        self.conn.execute(
            "DELETE FROM revision_ancestry WHERE child = ?1",
            params![rid.as_bytes()],
        )?;
        self.conn.execute(
            "DELETE FROM heights WHERE revision = ?1",
            params![rid.as_bytes()],
        )?;
        self.caches.borrow_mut().height_cache.remove(rid);
        self.conn.execute(
            "DELETE FROM revisions WHERE id = ?1",
            params![rid.as_bytes()],
        )?;

        for branch in branches {
            let branch = String::from_utf8_lossy(&branch).into_owned();
            self.recalc_branch_leaves(&branch)?;
        }

        guard.commit()
    }

    pub fn get_revision_parents(&self, rid: &RevisionId) -> DbResult<BTreeSet<RevisionId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT parent FROM revision_ancestry WHERE child = ?1")?;
        let rows = stmt.query_map(params![rid.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?;
        let mut parents = BTreeSet::new();
        for row in rows {
            parents.insert(RevisionId::from_bytes(&row?).map_err(|err| {
                DatabaseError::Corrupt {
                    table: "revision_ancestry",
                    hex: rid.hex(),
                    reason: err.to_string(),
                }
            })?);
        }
        Ok(parents)
    }

    pub fn get_revision_children(&self, rid: &RevisionId) -> DbResult<BTreeSet<RevisionId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT child FROM revision_ancestry WHERE parent = ?1")?;
        let rows = stmt.query_map(params![rid.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?;
        let mut children = BTreeSet::new();
        for row in rows {
            children.insert(RevisionId::from_bytes(&row?).map_err(|err| {
                DatabaseError::Corrupt {
                    table: "revision_ancestry",
                    hex: rid.hex(),
                    reason: err.to_string(),
                }
            })?);
        }
        Ok(children)
    }

    pub fn get_revision_ids(&self) -> DbResult<BTreeSet<RevisionId>> {
        let mut stmt = self.conn.prepare_cached("SELECT id FROM revisions")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(
                RevisionId::from_bytes(&row?).map_err(|err| DatabaseError::Corrupt {
                    table: "revisions",
                    hex: String::new(),
                    reason: err.to_string(),
                })?,
            );
        }
        Ok(ids)
    }

    // ---------------------------------------------------------------
    // heights

    pub fn get_rev_height(&self, rid: &RevisionId) -> DbResult<RevHeight> {
        if rid.is_null() {
            return Ok(RevHeight::root_height());
        }
        if let Some(height) = self.caches.borrow().height_cache.get(rid) {
            return Ok(height.clone());
        }
        let bytes: Vec<u8> = self
            .conn
            .prepare_cached("SELECT height FROM heights WHERE revision = ?1")?
            .query_row(params![rid.as_bytes()], |row| row.get(0))
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "height",
                hex: rid.hex(),
            })?;
        let height = RevHeight::from_bytes(&bytes).map_err(|err| DatabaseError::Corrupt {
            table: "heights",
            hex: rid.hex(),
            reason: err.to_string(),
        })?;
        self.caches
            .borrow_mut()
            .height_cache
            .insert(rid.clone(), height.clone());
        Ok(height)
    }

    fn put_rev_height(&self, rid: &RevisionId, height: &RevHeight) -> DbResult<()> {
        assert!(!rid.is_null());
        assert!(height.is_valid());
        self.caches.borrow_mut().height_cache.remove(rid);
        self.conn.execute(
            "INSERT INTO heights (revision, height) VALUES (?1, ?2)",
            params![rid.as_bytes(), height.to_bytes()],
        )?;
        Ok(())
    }

    fn has_rev_height(&self, height: &RevHeight) -> DbResult<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM heights WHERE height = ?1")?
            .query_row(params![height.to_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn put_height_for_revision(&self, new_id: &RevisionId, rev: &Revision) -> DbResult<()> {
        // Heights of real revisions all sort above the null parent's, so
        // the null height is a safe starting point for the max.
        let mut highest_parent = RevHeight::root_height();
        for old_rev in rev.edges.keys() {
            let parent = self.get_rev_height(old_rev)?;
            if parent > highest_parent {
                highest_parent = parent;
            }
        }

        let mut childnr: u32 = 0;
        loop {
            let candidate = highest_parent
                .child_height(childnr)
                .expect("child index space exhausted");
            if !self.has_rev_height(&candidate)? {
                self.put_rev_height(new_id, &candidate)?;
                return Ok(());
            }
            childnr = childnr
                .checked_add(1)
                .expect("child index space exhausted");
        }
    }

    // ---------------------------------------------------------------
    // certs

    /// Stores a cert; returns `false` for an exact duplicate. Branch
    /// certs keep the `branch_leaves` table in step.
    pub fn put_revision_cert(&self, cert: &Cert) -> DbResult<bool> {
        let hash = cert.ident();
        let exists: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM revision_certs WHERE hash = ?1")?
            .query_row(params![hash.as_bytes()], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }
        let guard = self.begin_transaction(false)?;
        self.conn.execute(
            "INSERT INTO revision_certs (hash, revision_id, name, value, keypair_id, signature) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                hash.as_bytes(),
                cert.revision.as_bytes(),
                cert.name.as_str(),
                cert.value.as_bytes(),
                cert.key.as_bytes(),
                cert.sig,
            ],
        )?;
        if cert.name.as_str() == BRANCH_CERT_NAME {
            self.recalc_branch_leaves(&cert.value)?;
        }
        guard.commit()?;
        Ok(true)
    }

    fn cert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, String, Vec<u8>, Vec<u8>, Vec<u8>)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn certs_from_query(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> DbResult<Vec<Cert>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(args, Self::cert_from_row)?;
        let mut certs = Vec::new();
        for row in rows {
            let (revision, name, value, key, sig) = row?;
            let corrupt = |reason: String| DatabaseError::Corrupt {
                table: "revision_certs",
                hex: String::new(),
                reason,
            };
            certs.push(Cert {
                revision: RevisionId::from_bytes(&revision).map_err(|e| corrupt(e.to_string()))?,
                name: CertName::from(name.as_str()),
                value: String::from_utf8(value).map_err(|e| corrupt(e.to_string()))?,
                key: KeyId::from_bytes(&key).map_err(|e| corrupt(e.to_string()))?,
                sig,
            });
        }
        Ok(certs)
    }

    pub fn get_revision_certs(&self, rid: &RevisionId) -> DbResult<Vec<Cert>> {
        self.certs_from_query(
            "SELECT revision_id, name, value, keypair_id, signature \
             FROM revision_certs WHERE revision_id = ?1 ORDER BY hash",
            &[&rid.as_bytes()],
        )
    }

    pub fn get_revision_certs_with_name(
        &self,
        rid: &RevisionId,
        name: &CertName,
    ) -> DbResult<Vec<Cert>> {
        self.certs_from_query(
            "SELECT revision_id, name, value, keypair_id, signature \
             FROM revision_certs WHERE revision_id = ?1 AND name = ?2 ORDER BY hash",
            &[&rid.as_bytes(), &name.as_str()],
        )
    }

    pub fn get_revisions_with_cert(
        &self,
        name: &CertName,
        value: &str,
    ) -> DbResult<BTreeSet<RevisionId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT revision_id FROM revision_certs WHERE name = ?1 AND value = ?2",
        )?;
        let rows = stmt.query_map(params![name.as_str(), value.as_bytes()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut revs = BTreeSet::new();
        for row in rows {
            revs.insert(
                RevisionId::from_bytes(&row?).map_err(|err| DatabaseError::Corrupt {
                    table: "revision_certs",
                    hex: String::new(),
                    reason: err.to_string(),
                })?,
            );
        }
        Ok(revs)
    }

    /// Leaves of a branch: revisions carrying the branch cert that are
    /// not ancestors of another such revision.
    pub fn get_branch_leaves(&self, branch: &str) -> DbResult<BTreeSet<RevisionId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT revision_id FROM branch_leaves WHERE branch = ?1")?;
        let rows = stmt.query_map(params![branch.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?;
        let mut revs = BTreeSet::new();
        for row in rows {
            revs.insert(
                RevisionId::from_bytes(&row?).map_err(|err| DatabaseError::Corrupt {
                    table: "branch_leaves",
                    hex: String::new(),
                    reason: err.to_string(),
                })?,
            );
        }
        Ok(revs)
    }

    fn recalc_branch_leaves(&self, branch: &str) -> DbResult<()> {
        self.conn.execute(
            "DELETE FROM branch_leaves WHERE branch = ?1",
            params![branch.as_bytes()],
        )?;
        let mut revs = self.get_revisions_with_cert(&CertName::from(BRANCH_CERT_NAME), branch)?;
        ancestry::erase_ancestors(self, &mut revs)?;
        for rid in revs {
            self.conn.execute(
                "INSERT INTO branch_leaves (branch, revision_id) VALUES (?1, ?2)",
                params![branch.as_bytes(), rid.as_bytes()],
            )?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // keys

    /// Stores a public key; its id is the hash of the serialized key.
    pub fn put_key(&self, name: &str, keydata: &[u8]) -> DbResult<KeyId> {
        let id = KeyId::hash_of(keydata);
        self.conn.execute(
            "INSERT OR REPLACE INTO public_keys (id, name, keydata) VALUES (?1, ?2, ?3)",
            params![id.as_bytes(), name, keydata],
        )?;
        Ok(id)
    }

    pub fn get_key(&self, id: &KeyId) -> DbResult<(String, Vec<u8>)> {
        self.conn
            .prepare_cached("SELECT name, keydata FROM public_keys WHERE id = ?1")?
            .query_row(params![id.as_bytes()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                object_type: "public key",
                hex: id.hex(),
            })
    }

    pub fn key_exists(&self, id: &KeyId) -> DbResult<bool> {
        let found: Option<i64> = self
            .conn
            .prepare_cached("SELECT 1 FROM public_keys WHERE id = ?1")?
            .query_row(params![id.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_key_ids(&self) -> DbResult<Vec<KeyId>> {
        let mut stmt = self.conn.prepare_cached("SELECT id FROM public_keys ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(
                KeyId::from_bytes(&row?).map_err(|err| DatabaseError::Corrupt {
                    table: "public_keys",
                    hex: String::new(),
                    reason: err.to_string(),
                })?,
            );
        }
        Ok(ids)
    }

    // ---------------------------------------------------------------
    // vars and epochs

    pub fn get_var(&self, domain: &str, name: &str) -> DbResult<Option<String>> {
        let value: Option<Vec<u8>> = self
            .conn
            .prepare_cached("SELECT value FROM db_vars WHERE domain = ?1 AND name = ?2")?
            .query_row(params![domain, name.as_bytes()], |row| row.get(0))
            .optional()?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_var(&self, domain: &str, name: &str, value: &str) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO db_vars (domain, name, value) VALUES (?1, ?2, ?3)",
            params![domain, name.as_bytes(), value.as_bytes()],
        )?;
        Ok(())
    }

    pub fn clear_var(&self, domain: &str, name: &str) -> DbResult<()> {
        self.conn.execute(
            "DELETE FROM db_vars WHERE domain = ?1 AND name = ?2",
            params![domain, name.as_bytes()],
        )?;
        Ok(())
    }

    pub fn get_vars(&self) -> DbResult<Vec<(String, String, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT domain, name, value FROM db_vars ORDER BY domain, name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut vars = Vec::new();
        for row in rows {
            let (domain, name, value) = row?;
            vars.push((
                domain,
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(vars)
    }

    /// Sets the epoch of a branch: 20 caller-supplied random bytes.
    pub fn set_epoch(&self, branch: &str, epoch: &[u8]) -> DbResult<()> {
        assert_eq!(epoch.len(), 20, "epochs are 20 bytes");
        let hash = checksum_of(branch.as_bytes());
        self.conn.execute(
            "INSERT OR REPLACE INTO branch_epochs (hash, branch, epoch) VALUES (?1, ?2, ?3)",
            params![hash, branch.as_bytes(), epoch],
        )?;
        Ok(())
    }

    pub fn get_epoch(&self, branch: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self
            .conn
            .prepare_cached("SELECT epoch FROM branch_epochs WHERE branch = ?1")?
            .query_row(params![branch.as_bytes()], |row| row.get(0))
            .optional()?)
    }

    pub fn get_epochs(&self) -> DbResult<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT branch, epoch FROM branch_epochs ORDER BY branch")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut epochs = Vec::new();
        for row in rows {
            let (branch, epoch) = row?;
            epochs.push((String::from_utf8_lossy(&branch).into_owned(), epoch));
        }
        Ok(epochs)
    }

    // ---------------------------------------------------------------
    // node ids

    /// Runs one raw SQL statement; for debugging and maintenance
    /// tooling, never for normal operation.
    pub fn debug_execute(&self, sql: &str) -> DbResult<usize> {
        Ok(self.conn.execute(sql, [])?)
    }

    /// Mints the next persistent node id from the one-row counter table.
    pub fn next_node_id(&self) -> DbResult<NodeId> {
        let guard = self.begin_transaction(false)?;
        let n: u32 = self
            .conn
            .query_row("SELECT n FROM next_roster_node_number", [], |row| row.get(0))?;
        self.conn.execute(
            "UPDATE next_roster_node_number SET n = ?1",
            params![n.checked_add(1).expect("node id space exhausted")],
        )?;
        guard.commit()?;
        let nid = NodeId::from_raw(n);
        assert!(!nid.is_temp(), "persistent node id space exhausted");
        Ok(nid)
    }
}

/// [`NodeIdSource`] backed by the database counter. Errors are deferred:
/// after a failure the source hands out ids from the temporary range so
/// callers can keep going, and `finish()` reports the first error before
/// anything built with those ids can be persisted.
pub struct DbNodeIdSource<'a> {
    db: &'a Database,
    error: Option<DatabaseError>,
    fallback: u32,
}

impl<'a> DbNodeIdSource<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            error: None,
            fallback: NodeId::FIRST_TEMP.as_raw(),
        }
    }

    pub fn finish(self) -> DbResult<()> {
        match self.error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl NodeIdSource for DbNodeIdSource<'_> {
    fn allocate(&mut self) -> NodeId {
        match self.db.next_node_id() {
            Ok(nid) => nid,
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                let nid = NodeId::from_raw(self.fallback);
                self.fallback += 1;
                nid
            }
        }
    }
}

/// Nested transaction guard. Dropping an uncommitted guard rolls the
/// (outermost) transaction back.
pub struct TransactionGuard<'a> {
    db: &'a Database,
    committed: bool,
    exclusive: bool,
    checkpoint_bytes: usize,
    checkpoint_calls: usize,
}

impl TransactionGuard<'_> {
    pub fn commit(mut self) -> DbResult<()> {
        self.committed = true;
        self.db.commit_transaction()
    }

    /// Accounts one store operation toward the checkpoint thresholds and
    /// splits the transaction when either is exceeded. Only meaningful
    /// on an outermost guard.
    pub fn maybe_checkpoint(&mut self, bytes: usize) -> DbResult<()> {
        self.checkpoint_bytes += bytes;
        self.checkpoint_calls += 1;
        if self.checkpoint_bytes >= CHECKPOINT_BATCH_BYTES
            || self.checkpoint_calls >= CHECKPOINT_BATCH_CALLS
        {
            assert_eq!(
                self.db.transaction_level.get(),
                1,
                "checkpoint inside a nested transaction"
            );
            self.db.commit_transaction()?;
            // This guard takes over the reopened transaction.
            let reopened = self.db.begin_transaction(self.exclusive)?;
            std::mem::forget(reopened);
            self.checkpoint_bytes = 0;
            self.checkpoint_calls = 0;
        }
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.db.rollback_transaction() {
                warn!("rollback failed: {err}");
            }
        }
    }
}
