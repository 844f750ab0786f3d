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

use assert_matches::assert_matches;
use mtn_lib::cert::Cert;
use mtn_lib::cert::CertName;
use mtn_lib::database::Database;
use mtn_lib::database::DatabaseError;
use mtn_lib::object_id::KeyId;
use mtn_lib::object_id::ObjectId as _;
use mtn_lib::roster::NodeIdSource as _;
use mtn_lib::xdelta;
use pretty_assertions::assert_eq;
use testutils::content_id;
use testutils::new_temp_dir;
use testutils::repo_path;
use testutils::TestGraph;

#[test]
fn create_and_reopen_checks_creator_and_schema() {
    let dir = new_temp_dir();
    let path = dir.path().join("test.mtn");
    drop(Database::create(&path).unwrap());
    drop(Database::open(&path).unwrap());

    assert_matches!(
        Database::open(&dir.path().join("absent.mtn")),
        Err(DatabaseError::Missing { .. })
    );

    // a database without our creator tag is rejected
    let foreign = dir.path().join("foreign.db");
    {
        let db = Database::create(&foreign).unwrap();
        db.debug_execute("PRAGMA user_version = 0").unwrap();
    }
    assert_matches!(
        Database::open(&foreign),
        Err(DatabaseError::WrongCreator { .. })
    );
}

#[test]
fn file_chain_reconstructs_from_either_end() {
    let db = Database::open_memory().unwrap();
    let v1 = b"first version of the file\n".repeat(50);
    let mut v2 = v1.clone();
    v2.extend_from_slice(b"second version appends\n");
    let mut v3 = v2.clone();
    v3.splice(0..5, b"THIRD".iter().copied());

    let guard = db.begin_transaction(false).unwrap();
    db.put_file(&content_id(&v1), &v1).unwrap();
    db.put_file_version(
        &content_id(&v1),
        &content_id(&v2),
        &xdelta::compute_delta(&v1, &v2),
    )
    .unwrap();
    db.put_file_version(
        &content_id(&v2),
        &content_id(&v3),
        &xdelta::compute_delta(&v2, &v3),
    )
    .unwrap();
    guard.commit().unwrap();

    db.reset_cache();
    // with the default reverse policy the newest version is full and the
    // others are delta chains; all three must reconstruct exactly
    assert_eq!(db.get_file_version(&content_id(&v3)).unwrap(), v3);
    assert_eq!(db.get_file_version(&content_id(&v2)).unwrap(), v2);
    assert_eq!(db.get_file_version(&content_id(&v1)).unwrap(), v1);
}

#[test]
fn forward_delta_policy_keeps_old_full() {
    let db = Database::open_memory().unwrap();
    db.set_var("database", "delta-direction", "forward").unwrap();
    let v1 = b"aaaa".repeat(100);
    let v2 = b"aaab".repeat(100);

    let guard = db.begin_transaction(false).unwrap();
    db.put_file(&content_id(&v1), &v1).unwrap();
    db.put_file_version(
        &content_id(&v1),
        &content_id(&v2),
        &xdelta::compute_delta(&v1, &v2),
    )
    .unwrap();
    guard.commit().unwrap();

    db.reset_cache();
    assert_eq!(db.get_file_version(&content_id(&v1)).unwrap(), v1);
    assert_eq!(db.get_file_version(&content_id(&v2)).unwrap(), v2);
}

#[test]
fn arbitrary_delta_is_invertible() {
    let db = Database::open_memory().unwrap();
    let v1 = b"one two three four five".repeat(40);
    let v2 = b"one two 3333? four five".repeat(40);
    let guard = db.begin_transaction(false).unwrap();
    db.put_file(&content_id(&v1), &v1).unwrap();
    db.put_file_version(
        &content_id(&v1),
        &content_id(&v2),
        &xdelta::compute_delta(&v1, &v2),
    )
    .unwrap();
    guard.commit().unwrap();

    // stored direction and computed direction must both apply cleanly,
    // by equality rather than merely by hash
    let forward = db
        .get_arbitrary_file_delta(&content_id(&v1), &content_id(&v2))
        .unwrap();
    assert_eq!(xdelta::apply_delta(&v1, &forward).unwrap(), v2);
    let backward = db
        .get_arbitrary_file_delta(&content_id(&v2), &content_id(&v1))
        .unwrap();
    assert_eq!(xdelta::apply_delta(&v2, &backward).unwrap(), v1);
}

#[test]
fn rollback_discards_delayed_files_and_dirty_rosters() {
    let db = Database::open_memory().unwrap();
    let data = b"uncommitted contents".to_vec();
    {
        let _guard = db.begin_transaction(false).unwrap();
        db.put_file(&content_id(&data), &data).unwrap();
        assert!(db.file_version_exists(&content_id(&data)).unwrap());
        // guard dropped without commit
    }
    assert!(!db.file_version_exists(&content_id(&data)).unwrap());
}

#[test]
fn revision_round_trip_and_hash_verification() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let r0 = graph.commit(&[], &[("a", "va")]);
    let rev = db.get_revision(&r0).unwrap();
    assert_eq!(rev.ident(), r0);
    assert_eq!(rev.edges.len(), 1);
    assert!(rev.edges.keys().next().unwrap().is_null());

    // corrupting the stored blob trips the hash check
    db.debug_execute("UPDATE revisions SET data = x'1f8b0800000000000003' ")
        .unwrap();
    assert_matches!(
        db.get_revision(&r0),
        Err(DatabaseError::Corrupt { table: "revisions", .. })
            | Err(DatabaseError::Compression(_))
    );
}

#[test]
fn roster_storage_is_delta_compressed_and_reconstructible() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let r0 = graph.commit(&[], &[("a", "v1")]);
    let r1 = graph.commit(&[&r0], &[("a", "v2"), ("b", "new")]);
    let r2 = graph.commit(&[&r1], &[("a", "v3"), ("b", "new")]);

    let snapshots: Vec<_> = [&r0, &r1, &r2]
        .iter()
        .map(|rid| db.get_roster_version(rid).unwrap())
        .collect();

    // drop every cache so the next reads really hit the delta chains
    db.reset_cache();
    for (rid, (roster, markings)) in [&r0, &r1, &r2].iter().zip(&snapshots) {
        let (re_roster, re_markings) = db.get_roster_version(rid).unwrap();
        assert_eq!(re_roster.as_ref(), roster.as_ref());
        assert_eq!(re_markings.as_ref(), markings.as_ref());
    }

    // the manifest of each reconstructed roster matches the revision
    for rid in [&r0, &r1, &r2] {
        let rev = db.get_revision(rid).unwrap();
        let (roster, _) = db.get_roster_version(rid).unwrap();
        assert_eq!(roster.manifest_id(), rev.new_manifest);
    }
}

#[test]
fn kill_rev_leaves_the_rest_reconstructible() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let r0 = graph.commit(&[], &[("a", "v1")]);
    let r1 = graph.commit(&[&r0], &[("a", "v2")]);
    let r2 = graph.commit(&[&r1], &[("a", "v3")]);

    // r1 has a child, killing it is refused by precondition
    assert!(!db.get_revision_children(&r1).unwrap().is_empty());

    db.delete_existing_rev_and_certs(&r2).unwrap();
    assert!(!db.revision_exists(&r2).unwrap());
    assert!(db.get_revision_children(&r1).unwrap().is_empty());

    db.reset_cache();
    for rid in [&r0, &r1] {
        assert!(db.revision_exists(rid).unwrap());
        let (roster, _) = db.get_roster_version(rid).unwrap();
        assert_eq!(roster.manifest_id(), db.get_revision(rid).unwrap().new_manifest);
        db.get_rev_height(rid).unwrap();
    }
}

#[test]
fn node_id_counter_is_monotonic_and_persistent() {
    let dir = new_temp_dir();
    let path = dir.path().join("test.mtn");
    let first;
    {
        let db = Database::create(&path).unwrap();
        first = db.next_node_id().unwrap();
        assert_eq!(db.next_node_id().unwrap().as_raw(), first.as_raw() + 1);
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.next_node_id().unwrap().as_raw(), first.as_raw() + 2);
}

#[test]
fn vars_epochs_and_keys() {
    let db = Database::open_memory().unwrap();
    assert_eq!(db.get_var("database", "delta-direction").unwrap(), None);
    db.set_var("database", "delta-direction", "both").unwrap();
    assert_eq!(
        db.get_var("database", "delta-direction").unwrap().as_deref(),
        Some("both")
    );
    db.clear_var("database", "delta-direction").unwrap();
    assert_eq!(db.get_var("database", "delta-direction").unwrap(), None);

    db.set_epoch("project.trunk", &[7u8; 20]).unwrap();
    assert_eq!(
        db.get_epoch("project.trunk").unwrap().as_deref(),
        Some(&[7u8; 20][..])
    );
    assert_eq!(db.get_epochs().unwrap().len(), 1);

    let key_id = db.put_key("tester@example.com", b"not a real rsa key").unwrap();
    assert_eq!(key_id, KeyId::hash_of(b"not a real rsa key"));
    assert!(db.key_exists(&key_id).unwrap());
    let (name, data) = db.get_key(&key_id).unwrap();
    assert_eq!(name, "tester@example.com");
    assert_eq!(data, b"not a real rsa key");
    assert_eq!(db.get_key_ids().unwrap(), vec![key_id]);
}

#[test]
fn branch_certs_maintain_leaves() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let r0 = graph.commit(&[], &[("a", "v1")]);
    let r1 = graph.commit(&[&r0], &[("a", "v2")]);

    let key = KeyId::hash_of(b"key");
    let branch_cert = |rid: &mtn_lib::object_id::RevisionId| Cert {
        revision: rid.clone(),
        name: CertName::from("branch"),
        value: "project.trunk".to_owned(),
        key: key.clone(),
        sig: vec![1, 2, 3],
    };
    assert!(db.put_revision_cert(&branch_cert(&r0)).unwrap());
    assert_eq!(db.get_branch_leaves("project.trunk").unwrap(), [r0.clone()].into());
    assert!(db.put_revision_cert(&branch_cert(&r1)).unwrap());
    // r0 is an ancestor of r1; only r1 remains a leaf
    assert_eq!(db.get_branch_leaves("project.trunk").unwrap(), [r1.clone()].into());
    // exact duplicate certs are not stored twice
    assert!(!db.put_revision_cert(&branch_cert(&r1)).unwrap());

    let certs = db.get_revision_certs(&r1).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].value, "project.trunk");
    assert_eq!(
        db.get_revisions_with_cert(&CertName::from("branch"), "project.trunk")
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        db.get_revision_certs_with_name(&r0, &CertName::from("branch"))
            .unwrap()
            .len(),
        1
    );

    // killing the leaf revision recomputes the branch leaves
    db.delete_existing_rev_and_certs(&r1).unwrap();
    assert_eq!(db.get_branch_leaves("project.trunk").unwrap(), [r0].into());
}

#[test]
fn missing_prerequisites_drop_the_revision() {
    let db = Database::open_memory().unwrap();
    let mut graph = TestGraph::new(&db);
    let r0 = graph.commit(&[], &[("a", "v1")]);
    let (roster0, _) = db.get_roster_version(&r0).unwrap();

    // build a child whose added file was never stored
    let mut roster1 = roster0.as_ref().clone();
    let mut nis = testutils::SequentialNodeIdSource::new();
    for _ in 0..2 {
        nis.allocate();
    }
    let nid = roster1.create_file_node(content_id(b"never stored"), &mut nis);
    roster1.attach_node_at(nid, &repo_path("ghost"));
    let rev = mtn_lib::revision::make_revision(&r0, &roster0, &roster1);
    let rid = rev.ident();
    assert!(!db.put_revision(&rid, &rev).unwrap());
    assert!(!db.revision_exists(&rid).unwrap());
}
