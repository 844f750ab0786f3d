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

//! Certs: signed name/value assertions about a revision.
//!
//! The cryptographic primitives stay behind contract seams: a
//! [`SignatureVerifier`] checks a signature over the signable text, and a
//! [`TrustPredicate`] decides whether a set of signers is believed for a
//! given assertion. Everything else (hashing, storage, trust
//! aggregation) lives here.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::object_id::CertId;
use crate::object_id::KeyId;
use crate::object_id::ObjectId as _;
use crate::object_id::RevisionId;

/// Well-known cert names.
pub const BRANCH_CERT_NAME: &str = "branch";
pub const AUTHOR_CERT_NAME: &str = "author";
pub const DATE_CERT_NAME: &str = "date";
pub const CHANGELOG_CERT_NAME: &str = "changelog";
pub const TAG_CERT_NAME: &str = "tag";
pub const SUSPEND_CERT_NAME: &str = "suspend";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CertName(String);

impl CertName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CertName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CertName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cert {
    pub revision: RevisionId,
    pub name: CertName,
    pub value: String,
    pub key: KeyId,
    pub sig: Vec<u8>,
}

/// Checks `sig` over `payload` with the named public key. The concrete
/// algorithm (RSA in the stock key store) is outside this crate.
pub type SignatureVerifier<'a> = dyn Fn(&KeyId, &[u8], &[u8]) -> bool + 'a;

/// Decides whether the given signers are collectively trusted to assert
/// `name = value` about `revision`.
pub type TrustPredicate<'a> = dyn Fn(&BTreeSet<KeyId>, &RevisionId, &CertName, &str) -> bool + 'a;

/// The exact bytes a cert signature covers.
pub fn cert_signable_text(revision: &RevisionId, name: &CertName, value: &str) -> Vec<u8> {
    format!("[{}@{}:{}]", name, revision.hex(), value).into_bytes()
}

impl Cert {
    /// The cert's own content hash, used as its storage key. Two certs
    /// differing only in signature hash differently.
    pub fn ident(&self) -> CertId {
        let mut payload = Vec::new();
        payload.extend_from_slice(self.revision.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.name.as_str().as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.value.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.key.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&self.sig);
        CertId::hash_of(&payload)
    }

    pub fn signable_text(&self) -> Vec<u8> {
        cert_signable_text(&self.revision, &self.name, &self.value)
    }

    pub fn verify(&self, verifier: &SignatureVerifier<'_>) -> bool {
        verifier(&self.key, &self.signable_text(), &self.sig)
    }
}

/// Drops certs whose `(name, value)` assertion is not trusted, deciding
/// per assertion over the aggregate set of signing keys.
pub fn erase_bogus_certs(certs: &mut Vec<Cert>, trust: &TrustPredicate<'_>) {
    let mut signers: BTreeMap<(RevisionId, CertName, String), BTreeSet<KeyId>> = BTreeMap::new();
    for cert in certs.iter() {
        signers
            .entry((cert.revision.clone(), cert.name.clone(), cert.value.clone()))
            .or_default()
            .insert(cert.key.clone());
    }
    certs.retain(|cert| {
        let keys = &signers[&(cert.revision.clone(), cert.name.clone(), cert.value.clone())];
        trust(keys, &cert.revision, &cert.name, &cert.value)
    });
}
