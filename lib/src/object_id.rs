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

#![allow(missing_docs)]

use digest::Digest as _;
use sha1::Sha1;
use thiserror::Error;

/// Width in bytes of every non-null identifier.
pub const ID_LEN: usize = 20;

/// Identifier for a stored object, equal to the SHA-1 of the object's
/// canonical serialization. The empty byte string is the distinguished
/// null id ("no such object", and the synthetic pre-root parent).
pub trait ObjectId: Clone {
    fn object_type(&self) -> &'static str;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;
    fn is_null(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid hex string: {0:?}")]
    BadHex(String),
    #[error("bad length for {object_type} id (expected {expected} bytes, got {actual})")]
    BadLength {
        object_type: &'static str,
        expected: usize,
        actual: usize,
    },
}

macro_rules! id_type {
    ($(#[$attr:meta])* $vis:vis $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        $vis struct $name(Vec<u8>);

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl $name {
            /// The null id: no such object.
            pub fn null() -> Self {
                Self(vec![])
            }

            pub fn new(bytes: Vec<u8>) -> Result<Self, crate::object_id::IdParseError> {
                if !bytes.is_empty() && bytes.len() != crate::object_id::ID_LEN {
                    return Err(crate::object_id::IdParseError::BadLength {
                        object_type: stringify!($name),
                        expected: crate::object_id::ID_LEN,
                        actual: bytes.len(),
                    });
                }
                Ok(Self(bytes))
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::object_id::IdParseError> {
                Self::new(bytes.to_vec())
            }

            pub fn try_from_hex(
                hex: &str,
            ) -> Result<Self, crate::object_id::IdParseError> {
                let bytes = ::hex::decode(hex).map_err(|_| {
                    crate::object_id::IdParseError::BadHex(hex.to_owned())
                })?;
                Self::new(bytes)
            }

            /// Hashes a canonical serialization into an id of this type.
            pub fn hash_of(payload: &[u8]) -> Self {
                Self(crate::object_id::sha1_digest(payload).to_vec())
            }
        }

        impl crate::object_id::ObjectId for $name {
            fn object_type(&self) -> &'static str {
                stringify!($name)
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                ::hex::encode(&self.0)
            }
        }
    };
}

pub(crate) use id_type;

id_type!(
    /// Identifier of a file's content: the SHA-1 of its bytes.
    pub FileId
);
id_type!(
    /// Identifier of a manifest: the SHA-1 of the public roster
    /// serialization.
    pub ManifestId
);
id_type!(
    /// Identifier of a revision: the SHA-1 of the revision serialization.
    pub RevisionId
);
id_type!(
    /// Identifier of a signing key: the SHA-1 of the serialized public key.
    pub KeyId
);
id_type!(
    /// Identifier of a cert: the SHA-1 of the signed cert serialization.
    pub CertId
);

pub(crate) fn sha1_digest(payload: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = FileId::hash_of(b"hello\n");
        assert_eq!(id.hex().len(), 2 * ID_LEN);
        assert_eq!(FileId::try_from_hex(&id.hex()).unwrap(), id);
    }

    #[test]
    fn known_digest() {
        // sha1("hello\n")
        let id = FileId::hash_of(b"hello\n");
        assert_eq!(id.hex(), "f572d396fae9206628714fb2ce00f72e94f2258f");
    }

    #[test]
    fn null_id() {
        let id = RevisionId::null();
        assert!(id.is_null());
        assert_eq!(id.hex(), "");
        assert_eq!(RevisionId::try_from_hex("").unwrap(), id);
    }

    #[test]
    fn rejects_bad_width() {
        assert_matches::assert_matches!(
            RevisionId::from_bytes(&[0u8; 7]),
            Err(IdParseError::BadLength { .. })
        );
    }
}
