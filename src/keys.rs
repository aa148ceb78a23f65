// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Hierarchy Model
//!
//! Passive data contract describing how client-side keys wrap one another.
//! The server stores and returns these structures verbatim. It never
//! validates, decrypts or re-derives key material.
//!
//! ## Hierarchy
//!
//! ```text
//! password + salt ──► KeyEncryptionKey (never persisted)
//!                       └─wraps─► MasterKey ◄─wraps── RecoveryKey
//!                                   ├─wraps─► PrivateKey
//!                                   ├─wraps─► RecoveryKey
//!                                   └─wraps─► CollectionKey ◄─wraps── recipient PublicKey
//!                                               └─wraps─► FileKey
//! ```
//!
//! Each plaintext key type has exactly one canonical ciphertext form carrying
//! `{ciphertext, nonce}`. Only ciphertext forms, the public key, the salt and
//! the verification id ever reach the server.
//!
//! ## Security Note
//!
//! **DO NOT** add decryption, key derivation or any other computation on key
//! material here. The zero-knowledge contract depends on the server holding
//! nothing it could decrypt with.

use std::fmt;

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Key Kinds
// =============================================================================

/// Every key type that appears in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Derived on the client from the password and a stored salt.
    KeyEncryptionKey,
    /// Root symmetric key of a user.
    MasterKey,
    /// Asymmetric private key used to receive shares.
    PrivateKey,
    /// Asymmetric public key, stored in the clear.
    PublicKey,
    /// Independent key enabling account recovery.
    RecoveryKey,
    /// One symmetric key per content collection.
    CollectionKey,
    /// One symmetric key per file.
    FileKey,
}

impl KeyKind {
    /// Keys this kind may be wrapped under. The first entry is the primary
    /// parent; further entries are alternate wrappings (recovery, sharing).
    pub const fn wrapped_by(self) -> &'static [KeyKind] {
        match self {
            KeyKind::KeyEncryptionKey | KeyKind::PublicKey => &[],
            KeyKind::MasterKey => &[KeyKind::KeyEncryptionKey, KeyKind::RecoveryKey],
            KeyKind::PrivateKey | KeyKind::RecoveryKey => &[KeyKind::MasterKey],
            KeyKind::CollectionKey => &[KeyKind::MasterKey, KeyKind::PublicKey],
            KeyKind::FileKey => &[KeyKind::CollectionKey],
        }
    }

    /// The primary wrapping parent, if any.
    pub const fn primary_parent(self) -> Option<KeyKind> {
        match self.wrapped_by() {
            [first, ..] => Some(*first),
            [] => None,
        }
    }

    /// Whether the server may ever hold this key in any form.
    ///
    /// The key encryption key is derived on demand and is never persisted,
    /// not even wrapped.
    pub const fn is_persisted(self) -> bool {
        !matches!(self, KeyKind::KeyEncryptionKey)
    }

    /// Chain of keys a client unlocks, starting at the password-derived key,
    /// to reach this kind along primary parents.
    ///
    /// `FileKey` yields `[KeyEncryptionKey, MasterKey, CollectionKey, FileKey]`.
    pub fn unlock_path(self) -> Vec<KeyKind> {
        let mut path = vec![self];
        let mut current = self;
        while let Some(parent) = current.primary_parent() {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::KeyEncryptionKey => "key_encryption_key",
            KeyKind::MasterKey => "master_key",
            KeyKind::PrivateKey => "private_key",
            KeyKind::PublicKey => "public_key",
            KeyKind::RecoveryKey => "recovery_key",
            KeyKind::CollectionKey => "collection_key",
            KeyKind::FileKey => "file_key",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Structural problem with submitted key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyMaterialError {
    #[error("{0}: ciphertext cannot be empty")]
    EmptyCiphertext(&'static str),

    #[error("{0}: nonce cannot be empty")]
    EmptyNonce(&'static str),

    #[error("{0}: key cannot be empty")]
    EmptyKey(&'static str),

    #[error("{0}: invalid base64")]
    Encoding(&'static str),
}

// =============================================================================
// Byte encoding
// =============================================================================

/// Opaque bytes serialized as standard base64.
#[derive(Clone, PartialEq, Eq, Hash)]
struct OpaqueBytes(Vec<u8>);

impl Serialize for OpaqueBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(&self.0))
    }
}

impl<'de> Deserialize<'de> for OpaqueBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded)
            .map(OpaqueBytes)
            .map_err(|_| serde::de::Error::custom(KeyMaterialError::Encoding("bytes")))
    }
}

#[derive(Serialize, Deserialize)]
struct WrappedRepr {
    ciphertext: OpaqueBytes,
    nonce: OpaqueBytes,
}

// =============================================================================
// Ciphertext forms
// =============================================================================

macro_rules! wrapped_key {
    ($(#[$meta:meta])* $name:ident, wraps = $kind:expr, under = $parent:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "WrappedRepr", into = "WrappedRepr")]
        pub struct $name {
            ciphertext: Vec<u8>,
            nonce: Vec<u8>,
        }

        impl $name {
            /// Key kind carried inside the ciphertext.
            pub const WRAPS: KeyKind = $kind;
            /// Key kind the ciphertext was produced under.
            pub const UNDER: KeyKind = $parent;

            /// Build from client-produced ciphertext and nonce.
            pub fn new(ciphertext: Vec<u8>, nonce: Vec<u8>) -> Result<Self, KeyMaterialError> {
                if ciphertext.is_empty() {
                    return Err(KeyMaterialError::EmptyCiphertext(stringify!($name)));
                }
                if nonce.is_empty() {
                    return Err(KeyMaterialError::EmptyNonce(stringify!($name)));
                }
                Ok(Self { ciphertext, nonce })
            }

            pub fn ciphertext(&self) -> &[u8] {
                &self.ciphertext
            }

            pub fn nonce(&self) -> &[u8] {
                &self.nonce
            }
        }

        impl TryFrom<WrappedRepr> for $name {
            type Error = KeyMaterialError;

            fn try_from(repr: WrappedRepr) -> Result<Self, Self::Error> {
                Self::new(repr.ciphertext.0, repr.nonce.0)
            }
        }

        impl From<$name> for WrappedRepr {
            fn from(key: $name) -> Self {
                WrappedRepr {
                    ciphertext: OpaqueBytes(key.ciphertext),
                    nonce: OpaqueBytes(key.nonce),
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("ciphertext_len", &self.ciphertext.len())
                    .field("nonce_len", &self.nonce.len())
                    .finish()
            }
        }
    };
}

wrapped_key!(
    /// MasterKey wrapped under the password-derived KeyEncryptionKey.
    EncryptedMasterKey,
    wraps = KeyKind::MasterKey,
    under = KeyKind::KeyEncryptionKey
);

wrapped_key!(
    /// MasterKey wrapped under the RecoveryKey: the password-less unlock path.
    MasterKeyEncryptedWithRecoveryKey,
    wraps = KeyKind::MasterKey,
    under = KeyKind::RecoveryKey
);

wrapped_key!(
    /// PrivateKey wrapped under the MasterKey.
    EncryptedPrivateKey,
    wraps = KeyKind::PrivateKey,
    under = KeyKind::MasterKey
);

wrapped_key!(
    /// RecoveryKey wrapped under the MasterKey.
    EncryptedRecoveryKey,
    wraps = KeyKind::RecoveryKey,
    under = KeyKind::MasterKey
);

wrapped_key!(
    /// CollectionKey wrapped under the owner's MasterKey.
    EncryptedCollectionKey,
    wraps = KeyKind::CollectionKey,
    under = KeyKind::MasterKey
);

wrapped_key!(
    /// FileKey wrapped under its owning CollectionKey.
    EncryptedFileKey,
    wraps = KeyKind::FileKey,
    under = KeyKind::CollectionKey
);

// =============================================================================
// Non-secret material
// =============================================================================

/// Salt the client feeds, with the password, into the KEK derivation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OpaqueBytes", into = "OpaqueBytes")]
pub struct KeySalt(Vec<u8>);

impl KeySalt {
    pub fn new(bytes: Vec<u8>) -> Result<Self, KeyMaterialError> {
        if bytes.is_empty() {
            return Err(KeyMaterialError::EmptyKey("KeySalt"));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<OpaqueBytes> for KeySalt {
    type Error = KeyMaterialError;

    fn try_from(bytes: OpaqueBytes) -> Result<Self, Self::Error> {
        Self::new(bytes.0)
    }
}

impl From<KeySalt> for OpaqueBytes {
    fn from(salt: KeySalt) -> Self {
        OpaqueBytes(salt.0)
    }
}

impl fmt::Debug for KeySalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeySalt").field(&self.0.len()).finish()
    }
}

/// Public half of the sharing key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key: OpaqueBytesDebug,
    /// Short human-comparable identifier clients use to verify the key.
    pub verification_id: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct OpaqueBytesDebug(OpaqueBytes);

impl fmt::Debug for OpaqueBytesDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0 .0.len())
    }
}

impl PublicKey {
    pub fn new(key: Vec<u8>, verification_id: impl Into<String>) -> Result<Self, KeyMaterialError> {
        if key.is_empty() {
            return Err(KeyMaterialError::EmptyKey("PublicKey"));
        }
        Ok(Self {
            key: OpaqueBytesDebug(OpaqueBytes(key)),
            verification_id: verification_id.into(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key.0 .0
    }
}

// =============================================================================
// Bundles
// =============================================================================

/// Everything a user's devices need to unlock the hierarchy, as persisted
/// alongside the user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyBundle {
    pub salt: KeySalt,
    pub encrypted_master_key: EncryptedMasterKey,
    pub public_key: PublicKey,
    pub encrypted_private_key: EncryptedPrivateKey,
    pub encrypted_recovery_key: EncryptedRecoveryKey,
    pub master_key_encrypted_with_recovery_key: MasterKeyEncryptedWithRecoveryKey,
}

/// A collection key granted to another user.
///
/// Same canonical `{ciphertext, nonce}` form as [`EncryptedCollectionKey`],
/// but produced under the recipient's [`PublicKey`] instead of the owner's
/// master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionKeyShare {
    pub collection_id: String,
    pub recipient_user_id: String,
    /// Verification id of the public key the share was produced under.
    pub recipient_verification_id: String,
    pub encrypted_collection_key: EncryptedCollectionKey,
}

impl CollectionKeyShare {
    /// Key kind the share is wrapped under.
    pub const UNDER: KeyKind = KeyKind::PublicKey;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped<T: TryFrom<WrappedRepr, Error = KeyMaterialError>>(seed: u8) -> T {
        T::try_from(WrappedRepr {
            ciphertext: OpaqueBytes(vec![seed; 48]),
            nonce: OpaqueBytes(vec![seed.wrapping_add(1); 24]),
        })
        .unwrap()
    }

    #[test]
    fn ciphertext_forms_match_hierarchy() {
        for (wraps, under) in [
            (EncryptedMasterKey::WRAPS, EncryptedMasterKey::UNDER),
            (
                MasterKeyEncryptedWithRecoveryKey::WRAPS,
                MasterKeyEncryptedWithRecoveryKey::UNDER,
            ),
            (EncryptedPrivateKey::WRAPS, EncryptedPrivateKey::UNDER),
            (EncryptedRecoveryKey::WRAPS, EncryptedRecoveryKey::UNDER),
            (EncryptedCollectionKey::WRAPS, EncryptedCollectionKey::UNDER),
            (EncryptedFileKey::WRAPS, EncryptedFileKey::UNDER),
            (KeyKind::CollectionKey, CollectionKeyShare::UNDER),
        ] {
            assert!(
                wraps.wrapped_by().contains(&under),
                "{wraps} must be wrappable under {under}"
            );
        }
    }

    #[test]
    fn file_key_unlock_path_walks_the_chain() {
        assert_eq!(
            KeyKind::FileKey.unlock_path(),
            vec![
                KeyKind::KeyEncryptionKey,
                KeyKind::MasterKey,
                KeyKind::CollectionKey,
                KeyKind::FileKey,
            ]
        );
        assert_eq!(
            KeyKind::KeyEncryptionKey.unlock_path(),
            vec![KeyKind::KeyEncryptionKey]
        );
    }

    #[test]
    fn recovery_branch_is_an_alternate_master_key_wrapping() {
        assert_eq!(KeyKind::MasterKey.primary_parent(), Some(KeyKind::KeyEncryptionKey));
        assert!(KeyKind::MasterKey.wrapped_by().contains(&KeyKind::RecoveryKey));
        assert!(!KeyKind::KeyEncryptionKey.is_persisted());
        assert!(KeyKind::PublicKey.is_persisted());
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert_eq!(
            EncryptedFileKey::new(vec![], vec![1]),
            Err(KeyMaterialError::EmptyCiphertext("EncryptedFileKey"))
        );
        assert_eq!(
            EncryptedFileKey::new(vec![1], vec![]),
            Err(KeyMaterialError::EmptyNonce("EncryptedFileKey"))
        );

        let result: Result<EncryptedFileKey, _> =
            serde_json::from_str(r#"{"ciphertext":"","nonce":"AQ=="}"#);
        assert!(result.is_err());
    }

    #[test]
    fn bundle_is_stored_verbatim() {
        let bundle = UserKeyBundle {
            salt: KeySalt::new(vec![9; 16]).unwrap(),
            encrypted_master_key: wrapped(1),
            public_key: PublicKey::new(vec![7; 32], "amber-falcon-42").unwrap(),
            encrypted_private_key: wrapped(2),
            encrypted_recovery_key: wrapped(3),
            master_key_encrypted_with_recovery_key: wrapped(4),
        };

        let json = serde_json::to_string(&bundle).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["salt"], Base64::encode_string(&[9; 16]));
        assert_eq!(value["public_key"]["verification_id"], "amber-falcon-42");

        let restored: UserKeyBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, bundle);
        assert_eq!(restored.encrypted_master_key.ciphertext(), &[1; 48][..]);
    }

    #[test]
    fn debug_output_hides_bytes() {
        let key = EncryptedFileKey::new(vec![0xAB; 40], vec![0xCD; 24]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("ciphertext_len: 40"));
        assert!(!debug.contains("171"));
    }
}
