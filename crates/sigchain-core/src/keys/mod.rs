//! The static key directory for a user.
//!
//! A [`KeyFamily`] is the server-provided directory of every key a user
//! has ever advertised, keyed by kid. It says nothing about which keys
//! are currently live; that judgement is produced by replaying the chain
//! into [`ComputedKeyInfos`](crate::keys::cki::ComputedKeyInfos).

pub mod cki;

use std::collections::BTreeMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Fingerprint, Fokid, Kid};

/// Byte width of an Ed25519 verifying key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Errors raised by the key directory and by chain replay into computed
/// key infos.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyFamilyError {
    /// A replay mutator other than the eldest installer was called first,
    /// or an eldest installer was called twice.
    #[error("first link of a subchain must install the eldest key")]
    NonEldestFirst,

    /// An eldest link that names no key id cannot seed a computed key
    /// family.
    #[error("eldest link does not name a key id")]
    MissingEldestKid,

    /// A delegation named a signing kid that is not live at this point in
    /// replay.
    #[error("delegation signer is not a live key: {kid}")]
    DelegateUnknownSigner {
        /// The unknown or retired signing kid.
        kid: Kid,
    },

    /// A revocation named a kid or sig id never seen in this replay.
    #[error("revocation target unknown: {target}")]
    RevokeUnknown {
        /// Text form of the unknown target.
        target: String,
    },

    /// A device update referenced a device that is neither present nor
    /// introduced by the updating link.
    #[error("unknown device: {device_id}")]
    UnknownDevice {
        /// The unresolved device id.
        device_id: String,
    },

    /// A kid was not found in the key family.
    #[error("kid not in key family: {kid}")]
    UnknownKid {
        /// The missing kid.
        kid: Kid,
    },

    /// Stored key material failed to parse as an Ed25519 point.
    #[error("invalid key bytes for {kid}: {reason}")]
    InvalidKeyBytes {
        /// The offending kid.
        kid: Kid,
        /// Parse failure description.
        reason: String,
    },
}

/// One server-advertised key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKey {
    /// Key identifier.
    pub kid: Kid,

    /// Raw Ed25519 verifying-key bytes.
    pub key_bytes: [u8; PUBLIC_KEY_LEN],

    /// Optional PGP fingerprint for cross-algorithm equivalence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl ServerKey {
    /// Parses the stored bytes into a verifying key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFamilyError::InvalidKeyBytes`] when the bytes are not
    /// a valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyFamilyError> {
        VerifyingKey::from_bytes(&self.key_bytes).map_err(|e| KeyFamilyError::InvalidKeyBytes {
            kid: self.kid.clone(),
            reason: e.to_string(),
        })
    }

    /// The fokid view of this record.
    #[must_use]
    pub fn fokid(&self) -> Fokid {
        Fokid {
            fingerprint: self.fingerprint,
            kid: Some(self.kid.clone()),
        }
    }
}

/// The static kid-to-key directory for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFamily {
    keys: BTreeMap<Kid, ServerKey>,
    eldest: Option<Kid>,
}

impl KeyFamily {
    /// Creates an empty family.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a key record.
    pub fn insert(&mut self, key: ServerKey) {
        self.keys.insert(key.kid.clone(), key);
    }

    /// Marks the directory's eldest kid.
    pub fn set_eldest(&mut self, kid: Kid) {
        self.eldest = Some(kid);
    }

    /// The directory's eldest kid, if any.
    #[must_use]
    pub fn eldest_kid(&self) -> Option<&Kid> {
        self.eldest.as_ref()
    }

    /// Looks up a key record.
    #[must_use]
    pub fn get(&self, kid: &Kid) -> Option<&ServerKey> {
        self.keys.get(kid)
    }

    /// Looks up a key record, failing closed.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFamilyError::UnknownKid`] when absent.
    pub fn require(&self, kid: &Kid) -> Result<&ServerKey, KeyFamilyError> {
        self.keys
            .get(kid)
            .ok_or_else(|| KeyFamilyError::UnknownKid { kid: kid.clone() })
    }

    /// The fokid for a kid, when the directory knows it.
    #[must_use]
    pub fn fokid_for(&self, kid: &Kid) -> Option<Fokid> {
        self.keys.get(kid).map(ServerKey::fokid)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A key family paired with the replay result for it.
///
/// The loader owns one of these; `cki` is populated by
/// [`SigChain::verify_sigs_and_compute_keys`](crate::chain::SigChain::verify_sigs_and_compute_keys).
#[derive(Debug, Clone, Default)]
pub struct ComputedKeyFamily {
    /// The static directory, when the caller supplied one.
    pub kf: Option<std::sync::Arc<KeyFamily>>,

    /// The computed view, once replay has run.
    pub cki: Option<std::sync::Arc<cki::ComputedKeyInfos>>,
}
