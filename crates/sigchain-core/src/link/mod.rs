//! One statement of a signature chain and its verification state.
//!
//! A [`ChainLink`] owns the canonical payload bytes a user signed, the
//! signature over them, and the identifiers derived from both. Links are
//! imported from the server or from local storage, and are never mutated
//! afterwards except to set monotonic verification flags and the
//! computed-key cache on a subchain's final link.
//!
//! # Import is fail-closed
//!
//! Every derived quantity the wire record advertises (payload hash,
//! signature id, seqno, signing kid) is recomputed or cross-checked
//! against the parsed payload during import. Any disagreement is a
//! [`LinkError::Malformed`] and the link is rejected before it can enter
//! a chain.

pub mod typed;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::context::Context;
use crate::keys::cki::ComputedKeyInfos;
use crate::keys::{KeyFamily, KeyFamilyError};
use crate::merkle::{self, MerkleError, MerkleNode};
use crate::store::{DbKey, DbTable, StoreError};
use crate::types::{Fingerprint, Fokid, Kid, LinkId, MerkleTriple, Seqno, SigId, Uid};

/// Errors raised while importing or verifying a single link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Parse or hash inconsistency on import; fatal for the link.
    #[error("malformed link: {reason}")]
    Malformed {
        /// What disagreed.
        reason: String,
    },

    /// The signing key is neither eldest nor currently delegated.
    #[error("signing key is not live: {kid}")]
    KeyNotLive {
        /// The retired or unknown signing kid.
        kid: Kid,
    },

    /// The signature did not verify over the payload.
    #[error("bad signature at seqno={seqno}")]
    SigBadSignature {
        /// Position of the offending link.
        seqno: Seqno,
    },

    /// The claimed signing kid has no corresponding key.
    #[error("no key material for signing kid {kid}")]
    KeySigMismatch {
        /// The unresolvable kid.
        kid: Kid,
    },

    /// A sibkey reverse signature failed to verify.
    #[error("bad reverse signature at seqno={seqno}")]
    BadReverseSig {
        /// Position of the offending link.
        seqno: Seqno,
    },

    /// The payload's claimed owner does not match the chain's user.
    #[error("link owner mismatch: {reason}")]
    BadUidOrName {
        /// Expected-versus-claimed description.
        reason: String,
    },

    /// Merkle cross-check failure.
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    /// Key-directory failure while resolving the signing key.
    #[error(transparent)]
    KeyFamily(#[from] KeyFamilyError),

    /// Storage failure while persisting or loading the link.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LinkError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Device metadata carried by a device-update link body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBody {
    /// Stable device identifier.
    pub id: String,

    /// Key held by the device; present when the link introduces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<Kid>,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Device class.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,

    /// Server-defined status code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
}

/// Revocation targets carried by a link.
///
/// A dedicated revocation link carries these in its body; any other link
/// type may piggyback them at the payload level, which is how a single
/// link can delegate a new key and revoke its own signer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeSection {
    /// Kids to retire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kids: Vec<Kid>,

    /// Delegation sig ids to retire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sig_ids: Vec<SigId>,
}

/// Typed payload body. Unrecognized types parse as [`LinkBody::Other`]
/// and have no key-family side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkBody {
    /// Installs the subchain's eldest key.
    Eldest {
        /// The eldest kid; defaults to the link's signing kid.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kid: Option<Kid>,
    },

    /// Delegates a key with equal authority to the eldest.
    Sibkey {
        /// The delegated kid.
        kid: Kid,

        /// Signature by the delegated key over this payload with this
        /// field nulled out; proof of possession.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse_sig: Option<String>,
    },

    /// Delegates a limited-use key.
    Subkey {
        /// The delegated kid.
        kid: Kid,
    },

    /// Retires keys and/or delegation signatures.
    Revoke {
        /// Kids to retire.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        kids: Vec<Kid>,

        /// Delegation sig ids to retire.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sig_ids: Vec<SigId>,
    },

    /// Updates device metadata bound to a key.
    Device {
        /// The device record.
        device: DeviceBody,
    },

    /// Any other statement type.
    #[serde(other)]
    Other,
}

/// The canonical signed payload of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    /// Owning user id.
    pub uid: Uid,

    /// Owning username.
    pub username: String,

    /// Chain position.
    pub seqno: Seqno,

    /// Id of the preceding link; absent only for an eldest link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<LinkId>,

    /// Signing kid.
    pub kid: Kid,

    /// PGP fingerprint of the signing key, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,

    /// Eldest kid this link asserts it is governed by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eldest_kid: Option<Kid>,

    /// Eldest fingerprint this link asserts it is governed by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eldest_fingerprint: Option<Fingerprint>,

    /// Claimed signing time, seconds since the Unix epoch.
    pub ctime: i64,

    /// Revocations piggybacked on a link of any type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke: Option<RevokeSection>,

    /// Typed statement body.
    pub body: LinkBody,
}

/// Wire and storage record for one link.
///
/// This is the shape the server returns from `sig/get` and the shape
/// persisted under `(DbTable::Link, link_id)`; imports from either
/// source round-trip through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLink {
    /// Advertised chain position; must match the payload.
    pub seqno: Seqno,

    /// Base64 of the canonical payload bytes.
    pub payload: String,

    /// Advertised SHA-256 of the payload bytes.
    pub payload_hash: LinkId,

    /// Base64 of the signature bytes.
    pub sig: String,

    /// Advertised SHA-256 of the signature bytes.
    pub sig_id: SigId,

    /// Advertised signing kid; must match the payload.
    pub kid: Kid,

    /// Sibling path for the Merkle cross-check, present on fetched tails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_path: Option<Vec<MerkleNode>>,
}

/// One verified (or pending-verification) chain statement.
#[derive(Debug, Clone)]
pub struct ChainLink {
    id: LinkId,
    sig_id: SigId,
    payload_bytes: Vec<u8>,
    signature: Vec<u8>,
    payload: LinkPayload,
    ctime: DateTime<Utc>,
    merkle_path: Vec<MerkleNode>,

    sig_verified: bool,
    hash_verified: bool,
    chain_verified: bool,

    cki: Option<Arc<ComputedKeyInfos>>,
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

impl ChainLink {
    /// Imports a link from one element of a server `sig/get` response.
    ///
    /// # Errors
    ///
    /// [`LinkError::Malformed`] on any parse or cross-check failure.
    pub fn import_from_server(value: &serde_json::Value) -> Result<Self, LinkError> {
        let wire: WireLink = serde_json::from_value(value.clone())
            .map_err(|e| LinkError::malformed(format!("bad wire record: {e}")))?;
        Self::import(wire)
    }

    /// Imports a link from its persisted storage bytes.
    ///
    /// # Errors
    ///
    /// [`LinkError::Malformed`] on any parse or cross-check failure.
    pub fn import_from_storage(bytes: &[u8]) -> Result<Self, LinkError> {
        let wire: WireLink = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::malformed(format!("bad stored record: {e}")))?;
        Self::import(wire)
    }

    /// Imports a wire record, recomputing and cross-checking every
    /// advertised quantity.
    ///
    /// # Errors
    ///
    /// [`LinkError::Malformed`] on any disagreement.
    pub fn import(wire: WireLink) -> Result<Self, LinkError> {
        let payload_bytes = BASE64
            .decode(&wire.payload)
            .map_err(|e| LinkError::malformed(format!("payload is not base64: {e}")))?;
        let signature = BASE64
            .decode(&wire.sig)
            .map_err(|e| LinkError::malformed(format!("signature is not base64: {e}")))?;

        let payload: LinkPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| LinkError::malformed(format!("bad payload: {e}")))?;

        if payload.seqno.value() == 0 {
            return Err(LinkError::malformed("seqno must be positive"));
        }
        if payload.seqno != wire.seqno {
            return Err(LinkError::malformed(format!(
                "advertised seqno {} disagrees with payload seqno {}",
                wire.seqno, payload.seqno
            )));
        }
        if payload.kid != wire.kid {
            return Err(LinkError::malformed(
                "advertised kid disagrees with payload kid",
            ));
        }

        let id = LinkId::from_bytes(sha256(&payload_bytes));
        if !bool::from(id.as_bytes().ct_eq(wire.payload_hash.as_bytes())) {
            return Err(LinkError::malformed(
                "payload hash disagrees with advertised link id",
            ));
        }

        let sig_id = SigId::from_bytes(sha256(&signature));
        if !bool::from(sig_id.as_bytes().ct_eq(wire.sig_id.as_bytes())) {
            return Err(LinkError::malformed(
                "signature hash disagrees with advertised sig id",
            ));
        }

        let ctime = Utc
            .timestamp_opt(payload.ctime, 0)
            .single()
            .ok_or_else(|| LinkError::malformed("ctime out of range"))?;

        Ok(Self {
            id,
            sig_id,
            payload_bytes,
            signature,
            payload,
            ctime,
            merkle_path: wire.merkle_path.unwrap_or_default(),
            sig_verified: false,
            hash_verified: false,
            chain_verified: false,
            cki: None,
        })
    }

    /// Rebuilds the wire record. The Merkle path is per-fetch proof data
    /// and is not persisted.
    #[must_use]
    pub fn to_wire(&self) -> WireLink {
        WireLink {
            seqno: self.payload.seqno,
            payload: BASE64.encode(&self.payload_bytes),
            payload_hash: self.id,
            sig: BASE64.encode(&self.signature),
            sig_id: self.sig_id,
            kid: self.payload.kid.clone(),
            merkle_path: None,
        }
    }

    /// The link's content hash.
    #[must_use]
    pub const fn id(&self) -> LinkId {
        self.id
    }

    /// The link's chain position.
    #[must_use]
    pub const fn seqno(&self) -> Seqno {
        self.payload.seqno
    }

    /// Id of the preceding link, absent for an eldest link.
    #[must_use]
    pub const fn prev(&self) -> Option<LinkId> {
        self.payload.prev
    }

    /// The signature id.
    #[must_use]
    pub const fn sig_id(&self) -> SigId {
        self.sig_id
    }

    /// The signing kid.
    #[must_use]
    pub fn signing_kid(&self) -> &Kid {
        &self.payload.kid
    }

    /// Claimed signing time.
    #[must_use]
    pub const fn ctime(&self) -> DateTime<Utc> {
        self.ctime
    }

    /// The parsed payload.
    #[must_use]
    pub const fn payload(&self) -> &LinkPayload {
        &self.payload
    }

    /// Whether the payload signature has verified under its key.
    #[must_use]
    pub const fn sig_verified(&self) -> bool {
        self.sig_verified
    }

    /// Whether the payload hash and signature structure have verified.
    #[must_use]
    pub const fn hash_verified(&self) -> bool {
        self.hash_verified
    }

    /// Whether this link has passed the chain-linkage pass.
    #[must_use]
    pub const fn chain_verified(&self) -> bool {
        self.chain_verified
    }

    pub(crate) fn set_chain_verified(&mut self) {
        self.chain_verified = true;
    }

    /// Verifies the stored payload against the link id and the structural
    /// validity of the signature bytes. Idempotent; does not bind the
    /// signature to a key — that is the subchain pass's job.
    ///
    /// # Errors
    ///
    /// [`LinkError::Malformed`] on hash disagreement or a signature that
    /// is not a valid Ed25519 form.
    pub fn verify_link(&mut self) -> Result<(), LinkError> {
        if self.hash_verified {
            return Ok(());
        }
        let computed = sha256(&self.payload_bytes);
        if !bool::from(computed.ct_eq(self.id.as_bytes())) {
            return Err(LinkError::malformed(
                "payload hash no longer matches link id",
            ));
        }
        Signature::from_slice(&self.signature)
            .map_err(|e| LinkError::malformed(format!("signature not well-formed: {e}")))?;
        self.hash_verified = true;
        Ok(())
    }

    /// Verifies the signature over the payload under the key named by the
    /// signing kid, requiring that key to be live (eldest or previously
    /// delegated) in the replay view.
    ///
    /// # Errors
    ///
    /// [`LinkError::KeySigMismatch`] when the kid has no key material,
    /// [`LinkError::KeyNotLive`] when it is not live at this replay
    /// point, [`LinkError::SigBadSignature`] on cryptographic failure.
    pub fn verify_sig_with_key_family(
        &mut self,
        kf: &KeyFamily,
        cki: &ComputedKeyInfos,
    ) -> Result<(), LinkError> {
        if self.sig_verified {
            return Ok(());
        }

        let kid = self.payload.kid.clone();
        let Some(server_key) = kf.get(&kid) else {
            return Err(LinkError::KeySigMismatch { kid });
        };
        if !cki.is_live(&kid) {
            return Err(LinkError::KeyNotLive { kid });
        }

        let verifying_key = server_key.verifying_key()?;
        let signature = Signature::from_slice(&self.signature).map_err(|_| {
            LinkError::SigBadSignature {
                seqno: self.payload.seqno,
            }
        })?;
        verifying_key
            .verify_strict(&self.payload_bytes, &signature)
            .map_err(|_| LinkError::SigBadSignature {
                seqno: self.payload.seqno,
            })?;

        self.sig_verified = true;
        Ok(())
    }

    /// Asserts the payload's claimed owner.
    ///
    /// # Errors
    ///
    /// [`LinkError::BadUidOrName`] on mismatch.
    pub fn check_name_and_id(&self, username: &str, uid: &Uid) -> Result<(), LinkError> {
        if self.payload.uid != *uid {
            return Err(LinkError::BadUidOrName {
                reason: format!("expected uid {uid}, link claims {}", self.payload.uid),
            });
        }
        if self.payload.username != username {
            return Err(LinkError::BadUidOrName {
                reason: format!(
                    "expected username {username:?}, link claims {:?}",
                    self.payload.username
                ),
            });
        }
        Ok(())
    }

    /// Whether the signing key carries this fingerprint.
    #[must_use]
    pub fn match_fingerprint(&self, fp: &Fingerprint) -> bool {
        self.payload.fingerprint.as_ref() == Some(fp)
    }

    /// Whether the asserted eldest fokid matches `fokid`.
    #[must_use]
    pub fn match_eldest_fokid(&self, fokid: &Fokid) -> bool {
        fokid.matches(&self.to_eldest_fokid())
    }

    /// The triple naming this link's chain position.
    #[must_use]
    pub const fn to_merkle_triple(&self) -> MerkleTriple {
        MerkleTriple::new(self.payload.seqno, self.id, self.sig_id)
    }

    /// The signing key's fokid view.
    #[must_use]
    pub fn to_fokid(&self) -> Fokid {
        Fokid {
            fingerprint: self.payload.fingerprint,
            kid: Some(self.payload.kid.clone()),
        }
    }

    /// The eldest fokid this link asserts it is governed by.
    ///
    /// Falls back to the eldest body's kid for an eldest link, and to
    /// the signing fokid when no assertion is present at all.
    #[must_use]
    pub fn to_eldest_fokid(&self) -> Fokid {
        if self.payload.eldest_kid.is_some() || self.payload.eldest_fingerprint.is_some() {
            return Fokid {
                fingerprint: self.payload.eldest_fingerprint,
                kid: self.payload.eldest_kid.clone(),
            };
        }
        if let LinkBody::Eldest { kid: Some(kid) } = &self.payload.body {
            return Fokid {
                fingerprint: self.payload.fingerprint,
                kid: Some(kid.clone()),
            };
        }
        self.to_fokid()
    }

    /// Cross-checks this link against the Merkle authority's triple.
    ///
    /// Returns `Ok(false)` when this link is not the position the triple
    /// names; `Ok(true)` when it is and the sibling path folds to the
    /// triple's link id.
    ///
    /// # Errors
    ///
    /// [`MerkleError`] when the position matches but the fold does not.
    pub fn check_against_merkle_tree(&self, t: &MerkleTriple) -> Result<bool, LinkError> {
        if self.payload.seqno != t.seqno {
            return Ok(false);
        }
        merkle::verify_path(&self.id, &self.merkle_path, &t.link_id, t.seqno)?;
        Ok(true)
    }

    /// Persists this link by id, returning whether anything was written.
    ///
    /// Already-present links report `false`, which callers use to
    /// short-circuit tail-to-head store walks.
    ///
    /// # Errors
    ///
    /// [`StoreError`] from the underlying store, including cancellation.
    pub fn store(&self, ctx: &Context) -> Result<bool, LinkError> {
        let key = DbKey::new(DbTable::Link, self.id.to_hex());
        if ctx.store.get(&ctx.cancel, &key)?.is_some() {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(&self.to_wire())
            .map_err(|e| LinkError::malformed(format!("encode for storage: {e}")))?;
        ctx.store.put(&ctx.cancel, &key, &bytes)?;
        Ok(true)
    }

    /// The cached computed-key snapshot, when this link ended a verified
    /// subchain replay.
    #[must_use]
    pub fn sig_check_cache(&self) -> Option<Arc<ComputedKeyInfos>> {
        self.cki.clone()
    }

    /// Caches a computed-key snapshot on this link. Written only after a
    /// replay fully succeeds.
    pub fn put_sig_check_cache(&mut self, cki: Arc<ComputedKeyInfos>) {
        self.cki = Some(cki);
    }

    /// Canonical payload bytes with the body's `reverse_sig` field nulled
    /// out; the message a sibkey reverse signature signs.
    pub(crate) fn reverse_sig_base(&self) -> Result<Vec<u8>, LinkError> {
        let mut value: serde_json::Value = serde_json::from_slice(&self.payload_bytes)
            .map_err(|e| LinkError::malformed(format!("bad payload: {e}")))?;
        let body = value
            .get_mut("body")
            .and_then(serde_json::Value::as_object_mut)
            .ok_or_else(|| LinkError::malformed("payload body is not an object"))?;
        body.insert("reverse_sig".to_string(), serde_json::Value::Null);
        serde_json::to_vec(&value)
            .map_err(|e| LinkError::malformed(format!("re-encode payload: {e}")))
    }

    /// The raw signature bytes.
    #[must_use]
    pub fn signature_bytes(&self) -> &[u8] {
        &self.signature
    }
}
