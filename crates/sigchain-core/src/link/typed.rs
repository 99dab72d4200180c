//! Role-typed views over chain links.
//!
//! A [`TypedChainLink`] classifies a [`ChainLink`] by its payload body
//! without mutating it, and exposes the role-specific obligations the
//! replay pass needs: delegation targets, revocation sets, device
//! records, and the sibkey reverse-signature check.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::Signature;
use tracing::warn;

use super::{ChainLink, DeviceBody, LinkBody, LinkError};
use crate::keys::cki::KeyRole;
use crate::keys::KeyFamily;
use crate::types::{Kid, SigId};

/// A tagged view of one link, classified by statement body.
#[derive(Debug)]
pub enum TypedChainLink<'a> {
    /// First link of a subchain; installs the eldest key.
    Eldest(&'a ChainLink),

    /// Delegates a key with equal authority; carries a reverse signature.
    SibkeyDelegation(&'a ChainLink),

    /// Delegates a limited-use key.
    SubkeyDelegation(&'a ChainLink),

    /// Retires keys and/or delegation signatures.
    Revocation(&'a ChainLink),

    /// Updates device metadata.
    DeviceUpdate(&'a ChainLink),

    /// No key-family side effect.
    Other(&'a ChainLink),
}

impl<'a> TypedChainLink<'a> {
    /// Classifies a link by its parsed body.
    ///
    /// Unrecognized bodies classify as [`TypedChainLink::Other`] with a
    /// warning; they are carried and verified but have no key-family
    /// side effect.
    #[must_use]
    pub fn classify(link: &'a ChainLink) -> Self {
        match &link.payload().body {
            LinkBody::Eldest { .. } => Self::Eldest(link),
            LinkBody::Sibkey { .. } => Self::SibkeyDelegation(link),
            LinkBody::Subkey { .. } => Self::SubkeyDelegation(link),
            LinkBody::Revoke { .. } => Self::Revocation(link),
            LinkBody::Device { .. } => Self::DeviceUpdate(link),
            LinkBody::Other => {
                warn!(seqno = link.seqno().value(), "untyped chain link; carrying as-is");
                Self::Other(link)
            },
        }
    }

    /// The underlying link.
    #[must_use]
    pub const fn link(&self) -> &'a ChainLink {
        match self {
            Self::Eldest(link)
            | Self::SibkeyDelegation(link)
            | Self::SubkeyDelegation(link)
            | Self::Revocation(link)
            | Self::DeviceUpdate(link)
            | Self::Other(link) => link,
        }
    }

    /// The delegation role this link carries, if any.
    #[must_use]
    pub const fn delegation_role(&self) -> Option<KeyRole> {
        match self {
            Self::SibkeyDelegation(_) => Some(KeyRole::Sibkey),
            Self::SubkeyDelegation(_) => Some(KeyRole::Subkey),
            _ => None,
        }
    }

    /// The kid this link delegates, if any.
    #[must_use]
    pub fn delegated_kid(&self) -> Option<Kid> {
        match &self.link().payload().body {
            LinkBody::Sibkey { kid, .. } | LinkBody::Subkey { kid } => Some(kid.clone()),
            _ => None,
        }
    }

    /// Kids this link retires, from its revocation body and from any
    /// piggybacked revoke section. Empty for links revoking nothing.
    #[must_use]
    pub fn revoked_kids(&self) -> Vec<Kid> {
        let payload = self.link().payload();
        let mut kids = match &payload.body {
            LinkBody::Revoke { kids, .. } => kids.clone(),
            _ => Vec::new(),
        };
        if let Some(section) = &payload.revoke {
            kids.extend(section.kids.iter().cloned());
        }
        kids
    }

    /// Delegation sig ids this link retires, from its revocation body
    /// and from any piggybacked revoke section.
    #[must_use]
    pub fn revoked_sig_ids(&self) -> Vec<SigId> {
        let payload = self.link().payload();
        let mut sig_ids = match &payload.body {
            LinkBody::Revoke { sig_ids, .. } => sig_ids.clone(),
            _ => Vec::new(),
        };
        if let Some(section) = &payload.revoke {
            sig_ids.extend(section.sig_ids.iter().copied());
        }
        sig_ids
    }

    /// The device record this link carries, if any.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceBody> {
        match &self.link().payload().body {
            LinkBody::Device { device } => Some(device),
            _ => None,
        }
    }

    /// Verifies the sibkey reverse signature: the delegated key must have
    /// signed this payload with the `reverse_sig` field nulled out,
    /// proving possession. A no-op for every other variant.
    ///
    /// # Errors
    ///
    /// [`LinkError::BadReverseSig`] when the signature is missing or
    /// fails; [`LinkError::KeySigMismatch`] when the delegated kid has no
    /// key material.
    pub fn verify_reverse_sig(&self, kf: &KeyFamily) -> Result<(), LinkError> {
        let Self::SibkeyDelegation(link) = self else {
            return Ok(());
        };
        let LinkBody::Sibkey { kid, reverse_sig } = &link.payload().body else {
            return Ok(());
        };

        let seqno = link.seqno();
        let Some(reverse_sig) = reverse_sig else {
            return Err(LinkError::BadReverseSig { seqno });
        };
        let sig_bytes = BASE64
            .decode(reverse_sig)
            .map_err(|_| LinkError::BadReverseSig { seqno })?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| LinkError::BadReverseSig { seqno })?;

        let Some(server_key) = kf.get(kid) else {
            return Err(LinkError::KeySigMismatch { kid: kid.clone() });
        };
        let verifying_key = server_key.verifying_key()?;

        let base = link.reverse_sig_base()?;
        verifying_key
            .verify_strict(&base, &signature)
            .map_err(|_| LinkError::BadReverseSig { seqno })
    }
}
