//! Computed key infos: the evolving view produced by chain replay.
//!
//! A [`ComputedKeyInfos`] starts empty, is seeded with an eldest key, and
//! is then driven forward one link at a time. After a full replay it
//! answers the questions the rest of the system cares about: which keys
//! are live, which are retired, who delegated what, and which devices are
//! bound to which keys.
//!
//! Snapshots are value-immutable. Replay mutates a private working copy;
//! callers receive `Arc<ComputedKeyInfos>` and clone the inner value when
//! they need to build an overlay on top of it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{KeyFamilyError, ServerKey};
use crate::link::typed::TypedChainLink;
use crate::types::{Fingerprint, Fokid, Kid, SigId};

/// Delegation kind for a newly introduced key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Equal authority to the eldest; may itself delegate.
    Sibkey,
    /// Limited-use key; may not delegate.
    Subkey,
}

/// Liveness of a key at the end of replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Usable for signing at the current chain tail.
    Live,
    /// Retired by a revocation.
    Revoked,
}

/// Provenance of one delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationInfo {
    /// Signature id of the delegating link, when proven on-chain. Local
    /// unproven delegations carry `None`.
    pub sig_id: Option<SigId>,

    /// The kid that signed the delegation.
    pub signer: Kid,

    /// Delegation kind.
    pub role: KeyRole,

    /// Claimed delegation time; zero-time for unproven local entries.
    pub ctime: DateTime<Utc>,
}

/// Replay-derived record for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedKeyInfo {
    /// The key this record describes.
    pub kid: Kid,

    /// Current liveness.
    pub status: KeyStatus,

    /// Whether this key seeded the subchain.
    pub eldest: bool,

    /// Whether this key may delegate further keys.
    pub sibkey: bool,

    /// Optional PGP fingerprint carried from the introducing link.
    pub fingerprint: Option<Fingerprint>,

    /// How the key entered the family; `None` only for eldest keys
    /// installed without a delegating link.
    pub delegation: Option<DelegationInfo>,

    /// Signature id of the revoking link, once retired.
    pub revoked_by: Option<SigId>,
}

/// Device metadata bound to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Stable device identifier.
    pub id: String,

    /// The key the device currently holds.
    pub kid: Option<Kid>,

    /// Human-readable name.
    pub name: Option<String>,

    /// Device class (desktop, mobile, paper, ...). Free-form here.
    pub device_type: Option<String>,

    /// Server-defined status code.
    pub status: Option<u32>,
}

/// The authoritative computed view after chain replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedKeyInfos {
    eldest: Option<Fokid>,
    username: Option<String>,
    infos: BTreeMap<Kid, ComputedKeyInfo>,
    sig_index: BTreeMap<SigId, Kid>,
    devices: BTreeMap<String, Device>,
}

impl ComputedKeyInfos {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn assert_fresh(&self) -> Result<(), KeyFamilyError> {
        if self.eldest.is_some() || !self.infos.is_empty() {
            return Err(KeyFamilyError::NonEldestFirst);
        }
        Ok(())
    }

    fn install_eldest(
        &mut self,
        kid: Kid,
        fingerprint: Option<Fingerprint>,
        username: Option<&str>,
    ) {
        self.eldest = Some(Fokid {
            fingerprint,
            kid: Some(kid.clone()),
        });
        self.username = username.map(str::to_owned);
        self.infos.insert(
            kid.clone(),
            ComputedKeyInfo {
                kid,
                status: KeyStatus::Live,
                eldest: true,
                sibkey: true,
                fingerprint,
                delegation: None,
                revoked_by: None,
            },
        );
    }

    /// Seeds the view from the first link of a subchain.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::NonEldestFirst`] unless this is the first call on
    /// a fresh view; [`KeyFamilyError::MissingEldestKid`] when the link
    /// names no key id.
    pub fn insert_eldest_link(
        &mut self,
        tcl: &TypedChainLink<'_>,
        username: &str,
    ) -> Result<(), KeyFamilyError> {
        self.assert_fresh()?;
        let fokid = tcl.link().to_eldest_fokid();
        let kid = fokid.kid.ok_or(KeyFamilyError::MissingEldestKid)?;
        self.install_eldest(kid, fokid.fingerprint, Some(username));
        Ok(())
    }

    /// Installs a server-advertised eldest key without traversing links.
    ///
    /// Used when the chain is empty after limiting to the eldest fokid.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::NonEldestFirst`] unless the view is fresh.
    pub fn insert_server_eldest_key(
        &mut self,
        key: &ServerKey,
        username: &str,
    ) -> Result<(), KeyFamilyError> {
        self.assert_fresh()?;
        self.install_eldest(key.kid.clone(), key.fingerprint, Some(username));
        Ok(())
    }

    /// Installs a locally delegated eldest key that precedes any signed
    /// statement.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::NonEldestFirst`] unless the view is fresh;
    /// [`KeyFamilyError::MissingEldestKid`] when the fokid names no kid.
    pub fn insert_local_eldest_key(&mut self, fokid: Fokid) -> Result<(), KeyFamilyError> {
        self.assert_fresh()?;
        let kid = fokid.kid.ok_or(KeyFamilyError::MissingEldestKid)?;
        self.install_eldest(kid, fokid.fingerprint, None);
        Ok(())
    }

    /// Commits the delegation carried by a link.
    ///
    /// A no-op for links without a delegation role.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::DelegateUnknownSigner`] when the signing kid is
    /// not live at this point in replay.
    pub fn delegate(&mut self, tcl: &TypedChainLink<'_>) -> Result<(), KeyFamilyError> {
        let Some(role) = tcl.delegation_role() else {
            return Ok(());
        };
        let Some(kid) = tcl.delegated_kid() else {
            return Ok(());
        };
        let link = tcl.link();
        self.delegate_raw(
            kid,
            None,
            Some(link.sig_id()),
            link.signing_kid().clone(),
            role,
            link.ctime(),
        )
    }

    /// Records a delegation entry directly. This is the local-delegation
    /// path; link-driven replay goes through [`Self::delegate`].
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::DelegateUnknownSigner`] when `signer` is not
    /// live.
    pub fn delegate_raw(
        &mut self,
        kid: Kid,
        fingerprint: Option<Fingerprint>,
        sig_id: Option<SigId>,
        signer: Kid,
        role: KeyRole,
        ctime: DateTime<Utc>,
    ) -> Result<(), KeyFamilyError> {
        if !self.is_live(&signer) {
            return Err(KeyFamilyError::DelegateUnknownSigner { kid: signer });
        }

        if let Some(sig_id) = sig_id {
            self.sig_index.insert(sig_id, kid.clone());
        }
        self.infos.insert(
            kid.clone(),
            ComputedKeyInfo {
                kid,
                status: KeyStatus::Live,
                eldest: false,
                sibkey: role == KeyRole::Sibkey,
                fingerprint,
                delegation: Some(DelegationInfo {
                    sig_id,
                    signer,
                    role,
                    ctime,
                }),
                revoked_by: None,
            },
        );
        Ok(())
    }

    /// Applies the revocations carried by a link.
    ///
    /// Already-retired targets are a no-op; unknown targets fail.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::RevokeUnknown`] when a named kid or sig id was
    /// never seen in this replay.
    pub fn revoke(&mut self, tcl: &TypedChainLink<'_>) -> Result<(), KeyFamilyError> {
        let revoking_sig = tcl.link().sig_id();

        for kid in tcl.revoked_kids() {
            self.retire(&kid, revoking_sig)?;
        }
        for sig_id in tcl.revoked_sig_ids() {
            let kid = self
                .sig_index
                .get(&sig_id)
                .cloned()
                .ok_or_else(|| KeyFamilyError::RevokeUnknown {
                    target: sig_id.to_hex(),
                })?;
            self.retire(&kid, revoking_sig)?;
        }
        Ok(())
    }

    fn retire(&mut self, kid: &Kid, revoking_sig: SigId) -> Result<(), KeyFamilyError> {
        let info = self
            .infos
            .get_mut(kid)
            .ok_or_else(|| KeyFamilyError::RevokeUnknown {
                target: kid.to_hex(),
            })?;
        if info.status == KeyStatus::Revoked {
            return Ok(());
        }
        info.status = KeyStatus::Revoked;
        info.revoked_by = Some(revoking_sig);
        Ok(())
    }

    /// Applies the device update carried by a link, if any.
    ///
    /// A device record naming a kid introduces the device; updates to an
    /// existing id merge field-wise.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError::UnknownDevice`] when the target id is neither
    /// present nor introduced by this link.
    pub fn update_devices(&mut self, tcl: &TypedChainLink<'_>) -> Result<(), KeyFamilyError> {
        let Some(body) = tcl.device() else {
            return Ok(());
        };

        if let Some(existing) = self.devices.get_mut(&body.id) {
            if let Some(kid) = &body.kid {
                existing.kid = Some(kid.clone());
            }
            if let Some(name) = &body.name {
                existing.name = Some(name.clone());
            }
            if let Some(device_type) = &body.device_type {
                existing.device_type = Some(device_type.clone());
            }
            if let Some(status) = body.status {
                existing.status = Some(status);
            }
            return Ok(());
        }

        if body.kid.is_none() {
            return Err(KeyFamilyError::UnknownDevice {
                device_id: body.id.clone(),
            });
        }
        self.devices.insert(
            body.id.clone(),
            Device {
                id: body.id.clone(),
                kid: body.kid.clone(),
                name: body.name.clone(),
                device_type: body.device_type.clone(),
                status: body.status,
            },
        );
        Ok(())
    }

    /// Whether a kid is live at the current replay point.
    #[must_use]
    pub fn is_live(&self, kid: &Kid) -> bool {
        self.infos
            .get(kid)
            .is_some_and(|info| info.status == KeyStatus::Live)
    }

    /// The eldest fokid, once seeded.
    #[must_use]
    pub fn eldest(&self) -> Option<&Fokid> {
        self.eldest.as_ref()
    }

    /// The replay-derived record for a kid.
    #[must_use]
    pub fn info_for(&self, kid: &Kid) -> Option<&ComputedKeyInfo> {
        self.infos.get(kid)
    }

    /// The kid a delegation sig id introduced, if recorded.
    #[must_use]
    pub fn kid_for_sig(&self, sig_id: &SigId) -> Option<&Kid> {
        self.sig_index.get(sig_id)
    }

    /// Device metadata by id.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// All live kids in deterministic order.
    pub fn live_kids(&self) -> impl Iterator<Item = &Kid> {
        self.infos
            .values()
            .filter(|info| info.status == KeyStatus::Live)
            .map(|info| &info.kid)
    }

    /// Walks delegation provenance from `kid` back to its root.
    ///
    /// The returned path starts at `kid` and ends at an eldest key for
    /// any key introduced by a well-formed replay. Cycles cannot occur in
    /// replay-built views, but the walk is bounded by the family size
    /// anyway.
    #[must_use]
    pub fn delegation_path(&self, kid: &Kid) -> Vec<Kid> {
        let mut path = Vec::new();
        let mut current = kid.clone();
        for _ in 0..=self.infos.len() {
            let Some(info) = self.infos.get(&current) else {
                break;
            };
            path.push(current.clone());
            match &info.delegation {
                Some(delegation) => current = delegation.signer.clone(),
                None => break,
            }
        }
        path
    }
}
