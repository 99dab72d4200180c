//! The per-user signature chain.
//!
//! A [`SigChain`] is the ordered, hash-linked sequence of a user's signed
//! statements plus a short-lived local overlay for delegations the server
//! has not reflected yet. It exposes three verification passes:
//!
//! 1. [`SigChain::verify_chain`] — payload hashes, owner checks, and
//!    prev-pointer linkage, tail to head, stopping early at links already
//!    verified in a prior pass.
//! 2. `verify_subchain` — replay of one eldest-governed suffix into a
//!    [`ComputedKeyInfos`], coalescing signature checks across runs of
//!    links signed by the same key.
//! 3. [`SigChain::verify_sigs_and_compute_keys`] — the composition both
//!    callers and the loader use.
//!
//! Verification flags and the computed-key cache are monotonic: they are
//! only set after the relevant pass fully succeeds, and never revert
//! within a session.


use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiArg, ApiError};
use crate::context::{Clock, Context};
use crate::keys::cki::{ComputedKeyInfos, KeyRole};
use crate::keys::{ComputedKeyFamily, KeyFamily, KeyFamilyError, ServerKey};
use crate::link::typed::TypedChainLink;
use crate::link::{ChainLink, LinkError};
use crate::store::StoreError;
use crate::types::{Fingerprint, Fokid, Kid, LinkId, MerkleTriple, Seqno, SigId, Uid};

/// Errors raised by chain verification, loading, and freshness checks.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A link failed import or verification.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Replay-order violation while computing keys.
    #[error(transparent)]
    KeyFamily(#[from] KeyFamilyError),

    /// Remote API failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Local storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Adjacent links do not link up; the chain must be reloaded from
    /// scratch.
    #[error("chain mismatch at seqno={seqno}")]
    ChainMismatch {
        /// Position of the link whose prev pointer broke.
        seqno: Seqno,
    },

    /// The server omitted a requested tail or returned an impossible
    /// response.
    #[error("server chain error: {reason}")]
    ServerChain {
        /// Description of the inconsistency.
        reason: String,
    },

    /// The server advertised a seqno behind what we have locally
    /// persisted; surfaces to the caller as a possible attack.
    #[error("server version rollback suspected: local {local} > server {server}")]
    Rollback {
        /// Locally known tail seqno.
        local: Seqno,
        /// Server-advertised tail seqno.
        server: Seqno,
    },

    /// A precondition inside the chain layer was violated.
    #[error("internal chain error: {reason}")]
    Internal {
        /// Description of the violated precondition.
        reason: String,
    },
}

/// Pure freshness decision over the three observable tails.
///
/// Returns `Ok(true)` only when the local chain already matches the
/// server-published tail and no newer locally committed tail exists.
///
/// # Errors
///
/// - [`ChainError::ServerChain`] when the server lost a user it should
///   know, or returned a tail whose id disagrees at the same seqno.
/// - [`ChainError::Rollback`] when the server is behind local state.
pub(crate) fn freshness_decision(
    client: Option<&MerkleTriple>,
    server: Option<&MerkleTriple>,
    future: Option<&MerkleTriple>,
) -> Result<bool, ChainError> {
    let current = match (server, client) {
        (None, Some(cli)) => {
            return Err(ChainError::ServerChain {
                reason: format!(
                    "server claimed not to have this user (local tail at seqno {})",
                    cli.seqno
                ),
            });
        },
        (None, None) | (Some(_), None) => false,
        (Some(srv), Some(cli)) => {
            if cli.seqno > srv.seqno {
                return Err(ChainError::Rollback {
                    local: cli.seqno,
                    server: srv.seqno,
                });
            }
            if cli.seqno == srv.seqno {
                if cli.link_id != srv.link_id {
                    return Err(ChainError::ServerChain {
                        reason: "server returned the wrong sigchain tail".to_string(),
                    });
                }
                true
            } else {
                false
            }
        },
    };

    if current {
        if let Some(future) = future {
            if client.is_none() || client.is_some_and(|cli| cli.seqno < future.seqno) {
                debug!(seqno = %future.seqno, "local tail outruns server; forcing reload");
                return Ok(false);
            }
        }
    }
    Ok(current)
}

/// One user's ordered, hash-linked signature chain.
#[derive(Debug)]
pub struct SigChain {
    uid: Uid,
    username: String,
    chain_links: Vec<ChainLink>,
    all_keys: bool,

    // A locally delegated key will not be reflected in the loaded chain
    // yet; the overlay carries it until the server catches up.
    local_cki: Option<Arc<ComputedKeyInfos>>,
    local_chain_tail: Option<MerkleTriple>,
    local_chain_update_time: Option<DateTime<Utc>>,

    server_update_lag: chrono::Duration,
}

impl SigChain {
    /// Builds a chain over already-imported links.
    #[must_use]
    pub fn with_links(
        uid: Uid,
        username: String,
        chain_links: Vec<ChainLink>,
        all_keys: bool,
        server_update_lag: chrono::Duration,
    ) -> Self {
        Self {
            uid,
            username,
            chain_links,
            all_keys,
            local_cki: None,
            local_chain_tail: None,
            local_chain_update_time: None,
            server_update_lag,
        }
    }

    /// Number of loaded links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain_links.len()
    }

    /// Whether no links are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain_links.is_empty()
    }

    /// The owning user's id.
    #[must_use]
    pub const fn uid(&self) -> Uid {
        self.uid
    }

    /// The owning username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether this chain was loaded across eldest-key rotations.
    #[must_use]
    pub const fn all_keys(&self) -> bool {
        self.all_keys
    }

    /// The loaded links in ascending seqno order.
    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.chain_links
    }

    /// The first loaded link.
    #[must_use]
    pub fn get_first_link(&self) -> Option<&ChainLink> {
        self.chain_links.first()
    }

    /// The last loaded link.
    #[must_use]
    pub fn get_last_link(&self) -> Option<&ChainLink> {
        self.chain_links.last()
    }

    /// Id of the last loaded link, from the in-memory array only.
    #[must_use]
    pub fn get_last_loaded_id(&self) -> Option<LinkId> {
        self.chain_links.last().map(ChainLink::id)
    }

    /// Seqno of the last loaded link; zero when empty.
    #[must_use]
    pub fn get_last_loaded_seqno(&self) -> Seqno {
        self.chain_links
            .last()
            .map_or(Seqno::ZERO, ChainLink::seqno)
    }

    /// Id of the last known link; the local overlay takes precedence.
    #[must_use]
    pub fn get_last_known_id(&self) -> Option<LinkId> {
        self.local_chain_tail
            .as_ref()
            .map_or_else(|| self.get_last_loaded_id(), |tail| Some(tail.link_id))
    }

    /// Seqno of the last known link; the local overlay takes precedence.
    #[must_use]
    pub fn get_last_known_seqno(&self) -> Seqno {
        self.local_chain_tail
            .as_ref()
            .map_or_else(|| self.get_last_loaded_seqno(), |tail| tail.seqno)
    }

    /// Triple of the last loaded link.
    #[must_use]
    pub fn get_current_tail_triple(&self) -> Option<MerkleTriple> {
        self.get_last_link().map(ChainLink::to_merkle_triple)
    }

    /// The locally written tail, while it is still within the staleness
    /// window; `None` once `server_update_lag` has elapsed.
    #[must_use]
    pub fn get_future_chain_tail(&self, clock: &dyn Clock) -> Option<&MerkleTriple> {
        let tail = self.local_chain_tail.as_ref()?;
        let updated = self.local_chain_update_time?;
        if clock.now() - updated < self.server_update_lag {
            Some(tail)
        } else {
            None
        }
    }

    /// Records a local one-link extension: the overlay tail becomes
    /// `last_known_seqno + 1` and the staleness window restarts.
    pub fn bump(&mut self, mut mt: MerkleTriple, clock: &dyn Clock) {
        mt.seqno = self.get_last_known_seqno().next();
        debug!(seqno = %mt.seqno, "bumping last known seqno");
        self.local_chain_tail = Some(mt);
        self.local_chain_update_time = Some(clock.now());
    }

    /// The computed key infos: the overlay when present, else the cache
    /// on the last loaded link.
    #[must_use]
    pub fn get_computed_key_infos(&self) -> Option<Arc<ComputedKeyInfos>> {
        self.local_cki
            .clone()
            .or_else(|| self.get_last_link().and_then(ChainLink::sig_check_cache))
    }

    /// Updates the overlay with a locally performed delegation.
    ///
    /// Starts from the current overlay, else from the last link's cached
    /// snapshot, else from a fresh view seeded with `signing_kid` as a
    /// local eldest. Snapshots are value-immutable: the inner value is
    /// cloned before mutation so link caches never observe overlay edits.
    ///
    /// # Errors
    ///
    /// [`KeyFamilyError`] when the delegation entry cannot be recorded.
    pub fn local_delegate(
        &mut self,
        kf: &KeyFamily,
        key: &ServerKey,
        sig_id: Option<&SigId>,
        signing_kid: &Kid,
        is_sibkey: bool,
    ) -> Result<(), ChainError> {
        let mut cki = match self.get_computed_key_infos() {
            Some(snapshot) => (*snapshot).clone(),
            None => {
                let mut fresh = ComputedKeyInfos::new();
                fresh.insert_local_eldest_key(Fokid::from_kid(signing_kid.clone()))?;
                fresh
            },
        };

        if let Some(sig_id) = sig_id {
            let fingerprint = key
                .fingerprint
                .or_else(|| kf.fokid_for(&key.kid).and_then(|f| f.fingerprint));
            let role = if is_sibkey {
                KeyRole::Sibkey
            } else {
                KeyRole::Subkey
            };
            // Unproven fields default to zero-time.
            cki.delegate_raw(
                key.kid.clone(),
                fingerprint,
                Some(*sig_id),
                signing_kid.clone(),
                role,
                DateTime::UNIX_EPOCH,
            )?;
        }

        self.local_cki = Some(Arc::new(cki));
        Ok(())
    }

    /// The chain suffix whose links all carry fingerprint `fp`; empty
    /// unless the final link is signature-verified.
    #[must_use]
    pub fn verified_chain_links(&self, fp: &Fingerprint) -> &[ChainLink] {
        let Some(last) = self.chain_links.last() else {
            return &[];
        };
        if !last.sig_verified() {
            return &[];
        }
        let mut start = self.chain_links.len();
        for i in (0..self.chain_links.len()).rev() {
            if self.chain_links[i].match_fingerprint(fp) {
                start = i;
            } else {
                break;
            }
        }
        &self.chain_links[start..]
    }

    /// Index of the first link of the suffix governed by `fokid`; equals
    /// `len` when no suffix matches.
    fn eldest_suffix_start(&self, fokid: &Fokid) -> usize {
        let mut start = self.chain_links.len();
        for i in (0..self.chain_links.len()).rev() {
            if self.chain_links[i].match_eldest_fokid(fokid) {
                start = i;
            } else {
                break;
            }
        }
        start
    }

    /// Walks backward from the tail, returning the longest contiguous
    /// suffix whose eldest fokid matches `fokid`. Reaching the head
    /// returns the full chain.
    #[must_use]
    pub fn limit_to_eldest_fokid(&self, fokid: &Fokid) -> &[ChainLink] {
        &self.chain_links[self.eldest_suffix_start(fokid)..]
    }

    /// Linear lookup by seqno.
    #[must_use]
    pub fn get_link_from_seqno(&self, seqno: Seqno) -> Option<&ChainLink> {
        self.chain_links.iter().find(|link| link.seqno() == seqno)
    }

    /// Linear lookup by signature id.
    #[must_use]
    pub fn get_link_from_sig_id(&self, sig_id: &SigId) -> Option<&ChainLink> {
        self.chain_links
            .iter()
            .find(|link| link.sig_id() == *sig_id)
    }

    /// Persists links tail to head, stopping at the first link storage
    /// already has; everything below it was persisted by a prior load.
    ///
    /// # Errors
    ///
    /// [`LinkError`] from persisting any link, including cancellation.
    pub fn store(&self, ctx: &Context) -> Result<(), ChainError> {
        for link in self.chain_links.iter().rev() {
            if !link.store(ctx)? {
                break;
            }
        }
        Ok(())
    }

    /// Walks links tail to head verifying payload hashes, owner claims,
    /// and prev-pointer linkage, setting `chain_verified` as it goes.
    /// Stops early at a link already verified by a prior pass.
    ///
    /// # Errors
    ///
    /// [`ChainError::ChainMismatch`] on linkage breakage, and any
    /// [`LinkError`] a link-level check raises.
    pub fn verify_chain(&mut self) -> Result<(), ChainError> {
        debug!(uid = %self.uid, "verifying chain linkage");
        for i in (0..self.chain_links.len()).rev() {
            if self.chain_links[i].chain_verified() {
                break;
            }
            self.chain_links[i].verify_link()?;
            if i > 0 {
                let prev_id = self.chain_links[i - 1].id();
                let prev_seqno = self.chain_links[i - 1].seqno();
                let curr = &self.chain_links[i];
                if curr.prev() != Some(prev_id) || curr.seqno() != prev_seqno.next() {
                    return Err(ChainError::ChainMismatch {
                        seqno: curr.seqno(),
                    });
                }
            }
            self.chain_links[i].check_name_and_id(&self.username, &self.uid)?;
            self.chain_links[i].set_chain_verified();
        }
        Ok(())
    }

    /// Replays the suffix starting at `start` into a fresh computed-key
    /// view, or returns the snapshot cached on the final link.
    ///
    /// Signature checks are coalesced across runs of consecutive links
    /// signed by the same key: only delegating links, the final link,
    /// and the last link of each same-key run are checked. Verification
    /// runs before revocation processing so a link revoking its own
    /// signer still validates.
    fn verify_subchain(
        &mut self,
        kf: &KeyFamily,
        start: usize,
    ) -> Result<(bool, Arc<ComputedKeyInfos>), ChainError> {
        let len = self.chain_links.len();
        if start >= len {
            return Err(ChainError::Internal {
                reason: "verify_subchain requires a non-empty subchain".to_string(),
            });
        }

        if let Some(snapshot) = self.chain_links[len - 1].sig_check_cache() {
            debug!(link_id = %self.chain_links[len - 1].id(), "subchain verification cached");
            return Ok((true, snapshot));
        }

        let username = self.username.clone();
        let mut cki = ComputedKeyInfos::new();

        for i in start..len {
            let is_final = i + 1 == len;
            let is_last_in_run = is_final || {
                let this_fokid = self.chain_links[i].to_fokid();
                !this_fokid.matches(&self.chain_links[i + 1].to_fokid())
            };

            let role = {
                let tcl = TypedChainLink::classify(&self.chain_links[i]);
                if i == start {
                    cki.insert_eldest_link(&tcl, &username)?;
                }
                tcl.delegation_role()
            };
            let is_delegating = role.is_some();

            debug!(link_id = %self.chain_links[i].id(), "verifying subchain link");
            if is_delegating || is_final || is_last_in_run {
                self.chain_links[i].verify_sig_with_key_family(kf, &cki)?;
            }

            let tcl = TypedChainLink::classify(&self.chain_links[i]);
            if is_delegating {
                cki.delegate(&tcl)?;
            }
            tcl.verify_reverse_sig(kf)?;
            cki.revoke(&tcl)?;
            cki.update_devices(&tcl)?;
        }

        let snapshot = Arc::new(cki);
        self.chain_links[len - 1].put_sig_check_cache(Arc::clone(&snapshot));
        Ok((false, snapshot))
    }

    /// Runs linkage verification, then replays the suffix governed by
    /// the key family's eldest key, filling `ckf.cki`. When limiting to
    /// the eldest leaves nothing to replay, the eldest key is installed
    /// directly into the overlay.
    ///
    /// Returns whether the replay result came from a link's cache.
    ///
    /// # Errors
    ///
    /// Any verification or replay failure; partial results are never
    /// cached.
    pub fn verify_sigs_and_compute_keys(
        &mut self,
        eldest: Option<&Kid>,
        ckf: &mut ComputedKeyFamily,
    ) -> Result<bool, ChainError> {
        debug!(uid = %self.uid, "verifying signatures and computing keys");
        self.verify_chain()?;

        let (Some(kf), Some(eldest)) = (ckf.kf.clone(), eldest) else {
            debug!("no key family or no eldest key; nothing to compute");
            return Ok(false);
        };

        let eldest_fokid = kf
            .fokid_for(eldest)
            .unwrap_or_else(|| Fokid::from_kid(eldest.clone()));
        let start = self.eldest_suffix_start(&eldest_fokid);

        if start >= self.chain_links.len() {
            debug!(eldest = %eldest, "empty chain after limiting to eldest");
            let key = kf.require(eldest)?;
            let mut cki = ComputedKeyInfos::new();
            cki.insert_server_eldest_key(key, &self.username)?;
            self.local_cki = Some(Arc::new(cki));
            return Ok(false);
        }

        let (cached, cki) = self.verify_subchain(&kf, start)?;
        ckf.cki = Some(cki);
        Ok(cached)
    }

    /// Fetches links past the last loaded seqno from the server,
    /// cross-checking against the authority triple `t` when supplied,
    /// and appends them. Returns the new dirty tail.
    ///
    /// The exclusive low-water mark means the server must only return
    /// seqnos greater than what is already loaded; stale entries are
    /// skipped defensively anyway.
    ///
    /// # Errors
    ///
    /// [`ChainError::ServerChain`] when `t` was supplied but never
    /// reached in the response; import, Merkle, and transport errors
    /// otherwise.
    pub fn load_from_server(
        &mut self,
        ctx: &Context,
        t: Option<&MerkleTriple>,
    ) -> Result<Option<MerkleTriple>, ChainError> {
        let low = self.get_last_loaded_seqno();
        debug!(uid = %self.uid, low = %low, "loading sigchain from server");

        let arg = ApiArg::new("sig/get")
            .arg("uid", self.uid.to_hex())
            .arg("low", low.value().to_string());
        let res = ctx.api.get(&ctx.cancel, &arg)?;

        let sigs = res
            .at_key("sigs")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| ChainError::ServerChain {
                reason: "response missing sigs array".to_string(),
            })?;
        debug!(count = sigs.len(), "got new entries");

        let mut found_tail = false;
        let mut staged: Vec<ChainLink> = Vec::new();
        for value in sigs {
            let link = ChainLink::import_from_server(value)?;
            if link.seqno() <= low {
                continue;
            }
            if !found_tail {
                if let Some(t) = t {
                    found_tail = link.check_against_merkle_tree(t)?;
                }
            }
            staged.push(link);
        }

        if let Some(t) = t {
            if !found_tail {
                return Err(ChainError::ServerChain {
                    reason: format!(
                        "failed to reach ({}, {}) in server response",
                        t.link_id, t.seqno
                    ),
                });
            }
        }

        let dirty_tail = staged.last().map(ChainLink::to_merkle_triple);
        if let Some(dirty) = &dirty_tail {
            // The freshly loaded chain has outrun the local overlay.
            let outrun = self
                .local_chain_tail
                .as_ref()
                .is_some_and(|local| local.less_than(dirty));
            if outrun {
                debug!(loaded = %dirty.seqno, "clearing stale local tail");
                self.local_chain_tail = None;
                self.local_cki = None;
            }
        }

        self.chain_links.extend(staged);
        Ok(dirty_tail)
    }

    /// Compares the local tail against the server-published triple.
    ///
    /// Returns `Ok(true)` when no fetch is needed. A locally committed
    /// tail still inside the staleness window forces a reload even when
    /// the server agrees with the loaded chain.
    ///
    /// # Errors
    ///
    /// [`ChainError::Rollback`] and [`ChainError::ServerChain`] as in
    /// [`freshness_decision`].
    pub fn check_freshness(
        &self,
        clock: &dyn Clock,
        server: Option<&MerkleTriple>,
    ) -> Result<bool, ChainError> {
        let client = self.get_current_tail_triple();
        let future = self.get_future_chain_tail(clock);
        let result = freshness_decision(client.as_ref(), server, future);
        debug!(uid = %self.uid, current = ?result.as_ref().ok(), "freshness checked");
        result
    }
}
