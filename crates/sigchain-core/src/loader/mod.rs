//! Staged sigchain loading.
//!
//! [`SigChainLoader`] drives a load end to end: reuse a preloaded chain,
//! read persisted links, verify linkage, compare against the Merkle
//! authority's published tail, fetch what is missing, replay signatures
//! into computed keys, and persist the result. Every stage is tagged for
//! logging and idempotent under preload.
//!
//! Persist ordering matters: the tail triple is only written after the
//! links it references are stored, so a crash between the two leaves a
//! reloadable database rather than a tail pointing at nothing.

#[cfg(test)]
mod tests;

use thiserror::Error;
use tracing::debug;

use crate::chain::{ChainError, SigChain};
use crate::context::Context;
use crate::keys::{ComputedKeyFamily, KeyFamily};
use crate::link::{ChainLink, LinkError};
use crate::store::{DbKey, DbTable, StoreError};
use crate::types::{Fokid, Kid, MerkleTriple, Uid};

/// Errors raised while loading a chain.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Chain-level verification or fetch failure.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Link import failure while walking storage.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the Merkle authority publishes for one user: the chain tail it
/// has committed to and the eldest key it believes governs the chain.
#[derive(Debug, Clone, Default)]
pub struct MerkleUserLeaf {
    /// Tail triple of the public chain, absent for link-less users.
    pub public: Option<MerkleTriple>,

    /// The user's eldest kid, absent for key-less users.
    pub eldest: Option<Kid>,
}

/// Which of a user's chains is being loaded.
///
/// Only the public chain exists today; the private and encrypted
/// variants are reserved.
pub struct ChainType {
    /// Storage table for this chain's tail triple.
    pub db_table: DbTable,

    /// Reserved.
    pub private: bool,

    /// Reserved.
    pub encrypted: bool,

    /// Selects this chain's triple out of a Merkle leaf.
    pub merkle_triple: fn(&MerkleUserLeaf) -> Option<&MerkleTriple>,
}

fn public_triple(leaf: &MerkleUserLeaf) -> Option<&MerkleTriple> {
    leaf.public.as_ref()
}

/// The public chain.
pub static PUBLIC_CHAIN: ChainType = ChainType {
    db_table: DbTable::SigChainTailPublic,
    private: false,
    encrypted: false,
    merkle_triple: public_triple,
};

/// The chain owner, as the calling layer knows them.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// User id.
    pub uid: Uid,

    /// Username the chain's links must claim.
    pub username: String,

    /// The user's key directory, when one is available.
    pub key_family: Option<std::sync::Arc<KeyFamily>>,
}

/// Orchestrates one chain load.
pub struct SigChainLoader<'a> {
    ctx: &'a Context,
    user: &'a UserInfo,
    all_keys: bool,
    leaf: Option<&'a MerkleUserLeaf>,
    chain_type: &'static ChainType,
    preload: Option<&'a SigChain>,

    links: Vec<ChainLink>,
    ckf: ComputedKeyFamily,
    dirty_tail: Option<MerkleTriple>,
}

impl<'a> SigChainLoader<'a> {
    /// Builds a loader.
    #[must_use]
    pub fn new(
        ctx: &'a Context,
        user: &'a UserInfo,
        all_keys: bool,
        leaf: Option<&'a MerkleUserLeaf>,
        chain_type: &'static ChainType,
        preload: Option<&'a SigChain>,
    ) -> Self {
        Self {
            ctx,
            user,
            all_keys,
            leaf,
            chain_type,
            preload,
            links: Vec::new(),
            ckf: ComputedKeyFamily::default(),
            dirty_tail: None,
        }
    }

    fn stage(&self, name: &str) {
        debug!(uid = %self.user.uid, stage = name, "sigchain load stage");
    }

    fn get_key_family(&mut self) {
        self.ckf.kf.clone_from(&self.user.key_family);
    }

    /// Reuses a preloaded chain's links when its `all_keys` mode matches
    /// the requested one. The copy is shallow: verification flags and
    /// cached snapshots carry over, which is what makes repeat loads of
    /// an already-verified user cheap.
    fn access_preload(&mut self) -> bool {
        match self.preload {
            Some(preload) if preload.all_keys() == self.all_keys => {
                debug!(uid = %self.user.uid, "preload successful");
                self.links = preload.links().to_vec();
                true
            },
            _ => {
                debug!(uid = %self.user.uid, "preload failed");
                false
            },
        }
    }

    fn load_last_link_id_from_storage(&self) -> Result<Option<MerkleTriple>, LoaderError> {
        let key = DbKey::new(self.chain_type.db_table, self.user.uid.to_hex());
        let Some(bytes) = self.ctx.store.get(&self.ctx.cancel, &key)? else {
            debug!(uid = %self.user.uid, "no stored tail");
            return Ok(None);
        };
        let triple: MerkleTriple =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(triple))
    }

    /// Reads the stored tail triple and walks backward through prev
    /// pointers. When `all_keys` is false the walk stops at the first
    /// link whose eldest fokid differs from the tail's, so the loaded
    /// slice never spans an eldest-key rotation.
    fn load_links_from_storage(&mut self) -> Result<(), LoaderError> {
        let Some(tail) = self.load_last_link_id_from_storage()? else {
            return Ok(());
        };

        let mut links: Vec<ChainLink> = Vec::new();
        let mut load_fokid: Option<Fokid> = None;
        let mut curr = Some(tail.link_id);

        while let Some(id) = curr {
            let key = DbKey::new(DbTable::Link, id.to_hex());
            let bytes = self.ctx.store.get(&self.ctx.cancel, &key)?.ok_or_else(|| {
                StoreError::Corrupt {
                    key: key.to_string(),
                    reason: "tail references a link that is not persisted".to_string(),
                }
            })?;
            let link = ChainLink::import_from_storage(&bytes)?;

            let fokid = link.to_eldest_fokid();
            match load_fokid.take() {
                None => load_fokid = Some(fokid),
                Some(first) => {
                    if !self.all_keys && !first.matches(&fokid) {
                        debug!(uid = %self.user.uid, stop_at = %fokid, "stopped walk at eldest rotation");
                        break;
                    }
                    load_fokid = Some(first);
                },
            }

            curr = link.prev();
            links.push(link);
        }

        links.reverse();
        self.links = links;
        Ok(())
    }

    fn make_sig_chain(&mut self) -> SigChain {
        SigChain::with_links(
            self.user.uid,
            self.user.username.clone(),
            std::mem::take(&mut self.links),
            self.all_keys,
            self.ctx.config.server_update_lag(),
        )
    }

    fn merkle_triple(&self) -> Option<&'a MerkleTriple> {
        self.leaf.and_then(|leaf| (self.chain_type.merkle_triple)(leaf))
    }

    fn store_tail(&mut self) -> Result<(), LoaderError> {
        let Some(tail) = &self.dirty_tail else {
            return Ok(());
        };
        let key = DbKey::new(self.chain_type.db_table, self.user.uid.to_hex());
        let bytes = serde_json::to_vec(tail).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.ctx.store.put(&self.ctx.cancel, &key, &bytes)?;
        debug!(uid = %self.user.uid, seqno = %tail.seqno, "stored dirty tail");
        self.dirty_tail = None;
        Ok(())
    }

    /// Runs the load to completion.
    ///
    /// A chain that is fresh and already carries computed keys returns
    /// without touching the network or storage again; a fresh chain with
    /// no computed keys still replays signatures, because a new process
    /// may hold verified links but no derived view.
    ///
    /// # Errors
    ///
    /// Any stage failure, unchanged.
    pub fn load(mut self) -> Result<SigChain, LoaderError> {
        debug!(uid = %self.user.uid, all_keys = self.all_keys, "loading sigchain");

        self.stage("get_key_family");
        self.get_key_family();

        self.stage("access_preload");
        let preloaded = self.access_preload();

        if !preloaded {
            self.stage("load_links_from_storage");
            self.load_links_from_storage()?;
        }

        self.stage("make_sig_chain");
        let mut chain = self.make_sig_chain();

        self.stage("verify_chain");
        chain.verify_chain()?;

        self.stage("check_freshness");
        let server_triple = self.merkle_triple();
        let current = chain.check_freshness(self.ctx.clock.as_ref(), server_triple)?;

        if !current {
            self.stage("load_from_server");
            self.dirty_tail = chain.load_from_server(self.ctx, server_triple)?;
        } else if chain.get_computed_key_infos().is_some() {
            return Ok(chain);
        } else {
            debug!(uid = %self.user.uid, "reverifying chain; computed keys absent");
        }

        self.stage("verify_chain");
        chain.verify_chain()?;

        self.stage("store_links");
        chain.store(self.ctx)?;

        self.stage("verify_sigs_and_compute_keys");
        if self.ckf.kf.is_some() {
            let eldest = self.leaf.and_then(|leaf| leaf.eldest.as_ref());
            chain.verify_sigs_and_compute_keys(eldest, &mut self.ckf)?;
        }

        self.stage("store_tail");
        self.store_tail()?;

        Ok(chain)
    }
}

/// Loads one user's chain through all stages.
///
/// # Errors
///
/// Any stage failure, unchanged.
pub fn load_sig_chain(
    ctx: &Context,
    user: &UserInfo,
    all_keys: bool,
    leaf: Option<&MerkleUserLeaf>,
    chain_type: &'static ChainType,
    preload: Option<&SigChain>,
) -> Result<SigChain, LoaderError> {
    SigChainLoader::new(ctx, user, all_keys, leaf, chain_type, preload).load()
}
