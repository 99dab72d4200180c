//! # sigchain-core
//!
//! Loading and verification of per-user signature chains: append-only,
//! cryptographically linked sequences of identity and key-management
//! statements (eldest-key installation, sibkey and subkey delegations,
//! revocations, device updates).
//!
//! For a given user the crate reconstructs the chain from local storage
//! and the remote, verifies every link's signature and the hash-chain
//! linkage between adjacent links, cross-checks the tail against the
//! Merkle authority's published triple, and replays the chain into the
//! current set of computed key infos: which keys are live, which are
//! revoked, and the delegation graph between them.
//!
//! ## Layers
//!
//! - [`types`] — identifiers: seqnos, uids, kids, link/sig ids, fokids,
//!   and the [`MerkleTriple`](types::MerkleTriple) naming a chain
//!   position.
//! - [`link`] — one statement: import, verification, persistence, and
//!   the role-typed view over it.
//! - [`keys`] — the static key directory and the replay-derived
//!   computed-key view.
//! - [`chain`] — the ordered chain, its verification passes, freshness
//!   against the authority, and the local-delegation overlay.
//! - [`loader`] — stage-by-stage orchestration of a full load.
//! - [`store`], [`api`], [`context`] — the collaborator seams: local
//!   storage, the remote API, and the clock/cancellation bundle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sigchain_core::api::HttpApiClient;
//! use sigchain_core::config::ChainConfig;
//! use sigchain_core::context::{Context, SystemClock};
//! use sigchain_core::loader::{load_sig_chain, UserInfo, PUBLIC_CHAIN};
//! use sigchain_core::store::SqliteStore;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChainConfig::default();
//! let ctx = Context::new(
//!     Arc::new(SqliteStore::open("/var/lib/sigchain/chains.db")?),
//!     Arc::new(HttpApiClient::new(&config)?),
//!     Arc::new(SystemClock),
//!     config,
//! );
//!
//! let user = UserInfo {
//!     uid: "00112233445566778899aabbccddeeff".parse()?,
//!     username: "ada".to_string(),
//!     key_family: None,
//! };
//! let chain = load_sig_chain(&ctx, &user, false, None, &PUBLIC_CHAIN, None)?;
//! println!("loaded {} links", chain.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! The core is not internally parallel. A chain is accessed by one
//! logical task at a time; callers serialize writers, typically behind a
//! read/write lock at the boundary. Collaborator calls are the only
//! suspension points, and all of them honor the context's cancellation
//! token.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod chain;
pub mod config;
pub mod context;
pub mod keys;
pub mod link;
pub mod loader;
pub mod merkle;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::chain::SigChain;
    pub use crate::config::ChainConfig;
    pub use crate::context::{Context, SystemClock};
    pub use crate::keys::cki::ComputedKeyInfos;
    pub use crate::keys::KeyFamily;
    pub use crate::link::ChainLink;
    pub use crate::loader::{load_sig_chain, UserInfo, PUBLIC_CHAIN};
    pub use crate::types::{Fokid, Kid, LinkId, MerkleTriple, Seqno, SigId, Uid};
}

pub use chain::SigChain;
pub use config::ChainConfig;
pub use context::Context;
pub use link::ChainLink;
pub use loader::load_sig_chain;
