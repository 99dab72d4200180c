//! Cross-checking chain tails against the Merkle authority.
//!
//! The remote publishes a signed [`MerkleTriple`](crate::types::MerkleTriple)
//! naming the tail it believes a user's chain has. A fetched link at that
//! seqno may carry an ordered sibling path; folding the link id up the path
//! must reproduce the triple's link id. An empty path degenerates to direct
//! id equality, which is the common case for a tail the authority commits
//! to verbatim.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::types::{LinkId, Seqno};

/// Upper bound on sibling-path length.
///
/// Paths deeper than this are rejected before any hashing is done.
pub const MAX_PATH_DEPTH: usize = 64;

/// Errors produced by the Merkle cross-check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// Sibling path exceeds [`MAX_PATH_DEPTH`].
    #[error("merkle path depth {depth} exceeds cap {MAX_PATH_DEPTH}")]
    PathTooDeep {
        /// Actual path length.
        depth: usize,
    },

    /// Folding the path did not reproduce the authority's link id.
    #[error("merkle root mismatch at seqno={seqno}")]
    RootMismatch {
        /// Chain position the authority named.
        seqno: Seqno,
    },
}

/// Which side of the concatenation a sibling hash occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerkleSide {
    /// Sibling is hashed before the running value.
    Left,
    /// Sibling is hashed after the running value.
    Right,
}

/// One step of a sibling path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    /// Sibling node hash.
    pub hash: LinkId,

    /// Concatenation side.
    pub side: MerkleSide,
}

/// Folds `leaf` up the sibling path.
fn fold_path(leaf: &LinkId, path: &[MerkleNode]) -> LinkId {
    let mut current = *leaf;
    for node in path {
        let mut hasher = Sha256::new();
        match node.side {
            MerkleSide::Left => {
                hasher.update(node.hash.as_bytes());
                hasher.update(current.as_bytes());
            },
            MerkleSide::Right => {
                hasher.update(current.as_bytes());
                hasher.update(node.hash.as_bytes());
            },
        }
        current = LinkId::from_bytes(hasher.finalize().into());
    }
    current
}

/// Verifies that `leaf` hashes up `path` to `expected_root` at `seqno`.
///
/// # Errors
///
/// Returns [`MerkleError::PathTooDeep`] for oversized paths and
/// [`MerkleError::RootMismatch`] when the fold disagrees with the
/// authority.
pub fn verify_path(
    leaf: &LinkId,
    path: &[MerkleNode],
    expected_root: &LinkId,
    seqno: Seqno,
) -> Result<(), MerkleError> {
    if path.len() > MAX_PATH_DEPTH {
        return Err(MerkleError::PathTooDeep { depth: path.len() });
    }

    let root = fold_path(leaf, path);
    if bool::from(root.as_bytes().ct_eq(expected_root.as_bytes())) {
        Ok(())
    } else {
        Err(MerkleError::RootMismatch { seqno })
    }
}
