//! Core identifiers for signature chains.
//!
//! This module implements the small value types the rest of the crate is
//! built from: sequence numbers, user and key identifiers, content and
//! signature hashes, and the [`MerkleTriple`] that names a chain position.
//!
//! # Text Form
//!
//! Every identifier has a strict lowercase-hex text form. Parsing is
//! fail-closed: wrong length, uppercase input, and non-hex characters are
//! all rejected, never coerced. Binary-to-text-to-binary round-trips are
//! lossless.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of bytes in a [`Uid`].
pub const UID_LEN: usize = 16;

/// Number of bytes in a [`LinkId`] or [`SigId`] (SHA-256 output).
pub const HASH_LEN: usize = 32;

/// Number of bytes in a PGP [`Fingerprint`].
pub const FINGERPRINT_LEN: usize = 20;

/// Maximum number of bytes in a [`Kid`].
///
/// Key identifiers are opaque, but unbounded input from the wire is not
/// acceptable; anything longer than this is rejected at parse time.
pub const MAX_KID_LEN: usize = 64;

/// Errors produced when parsing identifier text forms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Input was empty.
    #[error("empty identifier")]
    Empty,

    /// Input was not valid lowercase hex.
    #[error("invalid hex: {reason}")]
    InvalidHex {
        /// Description of the decode failure.
        reason: String,
    },

    /// Decoded byte length did not match the identifier's fixed width.
    #[error("wrong identifier length: expected {expected} bytes, got {got}")]
    WrongLength {
        /// Expected byte width.
        expected: usize,
        /// Actual decoded width.
        got: usize,
    },

    /// Key identifier exceeded [`MAX_KID_LEN`].
    #[error("key identifier too long: {got} bytes exceeds {MAX_KID_LEN}")]
    KidTooLong {
        /// Actual decoded width.
        got: usize,
    },
}

fn decode_hex_strict(input: &str) -> Result<Vec<u8>, IdError> {
    if input.is_empty() {
        return Err(IdError::Empty);
    }
    if input.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(IdError::InvalidHex {
            reason: "uppercase characters are not canonical".to_string(),
        });
    }
    hex::decode(input).map_err(|e| IdError::InvalidHex {
        reason: e.to_string(),
    })
}

macro_rules! fixed_hex_id {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Wraps raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Returns the lowercase-hex text form.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, IdError> {
                let bytes = decode_hex_strict(s)?;
                let arr: [u8; $len] =
                    bytes.try_into().map_err(|v: Vec<u8>| IdError::WrongLength {
                        expected: $len,
                        got: v.len(),
                    })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

fixed_hex_id!(
    /// A user identifier.
    Uid,
    UID_LEN
);

fixed_hex_id!(
    /// Content hash of a link's canonical payload (SHA-256).
    LinkId,
    HASH_LEN
);

fixed_hex_id!(
    /// Identifier of a signature over a link payload (SHA-256 of the
    /// signature bytes).
    SigId,
    HASH_LEN
);

fixed_hex_id!(
    /// A PGP key fingerprint. Carried for key-equivalence checks only;
    /// this crate never verifies PGP signatures.
    Fingerprint,
    FINGERPRINT_LEN
);

/// An opaque key identifier.
///
/// Kids are variable-width byte strings assigned by the key directory;
/// this crate never interprets their contents beyond equality.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kid(Vec<u8>);

impl Kid {
    /// Wraps raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Empty`] for empty input and
    /// [`IdError::KidTooLong`] past [`MAX_KID_LEN`].
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, IdError> {
        if bytes.is_empty() {
            return Err(IdError::Empty);
        }
        if bytes.len() > MAX_KID_LEN {
            return Err(IdError::KidTooLong { got: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the lowercase-hex text form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl FromStr for Kid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        Self::from_bytes(decode_hex_strict(s)?)
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", self.to_hex())
    }
}

impl Serialize for Kid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Kid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A 1-based chain position.
///
/// `Seqno::ZERO` is the "no links" sentinel used by freshness and storage
/// queries; a user's eldest link is at seqno 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seqno(u64);

impl Seqno {
    /// The "no links loaded" sentinel.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the next position.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fingerprint-or-kid pair used for key equivalence across algorithms.
///
/// Two fokids match iff every field present on both sides agrees and at
/// least one field overlaps. A kid-only fokid therefore matches a
/// fingerprint+kid fokid carrying the same kid.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fokid {
    /// Optional PGP fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,

    /// Optional key identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<Kid>,
}

impl Fokid {
    /// Builds a kid-only fokid.
    #[must_use]
    pub const fn from_kid(kid: Kid) -> Self {
        Self {
            fingerprint: None,
            kid: Some(kid),
        }
    }

    /// Field-agreement equivalence check.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let mut overlap = false;
        if let (Some(a), Some(b)) = (&self.kid, &other.kid) {
            if a != b {
                return false;
            }
            overlap = true;
        }
        if let (Some(a), Some(b)) = (&self.fingerprint, &other.fingerprint) {
            if a != b {
                return false;
            }
            overlap = true;
        }
        overlap
    }
}

impl fmt::Display for Fokid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.fingerprint, &self.kid) {
            (Some(fp), Some(kid)) => write!(f, "{fp}/{kid}"),
            (Some(fp), None) => write!(f, "{fp}/-"),
            (None, Some(kid)) => write!(f, "-/{kid}"),
            (None, None) => f.write_str("-/-"),
        }
    }
}

/// Canonical reference to a chain position: `{seqno, link_id, sig_id}`.
///
/// This is both the persisted tail format and the freshness reference the
/// Merkle authority publishes for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTriple {
    /// Chain position.
    pub seqno: Seqno,

    /// Link id at that position.
    pub link_id: LinkId,

    /// Signature id at that position.
    pub sig_id: SigId,
}

impl MerkleTriple {
    /// Builds a triple.
    #[must_use]
    pub const fn new(seqno: Seqno, link_id: LinkId, sig_id: SigId) -> Self {
        Self {
            seqno,
            link_id,
            sig_id,
        }
    }

    /// Total order by seqno only; link and signature ids do not
    /// participate in freshness comparisons.
    #[must_use]
    pub fn less_than(&self, other: &Self) -> bool {
        self.seqno < other.seqno
    }
}

impl fmt::Display for MerkleTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.seqno, self.link_id, self.sig_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_hex() {
        let uid: Uid = "00112233445566778899aabbccddeeff".parse().expect("parse");
        assert_eq!(uid.to_hex(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn uid_rejects_uppercase() {
        let err = "00112233445566778899AABBCCDDEEFF".parse::<Uid>().unwrap_err();
        assert!(matches!(err, IdError::InvalidHex { .. }));
    }

    #[test]
    fn uid_rejects_wrong_length() {
        let err = "0011".parse::<Uid>().unwrap_err();
        assert_eq!(
            err,
            IdError::WrongLength {
                expected: UID_LEN,
                got: 2
            }
        );
    }

    #[test]
    fn kid_rejects_empty_and_oversize() {
        assert_eq!("".parse::<Kid>().unwrap_err(), IdError::Empty);
        let long = "ab".repeat(MAX_KID_LEN + 1);
        assert_eq!(
            long.parse::<Kid>().unwrap_err(),
            IdError::KidTooLong { got: MAX_KID_LEN + 1 }
        );
    }

    #[test]
    fn fokid_matches_on_kid_overlap() {
        let kid: Kid = "0101".parse().expect("kid");
        let a = Fokid::from_kid(kid.clone());
        let b = Fokid {
            fingerprint: Some(Fingerprint::from_bytes([7u8; FINGERPRINT_LEN])),
            kid: Some(kid),
        };
        assert!(a.matches(&b));
        assert!(b.matches(&a));
    }

    #[test]
    fn fokid_mismatch_on_conflicting_field() {
        let a = Fokid {
            fingerprint: Some(Fingerprint::from_bytes([1u8; FINGERPRINT_LEN])),
            kid: Some("0101".parse().expect("kid")),
        };
        let b = Fokid {
            fingerprint: Some(Fingerprint::from_bytes([2u8; FINGERPRINT_LEN])),
            kid: Some("0101".parse().expect("kid")),
        };
        // Kid agrees but fingerprints conflict.
        assert!(!a.matches(&b));
    }

    #[test]
    fn fokid_requires_overlap() {
        let a = Fokid {
            fingerprint: Some(Fingerprint::from_bytes([1u8; FINGERPRINT_LEN])),
            kid: None,
        };
        let b = Fokid::from_kid("0101".parse().expect("kid"));
        assert!(!a.matches(&b));
    }

    #[test]
    fn triple_orders_by_seqno_only() {
        let lo = MerkleTriple::new(
            Seqno::new(3),
            LinkId::from_bytes([9u8; HASH_LEN]),
            SigId::from_bytes([9u8; HASH_LEN]),
        );
        let hi = MerkleTriple::new(
            Seqno::new(4),
            LinkId::from_bytes([0u8; HASH_LEN]),
            SigId::from_bytes([0u8; HASH_LEN]),
        );
        assert!(lo.less_than(&hi));
        assert!(!hi.less_than(&lo));
        assert!(!lo.less_than(&lo));
    }

    #[test]
    fn triple_serde_shape() {
        let t = MerkleTriple::new(
            Seqno::new(1),
            LinkId::from_bytes([0xab; HASH_LEN]),
            SigId::from_bytes([0xcd; HASH_LEN]),
        );
        let json = serde_json::to_value(&t).expect("serialize");
        assert_eq!(json["seqno"], 1);
        assert_eq!(json["link_id"], "ab".repeat(HASH_LEN));
        let back: MerkleTriple = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, t);
    }
}
