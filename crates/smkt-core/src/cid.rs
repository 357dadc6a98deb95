//! # Content Identifiers
//!
//! A [`Cid`] is a SHA-256 digest naming a piece of content: a deal
//! proposal, a chain message, a block of piece data. Structured values are
//! hashed through [`CanonicalBytes`]; raw byte payloads are hashed directly.
//!
//! The real network uses multihash-prefixed CIDs over CBOR. The market core
//! only compares identifiers for equality, so the encoding is opaque here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::CanonicalBytes;
use crate::error::{CanonicalizationError, ValidationError};

/// A 32-byte SHA-256 content identifier.
///
/// Serializes as a lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the identifier of a structured value via its canonical bytes.
    pub fn of(value: &impl Serialize) -> Result<Self, CanonicalizationError> {
        let canonical = CanonicalBytes::new(value)?;
        Ok(Self::from_canonical(&canonical))
    }

    /// Compute the identifier of already-canonicalized bytes.
    pub fn from_canonical(canonical: &CanonicalBytes) -> Self {
        Self::digest(canonical.as_bytes())
    }

    /// Compute the identifier of a raw byte payload.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Construct from a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Access the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Return the identifier as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// A short prefix for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short())
    }
}

impl FromStr for Cid {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ValidationError::InvalidCid(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair =
                std::str::from_utf8(chunk).map_err(|_| ValidationError::InvalidCid(s.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| ValidationError::InvalidCid(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Cid {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_cid_is_order_independent() {
        let a = Cid::of(&json!({"a": 1, "b": 2})).unwrap();
        let b = Cid::of(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_different_cid() {
        assert_ne!(Cid::digest(b"piece-a"), Cid::digest(b"piece-b"));
    }

    #[test]
    fn hex_parse_matches_display() {
        let cid = Cid::digest(b"hello");
        let parsed: Cid = cid.to_hex().parse().unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn parse_rejects_bad_length_and_digits() {
        assert!("abc".parse::<Cid>().is_err());
        let bad = "zz".repeat(32);
        assert!(bad.parse::<Cid>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let cid = Cid::digest(b"x");
        let json = serde_json::to_value(cid).unwrap();
        assert_eq!(json, serde_json::Value::String(cid.to_hex()));
    }

    #[test]
    fn short_is_prefix() {
        let cid = Cid::digest(b"x");
        assert!(cid.to_hex().starts_with(&cid.short()));
        assert_eq!(cid.short().len(), 12);
    }
}
