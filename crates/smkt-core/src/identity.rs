//! # Identity Newtypes
//!
//! Identifiers for chain actors, network peers, deals and sectors. Each is
//! a distinct type; a [`DealId`] cannot be passed where a [`SectorNumber`]
//! is expected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Chain identifiers
// ---------------------------------------------------------------------------

/// An ID address of a chain actor (`t0<id>`).
///
/// Only ID addresses are handled by the market core; key addresses are
/// resolved to IDs by the chain collaborator before they reach a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(u64);

impl Address {
    /// Create an ID address.
    pub const fn from_id(id: u64) -> Self {
        Self(id)
    }

    /// The actor id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t0{}", self.0)
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("t0")
            .or_else(|| s.strip_prefix("f0"))
            .ok_or_else(|| ValidationError::InvalidAddress(s.to_string()))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidAddress(s.to_string()));
        }
        digits
            .parse()
            .map(Self)
            .map_err(|_| ValidationError::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_string()
    }
}

/// On-chain identifier of a published storage deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealId(pub u64);

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of a sector within one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorNumber(pub u64);

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Network identifiers
// ---------------------------------------------------------------------------

/// Network identity of a counter-party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id, rejecting empty or whitespace-containing input.
    pub fn new(s: impl Into<String>) -> Result<Self, ValidationError> {
        let s = s.into();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidPeerId(s));
        }
        Ok(Self(s))
    }

    /// Access the peer id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> Self {
        p.0
    }
}

/// A peer id together with the addresses it was reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer identity.
    pub id: PeerId,
    /// Transport addresses (multiaddr strings), most recent first.
    pub addresses: Vec<String>,
}

impl PeerInfo {
    /// Create peer info with a single address.
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            addresses: vec![address.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let a = Address::from_id(1000);
        assert_eq!(a.to_string(), "t01000");
        assert_eq!("t01000".parse::<Address>().unwrap(), a);
        assert_eq!("f01000".parse::<Address>().unwrap(), a);
    }

    #[test]
    fn address_rejects_non_id_forms() {
        for bad in ["", "t0", "t1abc", "t0x12", "01000", "t0 1"] {
            assert!(bad.parse::<Address>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn address_serializes_as_string() {
        let json = serde_json::to_string(&Address::from_id(7)).unwrap();
        assert_eq!(json, "\"t07\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), 7);
    }

    #[test]
    fn peer_id_validation() {
        assert!(PeerId::new("12D3KooWabc").is_ok());
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("has space").is_err());
    }

    #[test]
    fn deal_and_sector_display() {
        assert_eq!(DealId(5).to_string(), "5");
        assert_eq!(SectorNumber(13).to_string(), "13");
    }
}
