//! # Units
//!
//! Epochs, token amounts, piece sizes and registered seal proofs.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A chain height.
pub type ChainEpoch = i64;

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

// ---------------------------------------------------------------------------
// TokenAmount
// ---------------------------------------------------------------------------

/// An amount of the native token in its smallest unit.
///
/// Arithmetic saturates instead of wrapping: an overflowing price is a
/// rejected proposal, not a panic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TokenAmount(u128);

impl TokenAmount {
    /// Zero tokens.
    pub const ZERO: TokenAmount = TokenAmount(0);

    /// Create an amount from its smallest unit.
    pub const fn from_atto(atto: u128) -> Self {
        Self(atto)
    }

    /// The amount in its smallest unit.
    pub fn atto(&self) -> u128 {
        self.0
    }

    /// Whether the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Multiply by an integer factor, saturating.
    pub fn mul(&self, factor: u64) -> Self {
        Self(self.0.saturating_mul(u128::from(factor)))
    }

    /// Compute `self * num / den`, rounding up. A zero denominator yields
    /// the maximum amount so that a misconfigured divisor never makes a
    /// deal look cheaper than it is.
    pub fn scale_ceil(&self, num: u64, den: u64) -> Self {
        if den == 0 {
            return Self(u128::MAX);
        }
        let product = self.0.saturating_mul(u128::from(num));
        let den = u128::from(den);
        Self(product / den + u128::from(product % den != 0))
    }
}

impl Add for TokenAmount {
    type Output = TokenAmount;

    fn add(self, rhs: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TokenAmount {
    type Output = TokenAmount;

    fn sub(self, rhs: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(Self)
            .map_err(|_| ValidationError::InvalidTokenAmount(s.to_string()))
    }
}

impl TryFrom<String> for TokenAmount {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TokenAmount> for String {
    fn from(t: TokenAmount) -> Self {
        t.0.to_string()
    }
}

// ---------------------------------------------------------------------------
// Piece sizes
// ---------------------------------------------------------------------------

/// Size of a piece after Fr32 padding. Always a power of two, at least 128.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct PaddedPieceSize(u64);

impl PaddedPieceSize {
    /// Validate and wrap a padded size.
    pub fn new(size: u64) -> Result<Self, ValidationError> {
        if size < 128 || !size.is_power_of_two() {
            return Err(ValidationError::InvalidPieceSize(size));
        }
        Ok(Self(size))
    }

    /// The padded size in bytes.
    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// The number of payload bytes this padded size holds.
    pub fn unpadded(&self) -> UnpaddedPieceSize {
        UnpaddedPieceSize(self.0 - self.0 / 128)
    }
}

impl TryFrom<u64> for PaddedPieceSize {
    type Error = ValidationError;

    fn try_from(size: u64) -> Result<Self, Self::Error> {
        Self::new(size)
    }
}

impl From<PaddedPieceSize> for u64 {
    fn from(p: PaddedPieceSize) -> Self {
        p.0
    }
}

impl fmt::Display for PaddedPieceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Size of a piece's payload before padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnpaddedPieceSize(pub u64);

impl UnpaddedPieceSize {
    /// The smallest valid padded size that can hold this payload.
    pub fn padded(&self) -> PaddedPieceSize {
        let raw = self.0 + self.0.div_ceil(127);
        PaddedPieceSize(raw.max(128).next_power_of_two())
    }
}

// ---------------------------------------------------------------------------
// RegisteredProof
// ---------------------------------------------------------------------------

/// The seal proof type a provider's sectors are registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisteredProof {
    /// 2 KiB sectors (test networks).
    StackedDrg2KiBV1,
    /// 8 MiB sectors.
    StackedDrg8MiBV1,
    /// 512 MiB sectors.
    StackedDrg512MiBV1,
    /// 32 GiB sectors.
    StackedDrg32GiBV1,
    /// 64 GiB sectors.
    StackedDrg64GiBV1,
}

impl RegisteredProof {
    /// Sector size in bytes.
    pub fn sector_size(&self) -> u64 {
        match self {
            Self::StackedDrg2KiBV1 => 2 << 10,
            Self::StackedDrg8MiBV1 => 8 << 20,
            Self::StackedDrg512MiBV1 => 512 << 20,
            Self::StackedDrg32GiBV1 => 32 << 30,
            Self::StackedDrg64GiBV1 => 64 << 30,
        }
    }

    /// The canonical name of the proof.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StackedDrg2KiBV1 => "StackedDrg2KiBV1",
            Self::StackedDrg8MiBV1 => "StackedDrg8MiBV1",
            Self::StackedDrg512MiBV1 => "StackedDrg512MiBV1",
            Self::StackedDrg32GiBV1 => "StackedDrg32GiBV1",
            Self::StackedDrg64GiBV1 => "StackedDrg64GiBV1",
        }
    }
}

impl fmt::Display for RegisteredProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegisteredProof {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StackedDrg2KiBV1" => Ok(Self::StackedDrg2KiBV1),
            "StackedDrg8MiBV1" => Ok(Self::StackedDrg8MiBV1),
            "StackedDrg512MiBV1" => Ok(Self::StackedDrg512MiBV1),
            "StackedDrg32GiBV1" => Ok(Self::StackedDrg32GiBV1),
            "StackedDrg64GiBV1" => Ok(Self::StackedDrg64GiBV1),
            other => Err(ValidationError::UnknownProof(other.to_string())),
        }
    }
}
