//! # Error Hierarchy
//!
//! Errors raised while constructing domain primitives or canonicalizing
//! structured data. Higher layers wrap these with `#[from]`.

use thiserror::Error;

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted in canonical representations.
    /// Token amounts and sizes must be integers.
    #[error("float values are not permitted in canonical representations: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for domain primitive newtypes.
///
/// Each variant carries the rejected input so that operators can diagnose
/// a malformed proposal or configuration value without guesswork.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Address is not an ID address of the form `t0<id>` / `f0<id>`.
    #[error("invalid address: \"{0}\" (expected t0<id> or f0<id>)")]
    InvalidAddress(String),

    /// Peer identifier is empty or contains whitespace.
    #[error("invalid peer id: \"{0}\"")]
    InvalidPeerId(String),

    /// Content identifier is not a 64-character hex SHA-256 digest.
    #[error("invalid cid: \"{0}\" (expected 64 hex characters)")]
    InvalidCid(String),

    /// Padded piece size is not a power of two of at least 128 bytes.
    #[error("invalid padded piece size: {0} (expected a power of two >= 128)")]
    InvalidPieceSize(u64),

    /// Token amount string is not a non-negative integer.
    #[error("invalid token amount: \"{0}\"")]
    InvalidTokenAmount(String),

    /// Registered proof name is not known.
    #[error("unknown registered proof: \"{0}\"")]
    UnknownProof(String),
}
