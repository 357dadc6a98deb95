#![deny(missing_docs)]

//! # smkt-core — Foundational Types for the Storage Market
//!
//! This crate defines the primitives every other crate in the workspace
//! depends on. It has no internal crate dependencies, only `serde`,
//! `serde_json`, `thiserror` and `sha2` from the external ecosystem.
//!
//! ## Design Principles
//!
//! 1. **Newtype wrappers for domain primitives.** A [`DealId`] cannot be
//!    passed where a [`SectorNumber`] is expected, and an [`Address`] is not
//!    a bare integer.
//!
//! 2. **[`CanonicalBytes`] is the sole path to a [`Cid`] over structured
//!    data.** Proposal references, message references and any other
//!    content-derived identifier flow through `CanonicalBytes::new()`, so two
//!    parties hashing the same proposal always agree on its identifier.
//!
//! 3. **Structured errors with `thiserror`.** No `Box<dyn Error>`, no
//!    `.unwrap()` outside tests.

pub mod canonical;
pub mod cid;
pub mod error;
pub mod identity;
pub mod units;

pub use canonical::CanonicalBytes;
pub use cid::Cid;
pub use error::{CanonicalizationError, ValidationError};
pub use identity::{Address, DealId, PeerId, PeerInfo, SectorNumber};
pub use units::{
    ChainEpoch, PaddedPieceSize, RegisteredProof, TokenAmount, UnpaddedPieceSize, GIB,
};
