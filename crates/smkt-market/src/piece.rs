//! # Piece Commitment
//!
//! Both parties compute the commitment of a payload independently: the
//! client to fill in its proposal, the provider to check that what it
//! received is what the client committed to.
//!
//! ## Warning
//!
//! [`Sha256PieceIo`] stands in for the real commitment scheme. It binds
//! the payload bytes but has none of the tree structure a sealing proof
//! needs.

use smkt_core::{Cid, RegisteredProof, UnpaddedPieceSize};

use crate::error::PieceIoError;

/// Computes piece commitments.
pub trait PieceIo: Send + Sync {
    /// Commitment and payload size of `data` under `proof`.
    fn generate_piece_commitment(
        &self,
        proof: RegisteredProof,
        data: &[u8],
    ) -> Result<(Cid, UnpaddedPieceSize), PieceIoError>;
}

/// SHA-256 digest of the payload as its commitment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256PieceIo;

impl PieceIo for Sha256PieceIo {
    fn generate_piece_commitment(
        &self,
        proof: RegisteredProof,
        data: &[u8],
    ) -> Result<(Cid, UnpaddedPieceSize), PieceIoError> {
        if data.is_empty() {
            return Err(PieceIoError::EmptyPiece);
        }
        let size = UnpaddedPieceSize(data.len() as u64);
        let padded = size.padded().bytes();
        if padded > proof.sector_size() {
            return Err(PieceIoError::PieceTooLarge {
                size: padded,
                sector_size: proof.sector_size(),
            });
        }
        Ok((Cid::digest(data), size))
    }
}
