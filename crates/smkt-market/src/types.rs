//! # Deal Data Model
//!
//! Records kept by the two orchestrators and the messages they exchange.
//!
//! Neither deal record carries its status. The engine owns the status and
//! a record is only ever read together with it through a
//! [`DealSnapshot`], taken under the engine's per-entity lock.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use smkt_chain::ClientDealProposal;
use smkt_core::{
    Address, ChainEpoch, Cid, DealId, PaddedPieceSize, PeerInfo, SectorNumber, TokenAmount,
    UnpaddedPieceSize,
};
use smkt_fsm::TransitionRecord;

use crate::status::StorageDealStatus;

// ── Payload references ───────────────────────────────────────────────

/// How the payload reaches the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    /// The provider pulls the payload from the client.
    Graphsync,
    /// The client hands the payload to the provider out of band.
    Manual,
}

impl TransferType {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graphsync => "graphsync",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the payload of a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    /// Transfer mode.
    pub transfer_type: TransferType,
    /// Root of the payload.
    pub root: Cid,
    /// Piece commitment, if the client computed it ahead of time.
    pub piece_cid: Option<Cid>,
    /// Payload size matching `piece_cid`.
    pub piece_size: Option<UnpaddedPieceSize>,
}

impl DataRef {
    /// A pull-transfer reference to `root`.
    pub fn graphsync(root: Cid) -> Self {
        Self {
            transfer_type: TransferType::Graphsync,
            root,
            piece_cid: None,
            piece_size: None,
        }
    }

    /// A manual-transfer reference to `root`.
    pub fn manual(root: Cid) -> Self {
        Self {
            transfer_type: TransferType::Manual,
            root,
            piece_cid: None,
            piece_size: None,
        }
    }

    /// Attach a precomputed commitment.
    pub fn with_piece(mut self, piece_cid: Cid, size: UnpaddedPieceSize) -> Self {
        self.piece_cid = Some(piece_cid);
        self.piece_size = Some(size);
        self
    }

    /// Whether the provider waits for an out-of-band import.
    pub fn is_manual(&self) -> bool {
        self.transfer_type == TransferType::Manual
    }
}

// ── Asks ─────────────────────────────────────────────────────────────

/// A provider's posted terms for new deals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAsk {
    /// Price per GiB per epoch.
    pub price: TokenAmount,
    /// Price per GiB per epoch for verified deals.
    pub verified_price: TokenAmount,
    /// Smallest accepted padded piece.
    pub min_piece_size: PaddedPieceSize,
    /// Largest accepted padded piece.
    pub max_piece_size: PaddedPieceSize,
    /// The asking miner.
    pub miner: Address,
    /// Chain epoch the ask was posted at.
    pub timestamp: ChainEpoch,
    /// Chain epoch after which the ask lapses.
    pub expiry: ChainEpoch,
    /// Incremented on every repost.
    pub seq_no: u64,
}

impl StorageAsk {
    /// Minimum price per epoch for a piece of `size` under this ask.
    pub fn min_price_per_epoch(&self, size: PaddedPieceSize, verified: bool) -> TokenAmount {
        let per_gib = if verified {
            self.verified_price
        } else {
            self.price
        };
        per_gib.scale_ceil(size.bytes(), smkt_core::GIB)
    }

    /// Whether the ask is still valid at `epoch`.
    pub fn is_live_at(&self, epoch: ChainEpoch) -> bool {
        epoch <= self.expiry
    }
}

/// What a client knows about a provider before proposing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderInfo {
    /// Miner actor address.
    pub address: Address,
    /// Owner account.
    pub owner: Address,
    /// Worker account.
    pub worker: Address,
    /// Sector size in bytes.
    pub sector_size: u64,
    /// Network identity.
    pub peer_info: PeerInfo,
}

// ── Wire messages ────────────────────────────────────────────────────

/// A deal proposal as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// The signed terms.
    pub deal_proposal: ClientDealProposal,
    /// Where the payload comes from.
    pub piece: DataRef,
}

/// The provider's answer to a proposal.
///
/// Sent once the deal is published, or as soon as the provider gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponse {
    /// The provider's state when responding.
    pub state: StorageDealStatus,
    /// Failure reason, empty on success.
    pub message: String,
    /// The proposal answered.
    pub proposal: Cid,
    /// The publish message, once published.
    pub publish_message: Option<Cid>,
}

/// A request for a miner's current ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskRequest {
    /// Miner whose ask is requested.
    pub miner: Address,
}

/// Answer to an [`AskRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskResponse {
    /// The posted ask.
    pub ask: StorageAsk,
}

// ── Deal records ─────────────────────────────────────────────────────

/// The provider's record of a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerDeal {
    /// The client's signed proposal. Never modified after creation.
    pub client_deal_proposal: ClientDealProposal,
    /// Content identifier of the proposal.
    pub proposal_cid: Cid,
    /// The provider.
    pub miner: PeerInfo,
    /// The client, as seen on the deal stream.
    pub client: PeerInfo,
    /// Payload reference from the proposal.
    pub data_ref: DataRef,
    /// Collateral top-up message, once broadcast.
    pub add_funds_cid: Option<Cid>,
    /// Publish message, once broadcast.
    pub publish_cid: Option<Cid>,
    /// On-chain deal id, once published.
    pub deal_id: Option<DealId>,
    /// Sector the deal was packed into.
    pub sector: Option<SectorNumber>,
    /// Offset of the piece within the sector, in padded bytes.
    pub offset: Option<u64>,
    /// Staged piece bytes.
    pub piece_path: Option<PathBuf>,
    /// Staged piece metadata.
    pub metadata_path: Option<PathBuf>,
    /// Whether the deal stream has been closed.
    pub connection_closed: bool,
    /// Last failure reason.
    pub message: String,
    /// When the deal stream was accepted.
    pub created_at: DateTime<Utc>,
}

impl MinerDeal {
    /// Record a failure reason, keeping an earlier one as context.
    pub fn record_failure(&mut self, reason: &str) {
        if self.message.is_empty() {
            self.message = reason.to_string();
        } else if !self.message.contains(reason) {
            self.message = format!("{}; {reason}", self.message);
        }
    }
}

/// The client's record of a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeal {
    /// The signed proposal. Never modified after creation.
    pub client_deal_proposal: ClientDealProposal,
    /// Content identifier of the proposal.
    pub proposal_cid: Cid,
    /// The provider.
    pub miner: StorageProviderInfo,
    /// Payload reference sent with the proposal.
    pub data_ref: DataRef,
    /// Escrow top-up message, once broadcast.
    pub add_funds_cid: Option<Cid>,
    /// Publish message reported by the provider.
    pub publish_message: Option<Cid>,
    /// On-chain deal id.
    pub deal_id: Option<DealId>,
    /// Whether the deal stream has been closed.
    pub connection_closed: bool,
    /// Last failure reason.
    pub message: String,
    /// When the deal was proposed.
    pub created_at: DateTime<Utc>,
}

/// Metadata staged next to a piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceMetadata {
    /// The deal the piece belongs to.
    pub proposal_cid: Cid,
    /// Commitment of the staged bytes.
    pub piece_cid: Cid,
    /// Payload root.
    pub payload_root: Cid,
    /// Payload size.
    pub size: UnpaddedPieceSize,
}

/// A deal record with its status and history, read atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSnapshot<D, K> {
    /// Status when the snapshot was taken.
    pub state: StorageDealStatus,
    /// The record.
    pub deal: D,
    /// Every transition so far, oldest first.
    pub history: Vec<TransitionRecord<StorageDealStatus, K>>,
}

impl<D, K> DealSnapshot<D, K> {
    /// Whether the deal has finished.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// States visited, starting from the initial one.
    pub fn path(&self) -> Vec<StorageDealStatus> {
        let mut path: Vec<_> = self.history.first().map(|r| r.from).into_iter().collect();
        path.extend(self.history.iter().map(|r| r.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask() -> StorageAsk {
        StorageAsk {
            price: TokenAmount::from_atto(1 << 30),
            verified_price: TokenAmount::from_atto(0),
            min_piece_size: PaddedPieceSize::new(256).unwrap(),
            max_piece_size: PaddedPieceSize::new(1 << 20).unwrap(),
            miner: Address::from_id(1000),
            timestamp: 0,
            expiry: 100,
            seq_no: 0,
        }
    }

    #[test]
    fn min_price_scales_with_piece_size() {
        let a = ask();
        let size = PaddedPieceSize::new(2048).unwrap();
        assert_eq!(a.min_price_per_epoch(size, false).atto(), 2048);
        assert!(a.min_price_per_epoch(size, true).is_zero());
    }

    #[test]
    fn ask_lapses_after_expiry() {
        let a = ask();
        assert!(a.is_live_at(100));
        assert!(!a.is_live_at(101));
    }

    #[test]
    fn transfer_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransferType::Manual).unwrap(),
            "\"manual\""
        );
        assert_eq!(TransferType::Graphsync.to_string(), "graphsync");
        assert!(DataRef::manual(Cid::digest(b"r")).is_manual());
    }
}
