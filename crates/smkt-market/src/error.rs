//! # Market Errors
//!
//! One error enum per orchestrator plus one per collaborator contract.
//! Orchestrator errors are returned to callers of the public operations;
//! collaborator errors raised inside chart actions never escape the chart
//! and are recorded on the deal as the reason of a failure event instead.

use std::path::PathBuf;

use smkt_chain::{ChainError, EventsError};
use smkt_core::{Address, CanonicalizationError, Cid, PeerId, ValidationError};
use smkt_fsm::FsmError;
use thiserror::Error;

// ── Orchestrators ────────────────────────────────────────────────────

/// Errors returned by [`StorageProvider`](crate::StorageProvider) operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No deal is registered under this proposal cid.
    #[error("deal {0} not found")]
    DealNotFound(Cid),

    /// Imported bytes do not hash to the piece commitment of the proposal.
    #[error("piece commitment mismatch for deal {proposal}: expected {expected}, got {actual}")]
    CommitmentMismatch {
        /// The deal.
        proposal: Cid,
        /// Commitment carried by the proposal.
        expected: Cid,
        /// Commitment of the supplied bytes.
        actual: Cid,
    },

    /// Data was imported for a deal that is not waiting for manual data.
    #[error("deal {proposal} is not awaiting data (state {state})")]
    NotAwaitingData {
        /// The deal.
        proposal: Cid,
        /// Its current state.
        state: String,
    },

    /// The provider was stopped and refuses new deal streams.
    #[error("provider is not accepting new deals")]
    NotAccepting,

    /// No ask is posted for this miner.
    #[error("no storage ask posted for {0}")]
    AskNotFound(Address),

    /// The deal engine rejected an operation.
    #[error("deal engine: {0}")]
    Fsm(#[from] FsmError),

    /// A chain call failed.
    #[error("chain: {0}")]
    Chain(#[from] ChainError),

    /// The chain watcher could not be started.
    #[error("events: {0}")]
    Events(#[from] EventsError),

    /// Piece commitment could not be computed.
    #[error("piece commitment: {0}")]
    Piece(#[from] PieceIoError),

    /// Staging the piece failed.
    #[error("file store: {0}")]
    FileStore(#[from] FileStoreError),

    /// Reading from or writing to a session failed.
    #[error("network: {0}")]
    Network(#[from] NetworkError),

    /// A proposal cid could not be derived.
    #[error("canonicalization: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

/// Errors returned by [`StorageClient`](crate::StorageClient) operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No local deal is registered under this proposal cid.
    #[error("local deal {0} not found")]
    DealNotFound(Cid),

    /// An ask response came from a different miner than the one asked.
    #[error("ask answered by {actual}, expected {expected}")]
    WrongMiner {
        /// Miner the request named.
        expected: Address,
        /// Miner in the response.
        actual: Address,
    },

    /// Neither a piece commitment nor payload bytes were supplied.
    #[error("piece data not set for a {0} transfer")]
    PieceDataNotSet(String),

    /// The padded piece does not fit in one of the provider's sectors.
    #[error("padded piece size {piece} exceeds sector size {sector}")]
    PieceSizeGreaterSectorSize {
        /// Padded piece size in bytes.
        piece: u64,
        /// Sector size in bytes.
        sector: u64,
    },

    /// The deal engine rejected an operation.
    #[error("deal engine: {0}")]
    Fsm(#[from] FsmError),

    /// A chain call failed.
    #[error("chain: {0}")]
    Chain(#[from] ChainError),

    /// The chain watcher could not be started.
    #[error("events: {0}")]
    Events(#[from] EventsError),

    /// Reading from or writing to a session failed.
    #[error("network: {0}")]
    Network(#[from] NetworkError),

    /// Piece commitment could not be computed.
    #[error("piece commitment: {0}")]
    Piece(#[from] PieceIoError),

    /// The payload could not be exposed for pulling.
    #[error("data transfer: {0}")]
    Transfer(#[from] DataTransferError),

    /// A proposal cid could not be derived.
    #[error("canonicalization: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment variable holds a malformed value.
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),

    /// A value failed domain validation.
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

// ── Collaborators ────────────────────────────────────────────────────

/// Network session failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The session was closed by either side.
    #[error("session closed")]
    Closed,

    /// The peer sent a message of another type than expected.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: &'static str,
        /// Received message type.
        actual: &'static str,
    },

    /// No route to this peer.
    #[error("peer {0} is not reachable")]
    PeerNotFound(PeerId),
}

/// Piece commitment failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceIoError {
    /// The payload is empty.
    #[error("cannot commit to an empty piece")]
    EmptyPiece,

    /// The padded payload does not fit one sector.
    #[error("piece of {size} padded bytes exceeds the {sector_size} byte sector")]
    PieceTooLarge {
        /// Padded size.
        size: u64,
        /// Sector size of the proof.
        sector_size: u64,
    },
}

/// Staging area failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileStoreError {
    /// Nothing is staged at this path.
    #[error("no staged file at {0}")]
    NotFound(PathBuf),

    /// The underlying storage failed.
    #[error("i/o error at {path}: {reason}")]
    Io {
        /// Path of the failing operation.
        path: PathBuf,
        /// OS error message.
        reason: String,
    },
}

impl FileStoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io {
                path,
                reason: err.to_string(),
            }
        }
    }
}

/// Data transfer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataTransferError {
    /// The counter-party does not serve this payload root.
    #[error("payload {0} is not available")]
    PayloadNotFound(Cid),

    /// The transfer was aborted.
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

/// Sealing pipeline failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealingError {
    /// The pipeline refused the deal.
    #[error("sealing pipeline rejected deal: {0}")]
    Rejected(String),
}

/// Piece index failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceStoreError {
    /// No deal is recorded for this piece.
    #[error("piece {0} not found")]
    PieceNotFound(Cid),

    /// The index could not be written.
    #[error("piece store unavailable: {0}")]
    Unavailable(String),
}
