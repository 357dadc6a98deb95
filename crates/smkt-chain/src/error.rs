//! Chain and watcher errors.

use smkt_core::{Address, CanonicalizationError, Cid};
use thiserror::Error;

/// Failure of a chain API call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The node could not be reached or refused the call.
    #[error("chain node unavailable: {0}")]
    Unavailable(String),

    /// No message with this cid is known.
    #[error("message {0} not found")]
    MessageNotFound(Cid),

    /// The address is not a registered miner.
    #[error("miner {0} not found")]
    MinerNotFound(Address),

    /// The sending wallet cannot cover a message value.
    #[error("insufficient funds in {wallet}: need {needed}, have {available}")]
    InsufficientFunds {
        /// The wallet charged.
        wallet: Address,
        /// Required amount.
        needed: String,
        /// Available amount.
        available: String,
    },

    /// Method parameters or return values could not be encoded or decoded.
    #[error("codec error for method {method}: {reason}")]
    Codec {
        /// The actor method number.
        method: u64,
        /// Decoder message.
        reason: String,
    },

    /// A message cid could not be computed.
    #[error("cannot compute message cid: {0}")]
    Cid(String),
}

impl From<CanonicalizationError> for ChainError {
    fn from(e: CanonicalizationError) -> Self {
        Self::Cid(e.to_string())
    }
}

/// Failure of the Events watcher lifecycle.
#[derive(Error, Debug)]
pub enum EventsError {
    /// Subscribing to head changes failed.
    #[error("chain notify subscription failed: {0}")]
    Subscribe(#[from] ChainError),

    /// `run` was called outside a tokio runtime.
    #[error("events watcher requires a tokio runtime")]
    NoRuntime,

    /// `run` was called after `stop`.
    #[error("events watcher was stopped")]
    Stopped,
}
