//! # Data Transfer
//!
//! Pull transfers of deal payloads from client to provider. Opening a
//! pull returns at once; the payload arrives later on a oneshot channel
//! that the provider chart awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::oneshot;

use smkt_core::{Cid, PeerInfo};

use crate::error::DataTransferError;

/// Outcome of a pull, delivered once.
pub type TransferOutcome = oneshot::Receiver<Result<Vec<u8>, DataTransferError>>;

/// A request to pull a deal's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// The deal the transfer belongs to.
    pub proposal_cid: Cid,
    /// Root of the payload.
    pub root: Cid,
    /// Peer serving the payload.
    pub from: PeerInfo,
}

/// Moves payloads between parties.
pub trait DataTransfer: Send + Sync {
    /// Make `data` available to pulls of `root`.
    fn expose(&self, root: Cid, data: Vec<u8>) -> Result<(), DataTransferError>;

    /// Start pulling a payload.
    fn open_pull(&self, request: PullRequest) -> Result<TransferOutcome, DataTransferError>;
}

/// Transfers between parties sharing one process.
///
/// Every exposed payload is visible to every pull, regardless of peer.
#[derive(Debug, Default)]
pub struct MemoryDataTransfer {
    payloads: RwLock<HashMap<Cid, Vec<u8>>>,
    refuse: AtomicBool,
}

impl MemoryDataTransfer {
    /// An empty transfer hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to open new pulls.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl DataTransfer for MemoryDataTransfer {
    fn expose(&self, root: Cid, data: Vec<u8>) -> Result<(), DataTransferError> {
        self.payloads.write().insert(root, data);
        Ok(())
    }

    fn open_pull(&self, request: PullRequest) -> Result<TransferOutcome, DataTransferError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DataTransferError::Aborted("transfers refused".into()));
        }
        let (tx, rx) = oneshot::channel();
        let outcome = self
            .payloads
            .read()
            .get(&request.root)
            .cloned()
            .ok_or(DataTransferError::PayloadNotFound(request.root));
        tracing::debug!(
            proposal_cid = %request.proposal_cid.short(), root = %request.root.short(),
            from = %request.from.id, found = outcome.is_ok(),
            "pull opened"
        );
        // The receiver is returned below, so the send cannot fail.
        let _ = tx.send(outcome);
        Ok(rx)
    }
}
