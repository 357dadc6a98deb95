//! The provider's currently posted ask.

use std::sync::Arc;

use parking_lot::RwLock;

use smkt_chain::ChainApi;
use smkt_core::{Address, ChainEpoch, PaddedPieceSize, TokenAmount};

use crate::error::ProviderError;
use crate::types::StorageAsk;

/// Holds the one ask a provider advertises.
///
/// Reposting replaces the ask and bumps its sequence number so clients
/// can tell a stale copy from a fresh one.
pub struct StoredAsk {
    chain: Arc<dyn ChainApi>,
    actor: Address,
    min_piece_size: PaddedPieceSize,
    max_piece_size: PaddedPieceSize,
    current: RwLock<Option<StorageAsk>>,
}

impl std::fmt::Debug for StoredAsk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredAsk")
            .field("actor", &self.actor)
            .field("current", &*self.current.read())
            .finish()
    }
}

impl StoredAsk {
    /// An empty ask book for `actor` accepting pieces in `[min, max]`.
    pub fn new(
        chain: Arc<dyn ChainApi>,
        actor: Address,
        min_piece_size: PaddedPieceSize,
        max_piece_size: PaddedPieceSize,
    ) -> Self {
        Self {
            chain,
            actor,
            min_piece_size,
            max_piece_size,
            current: RwLock::new(None),
        }
    }

    /// Post a new ask valid for `duration` epochs from the chain head.
    pub fn add_ask(
        &self,
        price: TokenAmount,
        verified_price: TokenAmount,
        duration: ChainEpoch,
    ) -> Result<StorageAsk, ProviderError> {
        let head = self.chain.chain_head()?;
        let mut current = self.current.write();
        let ask = StorageAsk {
            price,
            verified_price,
            min_piece_size: self.min_piece_size,
            max_piece_size: self.max_piece_size,
            miner: self.actor,
            timestamp: head.height,
            expiry: head.height + duration,
            seq_no: current.as_ref().map_or(0, |a| a.seq_no + 1),
        };
        tracing::info!(
            miner = %self.actor, price = %price, expiry = ask.expiry, seq_no = ask.seq_no,
            "storage ask posted"
        );
        *current = Some(ask.clone());
        Ok(ask)
    }

    /// The ask of `miner`. Only this provider's own ask is known.
    pub fn get_ask(&self, miner: &Address) -> Result<StorageAsk, ProviderError> {
        if *miner != self.actor {
            return Err(ProviderError::AskNotFound(*miner));
        }
        self.current
            .read()
            .clone()
            .ok_or(ProviderError::AskNotFound(*miner))
    }
}
