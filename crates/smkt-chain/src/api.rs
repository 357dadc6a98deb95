//! # Chain API
//!
//! The remote calls the market makes against a chain node. All of them are
//! fallible; callers inside the deal charts translate failures into
//! failure events instead of propagating them.

use tokio::sync::mpsc::UnboundedReceiver;

use smkt_core::{Address, Cid, TokenAmount};

use crate::actors::market::ClientDealProposal;
use crate::error::ChainError;
use crate::types::{HeadChange, MarketBalance, MinerInfo, MsgLookup, Tipset, TipsetKey, UnsignedMessage};

/// Chain node interface consumed by the orchestrators and the watcher.
///
/// Implementations must be cheap to call from synchronous contexts: the
/// deal charts invoke them from actions and tick-driven pollers.
pub trait ChainApi: Send + Sync {
    /// The current head tipset.
    fn chain_head(&self) -> Result<Tipset, ChainError>;

    /// Miner actor info at `tsk`.
    fn state_miner_info(&self, miner: &Address, tsk: &TipsetKey) -> Result<MinerInfo, ChainError>;

    /// Make sure `address` has at least `amount` of unlocked market escrow,
    /// topping it up from `wallet` if needed. Returns the cid of the top-up
    /// message, or `None` when the balance already suffices.
    fn market_ensure_available(
        &self,
        address: &Address,
        wallet: &Address,
        amount: TokenAmount,
        tsk: &TipsetKey,
    ) -> Result<Option<Cid>, ChainError>;

    /// Market escrow balance of `address` at `tsk`.
    fn market_get_balance(&self, address: &Address, tsk: &TipsetKey) -> Result<MarketBalance, ChainError>;

    /// Unconditionally deposit `amount` from `wallet` into the escrow of
    /// `address`. Returns the message cid.
    fn market_add_balance(
        &self,
        wallet: &Address,
        address: &Address,
        amount: TokenAmount,
    ) -> Result<Cid, ChainError>;

    /// Push a publish-storage-deals message signed by `worker`. Returns the
    /// message cid.
    fn publish_storage_deals(
        &self,
        worker: &Address,
        deals: Vec<ClientDealProposal>,
    ) -> Result<Cid, ChainError>;

    /// Look up where a message landed. `None` while it is still pending.
    fn state_search_msg(&self, message: &Cid) -> Result<Option<MsgLookup>, ChainError>;

    /// Load a message by cid.
    fn chain_get_message(&self, message: &Cid) -> Result<UnsignedMessage, ChainError>;

    /// Subscribe to head changes. The first batch holds the current head.
    fn chain_notify(&self) -> Result<UnboundedReceiver<Vec<HeadChange>>, ChainError>;
}
