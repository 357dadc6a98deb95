#![deny(missing_docs)]

//! # smkt-chain — Chain Collaborator Contracts
//!
//! Everything the deal lifecycle needs to know about the chain, and no
//! more:
//!
//! - [`types`]: tipsets, head changes, messages, receipts, miner info.
//! - [`actors`]: method numbers and parameter types of the storage market
//!   and miner actors, including the [`DealProposal`] both parties sign.
//! - [`api`]: the [`ChainApi`] trait the orchestrators call.
//! - [`mock`]: [`MockChain`], an in-memory chain that executes the market
//!   methods the orchestrators use and lets tests inject arbitrary blocks.
//! - [`events`]: the [`Events`] watcher that turns a precommit followed by
//!   a prove-commit into a one-shot sector commitment notification.

pub mod actors;
pub mod api;
pub mod error;
pub mod events;
pub mod mock;
pub mod types;

pub use actors::market::{ClientDealProposal, DealProposal};
pub use api::ChainApi;
pub use error::{ChainError, EventsError};
pub use events::{Events, SectorCommitWatch};
pub use mock::MockChain;
pub use types::{
    BlockHeader, ExitCode, HeadChange, HeadChangeType, MarketBalance, MessageReceipt, MethodNum,
    MinerInfo, MsgLookup, Tipset, TipsetKey, UnsignedMessage,
};
