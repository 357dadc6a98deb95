#![deny(missing_docs)]

//! # smkt-market — Storage Deal Orchestration
//!
//! The two parties of a storage deal, each driving its own view of the
//! deal through a chart on the [`smkt_fsm`] engine:
//!
//! - [`StorageProvider`] validates proposals, receives the payload,
//!   verifies its commitment, locks collateral, publishes the deal, hands
//!   it to sealing and waits for the sector to be proven.
//! - [`StorageClient`] funds escrow, sends the proposal, reads the
//!   provider's response and waits for the same sector commitment.
//!
//! ## Collaborators
//!
//! Everything outside the charts sits behind a trait with an in-memory
//! implementation next to it: [`ChainApi`](smkt_chain::ChainApi) and the
//! [`Events`](smkt_chain::Events) watcher from `smkt-chain`, plus
//! [`PieceIo`], [`DataTransfer`], [`FileStore`], [`SectorSealer`],
//! [`PieceStore`] and the session traits in [`network`].
//!
//! ## Failure model
//!
//! Public operations return [`ProviderError`] or [`ClientError`]. Once a
//! deal is registered, collaborator failures never surface as errors:
//! they drive the deal to `Failing` and then `Error`, with the reason
//! recorded on the deal record.

pub mod ask;
pub mod client;
pub mod config;
pub mod error;
pub mod filestore;
pub mod network;
pub mod piece;
pub mod provider;
pub mod publish;
pub mod sealing;
pub mod status;
pub mod transfer;
pub mod types;

pub use ask::StoredAsk;
pub use client::{ClientDealSnapshot, ClientDeps, ProposeStorageDealParams, StorageClient};
pub use config::{ClientConfig, ProviderConfig};
pub use error::{
    ClientError, ConfigError, DataTransferError, FileStoreError, NetworkError, PieceIoError,
    PieceStoreError, ProviderError, SealingError,
};
pub use filestore::{FileStore, LocalFileStore, MemoryFileStore};
pub use network::{ClientNetwork, DealSession, MemoryNetwork, StorageReceiver};
pub use piece::{PieceIo, Sha256PieceIo};
pub use provider::{ProviderDealSnapshot, ProviderDeps, StorageProvider};
pub use sealing::{MemoryPieceStore, MockSealer, PieceStore, SectorSealer};
pub use status::StorageDealStatus;
pub use transfer::{DataTransfer, MemoryDataTransfer};
pub use types::{
    ClientDeal, DataRef, DealSnapshot, MinerDeal, StorageAsk, StorageProviderInfo, TransferType,
};
