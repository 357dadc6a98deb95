//! # Storage Client
//!
//! Proposes deals to providers and follows each one through the client
//! chart in [`chart`]: escrow, proposal, the provider's response, and
//! activation of the sector holding the deal.
//!
//! The client opens one deal session per proposal. The provider answers
//! on that session exactly once, after publishing the deal or after
//! failing it.

pub mod chart;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use smkt_chain::{ChainApi, ClientDealProposal, DealProposal, Events, MarketBalance};
use smkt_core::{Address, ChainEpoch, Cid, TokenAmount, UnpaddedPieceSize};
use smkt_fsm::Fsm;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::network::{ClientNetwork, SessionTable};
use crate::piece::PieceIo;
use crate::status::StorageDealStatus;
use crate::transfer::DataTransfer;
use crate::types::{AskRequest, ClientDeal, DataRef, DealSnapshot, StorageAsk, StorageProviderInfo, TransferType};

pub use chart::{ClientEvent, ClientEventKind, ClientMachine};

use chart::{transition_table, ClientEnv};

/// A client deal with its status and transition history.
pub type ClientDealSnapshot = DealSnapshot<ClientDeal, ClientEventKind>;

/// Collaborators a client is wired to.
#[derive(Clone)]
pub struct ClientDeps {
    /// Chain node.
    pub chain: Arc<dyn ChainApi>,
    /// Sector commitment watcher. May be shared with a provider.
    pub events: Arc<Events>,
    /// Piece commitment.
    pub piece_io: Arc<dyn PieceIo>,
    /// Payload transfer.
    pub transfer: Arc<dyn DataTransfer>,
    /// Opens sessions to providers.
    pub network: Arc<dyn ClientNetwork>,
}

/// Terms of a new deal.
#[derive(Debug, Clone)]
pub struct ProposeStorageDealParams {
    /// The provider to store with.
    pub provider: StorageProviderInfo,
    /// Payload reference. A preset piece commitment is used as is.
    pub data_ref: DataRef,
    /// Payload bytes. Required unless the commitment is preset; exposed
    /// for pulling on graphsync transfers.
    pub payload: Option<Vec<u8>>,
    /// First epoch of the deal.
    pub start_epoch: ChainEpoch,
    /// Last epoch of the deal.
    pub end_epoch: ChainEpoch,
    /// Price per epoch for the whole piece.
    pub price: TokenAmount,
    /// Collateral the provider must lock.
    pub collateral: TokenAmount,
    /// Free-form label recorded on chain.
    pub label: String,
    /// Whether the deal uses verified data cap.
    pub verified: bool,
}

/// The client side of the storage market.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct StorageClient {
    env: Arc<ClientEnv>,
    piece_io: Arc<dyn PieceIo>,
    transfer: Arc<dyn DataTransfer>,
    network: Arc<dyn ClientNetwork>,
    fsm: Fsm<ClientMachine>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("address", &self.env.config.address)
            .field("deals", &self.fsm.len())
            .finish()
    }
}

impl StorageClient {
    /// Build a client. Nothing runs until [`start`](Self::start).
    pub fn new(config: ClientConfig, deps: ClientDeps) -> Result<Self, ClientError> {
        let env = Arc::new(ClientEnv {
            config,
            chain: deps.chain,
            events: deps.events,
            sessions: SessionTable::new(),
        });
        let fsm = Fsm::new(transition_table(&env))?;
        Ok(Self {
            env,
            piece_io: deps.piece_io,
            transfer: deps.transfer,
            network: deps.network,
            fsm,
            ticker: Arc::new(Mutex::new(None)),
        })
    }

    /// The paying account.
    pub fn address(&self) -> Address {
        self.env.config.address
    }

    /// Start the chain watcher and the ticker. Must run inside a tokio
    /// runtime.
    pub fn start(&self) -> Result<(), ClientError> {
        self.env.events.run()?;
        let mut ticker = self.ticker.lock();
        if ticker.is_none() {
            *ticker = Some(self.fsm.run_ticker(self.env.config.tick_interval)?);
        }
        tracing::info!(client = %self.env.config.address, "storage client started");
        Ok(())
    }

    /// Stop ticking. Deals in flight keep their state.
    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        tracing::info!(client = %self.env.config.address, "storage client stopped");
    }

    /// Run pending polls once.
    pub fn tick(&self) -> usize {
        self.fsm.tick()
    }

    // ── Deals ────────────────────────────────────────────────────────

    /// Commitment and size of a payload.
    pub fn calculate_comm_p(&self, data: &[u8]) -> Result<(Cid, UnpaddedPieceSize), ClientError> {
        Ok(self
            .piece_io
            .generate_piece_commitment(self.env.config.seal_proof, data)?)
    }

    /// Propose a deal and start following it. Returns the proposal cid.
    pub fn propose_storage_deal(&self, params: ProposeStorageDealParams) -> Result<Cid, ClientError> {
        let ProposeStorageDealParams {
            provider,
            data_ref,
            payload,
            start_epoch,
            end_epoch,
            price,
            collateral,
            label,
            verified,
        } = params;

        let (piece_cid, size) = match (data_ref.piece_cid, data_ref.piece_size, payload.as_deref()) {
            (Some(cid), Some(size), _) => (cid, size),
            (_, _, Some(bytes)) => self.calculate_comm_p(bytes)?,
            _ => return Err(ClientError::PieceDataNotSet(data_ref.transfer_type.to_string())),
        };
        let piece_size = size.padded();
        if piece_size.bytes() > provider.sector_size {
            return Err(ClientError::PieceSizeGreaterSectorSize {
                piece: piece_size.bytes(),
                sector: provider.sector_size,
            });
        }
        if data_ref.transfer_type == TransferType::Graphsync {
            if let Some(bytes) = payload {
                self.transfer.expose(data_ref.root, bytes)?;
            }
        }

        let client_deal_proposal = ClientDealProposal {
            proposal: DealProposal {
                piece_cid,
                piece_size,
                verified_deal: verified,
                client: self.env.config.address,
                provider: provider.address,
                label,
                start_epoch,
                end_epoch,
                storage_price_per_epoch: price,
                provider_collateral: collateral,
                client_collateral: TokenAmount::ZERO,
            },
            client_signature: Vec::new(),
        };
        let proposal_cid = client_deal_proposal.proposal_cid()?;
        let session = self.network.new_deal_stream(&provider.peer_info)?;

        let deal = ClientDeal {
            client_deal_proposal,
            proposal_cid,
            miner: provider,
            data_ref: data_ref.with_piece(piece_cid, size),
            add_funds_cid: None,
            publish_message: None,
            deal_id: None,
            connection_closed: false,
            message: String::new(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.fsm.begin(proposal_cid, deal, StorageDealStatus::Unknown) {
            session.close();
            return Err(err.into());
        }
        self.env.sessions.insert(proposal_cid, session);
        tracing::info!(proposal_cid = %proposal_cid.short(), "deal proposed");
        self.fsm.send(&proposal_cid, ClientEvent::Open)?;
        Ok(proposal_cid)
    }

    /// One local deal with its history.
    pub fn get_local_deal(&self, proposal_cid: &Cid) -> Result<ClientDealSnapshot, ClientError> {
        self.fsm
            .inspect(proposal_cid, |state, deal, log| DealSnapshot {
                state,
                deal: deal.clone(),
                history: log.to_vec(),
            })
            .map_err(|_| ClientError::DealNotFound(*proposal_cid))
    }

    /// Every local deal, oldest first.
    pub fn list_local_deals(&self) -> Vec<ClientDealSnapshot> {
        let mut deals: Vec<_> = self
            .fsm
            .keys()
            .iter()
            .filter_map(|cid| self.get_local_deal(cid).ok())
            .collect();
        deals.sort_by_key(|d| d.deal.created_at);
        deals
    }

    // ── Asks and escrow ──────────────────────────────────────────────

    /// Query a provider's current ask.
    pub async fn get_ask(&self, provider: &StorageProviderInfo) -> Result<StorageAsk, ClientError> {
        let session = self.network.new_ask_stream(&provider.peer_info)?;
        let result = async {
            session.write_ask_request(&AskRequest {
                miner: provider.address,
            })?;
            Ok::<_, ClientError>(session.read_ask_response().await?)
        }
        .await;
        session.close();

        let ask = result?.ask;
        if ask.miner != provider.address {
            return Err(ClientError::WrongMiner {
                expected: provider.address,
                actual: ask.miner,
            });
        }
        Ok(ask)
    }

    /// Market escrow of `address`.
    pub fn get_payment_escrow(&self, address: &Address) -> Result<MarketBalance, ClientError> {
        let tsk = self.env.chain.chain_head()?.key()?;
        Ok(self.env.chain.market_get_balance(address, &tsk)?)
    }

    /// Deposit `amount` into the escrow of `address` from the client
    /// wallet. Returns the message cid.
    pub fn add_payment_escrow(&self, address: &Address, amount: TokenAmount) -> Result<Cid, ClientError> {
        Ok(self
            .env
            .chain
            .market_add_balance(&self.env.config.wallet, address, amount)?)
    }
}
