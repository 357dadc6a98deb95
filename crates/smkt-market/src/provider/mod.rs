//! # Storage Provider
//!
//! Accepts deal proposals from clients and drives each one through the
//! provider chart in [`chart`] until it is sealed and indexed, or fails.
//!
//! ## Entry points
//!
//! - [`StorageProvider::handle_deal_stream`] reads one proposal, registers
//!   the deal and fires `Open`. Everything after that is chart-driven.
//! - [`StorageProvider::import_data_for_deal`] supplies the payload of a
//!   manual-transfer deal parked in `WaitingForData`.
//! - [`StorageProvider::handle_ask_stream`] answers one ask request.
//!
//! The provider implements [`StorageReceiver`], so it can be registered
//! with a network that hands it inbound sessions directly.

pub mod chart;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use smkt_chain::{ChainApi, Events, MarketBalance};
use smkt_core::{Address, Cid, TokenAmount};
use smkt_fsm::Fsm;

use crate::ask::StoredAsk;
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::filestore::{piece_file, FileStore};
use crate::network::{AskSession, DealSession, SessionTable, StorageReceiver};
use crate::piece::PieceIo;
use crate::sealing::{PieceStore, SectorSealer};
use crate::status::StorageDealStatus;
use crate::transfer::DataTransfer;
use crate::types::{AskResponse, DealSnapshot, MinerDeal, StorageAsk};

pub use chart::{ProviderEvent, ProviderEventKind, ProviderMachine};

use chart::{transition_table, ProviderEnv};

/// A provider deal with its status and transition history.
pub type ProviderDealSnapshot = DealSnapshot<MinerDeal, ProviderEventKind>;

/// Collaborators a provider is wired to.
#[derive(Clone)]
pub struct ProviderDeps {
    /// Chain node.
    pub chain: Arc<dyn ChainApi>,
    /// Sector commitment watcher. May be shared with a client.
    pub events: Arc<Events>,
    /// Piece commitment.
    pub piece_io: Arc<dyn PieceIo>,
    /// Payload transfer.
    pub transfer: Arc<dyn DataTransfer>,
    /// Staging area.
    pub filestore: Arc<dyn FileStore>,
    /// Sealing pipeline.
    pub sealer: Arc<dyn SectorSealer>,
    /// Piece index.
    pub piece_store: Arc<dyn PieceStore>,
}

struct ProviderInner {
    env: Arc<ProviderEnv>,
    fsm: Fsm<ProviderMachine>,
    stopped: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// The provider side of the storage market.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct StorageProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider")
            .field("actor", &self.inner.env.config.actor)
            .field("deals", &self.inner.fsm.len())
            .field("sessions", &self.inner.env.sessions.len())
            .finish()
    }
}

impl StorageProvider {
    /// Build a provider. The chart is validated here; nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: ProviderConfig, deps: ProviderDeps) -> Result<Self, ProviderError> {
        let asks = StoredAsk::new(
            Arc::clone(&deps.chain),
            config.actor,
            config.min_piece_size,
            config.max_piece_size,
        );
        let env = Arc::new(ProviderEnv {
            config,
            chain: deps.chain,
            events: deps.events,
            piece_io: deps.piece_io,
            transfer: deps.transfer,
            filestore: deps.filestore,
            sealer: deps.sealer,
            piece_store: deps.piece_store,
            asks,
            sessions: SessionTable::new(),
        });
        let fsm = Fsm::new(transition_table(&env))?;
        Ok(Self {
            inner: Arc::new(ProviderInner {
                env,
                fsm,
                stopped: AtomicBool::new(false),
                ticker: Mutex::new(None),
            }),
        })
    }

    /// The miner actor this provider serves.
    pub fn address(&self) -> Address {
        self.inner.env.config.actor
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the chain watcher and the ticker, and post the configured
    /// ask if none is posted yet. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), ProviderError> {
        let env = &self.inner.env;
        env.events.run()?;
        if env.asks.get_ask(&env.config.actor).is_err() {
            env.asks.add_ask(
                env.config.ask_price,
                env.config.ask_verified_price,
                env.config.ask_duration,
            )?;
        }
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_none() {
            *ticker = Some(self.inner.fsm.run_ticker(env.config.tick_interval)?);
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        tracing::info!(miner = %env.config.actor, peer = %env.config.peer.id, "storage provider started");
        Ok(())
    }

    /// Refuse new deal streams and stop ticking. Deals in flight keep
    /// their state; pending polls resume if the provider is started again.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.inner.ticker.lock().take() {
            ticker.abort();
        }
        tracing::info!(miner = %self.inner.env.config.actor, "storage provider stopped");
    }

    /// Run pending polls once. Returns the number of events they produced.
    pub fn tick(&self) -> usize {
        self.inner.fsm.tick()
    }

    // ── Streams ──────────────────────────────────────────────────────

    /// Answer one ask request and close the session.
    pub async fn handle_ask_stream(&self, session: Arc<dyn AskSession>) -> Result<(), ProviderError> {
        let result = self.answer_ask(session.as_ref()).await;
        session.close();
        if let Err(err) = &result {
            tracing::debug!(peer = %session.remote_peer().id, error = %err, "ask request not answered");
        }
        result
    }

    async fn answer_ask(&self, session: &dyn AskSession) -> Result<(), ProviderError> {
        let request = session.read_ask_request().await?;
        let ask = self.inner.env.asks.get_ask(&request.miner)?;
        session.write_ask_response(&AskResponse { ask })?;
        Ok(())
    }

    /// Read a proposal from `session` and start its deal. Returns the
    /// proposal cid.
    ///
    /// The session stays open and is answered by the chart, either on
    /// publication or on failure.
    pub async fn handle_deal_stream(&self, session: Arc<dyn DealSession>) -> Result<Cid, ProviderError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            session.close();
            return Err(ProviderError::NotAccepting);
        }
        let result = self.open_deal(&session).await;
        if let Err(err) = &result {
            tracing::warn!(peer = %session.remote_peer().id, error = %err, "deal stream refused");
            session.close();
        }
        result
    }

    async fn open_deal(&self, session: &Arc<dyn DealSession>) -> Result<Cid, ProviderError> {
        let env = &self.inner.env;
        let proposal = session.read_proposal().await?;
        let proposal_cid = proposal.deal_proposal.proposal_cid()?;

        let deal = MinerDeal {
            client_deal_proposal: proposal.deal_proposal,
            proposal_cid,
            miner: env.config.peer.clone(),
            client: session.remote_peer(),
            data_ref: proposal.piece,
            add_funds_cid: None,
            publish_cid: None,
            deal_id: None,
            sector: None,
            offset: None,
            piece_path: None,
            metadata_path: None,
            connection_closed: false,
            message: String::new(),
            created_at: Utc::now(),
        };
        self.inner.fsm.begin(proposal_cid, deal, StorageDealStatus::Unknown)?;
        env.sessions.insert(proposal_cid, Arc::clone(session));
        tracing::info!(
            proposal_cid = %proposal_cid.short(), client = %session.remote_peer().id,
            "deal proposal received"
        );
        self.inner.fsm.send(&proposal_cid, ProviderEvent::Open)?;
        Ok(proposal_cid)
    }

    // ── Manual import ────────────────────────────────────────────────

    /// Supply the payload of a manual-transfer deal.
    ///
    /// Bytes that do not match the proposal's piece commitment fail the
    /// deal and return [`ProviderError::CommitmentMismatch`]. Staging
    /// failures are returned without touching the deal, so the import can
    /// be retried.
    pub fn import_data_for_deal(&self, proposal_cid: &Cid, data: &[u8]) -> Result<(), ProviderError> {
        let env = &self.inner.env;
        let (proposal, root) = self
            .inner
            .fsm
            .inspect(proposal_cid, |state, deal, _| {
                (state, deal.client_deal_proposal.proposal.clone(), deal.data_ref.root)
            })
            .map_err(|_| ProviderError::DealNotFound(*proposal_cid))
            .and_then(|(state, proposal, root)| {
                if state == StorageDealStatus::WaitingForData {
                    Ok((proposal, root))
                } else {
                    Err(ProviderError::NotAwaitingData {
                        proposal: *proposal_cid,
                        state: state.name().to_string(),
                    })
                }
            })?;

        let (actual, size) = env.piece_io.generate_piece_commitment(env.config.seal_proof, data)?;
        if actual != proposal.piece_cid {
            let reason = format!(
                "imported piece commitment {} does not match proposal {}",
                actual.short(),
                proposal.piece_cid.short()
            );
            self.inner
                .fsm
                .send(proposal_cid, ProviderEvent::GeneratePieceCIDFailed(reason))?;
            return Err(ProviderError::CommitmentMismatch {
                proposal: *proposal_cid,
                expected: proposal.piece_cid,
                actual,
            });
        }

        let piece_path = env.filestore.stage(&piece_file(proposal_cid), data)?;
        let metadata_path = env.stage_metadata(proposal_cid, &proposal, root, size)?;
        self.inner.fsm.update(proposal_cid, |_, deal| {
            deal.piece_path = Some(piece_path);
            deal.metadata_path = Some(metadata_path);
        })?;
        tracing::info!(proposal_cid = %proposal_cid.short(), bytes = data.len(), "manual data imported");
        self.inner.fsm.send(proposal_cid, ProviderEvent::VerifiedData)?;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// One deal with its history.
    pub fn get_deal(&self, proposal_cid: &Cid) -> Result<ProviderDealSnapshot, ProviderError> {
        self.inner
            .fsm
            .inspect(proposal_cid, |state, deal, log| DealSnapshot {
                state,
                deal: deal.clone(),
                history: log.to_vec(),
            })
            .map_err(|_| ProviderError::DealNotFound(*proposal_cid))
    }

    /// Every deal, oldest first.
    pub fn list_deals(&self) -> Vec<ProviderDealSnapshot> {
        let mut deals: Vec<_> = self
            .inner
            .fsm
            .keys()
            .iter()
            .filter_map(|cid| self.get_deal(cid).ok())
            .collect();
        deals.sort_by_key(|d| d.deal.created_at);
        deals
    }

    /// Deals not yet in a terminal state.
    pub fn list_incomplete_deals(&self) -> Vec<ProviderDealSnapshot> {
        self.list_deals().into_iter().filter(|d| !d.is_terminal()).collect()
    }

    // ── Asks and collateral ──────────────────────────────────────────

    /// Post a new ask valid for `duration` epochs.
    pub fn add_ask(&self, price: TokenAmount, duration: i64) -> Result<StorageAsk, ProviderError> {
        let env = &self.inner.env;
        env.asks.add_ask(price, env.config.ask_verified_price, duration)
    }

    /// Asks posted by `miner`: this provider's current ask, or nothing.
    pub fn list_asks(&self, miner: &Address) -> Vec<StorageAsk> {
        self.inner.env.asks.get_ask(miner).into_iter().collect()
    }

    /// Market escrow of the provider actor.
    pub fn get_storage_collateral(&self) -> Result<MarketBalance, ProviderError> {
        let env = &self.inner.env;
        let tsk = env.chain.chain_head()?.key()?;
        Ok(env.chain.market_get_balance(&env.config.actor, &tsk)?)
    }

    /// Deposit `amount` into the provider actor's escrow from its worker.
    /// Returns the message cid.
    pub fn add_storage_collateral(&self, amount: TokenAmount) -> Result<Cid, ProviderError> {
        let env = &self.inner.env;
        let tsk = env.chain.chain_head()?.key()?;
        let worker = env.chain.state_miner_info(&env.config.actor, &tsk)?.worker;
        Ok(env.chain.market_add_balance(&worker, &env.config.actor, amount)?)
    }
}

impl StorageReceiver for StorageProvider {
    fn accept_deal_stream(&self, session: Arc<dyn DealSession>) {
        let Ok(handle) = Handle::try_current() else {
            tracing::error!("deal stream dropped: no tokio runtime");
            session.close();
            return;
        };
        let provider = self.clone();
        handle.spawn(async move {
            let _ = provider.handle_deal_stream(session).await;
        });
    }

    fn accept_ask_stream(&self, session: Arc<dyn AskSession>) {
        let Ok(handle) = Handle::try_current() else {
            tracing::error!("ask stream dropped: no tokio runtime");
            session.close();
            return;
        };
        let provider = self.clone();
        handle.spawn(async move {
            let _ = provider.handle_ask_stream(session).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_chain::{MinerInfo, MockChain};
    use smkt_core::{PeerId, PeerInfo, RegisteredProof};

    use crate::filestore::MemoryFileStore;
    use crate::network::MemoryStream;
    use crate::piece::Sha256PieceIo;
    use crate::sealing::{MemoryPieceStore, MockSealer};
    use crate::transfer::MemoryDataTransfer;
    use crate::types::AskRequest;

    const MINER: Address = Address::from_id(1000);
    const WORKER: Address = Address::from_id(1001);

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(PeerId::new(name).unwrap(), format!("/memory/{name}"))
    }

    fn provider() -> StorageProvider {
        let chain = Arc::new(MockChain::new());
        chain.add_miner(
            MINER,
            MinerInfo {
                owner: MINER,
                worker: WORKER,
                peer_id: None,
                seal_proof: RegisteredProof::StackedDrg2KiBV1,
            },
        );
        let deps = ProviderDeps {
            chain: chain.clone(),
            events: Arc::new(Events::new(chain.clone())),
            piece_io: Arc::new(Sha256PieceIo),
            transfer: Arc::new(MemoryDataTransfer::new()),
            filestore: Arc::new(MemoryFileStore::new()),
            sealer: Arc::new(MockSealer::new(chain, MINER, WORKER, RegisteredProof::StackedDrg2KiBV1)),
            piece_store: Arc::new(MemoryPieceStore::new()),
        };
        StorageProvider::new(ProviderConfig::local(MINER, peer("provider")).unwrap(), deps).unwrap()
    }

    #[tokio::test]
    async fn start_posts_the_default_ask() {
        let provider = provider();
        assert!(provider.list_asks(&MINER).is_empty());
        provider.start().unwrap();
        let asks = provider.list_asks(&MINER);
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].seq_no, 0);

        let ask = provider.add_ask(TokenAmount::from_atto(7), 100).unwrap();
        assert_eq!(ask.seq_no, 1);
        assert!(provider.list_asks(&Address::from_id(9)).is_empty());
        provider.stop();
    }

    #[tokio::test]
    async fn ask_stream_is_answered_and_closed() {
        let provider = provider();
        provider.start().unwrap();
        let (client, server) = MemoryStream::pair(peer("client"), peer("provider"));
        client.write_ask_request(&AskRequest { miner: MINER }).unwrap();
        provider.handle_ask_stream(Arc::new(server)).await.unwrap();

        let response = client.read_ask_response().await.unwrap();
        assert_eq!(response.ask.miner, MINER);
        assert!(client.read_ask_response().await.is_err());
        provider.stop();
    }

    #[tokio::test]
    async fn stopped_provider_refuses_deal_streams() {
        let provider = provider();
        provider.start().unwrap();
        provider.stop();
        let (client, server) = MemoryStream::pair(peer("client"), peer("provider"));
        let err = provider.handle_deal_stream(Arc::new(server)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotAccepting));
        assert!(DealSession::is_closed(&client));
    }

    #[test]
    fn unknown_deals_are_reported() {
        let provider = provider();
        let cid = Cid::digest(b"nothing");
        assert!(matches!(provider.get_deal(&cid), Err(ProviderError::DealNotFound(_))));
        assert!(matches!(
            provider.import_data_for_deal(&cid, b"data"),
            Err(ProviderError::DealNotFound(_))
        ));
        assert!(provider.list_deals().is_empty());
    }

    #[test]
    fn collateral_is_deposited_from_the_worker() {
        let provider = provider();
        assert_eq!(provider.get_storage_collateral().unwrap(), MarketBalance::default());
        provider.add_storage_collateral(TokenAmount::from_atto(500)).unwrap();
        assert_eq!(
            provider.get_storage_collateral().unwrap().available(),
            TokenAmount::from_atto(500)
        );
    }
}
