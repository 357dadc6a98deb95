//! Shared wiring for the market integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use smkt_chain::{ChainApi, ClientDealProposal, DealProposal, Events, MarketBalance, MinerInfo, MockChain};
use smkt_core::{Address, Cid, PeerId, PeerInfo, RegisteredProof, TokenAmount};
use smkt_market::network::MemoryStream;
use smkt_market::types::Proposal;
use smkt_market::{
    ClientConfig, ClientDeps, DataRef, DealSession, MemoryDataTransfer, MemoryFileStore, MemoryNetwork,
    MemoryPieceStore, MockSealer, PieceIo, ProviderConfig, ProviderDeps, Sha256PieceIo,
    StorageClient, StorageDealStatus, StorageProvider, StorageProviderInfo,
};

pub const MINER: Address = Address::from_id(1000);
pub const WORKER: Address = Address::from_id(1001);
pub const CLIENT: Address = Address::from_id(100);
pub const PROOF: RegisteredProof = RegisteredProof::StackedDrg2KiBV1;

pub const PAYLOAD: &[u8] = b"the quick brown fox stores a piece";

pub fn peer(name: &str) -> PeerInfo {
    PeerInfo::new(PeerId::new(name).unwrap(), format!("/memory/{name}"))
}

pub fn provider_info() -> StorageProviderInfo {
    StorageProviderInfo {
        address: MINER,
        owner: MINER,
        worker: WORKER,
        sector_size: PROOF.sector_size(),
        peer_info: peer("provider"),
    }
}

/// A provider wired to in-memory collaborators, with handles on each.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub events: Arc<Events>,
    pub transfer: Arc<MemoryDataTransfer>,
    pub filestore: Arc<MemoryFileStore>,
    pub sealer: MockSealer,
    pub piece_store: Arc<MemoryPieceStore>,
    pub network: Arc<MemoryNetwork>,
    pub provider: StorageProvider,
}

impl Harness {
    pub fn new() -> Self {
        let chain = Arc::new(MockChain::new());
        chain.add_miner(
            MINER,
            MinerInfo {
                owner: MINER,
                worker: WORKER,
                peer_id: Some(peer("provider").id),
                seal_proof: PROOF,
            },
        );
        let events = Arc::new(Events::new(chain.clone()));
        let transfer = Arc::new(MemoryDataTransfer::new());
        let filestore = Arc::new(MemoryFileStore::new());
        let sealer = MockSealer::new(chain.clone(), MINER, WORKER, PROOF);
        let piece_store = Arc::new(MemoryPieceStore::new());
        let deps = ProviderDeps {
            chain: chain.clone(),
            events: events.clone(),
            piece_io: Arc::new(Sha256PieceIo),
            transfer: transfer.clone(),
            filestore: filestore.clone(),
            sealer: Arc::new(sealer.clone()),
            piece_store: piece_store.clone(),
        };
        let config = ProviderConfig::local(MINER, peer("provider")).unwrap();
        let provider = StorageProvider::new(config, deps).unwrap();

        let network = MemoryNetwork::new();
        network.register(peer("provider").id, Arc::new(provider.clone()));

        Self {
            chain,
            events,
            transfer,
            filestore,
            sealer,
            piece_store,
            network,
            provider,
        }
    }

    /// Give the client enough escrow for any test deal.
    pub fn fund_client(&self) {
        self.chain.set_escrow(
            CLIENT,
            MarketBalance {
                escrow: TokenAmount::from_atto(1_000_000),
                locked: TokenAmount::ZERO,
            },
        );
    }

    /// A client on the same chain and network, with its own watcher.
    pub fn client(&self) -> StorageClient {
        let deps = ClientDeps {
            chain: self.chain.clone(),
            events: Arc::new(Events::new(self.chain.clone())),
            piece_io: Arc::new(Sha256PieceIo),
            transfer: self.transfer.clone(),
            network: Arc::new(self.network.endpoint(peer("client"))),
        };
        StorageClient::new(ClientConfig::local(CLIENT, peer("client")), deps).unwrap()
    }

    /// Open a deal stream carrying `proposal` and hand it to the provider.
    pub async fn open_deal(&self, proposal: Proposal) -> (MemoryStream, Cid) {
        let (client_end, provider_end) = MemoryStream::pair(peer("client"), peer("provider"));
        client_end.write_proposal(&proposal).unwrap();
        let cid = self
            .provider
            .handle_deal_stream(Arc::new(provider_end))
            .await
            .unwrap();
        (client_end, cid)
    }

    pub fn state(&self, cid: &Cid) -> StorageDealStatus {
        self.provider.get_deal(cid).unwrap().state
    }

    /// Wait until the provider deal reaches `want`.
    pub async fn wait_for(&self, cid: &Cid, want: StorageDealStatus) -> bool {
        eventually(|| self.state(cid) == want).await
    }

    pub fn head_height(&self) -> i64 {
        self.chain.chain_head().unwrap().height
    }
}

/// A proposal for `payload` with the given price per epoch.
pub fn proposal(data_ref: DataRef, payload: &[u8], price: u128) -> Proposal {
    let (piece_cid, size) = Sha256PieceIo.generate_piece_commitment(PROOF, payload).unwrap();
    Proposal {
        deal_proposal: ClientDealProposal {
            proposal: DealProposal {
                piece_cid,
                piece_size: size.padded(),
                verified_deal: false,
                client: CLIENT,
                provider: MINER,
                label: "test".into(),
                start_epoch: 1_000,
                end_epoch: 1_100,
                storage_price_per_epoch: TokenAmount::from_atto(price),
                provider_collateral: TokenAmount::ZERO,
                client_collateral: TokenAmount::ZERO,
            },
            client_signature: Vec::new(),
        },
        piece: data_ref,
    }
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
