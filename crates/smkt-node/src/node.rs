//! # Local Node Wiring
//!
//! One provider and one client sharing a [`MockChain`], a
//! [`MemoryNetwork`] and a [`MockSealer`]. The provider is registered on
//! the network under its configured peer id, so the client reaches it the
//! same way it would reach a remote miner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use smkt_chain::{Events, MinerInfo, MockChain};
use smkt_market::{
    ClientConfig, ClientDeps, FileStore, LocalFileStore, MemoryDataTransfer, MemoryFileStore,
    MemoryNetwork, MemoryPieceStore, MockSealer, ProviderConfig, ProviderDeps, Sha256PieceIo,
    StorageClient, StorageProvider, StorageProviderInfo,
};

/// Interval between checks while waiting on deal progress.
const POLL: Duration = Duration::from_millis(20);

/// A provider and a client wired to shared in-memory collaborators.
pub struct LocalNode {
    /// The simulated chain.
    pub chain: Arc<MockChain>,
    /// Payload transfer shared by both parties.
    pub transfer: Arc<MemoryDataTransfer>,
    /// Sealing pipeline of the provider.
    pub sealer: MockSealer,
    /// The storage provider.
    pub provider: StorageProvider,
    /// The storage client.
    pub client: StorageClient,
    provider_info: StorageProviderInfo,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("provider", &self.provider)
            .field("client", &self.client)
            .finish()
    }
}

impl LocalNode {
    /// Register the miner on a fresh chain and wire both parties.
    ///
    /// The miner's owner and worker are its own actor address. Pieces
    /// are staged on disk when `provider.staging_dir` is set.
    pub fn new(provider: ProviderConfig, client: ClientConfig) -> anyhow::Result<Self> {
        let chain = Arc::new(MockChain::new());
        chain.add_miner(
            provider.actor,
            MinerInfo {
                owner: provider.actor,
                worker: provider.actor,
                peer_id: Some(provider.peer.id.clone()),
                seal_proof: provider.seal_proof,
            },
        );
        let provider_info = StorageProviderInfo {
            address: provider.actor,
            owner: provider.actor,
            worker: provider.actor,
            sector_size: provider.seal_proof.sector_size(),
            peer_info: provider.peer.clone(),
        };

        let filestore: Arc<dyn FileStore> = match &provider.staging_dir {
            Some(dir) => Arc::new(
                LocalFileStore::new(dir)
                    .with_context(|| format!("opening staging directory {}", dir.display()))?,
            ),
            None => Arc::new(MemoryFileStore::new()),
        };
        let events = Arc::new(Events::new(chain.clone()));
        let transfer = Arc::new(MemoryDataTransfer::new());
        let sealer = MockSealer::new(chain.clone(), provider.actor, provider.actor, provider.seal_proof);

        let provider_peer = provider.peer.id.clone();
        let provider = StorageProvider::new(
            provider,
            ProviderDeps {
                chain: chain.clone(),
                events: events.clone(),
                piece_io: Arc::new(Sha256PieceIo),
                transfer: transfer.clone(),
                filestore,
                sealer: Arc::new(sealer.clone()),
                piece_store: Arc::new(MemoryPieceStore::new()),
            },
        )
        .context("building storage provider")?;

        let network = MemoryNetwork::new();
        network.register(provider_peer, Arc::new(provider.clone()));
        let endpoint = network.endpoint(client.peer.clone());
        let client = StorageClient::new(
            client,
            ClientDeps {
                chain: chain.clone(),
                events,
                piece_io: Arc::new(Sha256PieceIo),
                transfer: transfer.clone(),
                network: Arc::new(endpoint),
            },
        )
        .context("building storage client")?;

        Ok(Self {
            chain,
            transfer,
            sealer,
            provider,
            client,
            provider_info,
        })
    }

    /// How the client addresses the provider.
    pub fn provider_info(&self) -> &StorageProviderInfo {
        &self.provider_info
    }

    /// Start both parties. Must run inside a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        self.provider.start().context("starting provider")?;
        self.client.start().context("starting client")?;
        Ok(())
    }

    /// Stop both parties.
    pub fn stop(&self) {
        self.client.stop();
        self.provider.stop();
    }
}

/// Poll `check` until it returns `true` or `timeout` elapses.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let waited = tokio::time::timeout(timeout, async {
        loop {
            if check()? {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    match waited {
        Ok(result) => result,
        Err(_) => anyhow::bail!("timed out after {timeout:?} waiting for {what}"),
    }
}

/// Run `fut` with the node started, stopping it afterwards.
pub async fn with_started<T, Fut>(node: &LocalNode, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    node.start()?;
    let result = fut.await;
    node.stop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_core::{Address, PeerId, PeerInfo};

    fn node() -> LocalNode {
        let provider = ProviderConfig::local(
            Address::from_id(1000),
            PeerInfo::new(PeerId::new("provider").unwrap(), "/memory/provider"),
        )
        .unwrap();
        let client = ClientConfig::local(
            Address::from_id(100),
            PeerInfo::new(PeerId::new("client").unwrap(), "/memory/client"),
        );
        LocalNode::new(provider, client).unwrap()
    }

    #[tokio::test]
    async fn client_reaches_the_registered_provider() {
        let node = node();
        let ask = with_started(&node, async {
            Ok::<_, anyhow::Error>(node.client.get_ask(node.provider_info()).await?)
        })
        .await
        .unwrap();
        assert_eq!(ask.miner, Address::from_id(1000));
    }

    #[tokio::test]
    async fn waiting_times_out() {
        let err = wait_until("nothing", Duration::from_millis(50), || Ok(false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
