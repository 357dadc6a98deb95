//! In-process sessions for tests and the demo node.
//!
//! A [`MemoryStream`] pair is two unbounded channels. Frames written
//! before a close stay readable; once the writer closes and its buffer
//! is drained, reads fail with [`NetworkError::Closed`]. Closing either
//! end makes further writes on both ends fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use smkt_core::{PeerId, PeerInfo};

use super::{AskSession, ClientNetwork, DealSession, ReadFuture, StorageReceiver};
use crate::error::NetworkError;
use crate::types::{AskRequest, AskResponse, Proposal, ProposalResponse};

#[derive(Debug)]
enum Frame {
    Proposal(Proposal),
    Response(ProposalResponse),
    AskRequest(AskRequest),
    AskResponse(AskResponse),
}

impl Frame {
    fn name(&self) -> &'static str {
        match self {
            Frame::Proposal(_) => "proposal",
            Frame::Response(_) => "response",
            Frame::AskRequest(_) => "ask request",
            Frame::AskResponse(_) => "ask response",
        }
    }
}

/// One end of an in-memory session.
pub struct MemoryStream {
    remote: PeerInfo,
    tx: Mutex<Option<UnboundedSender<Frame>>>,
    rx: tokio::sync::Mutex<UnboundedReceiver<Frame>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("remote", &self.remote.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStream {
    /// A connected pair: the first end belongs to `client`, the second
    /// to `provider`.
    pub fn pair(client: PeerInfo, provider: PeerInfo) -> (MemoryStream, MemoryStream) {
        let (to_provider, from_client) = mpsc::unbounded_channel();
        let (to_client, from_provider) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let client_end = MemoryStream {
            remote: provider,
            tx: Mutex::new(Some(to_provider)),
            rx: tokio::sync::Mutex::new(from_provider),
            closed: Arc::clone(&closed),
        };
        let provider_end = MemoryStream {
            remote: client,
            tx: Mutex::new(Some(to_client)),
            rx: tokio::sync::Mutex::new(from_client),
            closed,
        };
        (client_end, provider_end)
    }

    fn write(&self, frame: Frame) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(NetworkError::Closed)?;
        tx.send(frame).map_err(|_| NetworkError::Closed)
    }

    fn read<T: Send + 'static>(
        &self,
        expected: &'static str,
        extract: fn(Frame) -> Result<T, Frame>,
    ) -> ReadFuture<'_, T> {
        Box::pin(async move {
            let frame = self.rx.lock().await.recv().await.ok_or(NetworkError::Closed)?;
            extract(frame).map_err(|other| NetworkError::UnexpectedMessage {
                expected,
                actual: other.name(),
            })
        })
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }
}

impl DealSession for MemoryStream {
    fn remote_peer(&self) -> PeerInfo {
        self.remote.clone()
    }

    fn read_proposal(&self) -> ReadFuture<'_, Proposal> {
        self.read("proposal", |f| match f {
            Frame::Proposal(p) => Ok(p),
            other => Err(other),
        })
    }

    fn write_proposal(&self, proposal: &Proposal) -> Result<(), NetworkError> {
        self.write(Frame::Proposal(proposal.clone()))
    }

    fn read_response(&self) -> ReadFuture<'_, ProposalResponse> {
        self.read("response", |f| match f {
            Frame::Response(r) => Ok(r),
            other => Err(other),
        })
    }

    fn write_response(&self, response: &ProposalResponse) -> Result<(), NetworkError> {
        self.write(Frame::Response(response.clone()))
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AskSession for MemoryStream {
    fn remote_peer(&self) -> PeerInfo {
        self.remote.clone()
    }

    fn read_ask_request(&self) -> ReadFuture<'_, AskRequest> {
        self.read("ask request", |f| match f {
            Frame::AskRequest(r) => Ok(r),
            other => Err(other),
        })
    }

    fn write_ask_request(&self, request: &AskRequest) -> Result<(), NetworkError> {
        self.write(Frame::AskRequest(request.clone()))
    }

    fn read_ask_response(&self) -> ReadFuture<'_, AskResponse> {
        self.read("ask response", |f| match f {
            Frame::AskResponse(r) => Ok(r),
            other => Err(other),
        })
    }

    fn write_ask_response(&self, response: &AskResponse) -> Result<(), NetworkError> {
        self.write(Frame::AskResponse(response.clone()))
    }

    fn close(&self) {
        self.shutdown();
    }
}

/// Routes sessions to registered providers by peer id.
#[derive(Default)]
pub struct MemoryNetwork {
    receivers: RwLock<HashMap<PeerId, Arc<dyn StorageReceiver>>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("receivers", &self.receivers.read().len())
            .finish()
    }
}

impl MemoryNetwork {
    /// An empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route sessions for `peer` to `receiver`, replacing any earlier one.
    pub fn register(&self, peer: PeerId, receiver: Arc<dyn StorageReceiver>) {
        tracing::debug!(peer = %peer, "memory network: receiver registered");
        self.receivers.write().insert(peer, receiver);
    }

    /// Stop routing sessions for `peer`.
    pub fn unregister(&self, peer: &PeerId) -> bool {
        self.receivers.write().remove(peer).is_some()
    }

    /// A client endpoint dialing from `local`.
    pub fn endpoint(self: &Arc<Self>, local: PeerInfo) -> MemoryEndpoint {
        MemoryEndpoint {
            network: Arc::clone(self),
            local,
        }
    }

    fn receiver(&self, peer: &PeerId) -> Result<Arc<dyn StorageReceiver>, NetworkError> {
        self.receivers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer.clone()))
    }
}

/// The dialing side of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    network: Arc<MemoryNetwork>,
    local: PeerInfo,
}

impl ClientNetwork for MemoryEndpoint {
    fn new_deal_stream(&self, peer: &PeerInfo) -> Result<Arc<dyn DealSession>, NetworkError> {
        let receiver = self.network.receiver(&peer.id)?;
        let (mine, theirs) = MemoryStream::pair(self.local.clone(), peer.clone());
        receiver.accept_deal_stream(Arc::new(theirs));
        Ok(Arc::new(mine))
    }

    fn new_ask_stream(&self, peer: &PeerInfo) -> Result<Arc<dyn AskSession>, NetworkError> {
        let receiver = self.network.receiver(&peer.id)?;
        let (mine, theirs) = MemoryStream::pair(self.local.clone(), peer.clone());
        receiver.accept_ask_stream(Arc::new(theirs));
        Ok(Arc::new(mine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_core::{Address, Cid};

    use crate::status::StorageDealStatus;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(PeerId::new(name).unwrap(), format!("/memory/{name}"))
    }

    fn response() -> ProposalResponse {
        ProposalResponse {
            state: StorageDealStatus::Failing,
            message: "no".into(),
            proposal: Cid::digest(b"p"),
            publish_message: None,
        }
    }

    #[tokio::test]
    async fn frames_written_before_close_stay_readable() {
        let (client, provider) = MemoryStream::pair(peer("c"), peer("p"));
        assert_eq!(DealSession::remote_peer(&client).id.as_str(), "p");
        assert_eq!(DealSession::remote_peer(&provider).id.as_str(), "c");

        provider.write_response(&response()).unwrap();
        DealSession::close(&provider);

        assert_eq!(client.read_response().await.unwrap(), response());
        assert_eq!(client.read_response().await, Err(NetworkError::Closed));
        assert_eq!(client.write_proposal(&proposal()), Err(NetworkError::Closed));
    }

    #[tokio::test]
    async fn unexpected_frame_is_reported() {
        let (client, provider) = MemoryStream::pair(peer("c"), peer("p"));
        client
            .write_ask_request(&AskRequest {
                miner: Address::from_id(1),
            })
            .unwrap();
        assert_eq!(
            provider.read_proposal().await,
            Err(NetworkError::UnexpectedMessage {
                expected: "proposal",
                actual: "ask request",
            })
        );
    }

    #[test]
    fn dialing_an_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let endpoint = network.endpoint(peer("c"));
        assert!(matches!(
            endpoint.new_deal_stream(&peer("nobody")),
            Err(NetworkError::PeerNotFound(_))
        ));
    }

    fn proposal() -> Proposal {
        use smkt_chain::{ClientDealProposal, DealProposal};
        use smkt_core::{PaddedPieceSize, TokenAmount};
        Proposal {
            deal_proposal: ClientDealProposal {
                proposal: DealProposal {
                    piece_cid: Cid::digest(b"piece"),
                    piece_size: PaddedPieceSize::new(128).unwrap(),
                    verified_deal: false,
                    client: Address::from_id(100),
                    provider: Address::from_id(1000),
                    label: String::new(),
                    start_epoch: 10,
                    end_epoch: 20,
                    storage_price_per_epoch: TokenAmount::ZERO,
                    provider_collateral: TokenAmount::ZERO,
                    client_collateral: TokenAmount::ZERO,
                },
                client_signature: Vec::new(),
            },
            piece: crate::types::DataRef::manual(Cid::digest(b"root")),
        }
    }
}
