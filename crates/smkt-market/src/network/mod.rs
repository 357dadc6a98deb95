//! # Network Session Layer
//!
//! Typed message sessions between client and provider. Two protocols run
//! over them:
//!
//! - **ask**: the client writes an [`AskRequest`], the provider answers
//!   with an [`AskResponse`] and closes.
//! - **deal**: the client writes a [`Proposal`]; the provider later
//!   answers with one [`ProposalResponse`], either on publication or on
//!   failure.
//!
//! Reads return futures; writes are non-blocking and fail only when the
//! session is closed. The wire encoding is the transport's concern.
//!
//! Orchestrators keep their open sessions in a [`SessionTable`] keyed by
//! proposal cid, separate from the deal records, so chart actions can
//! reply on the right session without the record owning it.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use smkt_core::{Cid, PeerInfo};

use crate::error::NetworkError;
use crate::types::{AskRequest, AskResponse, Proposal, ProposalResponse};

pub use memory::{MemoryEndpoint, MemoryNetwork, MemoryStream};

/// A pending read.
pub type ReadFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, NetworkError>> + Send + 'a>>;

/// A deal protocol session.
pub trait DealSession: Send + Sync {
    /// The peer on the other end.
    fn remote_peer(&self) -> PeerInfo;

    /// Read the client's proposal.
    fn read_proposal(&self) -> ReadFuture<'_, Proposal>;

    /// Send a proposal to the provider.
    fn write_proposal(&self, proposal: &Proposal) -> Result<(), NetworkError>;

    /// Read the provider's response.
    fn read_response(&self) -> ReadFuture<'_, ProposalResponse>;

    /// Send a response to the client.
    fn write_response(&self, response: &ProposalResponse) -> Result<(), NetworkError>;

    /// Close both directions. Idempotent.
    fn close(&self);

    /// Whether either side has closed the session.
    fn is_closed(&self) -> bool;
}

/// An ask protocol session.
pub trait AskSession: Send + Sync {
    /// The peer on the other end.
    fn remote_peer(&self) -> PeerInfo;

    /// Read an ask request.
    fn read_ask_request(&self) -> ReadFuture<'_, AskRequest>;

    /// Send an ask request.
    fn write_ask_request(&self, request: &AskRequest) -> Result<(), NetworkError>;

    /// Read an ask response.
    fn read_ask_response(&self) -> ReadFuture<'_, AskResponse>;

    /// Send an ask response.
    fn write_ask_response(&self, response: &AskResponse) -> Result<(), NetworkError>;

    /// Close both directions. Idempotent.
    fn close(&self);
}

/// Opens sessions to providers.
pub trait ClientNetwork: Send + Sync {
    /// Open a deal session to `peer`.
    fn new_deal_stream(&self, peer: &PeerInfo) -> Result<Arc<dyn DealSession>, NetworkError>;

    /// Open an ask session to `peer`.
    fn new_ask_stream(&self, peer: &PeerInfo) -> Result<Arc<dyn AskSession>, NetworkError>;
}

/// Accepts inbound sessions on the provider side.
pub trait StorageReceiver: Send + Sync {
    /// Take ownership of an inbound deal session.
    fn accept_deal_stream(&self, session: Arc<dyn DealSession>);

    /// Take ownership of an inbound ask session.
    fn accept_ask_stream(&self, session: Arc<dyn AskSession>);
}

/// Open deal sessions keyed by proposal cid.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<Cid, Arc<dyn DealSession>>>,
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("open", &self.sessions.read().len())
            .finish()
    }
}

impl SessionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a session is already registered for `proposal`.
    /// Returns whether the session was inserted.
    pub fn insert(&self, proposal: Cid, session: Arc<dyn DealSession>) -> bool {
        use std::collections::hash_map::Entry;
        match self.sessions.write().entry(proposal) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(session);
                true
            }
        }
    }

    /// The session of `proposal`, if open.
    pub fn get(&self, proposal: &Cid) -> Option<Arc<dyn DealSession>> {
        self.sessions.read().get(proposal).cloned()
    }

    /// Remove and close the session of `proposal`. Returns whether one was open.
    pub fn close(&self, proposal: &Cid) -> bool {
        let session = self.sessions.write().remove(proposal);
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_core::PeerId;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(PeerId::new(name).unwrap(), format!("/memory/{name}"))
    }

    #[test]
    fn session_table_inserts_once_and_closes() {
        let (a, b) = MemoryStream::pair(peer("client"), peer("provider"));
        let table = SessionTable::new();
        let cid = Cid::digest(b"proposal");

        assert!(table.insert(cid, Arc::new(a)));
        let (c, _d) = MemoryStream::pair(peer("client"), peer("provider"));
        assert!(!table.insert(cid, Arc::new(c)));
        assert_eq!(table.len(), 1);

        assert!(table.close(&cid));
        assert!(DealSession::is_closed(&b));
        assert!(table.get(&cid).is_none());
        assert!(!table.close(&cid));
    }
}
