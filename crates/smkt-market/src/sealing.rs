//! # Sealing Hand-off and Piece Index
//!
//! Once a deal is published the provider hands its piece to the sealing
//! pipeline and forgets about it until the chain reports the sector
//! proven. Activation is observed through the Events watcher, never
//! through the pipeline itself.
//!
//! After activation the piece is recorded in the piece store so that
//! retrieval can later find which sector holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use smkt_chain::actors::miner::{
    ProveCommitSectorParams, SectorPreCommitInfo, PRE_COMMIT_SECTOR, PROVE_COMMIT_SECTOR,
};
use smkt_chain::types::encode;
use smkt_chain::{ChainError, MockChain, UnsignedMessage};
use smkt_core::{Address, ChainEpoch, Cid, DealId, PaddedPieceSize, RegisteredProof, SectorNumber, TokenAmount};

use crate::error::{PieceStoreError, SealingError};

// ── Sealing ──────────────────────────────────────────────────────────

/// What the sealing pipeline needs to know about a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealInfo {
    /// On-chain deal id.
    pub deal_id: DealId,
    /// Proposal the deal came from.
    pub proposal_cid: Cid,
    /// Piece commitment.
    pub piece_cid: Cid,
    /// Padded piece size.
    pub piece_size: PaddedPieceSize,
    /// Epoch by which the sector must be proven.
    pub start_epoch: ChainEpoch,
    /// Epoch at which the deal ends.
    pub end_epoch: ChainEpoch,
}

/// Where the pipeline placed a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingResult {
    /// The sector the piece was packed into.
    pub sector: SectorNumber,
    /// Offset of the piece within the sector, in padded bytes.
    pub offset: u64,
}

/// The provider's sealing pipeline.
pub trait SectorSealer: Send + Sync {
    /// Accept a published deal's piece for sealing.
    fn hand_off(&self, deal: DealInfo, piece: &[u8]) -> Result<PackingResult, SealingError>;
}

struct SealerInner {
    chain: Arc<MockChain>,
    miner: Address,
    worker: Address,
    proof: RegisteredProof,
    next_sector: Mutex<u64>,
    queue: Mutex<Vec<(SectorNumber, DealId)>>,
    reject: AtomicBool,
}

impl SealerInner {
    /// Land the precommit and prove-commit of `sector` if it is still queued.
    fn seal(&self, sector: SectorNumber) -> Result<bool, ChainError> {
        let deal = {
            let mut queue = self.queue.lock();
            let Some(pos) = queue.iter().position(|(s, _)| *s == sector) else {
                return Ok(false);
            };
            queue.remove(pos).1
        };
        let precommit = SectorPreCommitInfo {
            seal_proof: self.proof,
            sector_number: sector,
            sealed_cid: Cid::digest(format!("{}/sealed/{sector}", self.miner).as_bytes()),
            seal_rand_epoch: self.chain.height(),
            deal_ids: vec![deal],
            expiration: self.chain.height() + 1_000_000,
        };
        let prove = ProveCommitSectorParams {
            sector_number: sector,
            proof: Vec::new(),
        };
        let message = |nonce, method, params| UnsignedMessage {
            to: self.miner,
            from: self.worker,
            nonce,
            value: TokenAmount::ZERO,
            method,
            params,
        };
        self.chain.apply_messages(vec![
            message(sector.0 * 2, PRE_COMMIT_SECTOR, encode(PRE_COMMIT_SECTOR, &precommit)?),
            message(sector.0 * 2 + 1, PROVE_COMMIT_SECTOR, encode(PROVE_COMMIT_SECTOR, &prove)?),
        ])?;
        tracing::info!(miner = %self.miner, sector = %sector, deal_id = %deal, "sector sealed");
        Ok(true)
    }
}

/// A sealing pipeline that commits sectors straight to a [`MockChain`].
///
/// Each hand-off gets its own sector. Sectors are committed when
/// [`seal_pending`](Self::seal_pending) is called or, with auto-sealing
/// on, after a delay on the tokio runtime.
#[derive(Clone)]
pub struct MockSealer {
    inner: Arc<SealerInner>,
    auto_seal: Option<Duration>,
}

impl std::fmt::Debug for MockSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSealer")
            .field("miner", &self.inner.miner)
            .field("queued", &self.inner.queue.lock().len())
            .field("auto_seal", &self.auto_seal)
            .finish()
    }
}

impl MockSealer {
    /// A sealer for `miner` whose messages are sent by `worker`.
    pub fn new(chain: Arc<MockChain>, miner: Address, worker: Address, proof: RegisteredProof) -> Self {
        Self {
            inner: Arc::new(SealerInner {
                chain,
                miner,
                worker,
                proof,
                next_sector: Mutex::new(1),
                queue: Mutex::new(Vec::new()),
                reject: AtomicBool::new(false),
            }),
            auto_seal: None,
        }
    }

    /// Commit each handed-off sector `delay` after the hand-off.
    pub fn with_auto_seal(mut self, delay: Duration) -> Self {
        self.auto_seal = Some(delay);
        self
    }

    /// Reject every further hand-off.
    pub fn set_reject(&self, reject: bool) {
        self.inner.reject.store(reject, Ordering::SeqCst);
    }

    /// Sectors handed off but not yet committed.
    pub fn queued(&self) -> Vec<SectorNumber> {
        self.inner.queue.lock().iter().map(|(s, _)| *s).collect()
    }

    /// Commit every queued sector. Returns how many were committed.
    pub fn seal_pending(&self) -> Result<usize, ChainError> {
        let mut sealed = 0;
        for sector in self.queued() {
            if self.inner.seal(sector)? {
                sealed += 1;
            }
        }
        Ok(sealed)
    }
}

impl SectorSealer for MockSealer {
    fn hand_off(&self, deal: DealInfo, piece: &[u8]) -> Result<PackingResult, SealingError> {
        if self.inner.reject.load(Ordering::SeqCst) {
            return Err(SealingError::Rejected("sealer is not accepting deals".into()));
        }
        if piece.is_empty() {
            return Err(SealingError::Rejected(format!("empty piece for deal {}", deal.deal_id)));
        }
        let sector = {
            let mut next = self.inner.next_sector.lock();
            let sector = SectorNumber(*next);
            *next += 1;
            sector
        };
        self.inner.queue.lock().push((sector, deal.deal_id));
        tracing::debug!(deal_id = %deal.deal_id, sector = %sector, "deal handed off");

        if let Some(delay) = self.auto_seal {
            match Handle::try_current() {
                Ok(handle) => {
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(err) = inner.seal(sector) {
                            tracing::warn!(sector = %sector, error = %err, "auto-seal failed");
                        }
                    });
                }
                Err(_) => tracing::warn!(sector = %sector, "no runtime, sector left queued"),
            }
        }
        Ok(PackingResult { sector, offset: 0 })
    }
}

// ── Piece store ──────────────────────────────────────────────────────

/// A deal holding a piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceDealInfo {
    /// On-chain deal id.
    pub deal_id: DealId,
    /// Sector holding the piece.
    pub sector: SectorNumber,
    /// Offset within the sector.
    pub offset: u64,
    /// Padded piece length.
    pub length: PaddedPieceSize,
}

/// Every deal known to hold a piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    /// The piece.
    pub piece_cid: Cid,
    /// Deals holding it.
    pub deals: Vec<PieceDealInfo>,
}

/// Index from pieces to the sectors holding them.
pub trait PieceStore: Send + Sync {
    /// Record that `deal` holds `piece_cid`. Recording the same deal twice
    /// is a no-op.
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal: PieceDealInfo) -> Result<(), PieceStoreError>;

    /// Deals holding `piece_cid`.
    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, PieceStoreError>;
}

/// Piece index held in memory.
#[derive(Debug, Default)]
pub struct MemoryPieceStore {
    pieces: RwLock<HashMap<Cid, PieceInfo>>,
    unavailable: AtomicBool,
}

impl MemoryPieceStore {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl PieceStore for MemoryPieceStore {
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal: PieceDealInfo) -> Result<(), PieceStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PieceStoreError::Unavailable("piece store offline".into()));
        }
        let mut pieces = self.pieces.write();
        let info = pieces.entry(*piece_cid).or_insert_with(|| PieceInfo {
            piece_cid: *piece_cid,
            deals: Vec::new(),
        });
        if !info.deals.iter().any(|d| d.deal_id == deal.deal_id) {
            info.deals.push(deal);
        }
        Ok(())
    }

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, PieceStoreError> {
        self.pieces
            .read()
            .get(piece_cid)
            .cloned()
            .ok_or(PieceStoreError::PieceNotFound(*piece_cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_chain::ChainApi;

    fn info(deal: u64) -> DealInfo {
        DealInfo {
            deal_id: DealId(deal),
            proposal_cid: Cid::digest(b"proposal"),
            piece_cid: Cid::digest(b"piece"),
            piece_size: PaddedPieceSize::new(128).unwrap(),
            start_epoch: 10,
            end_epoch: 100,
        }
    }

    fn sealer() -> (Arc<MockChain>, MockSealer) {
        let chain = Arc::new(MockChain::new());
        let sealer = MockSealer::new(
            chain.clone(),
            Address::from_id(1000),
            Address::from_id(1001),
            RegisteredProof::StackedDrg2KiBV1,
        );
        (chain, sealer)
    }

    #[test]
    fn hand_offs_get_distinct_sectors_and_seal_on_demand() {
        let (chain, sealer) = sealer();
        let a = sealer.hand_off(info(1), b"a").unwrap();
        let b = sealer.hand_off(info(2), b"b").unwrap();
        assert_ne!(a.sector, b.sector);
        assert_eq!(sealer.queued().len(), 2);

        let before = chain.height();
        assert_eq!(sealer.seal_pending().unwrap(), 2);
        assert!(sealer.queued().is_empty());
        assert_eq!(chain.height(), before + 2);

        let head = chain.chain_head().unwrap();
        let methods: Vec<_> = head.blocks[0]
            .messages
            .iter()
            .map(|cid| chain.chain_get_message(cid).unwrap().method)
            .collect();
        assert_eq!(methods, vec![PRE_COMMIT_SECTOR, PROVE_COMMIT_SECTOR]);
    }

    #[test]
    fn rejecting_sealer_fails_hand_off() {
        let (_chain, sealer) = sealer();
        sealer.set_reject(true);
        assert!(matches!(
            sealer.hand_off(info(1), b"a"),
            Err(SealingError::Rejected(_))
        ));
        assert!(sealer.queued().is_empty());
    }

    #[tokio::test]
    async fn auto_seal_commits_after_delay() {
        let (chain, sealer) = sealer();
        let sealer = sealer.with_auto_seal(Duration::from_millis(5));
        sealer.hand_off(info(1), b"a").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sealer.queued().is_empty());
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn piece_store_records_each_deal_once() {
        let store = MemoryPieceStore::new();
        let piece = Cid::digest(b"piece");
        let deal = PieceDealInfo {
            deal_id: DealId(1),
            sector: SectorNumber(3),
            offset: 0,
            length: PaddedPieceSize::new(128).unwrap(),
        };
        store.add_deal_for_piece(&piece, deal.clone()).unwrap();
        store.add_deal_for_piece(&piece, deal).unwrap();
        assert_eq!(store.get_piece_info(&piece).unwrap().deals.len(), 1);

        let other = Cid::digest(b"other");
        assert_eq!(
            store.get_piece_info(&other),
            Err(PieceStoreError::PieceNotFound(other))
        );

        store.set_unavailable(true);
        assert!(store
            .add_deal_for_piece(
                &piece,
                PieceDealInfo {
                    deal_id: DealId(2),
                    sector: SectorNumber(4),
                    offset: 0,
                    length: PaddedPieceSize::new(128).unwrap(),
                }
            )
            .is_err());
    }
}
