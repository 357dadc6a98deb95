//! # Events Watcher
//!
//! Bridges chain observation to one-shot, deal-scoped notifications.
//!
//! A watch registered with [`Events::on_deal_sector_committed`] resolves
//! the first time the watcher sees, in order:
//!
//! 1. a `PreCommitSector` message to the provider listing the deal id,
//!    which binds the watch to that sector number, then
//! 2. a `ProveCommitSector` message to the provider for the same sector.
//!
//! Both may arrive in the same tipset. Resolution removes the watch and
//! consumes its sender, so a watch resolves at most once. Watches never
//! time out; a caller that needs a bound imposes its own. A watch whose
//! receiver was dropped is pruned at the next registration or scan.
//!
//! ## Failure handling
//!
//! A message that cannot be loaded or whose parameters do not decode is
//! logged and skipped. One bad message never stops the scan of the rest
//! of the batch.
//!
//! ## Shutdown
//!
//! [`Events::stop`] drops every pending watch under the watch-table lock.
//! Receivers then observe a closed channel, and no scan can resolve
//! anything after `stop` returns because resolution happens under the
//! same lock and checks the stopped flag first.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use smkt_core::{Address, DealId, SectorNumber};

use crate::actors::miner::{self, ProveCommitSectorParams, SectorPreCommitInfo};
use crate::api::ChainApi;
use crate::error::EventsError;
use crate::types::{HeadChange, HeadChangeType, UnsignedMessage};

/// Receiver side of a sector commitment watch.
///
/// Yields the committed sector number, or `Err(RecvError)` if the watcher
/// was stopped before the sector was proven.
pub type SectorCommitWatch = oneshot::Receiver<SectorNumber>;

struct EventWatch {
    provider: Address,
    deal_id: DealId,
    sector: Option<SectorNumber>,
    tx: oneshot::Sender<SectorNumber>,
}

#[derive(Default)]
struct WatchTable {
    stopped: bool,
    watches: Vec<EventWatch>,
}

impl WatchTable {
    fn prune_closed(&mut self) {
        let before = self.watches.len();
        self.watches.retain(|w| !w.tx.is_closed());
        let pruned = before - self.watches.len();
        if pruned > 0 {
            tracing::debug!(pruned, "abandoned sector commit watches pruned");
        }
    }
}

/// Chain watcher for deal sector commitments.
pub struct Events {
    api: Arc<dyn ChainApi>,
    table: Arc<Mutex<WatchTable>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Events")
            .field("stopped", &table.stopped)
            .field("watches", &table.watches.len())
            .finish()
    }
}

impl Events {
    /// Create a watcher over `api`. Nothing is observed until [`run`](Self::run).
    pub fn new(api: Arc<dyn ChainApi>) -> Self {
        Self {
            api,
            table: Arc::new(Mutex::new(WatchTable::default())),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to head changes and start scanning them.
    ///
    /// A second call while running is a no-op. Calling after
    /// [`stop`](Self::stop) fails with [`EventsError::Stopped`].
    pub fn run(&self) -> Result<(), EventsError> {
        let mut task = self.task.lock();
        if task.is_some() {
            tracing::debug!("events watcher already running");
            return Ok(());
        }
        if self.table.lock().stopped {
            return Err(EventsError::Stopped);
        }
        let handle = Handle::try_current().map_err(|_| EventsError::NoRuntime)?;
        let mut changes = self.api.chain_notify()?;

        let api = Arc::clone(&self.api);
        let table = Arc::clone(&self.table);
        *task = Some(handle.spawn(async move {
            while let Some(batch) = changes.recv().await {
                scan(api.as_ref(), &table, &batch);
            }
            tracing::info!("chain notify stream closed");
        }));
        tracing::info!("events watcher running");
        Ok(())
    }

    /// Stop scanning and drop every pending watch.
    pub fn stop(&self) {
        let dropped = {
            let mut table = self.table.lock();
            table.stopped = true;
            let n = table.watches.len();
            table.watches.clear();
            n
        };
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::info!(dropped, "events watcher stopped");
    }

    /// Register a watch for the sector commitment of `deal_id` by
    /// `provider`. After [`stop`](Self::stop) the returned receiver is
    /// already closed.
    pub fn on_deal_sector_committed(&self, provider: Address, deal_id: DealId) -> SectorCommitWatch {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.stopped {
            return rx;
        }
        table.prune_closed();
        tracing::debug!(provider = %provider, deal_id = %deal_id, "sector commit watch registered");
        table.watches.push(EventWatch {
            provider,
            deal_id,
            sector: None,
            tx,
        });
        rx
    }

    /// Number of unresolved watches.
    pub fn pending_watches(&self) -> usize {
        self.table.lock().watches.len()
    }

    /// Scan one head-change batch synchronously. The background loop
    /// started by [`run`](Self::run) calls the same routine.
    pub fn process(&self, batch: &[HeadChange]) {
        scan(self.api.as_ref(), &self.table, batch);
    }
}

impl Drop for Events {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Load the applied messages of a batch, then match them against the
/// watch table in chain order.
fn scan(api: &dyn ChainApi, table: &Mutex<WatchTable>, batch: &[HeadChange]) {
    let mut messages = Vec::new();
    for change in batch {
        if change.kind != HeadChangeType::Apply {
            continue;
        }
        for block in &change.tipset.blocks {
            for cid in &block.messages {
                match api.chain_get_message(cid) {
                    Ok(msg) => messages.push(msg),
                    Err(err) => {
                        tracing::warn!(message = %cid.short(), error = %err, "skipping unloadable message");
                    }
                }
            }
        }
    }

    let mut table = table.lock();
    if table.stopped {
        return;
    }
    table.prune_closed();
    for msg in &messages {
        match msg.method {
            miner::PRE_COMMIT_SECTOR => on_pre_commit(&mut table, msg),
            miner::PROVE_COMMIT_SECTOR => on_prove_commit(&mut table, msg),
            _ => {}
        }
    }
}

fn on_pre_commit(table: &mut WatchTable, msg: &UnsignedMessage) {
    if !table
        .watches
        .iter()
        .any(|w| w.provider == msg.to && w.sector.is_none())
    {
        return;
    }
    let info: SectorPreCommitInfo = match msg.decode_params() {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(to = %msg.to, error = %err, "skipping undecodable precommit");
            return;
        }
    };
    for watch in table
        .watches
        .iter_mut()
        .filter(|w| w.provider == msg.to && w.sector.is_none())
    {
        if info.deal_ids.contains(&watch.deal_id) {
            tracing::debug!(
                deal_id = %watch.deal_id, sector = %info.sector_number,
                "deal precommitted"
            );
            watch.sector = Some(info.sector_number);
        }
    }
}

fn on_prove_commit(table: &mut WatchTable, msg: &UnsignedMessage) {
    if !table
        .watches
        .iter()
        .any(|w| w.provider == msg.to && w.sector.is_some())
    {
        return;
    }
    let params: ProveCommitSectorParams = match msg.decode_params() {
        Ok(params) => params,
        Err(err) => {
            tracing::warn!(to = %msg.to, error = %err, "skipping undecodable prove-commit");
            return;
        }
    };

    let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut table.watches)
        .into_iter()
        .partition(|w| w.provider == msg.to && w.sector == Some(params.sector_number));
    table.watches = rest;
    for watch in matched {
        tracing::info!(
            provider = %watch.provider, deal_id = %watch.deal_id, sector = %params.sector_number,
            "deal sector committed"
        );
        // A dropped receiver means the deal no longer cares.
        let _ = watch.tx.send(params.sector_number);
    }
}
