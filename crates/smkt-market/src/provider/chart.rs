//! # Provider Deal Chart
//!
//! ```text
//! Unknown ─Open→ Validating ─DealAccepted→ ProposalAccepted
//!   ProposalAccepted ─WaitingForManualData→ WaitingForData ──────────┐
//!   ProposalAccepted ─DataTransferInitiated→ Transferring            │ import
//!   Transferring ─DataTransferCompleted→ VerifyData ─VerifiedData→ EnsureProviderFunds
//!   EnsureProviderFunds ─FundingInitiated→ ProviderFunding ─Funded→ Publish
//!   EnsureProviderFunds ─Funded→ Publish
//!   Publish ─DealPublishInitiated→ Publishing ─DealPublished→ Staged
//!   Staged ─DealHandedOff→ Sealing ─DealActivated→ Active ─DealCompleted→ Completed
//!   any live state ─failure→ Failing ─Failed→ Error
//!   {Publishing, Failing} ─SendResponseFailed→ Error
//! ```
//!
//! Each action does one bounded unit of work against a collaborator and
//! yields at most one follow-up. Wait points (`WaitingForData`,
//! `Transferring`, `ProviderFunding`, `Publishing`, `Sealing`) yield
//! nothing synchronously; they either await a future or poll on ticks.
//!
//! Collaborator failures never escape an action. They become a failure
//! event whose reason is recorded on the deal, so every deal ends in an
//! inspectable terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use smkt_chain::{ChainApi, ChainError, DealProposal, Events, TipsetKey};
use smkt_core::{Address, CanonicalBytes, Cid, UnpaddedPieceSize};
use smkt_fsm::{Effects, Machine, MachineEvent, Rule, Transition, TransitionTable};

use crate::ask::StoredAsk;
use crate::config::ProviderConfig;
use crate::error::{NetworkError, ProviderError};
use crate::filestore::{metadata_file, piece_file, FileStore};
use crate::network::SessionTable;
use crate::piece::PieceIo;
use crate::publish::{lookup_published_deal, PublishOutcome};
use crate::sealing::{DealInfo, PieceDealInfo, PieceStore, SectorSealer};
use crate::status::StorageDealStatus;
use crate::transfer::{DataTransfer, PullRequest};
use crate::types::{MinerDeal, PieceMetadata, ProposalResponse};

use StorageDealStatus as S;

// ── Events ───────────────────────────────────────────────────────────

/// Events of the provider chart. Failure events carry their reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A proposal stream was accepted.
    Open,
    /// The proposal passed validation.
    DealAccepted,
    /// The proposal failed validation.
    DealRejected(String),
    /// The client will import the data out of band.
    WaitingForManualData,
    /// A pull transfer was opened.
    DataTransferInitiated,
    /// The pulled payload is staged.
    DataTransferCompleted,
    /// The pull transfer failed.
    DataTransferFailed(String),
    /// The staged piece matches the proposal.
    VerifiedData,
    /// The staged piece does not match the proposal.
    GeneratePieceCIDFailed(String),
    /// A collateral top-up was broadcast.
    FundingInitiated,
    /// Collateral covers the deal.
    Funded,
    /// A chain or node call failed.
    NodeErrored(String),
    /// The publish message was broadcast.
    DealPublishInitiated,
    /// The publish message landed and the client was told.
    DealPublished,
    /// The publish message failed on chain.
    DealPublishError(String),
    /// The staged piece could not be read.
    FileStoreErrored(String),
    /// The sealing pipeline took the deal.
    DealHandedOff,
    /// The sealing pipeline refused the deal.
    DealHandoffFailed(String),
    /// The sector holding the deal is proven.
    DealActivated,
    /// The deal cannot be watched for activation.
    DealActivationFailed(String),
    /// The staged piece is gone.
    UnableToLocatePiece(String),
    /// The staged metadata could not be read.
    ReadMetadataErrored(String),
    /// The piece index could not be updated.
    PieceStoreErrored(String),
    /// All post-activation bookkeeping is done.
    DealCompleted,
    /// A response could not be delivered to the client.
    SendResponseFailed(String),
    /// The failure was recorded and reported.
    Failed,
}

/// Discriminant of [`ProviderEvent`], used for rule lookup and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ProviderEventKind {
    Open,
    DealAccepted,
    DealRejected,
    WaitingForManualData,
    DataTransferInitiated,
    DataTransferCompleted,
    DataTransferFailed,
    VerifiedData,
    GeneratePieceCIDFailed,
    FundingInitiated,
    Funded,
    NodeErrored,
    DealPublishInitiated,
    DealPublished,
    DealPublishError,
    FileStoreErrored,
    DealHandedOff,
    DealHandoffFailed,
    DealActivated,
    DealActivationFailed,
    UnableToLocatePiece,
    ReadMetadataErrored,
    PieceStoreErrored,
    DealCompleted,
    SendResponseFailed,
    Failed,
}

impl ProviderEventKind {
    /// Every event kind.
    pub const ALL: [ProviderEventKind; 26] = [
        Self::Open,
        Self::DealAccepted,
        Self::DealRejected,
        Self::WaitingForManualData,
        Self::DataTransferInitiated,
        Self::DataTransferCompleted,
        Self::DataTransferFailed,
        Self::VerifiedData,
        Self::GeneratePieceCIDFailed,
        Self::FundingInitiated,
        Self::Funded,
        Self::NodeErrored,
        Self::DealPublishInitiated,
        Self::DealPublished,
        Self::DealPublishError,
        Self::FileStoreErrored,
        Self::DealHandedOff,
        Self::DealHandoffFailed,
        Self::DealActivated,
        Self::DealActivationFailed,
        Self::UnableToLocatePiece,
        Self::ReadMetadataErrored,
        Self::PieceStoreErrored,
        Self::DealCompleted,
        Self::SendResponseFailed,
        Self::Failed,
    ];
}

impl std::fmt::Display for ProviderEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl ProviderEvent {
    /// The failure reason, for failure events.
    pub fn reason(&self) -> Option<&str> {
        use ProviderEvent::*;
        match self {
            DealRejected(r)
            | DataTransferFailed(r)
            | GeneratePieceCIDFailed(r)
            | NodeErrored(r)
            | DealPublishError(r)
            | FileStoreErrored(r)
            | DealHandoffFailed(r)
            | DealActivationFailed(r)
            | UnableToLocatePiece(r)
            | ReadMetadataErrored(r)
            | PieceStoreErrored(r)
            | SendResponseFailed(r) => Some(r),
            _ => None,
        }
    }
}

impl MachineEvent for ProviderEvent {
    type Kind = ProviderEventKind;

    fn kind(&self) -> ProviderEventKind {
        use ProviderEvent as E;
        use ProviderEventKind as K;
        match self {
            E::Open => K::Open,
            E::DealAccepted => K::DealAccepted,
            E::DealRejected(_) => K::DealRejected,
            E::WaitingForManualData => K::WaitingForManualData,
            E::DataTransferInitiated => K::DataTransferInitiated,
            E::DataTransferCompleted => K::DataTransferCompleted,
            E::DataTransferFailed(_) => K::DataTransferFailed,
            E::VerifiedData => K::VerifiedData,
            E::GeneratePieceCIDFailed(_) => K::GeneratePieceCIDFailed,
            E::FundingInitiated => K::FundingInitiated,
            E::Funded => K::Funded,
            E::NodeErrored(_) => K::NodeErrored,
            E::DealPublishInitiated => K::DealPublishInitiated,
            E::DealPublished => K::DealPublished,
            E::DealPublishError(_) => K::DealPublishError,
            E::FileStoreErrored(_) => K::FileStoreErrored,
            E::DealHandedOff => K::DealHandedOff,
            E::DealHandoffFailed(_) => K::DealHandoffFailed,
            E::DealActivated => K::DealActivated,
            E::DealActivationFailed(_) => K::DealActivationFailed,
            E::UnableToLocatePiece(_) => K::UnableToLocatePiece,
            E::ReadMetadataErrored(_) => K::ReadMetadataErrored,
            E::PieceStoreErrored(_) => K::PieceStoreErrored,
            E::DealCompleted => K::DealCompleted,
            E::SendResponseFailed(_) => K::SendResponseFailed,
            E::Failed => K::Failed,
        }
    }
}

/// The provider's view of a deal, keyed by proposal cid.
#[derive(Debug)]
pub struct ProviderMachine;

impl Machine for ProviderMachine {
    type Key = Cid;
    type State = StorageDealStatus;
    type Event = ProviderEvent;
    type Entity = MinerDeal;
}

// ── Environment ──────────────────────────────────────────────────────

/// Everything the chart actions reach out to.
pub(crate) struct ProviderEnv {
    pub config: ProviderConfig,
    pub chain: Arc<dyn ChainApi>,
    pub events: Arc<Events>,
    pub piece_io: Arc<dyn PieceIo>,
    pub transfer: Arc<dyn DataTransfer>,
    pub filestore: Arc<dyn FileStore>,
    pub sealer: Arc<dyn SectorSealer>,
    pub piece_store: Arc<dyn PieceStore>,
    pub asks: StoredAsk,
    pub sessions: SessionTable,
}

impl ProviderEnv {
    /// Head tipset key and the miner's worker account.
    fn worker(&self) -> Result<(TipsetKey, Address), ChainError> {
        let tsk = self.chain.chain_head()?.key()?;
        let info = self.chain.state_miner_info(&self.config.actor, &tsk)?;
        Ok((tsk, info.worker))
    }

    fn respond(&self, proposal: &Cid, response: &ProposalResponse) -> Result<(), NetworkError> {
        let session = self.sessions.get(proposal).ok_or(NetworkError::Closed)?;
        session.write_response(response)
    }

    /// Write the metadata file of a verified piece.
    pub(crate) fn stage_metadata(
        &self,
        proposal_cid: &Cid,
        proposal: &DealProposal,
        payload_root: Cid,
        size: UnpaddedPieceSize,
    ) -> Result<PathBuf, ProviderError> {
        let meta = PieceMetadata {
            proposal_cid: *proposal_cid,
            piece_cid: proposal.piece_cid,
            payload_root,
            size,
        };
        let bytes = CanonicalBytes::new(&meta)?;
        Ok(self.filestore.stage(&metadata_file(proposal_cid), bytes.as_bytes())?)
    }

    /// Best-effort removal of a deal's staged files.
    fn remove_staged(&self, deal: &MinerDeal) {
        for path in [&deal.piece_path, &deal.metadata_path].into_iter().flatten() {
            if let Err(err) = self.filestore.remove(path) {
                tracing::warn!(
                    proposal_cid = %deal.proposal_cid.short(), path = %path.display(), error = %err,
                    "failed to remove staged file"
                );
            }
        }
    }
}

type Fx = Effects<ProviderEvent>;
type T<'a> = Transition<'a, ProviderMachine>;

fn with_env(
    env: &Arc<ProviderEnv>,
    f: fn(&Arc<ProviderEnv>, &mut MinerDeal, &T<'_>) -> Fx,
) -> impl Fn(&mut MinerDeal, &T<'_>) -> Fx + Send + Sync + 'static {
    let env = Arc::clone(env);
    move |deal: &mut MinerDeal, t: &T<'_>| f(&env, deal, t)
}

// ── Table ────────────────────────────────────────────────────────────

/// Build the provider transition table over `env`.
pub(crate) fn transition_table(env: &Arc<ProviderEnv>) -> TransitionTable<ProviderMachine> {
    use ProviderEventKind as K;

    TransitionTable::new()
        .rule(Rule::on(K::Open).from(S::Unknown).to(S::Validating).action(with_env(env, validate)))
        .rule(
            Rule::on(K::DealAccepted)
                .from(S::Validating)
                .to(S::ProposalAccepted)
                .action(with_env(env, decide_transfer)),
        )
        .rule(
            Rule::on(K::DealRejected)
                .from_many([S::Validating, S::VerifyData])
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(
            Rule::on(K::WaitingForManualData)
                .from(S::ProposalAccepted)
                .to(S::WaitingForData),
        )
        .rule(
            Rule::on(K::DataTransferInitiated)
                .from(S::ProposalAccepted)
                .to(S::Transferring),
        )
        .rule(
            Rule::on(K::DataTransferFailed)
                .from_many([S::ProposalAccepted, S::Transferring])
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(
            Rule::on(K::DataTransferCompleted)
                .from(S::Transferring)
                .to(S::VerifyData)
                .action(with_env(env, verify_data)),
        )
        .rule(
            Rule::on(K::GeneratePieceCIDFailed)
                .from_many([S::VerifyData, S::WaitingForData])
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(
            Rule::on(K::VerifiedData)
                .from_many([S::VerifyData, S::WaitingForData])
                .to(S::EnsureProviderFunds)
                .action(with_env(env, ensure_funds)),
        )
        .rule(
            Rule::on(K::FundingInitiated)
                .from(S::EnsureProviderFunds)
                .to(S::ProviderFunding)
                .action(with_env(env, wait_for_funding)),
        )
        .rule(
            Rule::on(K::Funded)
                .from_many([S::EnsureProviderFunds, S::ProviderFunding])
                .to(S::Publish)
                .action(with_env(env, publish)),
        )
        .rule(
            Rule::on(K::DealPublishInitiated)
                .from(S::Publish)
                .to(S::Publishing)
                .action(with_env(env, wait_for_publish)),
        )
        .rule(
            Rule::on(K::DealPublishError)
                .from(S::Publishing)
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(
            Rule::on(K::DealPublished)
                .from(S::Publishing)
                .to(S::Staged)
                .action(with_env(env, hand_off)),
        )
        .rule(
            Rule::on(K::FileStoreErrored)
                .from_many([S::Staged, S::Sealing, S::Active])
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(Rule::on(K::DealHandoffFailed).from(S::Staged).to(S::Failing).action(with_env(env, fail)))
        .rule(
            Rule::on(K::DealHandedOff)
                .from(S::Staged)
                .to(S::Sealing)
                .action(with_env(env, watch_sector)),
        )
        .rule(
            Rule::on(K::DealActivationFailed)
                .from(S::Sealing)
                .to(S::Failing)
                .action(with_env(env, fail)),
        )
        .rule(
            Rule::on(K::DealActivated)
                .from(S::Sealing)
                .to(S::Active)
                .action(with_env(env, record_piece)),
        )
        .rule(Rule::on(K::UnableToLocatePiece).from(S::Active).to(S::Failing).action(with_env(env, fail)))
        .rule(Rule::on(K::ReadMetadataErrored).from(S::Active).to(S::Failing).action(with_env(env, fail)))
        .rule(Rule::on(K::PieceStoreErrored).from(S::Active).to(S::Failing).action(with_env(env, fail)))
        .rule(
            Rule::on(K::DealCompleted)
                .from(S::Active)
                .to(S::Completed)
                .action(with_env(env, finalize)),
        )
        .rule(Rule::on(K::NodeErrored).from_any().to(S::Failing).action(with_env(env, fail)))
        .rule(
            Rule::on(K::SendResponseFailed)
                .from_many([S::Publishing, S::Failing])
                .to(S::Error)
                .action(with_env(env, fail_terminal)),
        )
        .rule(Rule::on(K::Failed).from(S::Failing).to(S::Error).action(with_env(env, fail_terminal)))
}

// ── Actions ──────────────────────────────────────────────────────────

fn validate(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    match check_proposal(env, &deal.client_deal_proposal.proposal) {
        Ok(None) => {
            tracing::info!(proposal_cid = %deal.proposal_cid.short(), "proposal accepted");
            Effects::emit(ProviderEvent::DealAccepted)
        }
        Ok(Some(reason)) => {
            tracing::info!(proposal_cid = %deal.proposal_cid.short(), reason = %reason, "proposal rejected");
            Effects::emit(ProviderEvent::DealRejected(reason))
        }
        Err(err) => Effects::emit(ProviderEvent::NodeErrored(format!("validating proposal: {err}"))),
    }
}

/// `Ok(Some(reason))` rejects the proposal; `Err` means the check itself failed.
fn check_proposal(env: &ProviderEnv, p: &DealProposal) -> Result<Option<String>, ChainError> {
    if p.provider != env.config.actor {
        return Ok(Some(format!("incorrect provider for deal: {}", p.provider)));
    }
    if p.end_epoch <= p.start_epoch {
        return Ok(Some(format!(
            "deal end epoch {} is not after start epoch {}",
            p.end_epoch, p.start_epoch
        )));
    }
    let head = env.chain.chain_head()?;
    if p.start_epoch <= head.height {
        return Ok(Some(format!(
            "deal start epoch {} has already elapsed (head {})",
            p.start_epoch, head.height
        )));
    }

    let Ok(ask) = env.asks.get_ask(&env.config.actor) else {
        return Ok(Some("no storage ask posted".into()));
    };
    if !ask.is_live_at(head.height) {
        return Ok(Some(format!("storage ask expired at epoch {}", ask.expiry)));
    }
    if p.piece_size < ask.min_piece_size {
        return Ok(Some(format!(
            "piece size {} below minimum {}",
            p.piece_size, ask.min_piece_size
        )));
    }
    if p.piece_size > ask.max_piece_size {
        return Ok(Some(format!(
            "piece size {} above maximum {}",
            p.piece_size, ask.max_piece_size
        )));
    }
    let min_price = ask.min_price_per_epoch(p.piece_size, p.verified_deal);
    if p.storage_price_per_epoch < min_price {
        return Ok(Some(format!(
            "storage price per epoch {} below asking price {}",
            p.storage_price_per_epoch, min_price
        )));
    }

    let tsk = head.key()?;
    let info = env.chain.state_miner_info(&env.config.actor, &tsk)?;
    if p.piece_size.bytes() > info.sector_size() {
        return Ok(Some(format!(
            "piece size {} exceeds sector size {}",
            p.piece_size,
            info.sector_size()
        )));
    }
    let balance = env.chain.market_get_balance(&p.client, &tsk)?;
    if balance.available() < p.client_balance_requirement() {
        return Ok(Some(format!(
            "client escrow {} cannot cover {}",
            balance.available(),
            p.client_balance_requirement()
        )));
    }
    Ok(None)
}

fn decide_transfer(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    if deal.data_ref.is_manual() {
        tracing::info!(proposal_cid = %deal.proposal_cid.short(), "waiting for manual data import");
        return Effects::emit(ProviderEvent::WaitingForManualData);
    }
    let request = PullRequest {
        proposal_cid: deal.proposal_cid,
        root: deal.data_ref.root,
        from: deal.client.clone(),
    };
    let outcome = match env.transfer.open_pull(request) {
        Ok(outcome) => outcome,
        Err(err) => return Effects::emit(ProviderEvent::DataTransferFailed(err.to_string())),
    };

    let filestore = Arc::clone(&env.filestore);
    let name = piece_file(&deal.proposal_cid);
    Effects::emit(ProviderEvent::DataTransferInitiated).and_await(async move {
        let event = match outcome.await {
            Ok(Ok(bytes)) => match filestore.stage(&name, &bytes) {
                Ok(_) => ProviderEvent::DataTransferCompleted,
                Err(err) => ProviderEvent::DataTransferFailed(format!("staging received piece: {err}")),
            },
            Ok(Err(err)) => ProviderEvent::DataTransferFailed(err.to_string()),
            Err(_) => ProviderEvent::DataTransferFailed("transfer channel closed".into()),
        };
        Some(event)
    })
}

fn verify_data(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let path = env.filestore.path_for(&piece_file(&deal.proposal_cid));
    deal.piece_path = Some(path.clone());
    let bytes = match env.filestore.read(&path) {
        Ok(bytes) => bytes,
        Err(err) => return Effects::emit(ProviderEvent::NodeErrored(format!("reading staged piece: {err}"))),
    };

    let proposal = &deal.client_deal_proposal.proposal;
    let (actual, size) = match env.piece_io.generate_piece_commitment(env.config.seal_proof, &bytes) {
        Ok(commitment) => commitment,
        Err(err) => return Effects::emit(ProviderEvent::GeneratePieceCIDFailed(err.to_string())),
    };
    if actual != proposal.piece_cid {
        return Effects::emit(ProviderEvent::GeneratePieceCIDFailed(format!(
            "piece commitment {} does not match proposal {}",
            actual.short(),
            proposal.piece_cid.short()
        )));
    }
    match env.stage_metadata(&deal.proposal_cid, proposal, deal.data_ref.root, size) {
        Ok(meta) => {
            deal.metadata_path = Some(meta);
            Effects::emit(ProviderEvent::VerifiedData)
        }
        Err(err) => Effects::emit(ProviderEvent::NodeErrored(format!("staging metadata: {err}"))),
    }
}

fn ensure_funds(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let amount = deal.client_deal_proposal.proposal.provider_balance_requirement();
    let result = env.worker().and_then(|(tsk, worker)| {
        env.chain
            .market_ensure_available(&env.config.actor, &worker, amount, &tsk)
    });
    match result {
        Ok(Some(cid)) => {
            tracing::info!(
                proposal_cid = %deal.proposal_cid.short(), message = %cid.short(), amount = %amount,
                "collateral top-up sent"
            );
            deal.add_funds_cid = Some(cid);
            Effects::emit(ProviderEvent::FundingInitiated)
        }
        Ok(None) => Effects::emit(ProviderEvent::Funded),
        Err(err) => Effects::emit(ProviderEvent::NodeErrored(format!("ensuring provider funds: {err}"))),
    }
}

fn wait_for_funding(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let Some(message) = deal.add_funds_cid else {
        return Effects::emit(ProviderEvent::NodeErrored("funding message not recorded".into()));
    };
    let chain = Arc::clone(&env.chain);
    Effects::poll(move || match chain.state_search_msg(&message) {
        Ok(None) => None,
        Ok(Some(lookup)) if lookup.receipt.exit_code.is_success() => Some(ProviderEvent::Funded),
        Ok(Some(lookup)) => Some(ProviderEvent::NodeErrored(format!(
            "funding message {} failed with exit code {}",
            message.short(),
            lookup.receipt.exit_code
        ))),
        Err(err) => Some(ProviderEvent::NodeErrored(format!("looking up funding message: {err}"))),
    })
}

fn publish(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let result = env.worker().and_then(|(_, worker)| {
        env.chain
            .publish_storage_deals(&worker, vec![deal.client_deal_proposal.clone()])
    });
    match result {
        Ok(cid) => {
            tracing::info!(proposal_cid = %deal.proposal_cid.short(), message = %cid.short(), "deal publish sent");
            deal.publish_cid = Some(cid);
            Effects::emit(ProviderEvent::DealPublishInitiated)
        }
        Err(err) => Effects::emit(ProviderEvent::NodeErrored(format!("publishing deal: {err}"))),
    }
}

fn wait_for_publish(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let Some(message) = deal.publish_cid else {
        return Effects::emit(ProviderEvent::NodeErrored("publish message not recorded".into()));
    };
    let env = Arc::clone(env);
    let proposal = deal.proposal_cid;
    Effects::poll(move || {
        let lookup = match env.chain.state_search_msg(&message) {
            Ok(None) => return None,
            Ok(Some(lookup)) => lookup,
            Err(err) => {
                return Some(ProviderEvent::NodeErrored(format!("looking up publish message: {err}")))
            }
        };
        if !lookup.receipt.exit_code.is_success() {
            return Some(ProviderEvent::DealPublishError(format!(
                "publish message {} failed with exit code {}",
                message.short(),
                lookup.receipt.exit_code
            )));
        }
        let response = ProposalResponse {
            state: S::ProposalAccepted,
            message: String::new(),
            proposal,
            publish_message: Some(message),
        };
        Some(match env.respond(&proposal, &response) {
            Ok(()) => ProviderEvent::DealPublished,
            Err(err) => ProviderEvent::SendResponseFailed(format!("sending acceptance: {err}")),
        })
    })
}

fn hand_off(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let Some(message) = deal.publish_cid else {
        return Effects::emit(ProviderEvent::NodeErrored("publish message not recorded".into()));
    };
    let deal_id = match lookup_published_deal(env.chain.as_ref(), &message, &deal.proposal_cid) {
        Ok(PublishOutcome::Published(id)) => id,
        Ok(other) => {
            return Effects::emit(ProviderEvent::NodeErrored(format!(
                "publish message {} yielded no deal id: {other:?}",
                message.short()
            )))
        }
        Err(err) => return Effects::emit(ProviderEvent::NodeErrored(format!("reading deal id: {err}"))),
    };
    deal.deal_id = Some(deal_id);

    let Some(path) = deal.piece_path.clone() else {
        return Effects::emit(ProviderEvent::FileStoreErrored("no staged piece recorded".into()));
    };
    let bytes = match env.filestore.read(&path) {
        Ok(bytes) => bytes,
        Err(err) => return Effects::emit(ProviderEvent::FileStoreErrored(err.to_string())),
    };

    let p = &deal.client_deal_proposal.proposal;
    let info = DealInfo {
        deal_id,
        proposal_cid: deal.proposal_cid,
        piece_cid: p.piece_cid,
        piece_size: p.piece_size,
        start_epoch: p.start_epoch,
        end_epoch: p.end_epoch,
    };
    match env.sealer.hand_off(info, &bytes) {
        Ok(packing) => {
            tracing::info!(
                proposal_cid = %deal.proposal_cid.short(), deal_id = %deal_id, sector = %packing.sector,
                "deal handed off to sealing"
            );
            deal.sector = Some(packing.sector);
            deal.offset = Some(packing.offset);
            Effects::emit(ProviderEvent::DealHandedOff)
        }
        Err(err) => Effects::emit(ProviderEvent::DealHandoffFailed(err.to_string())),
    }
}

fn watch_sector(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    let Some(deal_id) = deal.deal_id else {
        return Effects::emit(ProviderEvent::DealActivationFailed("deal id not recorded".into()));
    };
    let watch = env.events.on_deal_sector_committed(env.config.actor, deal_id);
    let proposal = deal.proposal_cid;
    Effects::await_event(async move {
        match watch.await {
            Ok(sector) => {
                tracing::info!(proposal_cid = %proposal.short(), sector = %sector, "deal activated");
                Some(ProviderEvent::DealActivated)
            }
            Err(_) => {
                tracing::warn!(proposal_cid = %proposal.short(), "sector watch dropped");
                None
            }
        }
    })
}

fn record_piece(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    if deal.piece_path.is_none() {
        return Effects::emit(ProviderEvent::UnableToLocatePiece("staged piece path not recorded".into()));
    }
    let Some(meta_path) = deal.metadata_path.clone() else {
        return Effects::emit(ProviderEvent::ReadMetadataErrored("metadata path not recorded".into()));
    };
    let meta: PieceMetadata = match env
        .filestore
        .read(&meta_path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
    {
        Ok(meta) => meta,
        Err(err) => return Effects::emit(ProviderEvent::ReadMetadataErrored(err)),
    };

    let p = &deal.client_deal_proposal.proposal;
    if meta.piece_cid != p.piece_cid {
        return Effects::emit(ProviderEvent::ReadMetadataErrored(format!(
            "metadata names piece {}, proposal {}",
            meta.piece_cid.short(),
            p.piece_cid.short()
        )));
    }
    let (Some(deal_id), Some(sector)) = (deal.deal_id, deal.sector) else {
        return Effects::emit(ProviderEvent::PieceStoreErrored("deal was never packed".into()));
    };
    let entry = PieceDealInfo {
        deal_id,
        sector,
        offset: deal.offset.unwrap_or(0),
        length: p.piece_size,
    };
    match env.piece_store.add_deal_for_piece(&p.piece_cid, entry) {
        Ok(()) => Effects::emit(ProviderEvent::DealCompleted),
        Err(err) => Effects::emit(ProviderEvent::PieceStoreErrored(err.to_string())),
    }
}

fn finalize(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, _t: &T<'_>) -> Fx {
    env.remove_staged(deal);
    env.sessions.close(&deal.proposal_cid);
    deal.connection_closed = true;
    tracing::info!(
        proposal_cid = %deal.proposal_cid.short(),
        deal_id = ?deal.deal_id.map(|id| id.0),
        "deal completed"
    );
    Effects::none()
}

fn fail(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, t: &T<'_>) -> Fx {
    let reason = t.event.reason().unwrap_or("deal failed");
    deal.record_failure(reason);
    tracing::warn!(
        proposal_cid = %deal.proposal_cid.short(), from = %t.from, event = %t.event.kind(),
        reason = %reason, "deal failing"
    );

    if env.sessions.get(&deal.proposal_cid).is_none() {
        return Effects::emit(ProviderEvent::Failed);
    }
    let response = ProposalResponse {
        state: S::Failing,
        message: deal.message.clone(),
        proposal: deal.proposal_cid,
        publish_message: deal.publish_cid,
    };
    match env.respond(&deal.proposal_cid, &response) {
        Ok(()) => Effects::emit(ProviderEvent::Failed),
        Err(err) => Effects::emit(ProviderEvent::SendResponseFailed(format!("sending rejection: {err}"))),
    }
}

fn fail_terminal(env: &Arc<ProviderEnv>, deal: &mut MinerDeal, t: &T<'_>) -> Fx {
    if let Some(reason) = t.event.reason() {
        deal.record_failure(reason);
    }
    env.remove_staged(deal);
    env.sessions.close(&deal.proposal_cid);
    deal.connection_closed = true;
    tracing::error!(
        proposal_cid = %deal.proposal_cid.short(), from = %t.from, message = %deal.message,
        "deal failed"
    );
    Effects::none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smkt_chain::MockChain;
    use smkt_core::{PeerId, PeerInfo, RegisteredProof};
    use smkt_fsm::Fsm;

    use crate::filestore::MemoryFileStore;
    use crate::piece::Sha256PieceIo;
    use crate::sealing::{MemoryPieceStore, MockSealer};
    use crate::transfer::MemoryDataTransfer;
    use ProviderEventKind as K;

    fn chart() -> Fsm<ProviderMachine> {
        let chain = Arc::new(MockChain::new());
        let miner = Address::from_id(1000);
        let peer = PeerInfo::new(PeerId::new("provider").unwrap(), "/memory/provider");
        let config = ProviderConfig::local(miner, peer).unwrap();
        let env = Arc::new(ProviderEnv {
            asks: StoredAsk::new(chain.clone(), miner, config.min_piece_size, config.max_piece_size),
            config,
            chain: chain.clone(),
            events: Arc::new(Events::new(chain.clone())),
            piece_io: Arc::new(Sha256PieceIo),
            transfer: Arc::new(MemoryDataTransfer::new()),
            filestore: Arc::new(MemoryFileStore::new()),
            sealer: Arc::new(MockSealer::new(
                chain,
                miner,
                Address::from_id(1001),
                RegisteredProof::StackedDrg2KiBV1,
            )),
            piece_store: Arc::new(MemoryPieceStore::new()),
            sessions: SessionTable::new(),
        });
        Fsm::new(transition_table(&env)).unwrap()
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let fsm = chart();
        for state in [S::Completed, S::Error] {
            for kind in ProviderEventKind::ALL {
                assert!(!fsm.accepts(state, kind), "{state} accepts {kind}");
            }
        }
    }

    #[test]
    fn every_live_state_can_fail() {
        let fsm = chart();
        for state in S::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(fsm.target(state, K::NodeErrored), Some(S::Failing), "{state}");
        }
        assert_eq!(fsm.target(S::Failing, K::Failed), Some(S::Error));
        assert_eq!(fsm.target(S::Failing, K::SendResponseFailed), Some(S::Error));
        assert_eq!(fsm.target(S::Publishing, K::SendResponseFailed), Some(S::Error));
    }

    #[test]
    fn store_and_rejection_failures_reach_failing_from_every_source() {
        let fsm = chart();
        for state in [S::Staged, S::Sealing, S::Active] {
            assert_eq!(fsm.target(state, K::FileStoreErrored), Some(S::Failing), "{state}");
        }
        for state in [S::Validating, S::VerifyData] {
            assert_eq!(fsm.target(state, K::DealRejected), Some(S::Failing), "{state}");
        }
        assert!(!fsm.accepts(S::Publishing, K::FileStoreErrored));
        assert!(!fsm.accepts(S::Sealing, K::DealRejected));
    }

    #[test]
    fn happy_path_is_connected() {
        let fsm = chart();
        let steps = [
            (S::Unknown, K::Open, S::Validating),
            (S::Validating, K::DealAccepted, S::ProposalAccepted),
            (S::ProposalAccepted, K::DataTransferInitiated, S::Transferring),
            (S::Transferring, K::DataTransferCompleted, S::VerifyData),
            (S::VerifyData, K::VerifiedData, S::EnsureProviderFunds),
            (S::EnsureProviderFunds, K::FundingInitiated, S::ProviderFunding),
            (S::ProviderFunding, K::Funded, S::Publish),
            (S::Publish, K::DealPublishInitiated, S::Publishing),
            (S::Publishing, K::DealPublished, S::Staged),
            (S::Staged, K::DealHandedOff, S::Sealing),
            (S::Sealing, K::DealActivated, S::Active),
            (S::Active, K::DealCompleted, S::Completed),
        ];
        for (from, kind, to) in steps {
            assert_eq!(fsm.target(from, kind), Some(to), "{from} on {kind}");
        }
    }

    #[test]
    fn shortcuts_skip_transfer_and_funding() {
        let fsm = chart();
        assert_eq!(
            fsm.target(S::ProposalAccepted, K::WaitingForManualData),
            Some(S::WaitingForData)
        );
        assert_eq!(
            fsm.target(S::WaitingForData, K::VerifiedData),
            Some(S::EnsureProviderFunds)
        );
        assert_eq!(fsm.target(S::EnsureProviderFunds, K::Funded), Some(S::Publish));
        assert!(!fsm.accepts(S::Validating, K::VerifiedData));
        assert!(!fsm.accepts(S::Transferring, K::DealPublished));
    }

    #[test]
    fn failure_reasons_are_carried() {
        assert_eq!(
            ProviderEvent::DealRejected("too cheap".into()).reason(),
            Some("too cheap")
        );
        assert_eq!(ProviderEvent::DealAccepted.reason(), None);
        for kind in ProviderEventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(serde_json::from_str::<ProviderEventKind>(&json).unwrap(), kind);
        }
    }
}
