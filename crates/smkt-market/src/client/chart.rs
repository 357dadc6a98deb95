//! # Client Deal Chart
//!
//! ```text
//! Unknown ─Open→ EnsureClientFunds ─FundingInitiated→ ClientFunding
//!   {EnsureClientFunds, ClientFunding} ─FundsEnsured→ FundsEnsured
//!   FundsEnsured ─DealProposed→ Validating ─DealPublished→ Sealing
//!   Sealing ─DealActivated→ Active ─DealCompleted→ Completed
//!   any live state ─failure→ Failing ─Failed→ Error
//! ```
//!
//! The client learns the on-chain deal id from the provider's response:
//! the response names the publish message, and the id is read from that
//! message's receipt rather than trusted from the wire.

use std::sync::Arc;

use smkt_chain::{ChainApi, Events};
use smkt_core::{Cid, DealId};
use smkt_fsm::{Effects, Machine, MachineEvent, Rule, Transition, TransitionTable};

use crate::config::ClientConfig;
use crate::network::SessionTable;
use crate::publish::{lookup_published_deal, PublishOutcome};
use crate::status::StorageDealStatus;
use crate::types::{ClientDeal, Proposal, ProposalResponse};

use StorageDealStatus as S;

/// Events of the client chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The deal was registered.
    Open,
    /// An escrow top-up was broadcast.
    FundingInitiated(Cid),
    /// Escrow covers the deal.
    FundsEnsured,
    /// Escrow could not be topped up.
    EnsureFundsFailed(String),
    /// The proposal was written to the provider.
    DealProposed,
    /// The proposal could not be written.
    WriteProposalFailed(String),
    /// The provider published the deal.
    DealPublished {
        /// On-chain id read from the publish receipt.
        deal_id: DealId,
        /// The publish message.
        publish_message: Cid,
    },
    /// The provider rejected or failed the deal.
    DealRejected(String),
    /// No usable response arrived.
    ReadResponseFailed(String),
    /// The sector holding the deal is proven.
    DealActivated,
    /// Nothing left to do.
    DealCompleted,
    /// A chain call failed.
    NodeErrored(String),
    /// The failure was recorded.
    Failed,
}

/// Discriminant of [`ClientEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[allow(missing_docs)]
pub enum ClientEventKind {
    Open,
    FundingInitiated,
    FundsEnsured,
    EnsureFundsFailed,
    DealProposed,
    WriteProposalFailed,
    DealPublished,
    DealRejected,
    ReadResponseFailed,
    DealActivated,
    DealCompleted,
    NodeErrored,
    Failed,
}

impl std::fmt::Display for ClientEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl ClientEvent {
    /// The failure reason, for failure events.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ClientEvent::EnsureFundsFailed(r)
            | ClientEvent::WriteProposalFailed(r)
            | ClientEvent::DealRejected(r)
            | ClientEvent::ReadResponseFailed(r)
            | ClientEvent::NodeErrored(r) => Some(r),
            _ => None,
        }
    }
}

impl MachineEvent for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        use ClientEvent as E;
        use ClientEventKind as K;
        match self {
            E::Open => K::Open,
            E::FundingInitiated(_) => K::FundingInitiated,
            E::FundsEnsured => K::FundsEnsured,
            E::EnsureFundsFailed(_) => K::EnsureFundsFailed,
            E::DealProposed => K::DealProposed,
            E::WriteProposalFailed(_) => K::WriteProposalFailed,
            E::DealPublished { .. } => K::DealPublished,
            E::DealRejected(_) => K::DealRejected,
            E::ReadResponseFailed(_) => K::ReadResponseFailed,
            E::DealActivated => K::DealActivated,
            E::DealCompleted => K::DealCompleted,
            E::NodeErrored(_) => K::NodeErrored,
            E::Failed => K::Failed,
        }
    }
}

/// The client's view of a deal, keyed by proposal cid.
#[derive(Debug)]
pub struct ClientMachine;

impl Machine for ClientMachine {
    type Key = Cid;
    type State = StorageDealStatus;
    type Event = ClientEvent;
    type Entity = ClientDeal;
}

pub(crate) struct ClientEnv {
    pub config: ClientConfig,
    pub chain: Arc<dyn ChainApi>,
    pub events: Arc<Events>,
    pub sessions: SessionTable,
}

type Fx = Effects<ClientEvent>;
type T<'a> = Transition<'a, ClientMachine>;

fn with_env(
    env: &Arc<ClientEnv>,
    f: fn(&Arc<ClientEnv>, &mut ClientDeal, &T<'_>) -> Fx,
) -> impl Fn(&mut ClientDeal, &T<'_>) -> Fx + Send + Sync + 'static {
    let env = Arc::clone(env);
    move |deal: &mut ClientDeal, t: &T<'_>| f(&env, deal, t)
}

pub(crate) fn transition_table(env: &Arc<ClientEnv>) -> TransitionTable<ClientMachine> {
    use ClientEventKind as K;

    TransitionTable::new()
        .rule(
            Rule::on(K::Open)
                .from(S::Unknown)
                .to(S::EnsureClientFunds)
                .action(with_env(env, ensure_funds)),
        )
        .rule(
            Rule::on(K::FundingInitiated)
                .from(S::EnsureClientFunds)
                .to(S::ClientFunding)
                .action(with_env(env, wait_for_funding)),
        )
        .rule(
            Rule::on(K::FundsEnsured)
                .from_many([S::EnsureClientFunds, S::ClientFunding])
                .to(S::FundsEnsured)
                .action(with_env(env, propose)),
        )
        .rule(
            Rule::on(K::EnsureFundsFailed)
                .from_many([S::EnsureClientFunds, S::ClientFunding])
                .to(S::Failing)
                .action(fail),
        )
        .rule(
            Rule::on(K::DealProposed)
                .from(S::FundsEnsured)
                .to(S::Validating)
                .action(with_env(env, await_response)),
        )
        .rule(Rule::on(K::WriteProposalFailed).from(S::FundsEnsured).to(S::Failing).action(fail))
        .rule(
            Rule::on(K::DealPublished)
                .from(S::Validating)
                .to(S::Sealing)
                .action(with_env(env, watch_sector)),
        )
        .rule(Rule::on(K::DealRejected).from(S::Validating).to(S::Failing).action(fail))
        .rule(Rule::on(K::ReadResponseFailed).from(S::Validating).to(S::Failing).action(fail))
        .rule(
            Rule::on(K::DealActivated)
                .from(S::Sealing)
                .to(S::Active)
                .action(|_, _| Effects::emit(ClientEvent::DealCompleted)),
        )
        .rule(
            Rule::on(K::DealCompleted)
                .from(S::Active)
                .to(S::Completed)
                .action(with_env(env, finalize)),
        )
        .rule(Rule::on(K::NodeErrored).from_any().to(S::Failing).action(fail))
        .rule(Rule::on(K::Failed).from(S::Failing).to(S::Error).action(with_env(env, fail_terminal)))
}

fn ensure_funds(env: &Arc<ClientEnv>, deal: &mut ClientDeal, _t: &T<'_>) -> Fx {
    let amount = deal.client_deal_proposal.proposal.client_balance_requirement();
    let result = env.chain.chain_head().and_then(|head| head.key()).and_then(|tsk| {
        env.chain
            .market_ensure_available(&env.config.address, &env.config.wallet, amount, &tsk)
    });
    match result {
        Ok(Some(cid)) => {
            tracing::info!(proposal_cid = %deal.proposal_cid.short(), message = %cid.short(), amount = %amount, "escrow top-up sent");
            Effects::emit(ClientEvent::FundingInitiated(cid))
        }
        Ok(None) => Effects::emit(ClientEvent::FundsEnsured),
        Err(err) => Effects::emit(ClientEvent::EnsureFundsFailed(format!("ensuring client funds: {err}"))),
    }
}

fn wait_for_funding(env: &Arc<ClientEnv>, deal: &mut ClientDeal, t: &T<'_>) -> Fx {
    let ClientEvent::FundingInitiated(message) = t.event else {
        return Effects::none();
    };
    let message = *message;
    deal.add_funds_cid = Some(message);
    let chain = Arc::clone(&env.chain);
    Effects::poll(move || match chain.state_search_msg(&message) {
        Ok(None) => None,
        Ok(Some(lookup)) if lookup.receipt.exit_code.is_success() => Some(ClientEvent::FundsEnsured),
        Ok(Some(lookup)) => Some(ClientEvent::EnsureFundsFailed(format!(
            "escrow message {} failed with exit code {}",
            message.short(),
            lookup.receipt.exit_code
        ))),
        Err(err) => Some(ClientEvent::NodeErrored(format!("looking up escrow message: {err}"))),
    })
}

fn propose(env: &Arc<ClientEnv>, deal: &mut ClientDeal, _t: &T<'_>) -> Fx {
    let Some(session) = env.sessions.get(&deal.proposal_cid) else {
        return Effects::emit(ClientEvent::WriteProposalFailed("no open deal session".into()));
    };
    let proposal = Proposal {
        deal_proposal: deal.client_deal_proposal.clone(),
        piece: deal.data_ref.clone(),
    };
    match session.write_proposal(&proposal) {
        Ok(()) => {
            tracing::info!(proposal_cid = %deal.proposal_cid.short(), miner = %deal.miner.address, "proposal sent");
            Effects::emit(ClientEvent::DealProposed)
        }
        Err(err) => Effects::emit(ClientEvent::WriteProposalFailed(err.to_string())),
    }
}

fn await_response(env: &Arc<ClientEnv>, deal: &mut ClientDeal, _t: &T<'_>) -> Fx {
    let Some(session) = env.sessions.get(&deal.proposal_cid) else {
        return Effects::emit(ClientEvent::ReadResponseFailed("no open deal session".into()));
    };
    let chain = Arc::clone(&env.chain);
    let proposal = deal.proposal_cid;
    Effects::await_event(async move {
        let response = match session.read_response().await {
            Ok(response) => response,
            Err(err) => return Some(ClientEvent::ReadResponseFailed(err.to_string())),
        };
        Some(interpret_response(chain.as_ref(), &proposal, response))
    })
}

fn interpret_response(chain: &dyn ChainApi, proposal: &Cid, response: ProposalResponse) -> ClientEvent {
    if response.proposal != *proposal {
        return ClientEvent::ReadResponseFailed(format!(
            "response names proposal {}",
            response.proposal.short()
        ));
    }
    if response.state.is_failure() {
        return ClientEvent::DealRejected(response.message);
    }
    let Some(publish_message) = response.publish_message else {
        return ClientEvent::ReadResponseFailed(format!(
            "provider reported {} without a publish message",
            response.state
        ));
    };
    match lookup_published_deal(chain, &publish_message, proposal) {
        Ok(PublishOutcome::Published(deal_id)) => ClientEvent::DealPublished {
            deal_id,
            publish_message,
        },
        Ok(PublishOutcome::Pending) => ClientEvent::NodeErrored(format!(
            "publish message {} has not landed",
            publish_message.short()
        )),
        Ok(PublishOutcome::Failed(code)) => ClientEvent::DealRejected(format!(
            "publish message {} failed with exit code {code}",
            publish_message.short()
        )),
        Err(err) => ClientEvent::NodeErrored(format!("reading deal id: {err}")),
    }
}

fn watch_sector(env: &Arc<ClientEnv>, deal: &mut ClientDeal, t: &T<'_>) -> Fx {
    let ClientEvent::DealPublished {
        deal_id,
        publish_message,
    } = t.event
    else {
        return Effects::none();
    };
    deal.deal_id = Some(*deal_id);
    deal.publish_message = Some(*publish_message);
    tracing::info!(proposal_cid = %deal.proposal_cid.short(), deal_id = %deal_id, "deal published");

    let watch = env.events.on_deal_sector_committed(deal.miner.address, *deal_id);
    let proposal = deal.proposal_cid;
    Effects::await_event(async move {
        match watch.await {
            Ok(_) => Some(ClientEvent::DealActivated),
            Err(_) => {
                tracing::warn!(proposal_cid = %proposal.short(), "sector watch dropped");
                None
            }
        }
    })
}

fn finalize(env: &Arc<ClientEnv>, deal: &mut ClientDeal, _t: &T<'_>) -> Fx {
    env.sessions.close(&deal.proposal_cid);
    deal.connection_closed = true;
    tracing::info!(proposal_cid = %deal.proposal_cid.short(), "deal completed");
    Effects::none()
}

fn fail(deal: &mut ClientDeal, t: &T<'_>) -> Fx {
    let reason = t.event.reason().unwrap_or("deal failed");
    if deal.message.is_empty() {
        deal.message = reason.to_string();
    } else {
        deal.message = format!("{}; {reason}", deal.message);
    }
    tracing::warn!(proposal_cid = %deal.proposal_cid.short(), from = %t.from, reason = %reason, "deal failing");
    Effects::emit(ClientEvent::Failed)
}

fn fail_terminal(env: &Arc<ClientEnv>, deal: &mut ClientDeal, _t: &T<'_>) -> Fx {
    env.sessions.close(&deal.proposal_cid);
    deal.connection_closed = true;
    tracing::error!(proposal_cid = %deal.proposal_cid.short(), message = %deal.message, "deal failed");
    Effects::none()
}
