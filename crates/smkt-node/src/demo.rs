//! # Demo Subcommand
//!
//! Proposes one deal from the local client to the local provider and
//! follows both sides until they finish. Sectors are committed as soon
//! as both parties are watching for them.

use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;

use smkt_chain::ChainApi;
use smkt_core::{Cid, TokenAmount};
use smkt_market::{
    ClientDealSnapshot, DataRef, ProposeStorageDealParams, ProviderDealSnapshot, StorageDealStatus,
};

use crate::node::{wait_until, with_started, LocalNode};

/// How the payload reaches the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transfer {
    /// The provider pulls the payload from the client.
    Graphsync,
    /// The payload is imported on the provider out of band.
    Manual,
}

/// Arguments for the demo subcommand.
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Payload size in bytes.
    #[arg(long, default_value_t = 1000)]
    pub size: usize,

    /// Payload transfer mode.
    #[arg(long, value_enum, default_value_t = Transfer::Graphsync)]
    pub transfer: Transfer,

    /// Price per epoch, in atto.
    #[arg(long, default_value_t = 1)]
    pub price: u128,

    /// Provider collateral, in atto.
    #[arg(long, default_value_t = 0)]
    pub collateral: u128,

    /// Epochs between the chain head and the deal start.
    #[arg(long, default_value_t = 100)]
    pub start_offset: i64,

    /// Deal duration in epochs.
    #[arg(long, default_value_t = 1000)]
    pub duration: i64,

    /// Seconds to wait for each stage.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

/// Both views of the deal once it has finished.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    /// The proposal cid both sides key the deal by.
    pub proposal_cid: Cid,
    /// The provider's record.
    pub provider: ProviderDealSnapshot,
    /// The client's record.
    pub client: ClientDealSnapshot,
}

impl DemoReport {
    /// Whether both sides completed the deal.
    pub fn completed(&self) -> bool {
        self.provider.state == StorageDealStatus::Completed
            && self.client.state == StorageDealStatus::Completed
    }
}

/// Deterministic payload bytes.
pub fn payload(size: usize) -> Vec<u8> {
    b"smkt demo payload "
        .iter()
        .cycle()
        .take(size)
        .enumerate()
        .map(|(i, b)| b.wrapping_add((i / 256) as u8))
        .collect()
}

/// Run one deal to a terminal state on both sides.
pub async fn run(args: &DemoArgs, node: &LocalNode) -> anyhow::Result<DemoReport> {
    with_started(node, drive(args, node)).await
}

async fn drive(args: &DemoArgs, node: &LocalNode) -> anyhow::Result<DemoReport> {
    let timeout = Duration::from_secs(args.timeout);
    let data = payload(args.size);
    let root = Cid::digest(&data);
    let data_ref = match args.transfer {
        Transfer::Graphsync => DataRef::graphsync(root),
        Transfer::Manual => DataRef::manual(root),
    };
    let head = node.chain.chain_head()?.height;
    let start_epoch = head + args.start_offset;

    let proposal_cid = node.client.propose_storage_deal(ProposeStorageDealParams {
        provider: node.provider_info().clone(),
        data_ref,
        payload: Some(data.clone()),
        start_epoch,
        end_epoch: start_epoch + args.duration,
        price: TokenAmount::from_atto(args.price),
        collateral: TokenAmount::from_atto(args.collateral),
        label: "smkt demo".into(),
        verified: false,
    })?;
    tracing::info!(proposal_cid = %proposal_cid, bytes = data.len(), transfer = ?args.transfer, "deal proposed");

    let provider_state = || -> anyhow::Result<StorageDealStatus> {
        Ok(node.provider.get_deal(&proposal_cid)?.state)
    };
    let client_state = || -> anyhow::Result<StorageDealStatus> {
        Ok(node.client.get_local_deal(&proposal_cid)?.state)
    };

    if args.transfer == Transfer::Manual {
        wait_until("the provider to wait for data", timeout, || {
            let state = provider_state()?;
            Ok(state == StorageDealStatus::WaitingForData || state.is_terminal())
        })
        .await?;
        if provider_state()? == StorageDealStatus::WaitingForData {
            node.provider.import_data_for_deal(&proposal_cid, &data)?;
            tracing::info!(proposal_cid = %proposal_cid, "payload imported");
        }
    }

    let settled = |state: StorageDealStatus| state == StorageDealStatus::Sealing || state.is_terminal();
    wait_until("both sides to reach sealing", timeout, || {
        Ok(settled(provider_state()?) && settled(client_state()?))
    })
    .await?;
    let sealed = node.sealer.seal_pending()?;
    tracing::info!(proposal_cid = %proposal_cid, sectors = sealed, "sectors committed");

    wait_until("both sides to finish", timeout, || {
        Ok(provider_state()?.is_terminal() && client_state()?.is_terminal())
    })
    .await?;

    let report = DemoReport {
        proposal_cid,
        provider: node.provider.get_deal(&proposal_cid)?,
        client: node.client.get_local_deal(&proposal_cid)?,
    };
    tracing::info!(
        proposal_cid = %proposal_cid,
        provider = %report.provider.state,
        client = %report.client.state,
        deal_id = ?report.provider.deal.deal_id,
        "deal finished"
    );
    Ok(report)
}
