//! # Ask Subcommand
//!
//! Posts an ask on the local provider and reads it back through the
//! client's ask stream.

use clap::Args;

use smkt_core::TokenAmount;
use smkt_market::StorageAsk;

use crate::node::{with_started, LocalNode};

/// Arguments for the ask subcommand.
#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    /// Price per GiB per epoch, in atto. Keeps the configured ask when unset.
    #[arg(long)]
    pub price: Option<u128>,

    /// Epochs the ask stays valid.
    #[arg(long, default_value_t = 10_000)]
    pub duration: i64,
}

/// Post the ask (if a price is given) and query it as the client.
pub async fn run(args: &AskArgs, node: &LocalNode) -> anyhow::Result<StorageAsk> {
    with_started(node, async {
        if let Some(price) = args.price {
            let posted = node.provider.add_ask(TokenAmount::from_atto(price), args.duration)?;
            tracing::info!(price = %posted.price, expiry = posted.expiry, seq_no = posted.seq_no, "ask posted");
        }
        Ok::<_, anyhow::Error>(node.client.get_ask(node.provider_info()).await?)
    })
    .await
}
