//! # smkt Entry Point
//!
//! Parses the command line, loads configuration from the environment and
//! dispatches to the subcommand handlers.

use clap::Parser;

use smkt_market::{ClientConfig, ProviderConfig};
use smkt_node::ask::AskArgs;
use smkt_node::demo::DemoArgs;
use smkt_node::node::LocalNode;

/// Local storage-market node.
///
/// Runs a provider and a client against an in-memory chain. Provider and
/// client settings come from `SMKT_*` environment variables.
#[derive(Parser, Debug)]
#[command(name = "smkt", version, about)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one deal end-to-end and print both deal records.
    Demo(DemoArgs),
    /// Post and query the provider's ask.
    Ask(AskArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let node = LocalNode::new(ProviderConfig::from_env()?, ClientConfig::from_env()?)?;

    match cli.command {
        Commands::Demo(args) => {
            let report = smkt_node::demo::run(&args, &node).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.completed() {
                anyhow::bail!(
                    "deal {} ended as provider {} / client {}",
                    report.proposal_cid,
                    report.provider.state,
                    report.client.state
                );
            }
        }
        Commands::Ask(args) => {
            let ask = smkt_node::ask::run(&args, &node).await?;
            println!("{}", serde_json::to_string_pretty(&ask)?);
        }
    }

    Ok(())
}
