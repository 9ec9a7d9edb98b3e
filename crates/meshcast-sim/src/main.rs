mod cluster;
mod config;
mod report;
mod runner;
mod scenario_failover;
mod scenario_flood;
mod scenario_outbox;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "meshcast-sim", about = "In-process meshcast network simulator")]
struct Cli {
    /// TOML settings file. `MESHCAST_*` environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Every node broadcasts; checks full delivery without duplicates.
    Flood {
        /// Number of nodes.
        #[arg(long, default_value = "8")]
        nodes: usize,
        /// Broadcasts per node.
        #[arg(long, default_value = "3")]
        messages: usize,
    },

    /// Kill the rendezvous hub and check that survivors re-elect.
    Failover,

    /// Directed message to an absent node, delivered when it appears.
    Outbox,

    /// Run every scenario.
    All {
        #[arg(long, default_value = "8")]
        nodes: usize,
        #[arg(long, default_value = "3")]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::SimConfig::load(cli.config.as_deref())?;
    eprintln!("meshcast-sim v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Flood { nodes, messages } => {
            anyhow::ensure!(nodes >= 2, "flood needs at least two nodes");
            scenario_flood::run(&config, nodes, messages).await?
        }
        Command::Failover => scenario_failover::run(&config).await?,
        Command::Outbox => scenario_outbox::run(&config).await?,
        Command::All { nodes, messages } => {
            if !runner::run(&config, nodes, messages).await {
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    result.print_summary();
    result.emit_json();
    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}
