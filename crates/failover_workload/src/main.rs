//! Binary entrypoint for the failover workload generator.

use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use failover_workload::events::EVENTS_TARGET;
use failover_workload::{Args, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("failover_workload=info,tokio_postgres=warn,warn"))
        // Host transitions are the signal this tool exists for; keep them on.
        .add_directive(format!("{EVENTS_TARGET}=info").parse()?);
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_target(false)
        .with_env_filter(filter)
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => {
            let config = args.into_config()?;
            failover_workload::run(config).await?;
            Ok(())
        }
    }
}
