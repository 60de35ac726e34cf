mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qqgate")]
#[command(about = "QQ Open Platform bot gateway connector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled account's gateway (long-running)
    Gateway,

    /// Show per-account configuration status
    Status,
}

#[tokio::main]
async fn main() -> qqgate_core::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "qqgate=debug,qqgate_channel=debug,qqgate_core=debug,qqgate_storage=debug"
    } else {
        "qqgate=info,qqgate_channel=info,qqgate_core=info,qqgate_storage=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Gateway => commands::gateway::run().await,
        Commands::Status => commands::status::run().await,
    }
}
