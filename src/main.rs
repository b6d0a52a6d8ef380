use anyhow::Result;
use clap::Parser;
use snapfault::cli::Commands;
use snapfault::{cli, commands};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Initialize logging: only use colors when outputting to a TTY (not when piped to file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .init();

    // Dispatch to appropriate command handler
    let result = match cli.cmd {
        Commands::Serve(args) => commands::cmd_serve(args).await,
        Commands::Warm(args) => commands::cmd_warm(args).await,
    };

    // Handle errors
    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
