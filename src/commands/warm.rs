use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::WarmArgs;
use crate::uffd::warm_snapshot_file;

pub async fn cmd_warm(args: WarmArgs) -> Result<()> {
    let start = Instant::now();
    let path = args.mem_file.clone();
    let bytes = tokio::task::spawn_blocking(move || warm_snapshot_file(&path, args.readers))
        .await
        .context("warm task panicked")?
        .with_context(|| format!("warming {}", args.mem_file.display()))?;

    info!(
        mem_file = %args.mem_file.display(),
        mb = bytes / (1024 * 1024),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "snapshot warmed"
    );
    println!("Warmed {} MB from {}", bytes / (1024 * 1024), args.mem_file.display());
    Ok(())
}
