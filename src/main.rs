// src/main.rs

use anyhow::{bail, Context, Result};
use chunkstream::integrity::sha256_file;
use chunkstream::prelude::*;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Download a file over HTTP in parallel byte ranges.
#[derive(Debug, Parser)]
#[command(name = "chunkstream", version, about)]
struct Args {
    /// URL to download.
    url: String,

    /// Write the result here. Without it, the bytes are kept in memory and only summarised.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON file with transfer options. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    chunk_size_mib: Option<u64>,

    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Failed attempts allowed per chunk.
    #[arg(long)]
    retries: Option<u32>,

    /// Bandwidth cap in bytes per second. 0 is unlimited.
    #[arg(long)]
    max_bytes_per_sec: Option<u64>,

    /// Expected hex SHA-256 of the whole file.
    #[arg(long)]
    sha256: Option<String>,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn transfer_config(&self) -> Result<TransferConfig> {
        let mut config = match &self.config {
            Some(path) => TransferConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TransferConfig::default(),
        };
        if let Some(mib) = self.chunk_size_mib {
            config.chunk_size_bytes = mib * MIB;
        }
        if let Some(n) = self.concurrency {
            config.concurrency_limit = n;
        }
        if let Some(n) = self.retries {
            config.retry_ceiling = n;
        }
        if let Some(rate) = self.max_bytes_per_sec {
            config.max_bytes_per_sec = rate;
        }
        if let Some(digest) = &self.sha256 {
            config.expected_sha256 = Some(digest.clone());
        }
        if let Some(path) = &self.output {
            config.output = OutputTarget::File(path.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn log_filter(&self) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        let level = match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        };
        EnvFilter::new(format!("chunkstream={level},warn"))
    }
}

/// Wait for a background task, logging instead of propagating its failure.
async fn settle(task: JoinHandle<()>, name: &str) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "background task failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(args.log_filter()).with_target(false).init();

    let config = args.transfer_config()?;
    let start_time = Instant::now();
    let handle = start_transfer(args.url.clone(), config);

    let mut updates = handle.subscribe();
    let cancel = handle.cancellation_token();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let p = updates.borrow().clone();
                    if p.state == SessionState::Transferring {
                        match p.fraction() {
                            Some(f) => info!("[PROGRESS] {:.2}% ({} bytes)", f * 100.0, p.bytes_done),
                            None => info!("[PROGRESS] {} bytes", p.bytes_done),
                        }
                    }
                }
                changed = updates.changed() => {
                    if changed.is_err() || updates.borrow().state.is_terminal() {
                        break;
                    }
                }
            }
        }
    });
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling transfer");
            cancel.cancel();
        }
    });

    let completion = handle.wait().await;
    interrupt.abort();
    settle(reporter, "progress reporter").await;

    let elapsed = start_time.elapsed();
    match completion.result {
        Ok(TransferOutput::File(path)) => {
            let digest = sha256_file(&path).await?;
            info!(
                "saved {} in {:.2}s, sha256 {}",
                path.display(),
                elapsed.as_secs_f32(),
                digest
            );
        }
        Ok(TransferOutput::Memory(bytes)) => {
            info!("received {} bytes in {:.2}s", bytes.len(), elapsed.as_secs_f32());
        }
        Err(e) => bail!("transfer ended {:?}: {e}", completion.state),
    }
    Ok(())
}
