//! Dropstream upload client entry point.

mod app;

use std::path::PathBuf;

use clap::Parser;
use dropstream_transfer::{
    BatchLimits, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT, SchedulerConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload files to a dropstream server")]
struct Args {
    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    server: String,

    /// Maximum number of simultaneous uploads
    #[arg(short = 'j', long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    concurrency: usize,

    /// Bytes read per chunk (clamped to 16 KiB - 1 MiB)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Refuse batches with more files than this
    #[arg(long)]
    max_files: Option<usize>,

    /// Refuse batches larger than this many bytes in total
    #[arg(long)]
    max_total_bytes: Option<u64>,

    /// Follow the server's progress stream for every upload
    #[arg(short, long)]
    watch: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = app::SendOptions {
        server: args.server,
        files: args.files,
        scheduler: SchedulerConfig {
            max_concurrent: args.concurrency,
            chunk_size: args.chunk_size,
            limits: BatchLimits {
                max_files: args.max_files,
                max_total_bytes: args.max_total_bytes,
            },
        },
        watch: args.watch,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(app::run(options, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }))?;

    if !report.all_succeeded() {
        anyhow::bail!(
            "{} of {} uploads did not complete",
            report.canceled + report.failed,
            report.outcomes.len()
        );
    }
    Ok(())
}
