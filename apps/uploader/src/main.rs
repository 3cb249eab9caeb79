//! dagflow uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked uploader for dagflow task files")]
pub struct Args {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/dagflow/uploader.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// tus creation endpoint
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Destination group (task id) attached to every upload
    #[arg(long)]
    pub group: Option<String>,

    /// Chunk size in MiB
    #[arg(long)]
    pub chunk_size_mb: Option<u64>,

    /// Partial uploads sent concurrently per file
    #[arg(long)]
    pub parallel_chunks: Option<usize>,

    /// Send the first chunk with the creation request
    #[arg(long)]
    pub upload_data_during_creation: bool,

    /// Files uploaded at once (1-10)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Append completed uploads to this JSON file
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Upload into an in-memory endpoint instead of the network
    #[arg(long)]
    pub dry_run: bool,

    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting dagflow uploader");

    let config = config::Config::load(args.config.as_deref())?;
    let config = app::apply_overrides(config, &args);
    tracing::info!(
        endpoint = %config.endpoint,
        group = %config.queue.group_id,
        concurrency = config.queue.concurrency_limit,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args))
}
