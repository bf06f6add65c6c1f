use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmbit::piece::PieceStore;
use swarmbit::swarm::{self, Shutdown};
use swarmbit::torrent::file::Metainfo;
use tracing_subscriber::EnvFilter;

/// Downloads and seeds the file described by a .torrent metainfo file.
#[derive(Parser, Debug)]
#[command(name = "client")]
struct Cli {
    /// Path to the .torrent metainfo file
    metainfo: PathBuf,

    /// Listen port for inbound peers; 0 asks the OS for one
    #[arg(default_value_t = 0)]
    listen_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    if args.metainfo.extension().and_then(|e| e.to_str()) != Some("torrent") {
        bail!("metainfo path must end in .torrent");
    }

    let meta = Arc::new(
        Metainfo::load(&args.metainfo)
            .with_context(|| format!("loading {}", args.metainfo.display()))?,
    );
    meta.log_summary();

    let store =
        Arc::new(PieceStore::open(&meta, Path::new(".")).context("opening the backing file")?);

    let shutdown = Shutdown::new();
    tokio::spawn(swarm::listen_for_shutdown(shutdown.clone()));

    swarm::run(meta, store, args.listen_port, shutdown).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
