use std::sync::Arc;
use swarmbit::tracker::server::{self, Roster, ANNOUNCE_INTERVAL, PEER_TIMEOUT};
use tracing_subscriber::EnvFilter;

const TRACKER_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let roster = Arc::new(Roster::new(ANNOUNCE_INTERVAL, PEER_TIMEOUT));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", TRACKER_PORT)).await?;
    server::serve(listener, roster).await?;
    Ok(())
}
