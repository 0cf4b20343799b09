use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use commitment_server::{
    cli::Cli,
    crypto::Pbkdf2Hasher,
    engine::VerificationEngine,
    protocol::CommandProtocol,
    server::Server,
    store::CommitmentStore,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let hasher = Pbkdf2Hasher::new(cli.hash_iterations).context("invalid --hash-iterations")?;

    let store = Arc::new(CommitmentStore::new());
    let engine = VerificationEngine::new(store).with_hasher(hasher);
    let protocol = Arc::new(CommandProtocol::new(engine));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    let server = Server::new(listener, protocol);
    info!("accepting connections on {}", server.local_addr()?);

    if let Err(err) = server.run().await {
        error!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
