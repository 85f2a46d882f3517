mod grid;
mod ledger;
mod notify;
mod provider;
mod purchase;
mod server;
mod settings;
mod store;

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use notify::LogSink;
use purchase::Orchestrator;
use settings::{Config, ProviderConfigStore};
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    info!(
        port = config.server_port,
        database = %config.database_path,
        provider = ?config.providers.active,
        "configuration loaded"
    );

    let store = Store::open(&config.database_path)?;
    let provider_config = Arc::new(ProviderConfigStore::new(config.providers.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        provider_config,
        Arc::new(LogSink),
        Arc::new(LogSink),
    )?);

    server::run_server(config.server_port, orchestrator, config.shutdown_grace).await
}
