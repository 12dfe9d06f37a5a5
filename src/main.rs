use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otc_broker::adapter::registry::ChainRegistry;
use otc_broker::config::Config;
use otc_broker::engine::deal_engine::DealEngine;
use otc_broker::engine::gas_tank::GasTank;
use otc_broker::engine::payout_queue::PayoutQueue;
use otc_broker::engine::watcher::WatcherSupervisor;
use otc_broker::engine::DealService;
use otc_broker::mail;
use otc_broker::routes::{self, AppState};
use otc_broker::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env());
    let store = Store::connect(&config.database_url).await?;
    let registry = Arc::new(ChainRegistry::from_config(&config, store.pool().clone())?);
    let service = Arc::new(DealService::new(store, Arc::clone(&registry), Arc::clone(&config)));
    let gas_tank = Arc::new(GasTank::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(DealEngine::new(Arc::clone(&service), Arc::clone(&gas_tank)));
    let watchers = Arc::new(WatcherSupervisor::new(Arc::clone(&service)));
    let queue = Arc::new(PayoutQueue::new(Arc::clone(&service), Arc::clone(&gas_tank)));

    // Background workers; the first engine tick doubles as crash recovery,
    // re-driving every non-terminal deal from its persisted state.
    tokio::spawn(Arc::clone(&engine).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&watchers).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&queue).run(shutdown_rx.clone()));

    let state = AppState { service: Arc::clone(&service), mailer: mail::from_config(&config) };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, base_url = %config.base_url, "otc broker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;
    Ok(())
}
