//! Spreadbot - multi-venue price ingestion and cross-venue spread engine.
//!
//! The supervisor wires everything together: store + rate manager +
//! spread engine, one adapter per venue, the periodic stats and cleaner
//! loops, and the JSON API. SIGINT/SIGTERM flips a single watch channel
//! every task selects on.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spreadbot::adapters::{self, Shutdown};
use spreadbot::api::{self, AppState};
use spreadbot::config::Config;
use spreadbot::engine::SpreadEngine;
use spreadbot::models::Exchange;
use spreadbot::rates::ExchangeRateManager;
use spreadbot::store::PriceStore;

const STATS_INTERVAL: Duration = Duration::from_secs(30);
const CLEAN_INTERVAL: Duration = Duration::from_secs(300);
const CLEAN_THRESHOLD_MINS: i64 = 10;

/// Workers get this long to drain after the stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spreadbot=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🚀 spreadbot starting");

    let config = Config::from_env()?;
    let rates = Arc::new(ExchangeRateManager::new(Exchange::Binance));
    let (store, rate_refresh_rx) = PriceStore::new(rates.clone());
    let engine = Arc::new(SpreadEngine::new(store.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    handles.push(tokio::spawn(run_rate_refresh(
        rate_refresh_rx,
        rates.clone(),
        store.clone(),
        shutdown_rx.clone(),
    )));

    // Venue adapters. A venue that fails to initialize is logged and
    // skipped; the rest of the board keeps running without it.
    for (name, result) in [
        (
            "binance",
            adapters::binance::spawn(&config, store.clone(), shutdown_rx.clone()).await,
        ),
        (
            "aster",
            adapters::aster::spawn(&config, store.clone(), shutdown_rx.clone()).await,
        ),
        (
            "lighter",
            adapters::lighter::spawn(&config, store.clone(), shutdown_rx.clone()).await,
        ),
        (
            "odos",
            adapters::dex::spawn(&config, store.clone(), shutdown_rx.clone()).await,
        ),
    ] {
        match result {
            Ok(adapter_handles) => handles.extend(adapter_handles),
            Err(e) => error!(venue = name, error = %e, "adapter failed to start"),
        }
    }

    handles.push(tokio::spawn(run_stats_loop(
        store.clone(),
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_cleaner_loop(
        store.clone(),
        shutdown_rx.clone(),
    )));

    // JSON API.
    let app = api::router(AppState {
        store,
        rates,
        engine,
        default_min_spread: config.min_spread_percent,
    });
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    info!(port = config.port, "📡 API listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server exited");
        }
    });

    wait_for_stop_signal().await?;
    info!("🛑 stop signal received; shutting down");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await
    .is_err()
    {
        warn!("some workers did not stop within the grace period");
    }
    let _ = server.await;

    info!("shutdown complete");
    Ok(())
}

/// Drain rate-refresh triggers emitted by the store's write path.
/// Refreshes run here, never under the store's write lock.
async fn run_rate_refresh(
    mut triggers: mpsc::UnboundedReceiver<()>,
    rates: Arc<ExchangeRateManager>,
    store: Arc<PriceStore>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    return;
                }
                rates.refresh_from_store(&store);
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_stats_loop(store: Arc<PriceStore>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = sleep(STATS_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        let stats = store.get_stats();
        info!(
            prices = stats.total_prices,
            symbols = stats.total_symbols,
            accepted = stats.accepted_writes,
            rejected = stats.rejected_writes,
            by_exchange = ?stats.by_exchange,
            "📊 store stats"
        );
    }
}

async fn run_cleaner_loop(store: Arc<PriceStore>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = sleep(CLEAN_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        let removed = store.clean_stale_data(chrono::Duration::minutes(CLEAN_THRESHOLD_MINS));
        if removed > 0 {
            info!(removed, "🧹 stale entries removed");
        }
    }
}

async fn wait_for_stop_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    }
    Ok(())
}
