//! Binance venue wiring: spot + USD-M futures book-ticker pools with
//! corrective REST snapshots. Binance publishes several regional REST
//! bases; they rotate on failure.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{Exchange, MarketType};
use crate::store::PriceStore;
use crate::symbols::has_known_quote;

use super::book_ticker::{
    apply_snapshot, fetch_book_tickers, fetch_day_volumes, run_snapshot_poller, spawn_pool,
    BookTickerVenue, VenueRest,
};
use super::{http_client, Shutdown};

const SPOT_BOOK_TICKER_PATH: &str = "/api/v3/ticker/bookTicker";
const SPOT_DAY_TICKER_PATH: &str = "/api/v3/ticker/24hr";
const FUTURES_BOOK_TICKER_PATH: &str = "/fapi/v1/ticker/bookTicker";
const FUTURES_DAY_TICKER_PATH: &str = "/fapi/v1/ticker/24hr";

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Cold-start snapshot, streaming pools, and steady-state pollers for
/// both Binance markets. The snapshot doubles as the symbol-universe
/// discovery for the pools; instruments listed later are not added
/// until the next process start.
pub async fn spawn(
    config: &Config,
    store: Arc<PriceStore>,
    shutdown: Shutdown,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let client = http_client(config.https_proxy.as_deref(), POLL_TIMEOUT)?;
    let mut handles = Vec::new();

    let markets = [
        (
            MarketType::Spot,
            VenueRest {
                bases: config.binance_spot_rest_bases.clone(),
                book_ticker_path: SPOT_BOOK_TICKER_PATH.to_string(),
                day_ticker_path: SPOT_DAY_TICKER_PATH.to_string(),
            },
            config.binance_spot_ws_url.clone(),
        ),
        (
            MarketType::Future,
            VenueRest {
                bases: config.binance_futures_rest_bases.clone(),
                book_ticker_path: FUTURES_BOOK_TICKER_PATH.to_string(),
                day_ticker_path: FUTURES_DAY_TICKER_PATH.to_string(),
            },
            config.binance_futures_ws_url.clone(),
        ),
    ];

    for (market_type, rest, ws_url) in markets {
        let universe =
            cold_start(&client, &rest, Exchange::Binance, market_type, &store).await;

        if !universe.is_empty() {
            handles.extend(spawn_pool(
                BookTickerVenue {
                    exchange: Exchange::Binance,
                    market_type,
                    ws_url,
                },
                universe,
                store.clone(),
                shutdown.clone(),
            ));
        }

        handles.push(tokio::spawn(run_snapshot_poller(
            client.clone(),
            rest,
            Exchange::Binance,
            market_type,
            store.clone(),
            shutdown.clone(),
            Duration::from_secs(config.rest_refresh_secs),
            POLL_TIMEOUT,
        )));
    }

    Ok(handles)
}

/// Initial snapshot: seed the store and return the instrument universe
/// for the streaming pool. A failed cold start leaves streaming off for
/// this market; the poller keeps re-attempting on its cadence.
pub(crate) async fn cold_start(
    client: &reqwest::Client,
    rest: &VenueRest,
    exchange: Exchange,
    market_type: MarketType,
    store: &PriceStore,
) -> Vec<String> {
    let rows = match fetch_book_tickers(client, rest)
        .await
        .context("cold-start snapshot")
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(exchange = %exchange, market_type = %market_type, error = %e, "cold start failed");
            return Vec::new();
        }
    };
    let volumes = fetch_day_volumes(client, rest).await.unwrap_or_default();

    let accepted = apply_snapshot(store, exchange, market_type, &rows, &volumes);
    let universe: Vec<String> = rows
        .iter()
        .filter(|r| has_known_quote(&r.symbol))
        .map(|r| r.symbol.clone())
        .collect();

    info!(
        exchange = %exchange,
        market_type = %market_type,
        instruments = universe.len(),
        accepted,
        "cold-start snapshot loaded"
    );
    universe
}
