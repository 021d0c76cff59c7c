//! Aster venue wiring. Aster's perp API mirrors the Binance futures
//! shape, so the shared book-ticker pool and snapshot plumbing apply
//! unchanged; only the endpoints and the venue tag differ.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::models::{Exchange, MarketType};
use crate::store::PriceStore;

use super::binance::cold_start;
use super::book_ticker::{run_snapshot_poller, spawn_pool, BookTickerVenue, VenueRest};
use super::{http_client, Shutdown};

const BOOK_TICKER_PATH: &str = "/fapi/v1/ticker/bookTicker";
const DAY_TICKER_PATH: &str = "/fapi/v1/ticker/24hr";

// Aster answers slower than Binance under load.
const POLL_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn spawn(
    config: &Config,
    store: Arc<PriceStore>,
    shutdown: Shutdown,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let client = http_client(config.https_proxy.as_deref(), POLL_TIMEOUT)?;
    let rest = VenueRest {
        bases: config.aster_rest_bases.clone(),
        book_ticker_path: BOOK_TICKER_PATH.to_string(),
        day_ticker_path: DAY_TICKER_PATH.to_string(),
    };

    let universe = cold_start(
        &client,
        &rest,
        Exchange::Aster,
        MarketType::Future,
        &store,
    )
    .await;

    let mut handles = Vec::new();
    if !universe.is_empty() {
        handles.extend(spawn_pool(
            BookTickerVenue {
                exchange: Exchange::Aster,
                market_type: MarketType::Future,
                ws_url: config.aster_ws_url.clone(),
            },
            universe,
            store.clone(),
            shutdown.clone(),
        ));
    }

    handles.push(tokio::spawn(run_snapshot_poller(
        client,
        rest,
        Exchange::Aster,
        MarketType::Future,
        store,
        shutdown,
        Duration::from_secs(config.rest_refresh_secs),
        POLL_TIMEOUT,
    )));

    Ok(handles)
}
