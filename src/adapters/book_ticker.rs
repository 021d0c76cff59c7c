//! Sharded book-ticker streaming pool plus REST snapshot plumbing for
//! venues speaking the Binance-shaped wire format.
//!
//! Design:
//! - One persistent connection per shard of instruments (combined-stream
//!   subscription in the URL), reconnecting with a fixed delay
//! - simd-json + fast-float decode on the hot path
//! - Server pings echoed verbatim; silence past 90 s logged as a
//!   heartbeat anomaly; connections recycled before the venue's 24 h cap
//! - Non-book-ticker frames (acks, unknown types) tolerated silently
//! - REST snapshots with base-URL rotation and bounded retries feed the
//!   same store under the freshness rule, so polling is purely corrective

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{Exchange, MarketType, Price, PriceSource};
use crate::store::PriceStore;
use crate::symbols::has_known_quote;

use super::{
    is_shutdown, shard_symbols, PollCadence, Shutdown, HEARTBEAT_TIMEOUT, MAX_CONNECTION_AGE,
    RECONNECT_DELAY, REST_ATTEMPTS, REST_RETRY_DELAY, SYMBOLS_PER_CONNECTION,
};

/// Parse-error floods surface one warning per this many drops.
const PARSE_WARN_EVERY: u64 = 500;

/// Streaming endpoint identity for one venue + market type.
#[derive(Debug, Clone)]
pub struct BookTickerVenue {
    pub exchange: Exchange,
    pub market_type: MarketType,
    /// Combined-stream endpoint, e.g. "wss://.../stream"
    pub ws_url: String,
}

/// REST endpoint set for the same venue.
#[derive(Debug, Clone)]
pub struct VenueRest {
    /// Tried in rotation on failure
    pub bases: Vec<String>,
    pub book_ticker_path: String,
    pub day_ticker_path: String,
}

// ============================================================================
// Wire decode (hot path)
// ============================================================================

#[derive(Debug, PartialEq)]
struct BookTickerFrame {
    symbol: String,
    bid_price: f64,
    bid_qty: f64,
    ask_price: f64,
    ask_qty: f64,
    timestamp_ms: Option<i64>,
}

#[derive(Debug)]
enum ParseError {
    InvalidJson,
    NotObject,
    MissingField(&'static str),
    InvalidPrice,
    ControlMessage,
}

fn parse_price_field(value: Option<&simd_json::BorrowedValue>) -> Result<f64, ParseError> {
    use simd_json::prelude::*;
    let s = value
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("price"))?;
    fast_float::parse(s).map_err(|_| ParseError::InvalidPrice)
}

/// Decode a book-ticker frame, either the combined-stream wrapper
/// {"stream":"...","data":{...}} or the bare payload
/// {"u":...,"s":"BTCUSDT","b":"...","B":"...","a":"...","A":"..."}.
/// Uses the match time ("T") when present, else the event time ("E").
fn parse_book_ticker(raw: &mut [u8]) -> Result<BookTickerFrame, ParseError> {
    use simd_json::prelude::*;

    let value = simd_json::to_borrowed_value(raw).map_err(|_| ParseError::InvalidJson)?;
    let obj = value.as_object().ok_or(ParseError::NotObject)?;

    // Subscription acks and command responses.
    if obj.contains_key("result") || obj.contains_key("id") {
        return Err(ParseError::ControlMessage);
    }

    let data_obj = match obj.get("data") {
        Some(data) => data.as_object().ok_or(ParseError::NotObject)?,
        None => obj,
    };

    let symbol = data_obj
        .get("s")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("s"))?
        .to_string();

    let bid_price = parse_price_field(data_obj.get("b"))?;
    let bid_qty = parse_price_field(data_obj.get("B"))?;
    let ask_price = parse_price_field(data_obj.get("a"))?;
    let ask_qty = parse_price_field(data_obj.get("A"))?;

    let timestamp_ms = data_obj
        .get("T")
        .and_then(|v| v.as_i64())
        .or_else(|| data_obj.get("E").and_then(|v| v.as_i64()));

    Ok(BookTickerFrame {
        symbol,
        bid_price,
        bid_qty,
        ask_price,
        ask_qty,
        timestamp_ms,
    })
}

fn frame_timestamp(frame: &BookTickerFrame) -> DateTime<Utc> {
    frame
        .timestamp_ms
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

// ============================================================================
// Streaming pool
// ============================================================================

/// Spawn one read-loop task per shard. Instruments are assigned
/// round-robin at startup; the shard set is fixed for the pool's life.
pub fn spawn_pool(
    venue: BookTickerVenue,
    symbols: Vec<String>,
    store: Arc<PriceStore>,
    shutdown: Shutdown,
) -> Vec<tokio::task::JoinHandle<()>> {
    let shards = shard_symbols(&symbols, SYMBOLS_PER_CONNECTION);
    info!(
        exchange = %venue.exchange,
        market_type = %venue.market_type,
        symbols = symbols.len(),
        connections = shards.len(),
        "starting book-ticker pool"
    );

    shards
        .into_iter()
        .enumerate()
        .map(|(shard_id, shard)| {
            let venue = venue.clone();
            let store = store.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_connection(venue, shard_id, shard, store, shutdown).await;
            })
        })
        .collect()
}

async fn run_connection(
    venue: BookTickerVenue,
    shard_id: usize,
    shard: Vec<String>,
    store: Arc<PriceStore>,
    mut shutdown: Shutdown,
) {
    loop {
        if is_shutdown(&shutdown) {
            return;
        }
        match stream_shard(&venue, shard_id, &shard, &store, &mut shutdown).await {
            Ok(()) => {
                if is_shutdown(&shutdown) {
                    return;
                }
                // Proactive recycle: re-dial immediately with the same shard.
            }
            Err(e) => {
                warn!(
                    exchange = %venue.exchange,
                    shard_id,
                    error = %e,
                    "book-ticker stream dropped; reconnecting"
                );
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

async fn stream_shard(
    venue: &BookTickerVenue,
    shard_id: usize,
    shard: &[String],
    store: &PriceStore,
    shutdown: &mut Shutdown,
) -> Result<()> {
    let streams: Vec<String> = shard
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    let url = format!("{}?streams={}", venue.ws_url, streams.join("/"));

    let (ws_stream, _) = connect_async(&url)
        .await
        .context("connect book-ticker stream")?;
    info!(
        exchange = %venue.exchange,
        market_type = %venue.market_type,
        shard_id,
        instruments = shard.len(),
        "book-ticker stream connected"
    );

    let (mut write, mut read) = ws_stream.split();
    let connected_at = Instant::now();
    let mut last_ping = Instant::now();
    let mut parse_errors: u64 = 0;
    let mut parse_buffer: Vec<u8> = Vec::with_capacity(512);

    let mut health = interval(Duration::from_secs(30));
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = health.tick() => {
                if connected_at.elapsed() > MAX_CONNECTION_AGE {
                    info!(exchange = %venue.exchange, shard_id, "recycling aged connection");
                    return Ok(());
                }
                if last_ping.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!(
                        exchange = %venue.exchange,
                        shard_id,
                        silent_secs = last_ping.elapsed().as_secs(),
                        "no server ping; heartbeat anomaly"
                    );
                }
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Err(anyhow!("book-ticker stream ended"));
                };
                match msg.context("book-ticker read error")? {
                    Message::Text(text) => {
                        handle_payload(venue, text.as_bytes(), &mut parse_buffer, store, &mut parse_errors);
                    }
                    Message::Binary(data) => {
                        handle_payload(venue, &data, &mut parse_buffer, store, &mut parse_errors);
                    }
                    Message::Ping(payload) => {
                        last_ping = Instant::now();
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        return Err(anyhow!("server closed connection: {frame:?}"));
                    }
                    _ => {}
                }
            }
        }
    }
}

fn handle_payload(
    venue: &BookTickerVenue,
    raw: &[u8],
    parse_buffer: &mut Vec<u8>,
    store: &PriceStore,
    parse_errors: &mut u64,
) {
    // simd-json mutates its input; reuse one buffer per connection.
    parse_buffer.clear();
    parse_buffer.extend_from_slice(raw);

    match parse_book_ticker(parse_buffer) {
        Ok(frame) => {
            let timestamp = frame_timestamp(&frame);
            let price = Price::top_of_book(
                frame.symbol,
                venue.exchange,
                venue.market_type,
                frame.bid_price,
                frame.ask_price,
                PriceSource::Websocket,
                timestamp,
            )
            .with_quantities(frame.bid_qty, frame.ask_qty);
            store.update_price(price);
        }
        Err(ParseError::ControlMessage) => {}
        Err(_) => {
            *parse_errors += 1;
            if *parse_errors % PARSE_WARN_EVERY == 1 {
                warn!(
                    exchange = %venue.exchange,
                    dropped = *parse_errors,
                    "unparseable frames on book-ticker stream"
                );
            }
        }
    }
}

// ============================================================================
// REST snapshots
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerRow {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: String,
    #[serde(rename = "bidQty", default)]
    pub bid_qty: String,
    #[serde(rename = "askPrice")]
    pub ask_price: String,
    #[serde(rename = "askQty", default)]
    pub ask_qty: String,
}

impl BookTickerRow {
    fn price(s: &str) -> f64 {
        fast_float::parse(s).unwrap_or(0.0)
    }

    pub fn bid(&self) -> f64 {
        Self::price(&self.bid_price)
    }
    pub fn ask(&self) -> f64 {
        Self::price(&self.ask_price)
    }
    pub fn bid_quantity(&self) -> f64 {
        Self::price(&self.bid_qty)
    }
    pub fn ask_quantity(&self) -> f64 {
        Self::price(&self.ask_qty)
    }
}

#[derive(Debug, Deserialize)]
struct DayTickerRow {
    symbol: String,
    #[serde(rename = "quoteVolume", default)]
    quote_volume: String,
}

/// GET with base rotation and bounded retries. Non-429 client errors are
/// permanent: fail fast and let the poller re-attempt on cadence.
async fn fetch_rotating<T: DeserializeOwned>(
    client: &reqwest::Client,
    bases: &[String],
    path: &str,
) -> Result<T> {
    if bases.is_empty() {
        return Err(anyhow!("no REST bases configured"));
    }
    let mut last_err = None;
    for attempt in 0..REST_ATTEMPTS {
        let base = &bases[attempt % bases.len()];
        let url = format!("{base}{path}");
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<T>().await {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(anyhow!("decode {url}: {e}")),
            },
            Ok(resp) => {
                let status = resp.status();
                if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(anyhow!("GET {url}: {status}"));
                }
                last_err = Some(anyhow!("GET {url}: {status}"));
            }
            Err(e) => last_err = Some(anyhow!("GET {url}: {e}")),
        }
        if attempt + 1 < REST_ATTEMPTS {
            sleep(REST_RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("request attempts exhausted")))
}

pub async fn fetch_book_tickers(
    client: &reqwest::Client,
    rest: &VenueRest,
) -> Result<Vec<BookTickerRow>> {
    fetch_rotating(client, &rest.bases, &rest.book_ticker_path).await
}

pub async fn fetch_day_volumes(
    client: &reqwest::Client,
    rest: &VenueRest,
) -> Result<HashMap<String, f64>> {
    let rows: Vec<DayTickerRow> = fetch_rotating(client, &rest.bases, &rest.day_ticker_path).await?;
    Ok(rows
        .into_iter()
        .map(|r| {
            let vol = fast_float::parse(&r.quote_volume).unwrap_or(0.0);
            (r.symbol, vol)
        })
        .collect())
}

/// Feed a snapshot into the store. Instruments without a recognized
/// quote suffix are skipped; the freshness rule decides the rest.
pub fn apply_snapshot(
    store: &PriceStore,
    exchange: Exchange,
    market_type: MarketType,
    rows: &[BookTickerRow],
    volumes: &HashMap<String, f64>,
) -> usize {
    let now = Utc::now();
    let mut accepted = 0;
    for row in rows {
        if !has_known_quote(&row.symbol) {
            continue;
        }
        let (bid, ask) = (row.bid(), row.ask());
        if bid <= 0.0 && ask <= 0.0 {
            continue;
        }
        let price = Price::top_of_book(
            row.symbol.clone(),
            exchange,
            market_type,
            bid,
            ask,
            PriceSource::Rest,
            now,
        )
        .with_quantities(row.bid_quantity(), row.ask_quantity())
        .with_volume(volumes.get(&row.symbol).copied().unwrap_or(0.0));
        if store.update_price(price) {
            accepted += 1;
        }
    }
    accepted
}

/// Steady-state corrective poller: accelerated for the first minute
/// after start, then on the venue's normal cadence. Each poll is
/// bounded by `poll_timeout` and races the shutdown signal.
pub async fn run_snapshot_poller(
    client: reqwest::Client,
    rest: VenueRest,
    exchange: Exchange,
    market_type: MarketType,
    store: Arc<PriceStore>,
    mut shutdown: Shutdown,
    normal_every: Duration,
    poll_timeout: Duration,
) {
    let cadence = PollCadence::standard(normal_every);
    info!(
        exchange = %exchange,
        market_type = %market_type,
        "starting snapshot poller"
    );

    loop {
        match tokio::time::timeout(
            poll_timeout,
            poll_once(&client, &rest, exchange, market_type, &store),
        )
        .await
        {
            Ok(Ok(accepted)) => {
                debug!(exchange = %exchange, market_type = %market_type, accepted, "snapshot applied");
            }
            Ok(Err(e)) => {
                warn!(exchange = %exchange, market_type = %market_type, error = %e, "snapshot poll failed");
            }
            Err(_) => {
                warn!(exchange = %exchange, market_type = %market_type, "snapshot poll timed out");
            }
        }

        tokio::select! {
            _ = sleep(cadence.next_delay()) => {}
            _ = shutdown.changed() => {
                info!(exchange = %exchange, market_type = %market_type, "snapshot poller stopping");
                return;
            }
        }
    }
}

async fn poll_once(
    client: &reqwest::Client,
    rest: &VenueRest,
    exchange: Exchange,
    market_type: MarketType,
    store: &PriceStore,
) -> Result<usize> {
    let rows = fetch_book_tickers(client, rest).await?;
    // Volumes are decoration; a failed volume fetch doesn't fail the poll.
    let volumes = match fetch_day_volumes(client, rest).await {
        Ok(v) => v,
        Err(e) => {
            debug!(exchange = %exchange, error = %e, "24h volume fetch failed");
            HashMap::new()
        }
    };
    Ok(apply_snapshot(store, exchange, market_type, &rows, &volumes))
}
