//! Lighter adapter. Lighter publishes no consolidated book-ticker
//! stream, only per-market incremental order-book updates, so each
//! connection maintains local books and extracts top-of-book itself.
//!
//! - Updates carry a continuity pair (begin_offset, offset); a mismatch
//!   against the local book means a dropped frame: the book is discarded
//!   and rebuilt from a REST snapshot before anything else is trusted
//! - Best bid/ask extraction filters dust levels below a minimum
//!   notional so one-lot quotes don't dominate the spread matrix
//! - Books are resynced periodically regardless, to bound silent drift
//! - The market list is refreshed on an interval; new markets join on
//!   the next reconnect cycle rather than by mutating live subscriptions

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Exchange, MarketType, Price, PriceSource};
use crate::store::PriceStore;

use super::{http_client, is_shutdown, PollCadence, Shutdown, RECONNECT_DELAY};

const MARKETS_PATH: &str = "/api/v1/orderBooks";
const BOOK_SNAPSHOT_PATH: &str = "/api/v1/orderBookOrders";
const EXCHANGE_STATS_PATH: &str = "/api/v1/exchangeStats";

/// Levels worth less than this (price * size, USDT) are dust.
const MIN_NOTIONAL: f64 = 5.0;

/// Periodic resync bounds: whichever comes first.
const RESYNC_EVERY_UPDATES: u32 = 1_000;
const RESYNC_MAX_AGE: Duration = Duration::from_secs(10);

/// Fixed connection fan-out; each connection owns the markets with
/// market_id % LIGHTER_CONNECTIONS == its slot.
const LIGHTER_CONNECTIONS: u32 = 4;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// The REST stats feed has no book, only a last-trade print; bid/ask
/// are fabricated one basis point around it.
const REST_FABRICATION_BP: f64 = 1e-4;

#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub market_id: u32,
    pub symbol: String,
}

impl Market {
    /// Lighter lists bare base assets; everything is USDC-quoted.
    pub fn venue_symbol(&self) -> String {
        format!("{}USDC", self.symbol)
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    order_books: Vec<Market>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct BookSnapshotResponse {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct StatsRow {
    symbol: String,
    #[serde(default)]
    last_trade_price: String,
    #[serde(default)]
    daily_quote_token_volume: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    order_book_stats: Vec<StatsRow>,
}

#[derive(Debug, Deserialize)]
struct WsBookPayload {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    order_book: Option<WsBookPayload>,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    begin_offset: u64,
}

fn parse_level(level: &WireLevel) -> Option<(f64, f64)> {
    let price: f64 = fast_float::parse(&level.price).ok()?;
    let size: f64 = fast_float::parse(&level.size).ok()?;
    Some((price, size))
}

// ============================================================================
// Local book
// ============================================================================

#[derive(Debug)]
pub(crate) enum ApplyError {
    /// begin_offset did not continue the stored offset; book dropped.
    Gap { expected: u64, got: u64 },
    /// No snapshot yet; updates are meaningless.
    NotSynced,
}

/// Price key for the ordered book sides. Prices are positive, and for
/// non-negative floats the IEEE bit pattern orders the same way the
/// numbers do, so the BTreeMap stays sorted by price.
fn price_key(price: f64) -> u64 {
    price.to_bits()
}

/// Rolling order book rebuilt from snapshots and patched by deltas.
/// Each side is an ordered map so best-level extraction walks from the
/// top of book and stops at the first level above the dust threshold.
pub(crate) struct LocalBook {
    bids: BTreeMap<u64, (f64, f64)>,
    asks: BTreeMap<u64, (f64, f64)>,
    offset: u64,
    synced: bool,
    updates_since_resync: u32,
    last_resync: Instant,
}

impl Default for LocalBook {
    fn default() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            offset: 0,
            synced: false,
            updates_since_resync: 0,
            last_resync: Instant::now(),
        }
    }
}

impl LocalBook {
    fn apply_side(side: &mut BTreeMap<u64, (f64, f64)>, levels: &[WireLevel]) {
        for level in levels {
            let Some((price, size)) = parse_level(level) else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }
            if size <= 0.0 {
                side.remove(&price_key(price));
            } else {
                side.insert(price_key(price), (price, size));
            }
        }
    }

    pub(crate) fn reset_from_snapshot(
        &mut self,
        bids: &[WireLevel],
        asks: &[WireLevel],
        offset: u64,
    ) {
        self.bids.clear();
        self.asks.clear();
        Self::apply_side(&mut self.bids, bids);
        Self::apply_side(&mut self.asks, asks);
        self.offset = offset;
        self.synced = true;
        self.updates_since_resync = 0;
        self.last_resync = Instant::now();
    }

    pub(crate) fn apply_update(
        &mut self,
        begin_offset: u64,
        offset: u64,
        bids: &[WireLevel],
        asks: &[WireLevel],
    ) -> Result<(), ApplyError> {
        if !self.synced {
            return Err(ApplyError::NotSynced);
        }
        if begin_offset != self.offset {
            let expected = self.offset;
            self.clear();
            return Err(ApplyError::Gap {
                expected,
                got: begin_offset,
            });
        }
        Self::apply_side(&mut self.bids, bids);
        Self::apply_side(&mut self.asks, asks);
        self.offset = offset;
        self.updates_since_resync += 1;
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.offset = 0;
        self.synced = false;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.synced
    }

    pub(crate) fn needs_periodic_resync(&self) -> bool {
        self.synced
            && (self.updates_since_resync >= RESYNC_EVERY_UPDATES
                || self.last_resync.elapsed() >= RESYNC_MAX_AGE)
    }

    /// Best level above the dust threshold: highest bid, lowest ask.
    /// The maps iterate in price order, so the walk stops at the first
    /// level that clears the notional filter.
    pub(crate) fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids
            .values()
            .rev()
            .find(|(p, s)| p * s >= MIN_NOTIONAL)
            .copied()
    }

    pub(crate) fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks
            .values()
            .find(|(p, s)| p * s >= MIN_NOTIONAL)
            .copied()
    }
}

// ============================================================================
// Adapter
// ============================================================================

type SharedMarkets = Arc<RwLock<Vec<Market>>>;

pub async fn spawn(
    config: &Config,
    store: Arc<PriceStore>,
    shutdown: Shutdown,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let client = http_client(config.https_proxy.as_deref(), POLL_TIMEOUT)?;
    let base = config.lighter_rest_base.clone();

    let markets: SharedMarkets = Arc::new(RwLock::new(Vec::new()));
    match fetch_markets(&client, &base).await {
        Ok(list) => {
            info!(markets = list.len(), "lighter market list loaded");
            *markets.write() = list;
        }
        Err(e) => warn!(error = %e, "lighter market list unavailable at start"),
    }

    let mut handles = Vec::new();

    for slot in 0..LIGHTER_CONNECTIONS {
        let ws_url = config.lighter_ws_url.clone();
        let client = client.clone();
        let base = base.clone();
        let markets = markets.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            run_connection(slot, ws_url, client, base, markets, store, shutdown).await;
        }));
    }

    handles.push(tokio::spawn(run_stats_poller(
        client.clone(),
        base.clone(),
        store.clone(),
        shutdown.clone(),
        Duration::from_secs(config.rest_refresh_secs),
    )));

    if config.lighter_market_refresh_secs > 0 {
        handles.push(tokio::spawn(run_market_refresh(
            client,
            base,
            markets,
            shutdown,
            Duration::from_secs(config.lighter_market_refresh_secs),
        )));
    }

    Ok(handles)
}

async fn fetch_markets(client: &reqwest::Client, base: &str) -> Result<Vec<Market>> {
    let url = format!("{base}{MARKETS_PATH}");
    let resp: MarketsResponse = client
        .get(&url)
        .send()
        .await
        .context("GET lighter markets")?
        .error_for_status()
        .context("lighter markets status")?
        .json()
        .await
        .context("decode lighter markets")?;
    Ok(resp.order_books)
}

async fn fetch_book_snapshot(
    client: &reqwest::Client,
    base: &str,
    market_id: u32,
) -> Result<BookSnapshotResponse> {
    let url = format!("{base}{BOOK_SNAPSHOT_PATH}?market_id={market_id}&limit=200");
    client
        .get(&url)
        .send()
        .await
        .context("GET lighter book snapshot")?
        .error_for_status()
        .context("lighter book snapshot status")?
        .json()
        .await
        .context("decode lighter book snapshot")
}

/// Periodic market-list refresh. Connections pick new markets up when
/// they next (re)connect; live subscriptions are left alone.
async fn run_market_refresh(
    client: reqwest::Client,
    base: String,
    markets: SharedMarkets,
    mut shutdown: Shutdown,
    every: Duration,
) {
    loop {
        tokio::select! {
            _ = sleep(every) => {}
            _ = shutdown.changed() => return,
        }
        match fetch_markets(&client, &base).await {
            Ok(list) => {
                let known = markets.read().len();
                if list.len() != known {
                    info!(markets = list.len(), known, "lighter market list changed");
                }
                *markets.write() = list;
            }
            Err(e) => warn!(error = %e, "lighter market refresh failed"),
        }
    }
}

async fn run_connection(
    slot: u32,
    ws_url: String,
    client: reqwest::Client,
    base: String,
    markets: SharedMarkets,
    store: Arc<PriceStore>,
    mut shutdown: Shutdown,
) {
    loop {
        if is_shutdown(&shutdown) {
            return;
        }

        // This slot's share of the current market list.
        let assigned: Vec<Market> = markets
            .read()
            .iter()
            .filter(|m| m.market_id % LIGHTER_CONNECTIONS == slot)
            .cloned()
            .collect();

        let result = if assigned.is_empty() {
            Err(anyhow!("no markets assigned yet"))
        } else {
            stream_books(&ws_url, &client, &base, &assigned, &store, &mut shutdown).await
        };

        match result {
            Ok(()) => {
                if is_shutdown(&shutdown) {
                    return;
                }
            }
            Err(e) => {
                debug!(slot, error = %e, "lighter stream dropped; reconnecting");
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

async fn stream_books(
    ws_url: &str,
    client: &reqwest::Client,
    base: &str,
    assigned: &[Market],
    store: &PriceStore,
    shutdown: &mut Shutdown,
) -> Result<()> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .context("connect lighter stream")?;
    let (mut write, mut read) = ws_stream.split();

    let by_id: HashMap<u32, &Market> = assigned.iter().map(|m| (m.market_id, m)).collect();
    let mut books: HashMap<u32, LocalBook> = HashMap::new();

    for market in assigned {
        let sub = serde_json::json!({
            "type": "subscribe",
            "channel": format!("order_book/{}", market.market_id),
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send lighter subscription")?;
    }
    info!(markets = assigned.len(), "lighter stream subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Err(anyhow!("lighter stream ended"));
                };
                match msg.context("lighter read error")? {
                    Message::Text(text) => {
                        if let Some(envelope) = decode_envelope(&text) {
                            if envelope.kind == "ping" {
                                let _ = write
                                    .send(Message::Text(r#"{"type":"pong"}"#.to_string()))
                                    .await;
                                continue;
                            }
                            handle_envelope(envelope, &by_id, &mut books, client, base, store)
                                .await;
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        return Err(anyhow!("lighter closed connection: {frame:?}"));
                    }
                    _ => {}
                }
            }
        }
    }
}

fn decode_envelope(text: &str) -> Option<WsEnvelope> {
    serde_json::from_str(text).ok()
}

fn channel_market_id(channel: &str) -> Option<u32> {
    channel.rsplit(':').next()?.parse().ok()
}

async fn handle_envelope(
    envelope: WsEnvelope,
    by_id: &HashMap<u32, &Market>,
    books: &mut HashMap<u32, LocalBook>,
    client: &reqwest::Client,
    base: &str,
    store: &PriceStore,
) {
    let Some(market_id) = channel_market_id(&envelope.channel) else {
        return;
    };
    let Some(market) = by_id.get(&market_id).copied() else {
        return;
    };
    let book = books.entry(market_id).or_default();

    match envelope.kind.as_str() {
        "subscribed/order_book" => {
            let Some(payload) = envelope.order_book else {
                return;
            };
            book.reset_from_snapshot(&payload.bids, &payload.asks, payload.offset);
            push_top_of_book(store, market, book, PriceSource::Websocket);
        }
        "update/order_book" => {
            let Some(payload) = envelope.order_book else {
                return;
            };
            match book.apply_update(
                envelope.begin_offset,
                envelope.offset,
                &payload.bids,
                &payload.asks,
            ) {
                Ok(()) => {
                    if book.needs_periodic_resync() {
                        resync_book(client, base, market, book, store).await;
                    } else {
                        push_top_of_book(store, market, book, PriceSource::Websocket);
                    }
                }
                Err(ApplyError::Gap { expected, got }) => {
                    warn!(
                        market = market.venue_symbol(),
                        expected, got, "lighter book gap; resyncing from snapshot"
                    );
                    resync_book(client, base, market, book, store).await;
                }
                Err(ApplyError::NotSynced) => {
                    resync_book(client, base, market, book, store).await;
                }
            }
        }
        _ => {} // acks and unknown channels are tolerated silently
    }
}

/// Rebuild a book from REST and publish its top-of-book as snapshot
/// data. The freshness rule keeps it from displacing live stream rows.
async fn resync_book(
    client: &reqwest::Client,
    base: &str,
    market: &Market,
    book: &mut LocalBook,
    store: &PriceStore,
) {
    match fetch_book_snapshot(client, base, market.market_id).await {
        Ok(snapshot) => {
            book.reset_from_snapshot(&snapshot.bids, &snapshot.asks, snapshot.offset);
            push_top_of_book(store, market, book, PriceSource::Rest);
        }
        Err(e) => {
            book.clear();
            warn!(market = market.venue_symbol(), error = %e, "lighter book resync failed");
        }
    }
}

fn push_top_of_book(store: &PriceStore, market: &Market, book: &LocalBook, source: PriceSource) {
    if !book.is_synced() {
        return;
    }
    let bid = book.best_bid();
    let ask = book.best_ask();
    if bid.is_none() && ask.is_none() {
        return;
    }
    let (bid_price, bid_qty) = bid.unwrap_or((0.0, 0.0));
    let (ask_price, ask_qty) = ask.unwrap_or((0.0, 0.0));

    let price = Price::top_of_book(
        market.venue_symbol(),
        Exchange::Lighter,
        MarketType::Spot,
        bid_price,
        ask_price,
        source,
        Utc::now(),
    )
    .with_quantities(bid_qty, ask_qty);
    store.update_price(price);
}

/// Steady-state REST feed. Lighter's stats endpoint only exposes a
/// last-trade price, so bid/ask are fabricated one bp around it; the
/// store accepts these, and stream rows displace them on arrival.
async fn run_stats_poller(
    client: reqwest::Client,
    base: String,
    store: Arc<PriceStore>,
    mut shutdown: Shutdown,
    normal_every: Duration,
) {
    let cadence = PollCadence::standard(normal_every);
    info!("starting lighter stats poller");

    loop {
        match tokio::time::timeout(POLL_TIMEOUT, poll_stats(&client, &base, &store)).await {
            Ok(Ok(accepted)) => debug!(accepted, "lighter stats applied"),
            Ok(Err(e)) => warn!(error = %e, "lighter stats poll failed"),
            Err(_) => warn!("lighter stats poll timed out"),
        }

        tokio::select! {
            _ = sleep(cadence.next_delay()) => {}
            _ = shutdown.changed() => {
                info!("lighter stats poller stopping");
                return;
            }
        }
    }
}

async fn poll_stats(client: &reqwest::Client, base: &str, store: &PriceStore) -> Result<usize> {
    let url = format!("{base}{EXCHANGE_STATS_PATH}");
    let resp: StatsResponse = client
        .get(&url)
        .send()
        .await
        .context("GET lighter stats")?
        .error_for_status()
        .context("lighter stats status")?
        .json()
        .await
        .context("decode lighter stats")?;

    let now = Utc::now();
    let mut accepted = 0;
    for row in resp.order_book_stats {
        let last: f64 = fast_float::parse(&row.last_trade_price).unwrap_or(0.0);
        if last <= 0.0 {
            continue;
        }
        let volume: f64 = fast_float::parse(&row.daily_quote_token_volume).unwrap_or(0.0);
        let price = Price::top_of_book(
            format!("{}USDC", row.symbol),
            Exchange::Lighter,
            MarketType::Spot,
            last * (1.0 - REST_FABRICATION_BP),
            last * (1.0 + REST_FABRICATION_BP),
            PriceSource::Rest,
            now,
        )
        .with_volume(volume);
        if store.update_price(price) {
            accepted += 1;
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: &str, size: &str) -> WireLevel {
        WireLevel {
            price: price.to_string(),
            size: size.to_string(),
        }
    }

    fn synced_book() -> LocalBook {
        let mut book = LocalBook::default();
        book.reset_from_snapshot(
            &[level("3120.0", "2.0"), level("3119.5", "5.0")],
            &[level("3120.5", "1.5"), level("3121.0", "4.0")],
            40,
        );
        book
    }

    #[test]
    fn test_snapshot_then_continuous_updates() {
        let mut book = synced_book();
        assert!(book.is_synced());

        // 40 -> 41: remove the best bid, add a better ask.
        book.apply_update(
            40,
            41,
            &[level("3120.0", "0")],
            &[level("3120.3", "3.0")],
        )
        .unwrap();
        assert_eq!(book.best_bid().unwrap().0, 3119.5);
        assert_eq!(book.best_ask().unwrap().0, 3120.3);
    }

    #[test]
    fn test_gap_drops_book() {
        let mut book = synced_book();
        // Stored offset is 40; a frame beginning at 42 means 41 was lost.
        let err = book
            .apply_update(42, 43, &[level("3120.2", "1.0")], &[])
            .unwrap_err();
        assert!(matches!(err, ApplyError::Gap { expected: 40, got: 42 }));
        assert!(!book.is_synced());
        assert!(book.best_bid().is_none());

        // The gapped stream can't feed the book until a snapshot lands.
        assert!(matches!(
            book.apply_update(43, 44, &[level("3120.2", "1.0")], &[]),
            Err(ApplyError::NotSynced)
        ));

        // REST snapshot restores service.
        book.reset_from_snapshot(&[level("3120.1", "2.0")], &[level("3120.6", "2.0")], 50);
        assert!(book.is_synced());
        assert_eq!(book.offset, 50);
        assert_eq!(book.best_bid().unwrap().0, 3120.1);
    }

    #[test]
    fn test_dust_levels_are_ignored() {
        let mut book = LocalBook::default();
        // 3121.0 * 0.001 = ~3.1 notional: dust. 3120.0 * 0.01 = 31.2: real.
        book.reset_from_snapshot(
            &[level("3121.0", "0.001"), level("3120.0", "0.01")],
            &[level("3121.5", "0.0001"), level("3122.0", "1.0")],
            1,
        );
        assert_eq!(book.best_bid().unwrap().0, 3120.0);
        assert_eq!(book.best_ask().unwrap().0, 3122.0);
    }

    #[test]
    fn test_periodic_resync_after_update_count() {
        let mut book = synced_book();
        for i in 0..RESYNC_EVERY_UPDATES {
            let begin = 40 + u64::from(i);
            book.apply_update(begin, begin + 1, &[], &[]).unwrap();
        }
        assert!(book.needs_periodic_resync());

        book.reset_from_snapshot(&[level("1.0", "10.0")], &[], 2_000);
        assert!(!book.needs_periodic_resync());
    }

    #[test]
    fn test_sides_order_numerically_not_lexically() {
        let mut book = LocalBook::default();
        // "9.5" sorts after "10.0" as a string; the book must not.
        book.reset_from_snapshot(
            &[level("9.5", "10.0"), level("10.0", "10.0")],
            &[level("10.5", "10.0"), level("9.8", "10.0")],
            1,
        );
        assert_eq!(book.best_bid().unwrap().0, 10.0);
        assert_eq!(book.best_ask().unwrap().0, 9.8);
    }

    #[test]
    fn test_zero_size_removes_level() {
        let mut book = synced_book();
        book.apply_update(40, 41, &[level("3119.5", "0")], &[])
            .unwrap();
        // Only 3120.0 remains on the bid side.
        assert_eq!(book.best_bid().unwrap().0, 3120.0);
        book.apply_update(41, 42, &[level("3120.0", "0")], &[])
            .unwrap();
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn test_channel_market_id_parse() {
        assert_eq!(channel_market_id("order_book:7"), Some(7));
        assert_eq!(channel_market_id("order_book:abc"), None);
        assert_eq!(channel_market_id(""), None);
    }

    #[test]
    fn test_envelope_decode() {
        let text = r#"{"type":"update/order_book","channel":"order_book:3","offset":43,"begin_offset":42,"order_book":{"bids":[{"price":"3120.0","size":"1.0"}],"asks":[]}}"#;
        let env = decode_envelope(text).unwrap();
        assert_eq!(env.kind, "update/order_book");
        assert_eq!(env.begin_offset, 42);
        assert_eq!(env.offset, 43);
        assert_eq!(env.order_book.unwrap().bids.len(), 1);
    }

    #[test]
    fn test_market_symbol_is_usdc_quoted() {
        let market = Market {
            market_id: 0,
            symbol: "ETH".to_string(),
        };
        assert_eq!(market.venue_symbol(), "ETHUSDC");
    }
}
