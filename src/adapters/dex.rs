//! Odos DEX-aggregator adapter. The aggregator has no stream, only a
//! quote-request API throttled per API key, so the adapter runs one
//! worker per key at the vendor rate and pairs quotes up afterwards.
//!
//! - The coordinator assigns the buy and sell direction of the same
//!   instrument to two different workers so both sides are quoted in
//!   parallel; results merge by task id over oneshot channels (a dropped
//!   channel signals failure, no polling)
//! - A semaphore of 2 * worker_count caps in-flight tasks; dispatch
//!   blocks when the pool is saturated
//! - A validator rejects merged quotes whose implied spread or jump vs
//!   the previous accepted quote exceeds the configured thresholds, and
//!   keeps per-symbol statistics

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Exchange, MarketType, Price, PriceSource};
use crate::store::PriceStore;

use super::{http_client, Shutdown};

/// Vendor-imposed per-key rate.
const REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// A task whose quotes haven't both arrived by now is abandoned.
const MERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between dispatch rounds over the monitored symbols.
const ROUND_DELAY: Duration = Duration::from_secs(2);

/// Quote request size in quote currency.
const QUOTE_NOTIONAL: f64 = 1_000.0;

const QUOTE_PATH: &str = "/v1/quote";

/// Validator stats are logged this often (in dispatch rounds).
const STATS_LOG_EVERY_ROUNDS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Buy,
    Sell,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

struct QuoteJob {
    task_id: u64,
    symbol: String,
    side: Side,
    reply: oneshot::Sender<f64>,
}

#[derive(Debug, serde::Deserialize)]
struct QuoteResponse {
    price: f64,
}

// ============================================================================
// Validator
// ============================================================================

#[derive(Debug, Default, Clone)]
struct SymbolQuoteStats {
    merged: u64,
    rejected_spread: u64,
    rejected_jump: u64,
    /// ask at or below bid in a merged pair: stored anyway, but counted
    crossed_books: u64,
    last_mid: f64,
}

struct QuoteValidator {
    max_spread_percent: f64,
    max_jump_percent: f64,
    stats: HashMap<String, SymbolQuoteStats>,
}

impl QuoteValidator {
    fn new(max_spread_percent: f64, max_jump_percent: f64) -> Self {
        Self {
            max_spread_percent,
            max_jump_percent,
            stats: HashMap::new(),
        }
    }

    /// Accept or reject a merged (bid, ask) pair. Rejections only update
    /// statistics; the previous accepted mid stays the jump reference.
    fn validate(&mut self, symbol: &str, bid: f64, ask: f64) -> bool {
        let entry = self.stats.entry(symbol.to_string()).or_default();
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            entry.rejected_spread += 1;
            return false;
        }

        // A crossed pair (ask at or below bid) is inconsistent venue
        // data but still the real top-of-book: store it, count it, warn.
        if ask <= bid {
            entry.crossed_books += 1;
            entry.merged += 1;
            entry.last_mid = mid;
            warn!(symbol, bid, ask, "crossed dex quote pair; stored with warning");
            return true;
        }

        let spread_percent = (ask - bid) / mid * 100.0;
        if spread_percent > self.max_spread_percent {
            entry.rejected_spread += 1;
            return false;
        }

        if entry.last_mid > 0.0 {
            let jump_percent = (mid - entry.last_mid).abs() / entry.last_mid * 100.0;
            if jump_percent > self.max_jump_percent {
                entry.rejected_jump += 1;
                return false;
            }
        }

        entry.merged += 1;
        entry.last_mid = mid;
        true
    }

    fn log_stats(&self) {
        for (symbol, s) in &self.stats {
            info!(
                symbol,
                merged = s.merged,
                rejected_spread = s.rejected_spread,
                rejected_jump = s.rejected_jump,
                crossed_books = s.crossed_books,
                last_mid = s.last_mid,
                "dex quote stats"
            );
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn fetch_quote(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    symbol: &str,
    side: Side,
) -> Result<f64> {
    let url = format!("{base}{QUOTE_PATH}");
    let resp: QuoteResponse = client
        .get(&url)
        .header("X-API-Key", api_key)
        .query(&[
            ("symbol", symbol),
            ("side", side.as_str()),
            ("notional", &QUOTE_NOTIONAL.to_string()),
        ])
        .send()
        .await
        .context("GET dex quote")?
        .error_for_status()
        .context("dex quote status")?
        .json()
        .await
        .context("decode dex quote")?;
    Ok(resp.price)
}

/// One worker per API key: its own client, its own rate ticker.
async fn run_worker(
    id: usize,
    api_key: String,
    base: String,
    https_proxy: Option<String>,
    mut jobs: mpsc::Receiver<QuoteJob>,
) {
    let client = match http_client(https_proxy.as_deref(), Duration::from_secs(8)) {
        Ok(c) => c,
        Err(e) => {
            warn!(worker = id, error = %e, "dex worker failed to build client");
            return;
        }
    };

    let mut rate = interval(REQUEST_INTERVAL);
    rate.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while let Some(job) = jobs.recv().await {
        rate.tick().await;
        match fetch_quote(&client, &base, &api_key, &job.symbol, job.side).await {
            Ok(price) if price > 0.0 => {
                let _ = job.reply.send(price);
            }
            Ok(_) => {
                debug!(worker = id, symbol = job.symbol, "dex returned zero price");
                // reply dropped: the merge side observes the closed channel
            }
            Err(e) => {
                debug!(worker = id, task_id = job.task_id, error = %e, "dex quote failed");
            }
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub async fn spawn(
    config: &Config,
    store: Arc<PriceStore>,
    shutdown: Shutdown,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    if config.dex_api_keys.is_empty() {
        info!("no DEX api keys configured; odos adapter disabled");
        return Ok(Vec::new());
    }

    let mut handles = Vec::new();
    let mut workers: Vec<mpsc::Sender<QuoteJob>> = Vec::new();

    for (id, key) in config.dex_api_keys.iter().enumerate() {
        let (tx, rx) = mpsc::channel::<QuoteJob>(16);
        workers.push(tx);
        handles.push(tokio::spawn(run_worker(
            id,
            key.clone(),
            config.dex_base_url.clone(),
            config.https_proxy.clone(),
            rx,
        )));
    }

    info!(
        workers = workers.len(),
        symbols = config.monitored_symbols.len(),
        "starting odos quote pool"
    );

    let validator = Arc::new(Mutex::new(QuoteValidator::new(
        config.dex_max_spread_percent,
        config.dex_max_jump_percent,
    )));
    let semaphore = Arc::new(Semaphore::new(2 * workers.len()));

    handles.push(tokio::spawn(run_coordinator(
        workers,
        config.monitored_symbols.clone(),
        store,
        validator,
        semaphore,
        shutdown,
    )));

    Ok(handles)
}

async fn run_coordinator(
    workers: Vec<mpsc::Sender<QuoteJob>>,
    symbols: Vec<String>,
    store: Arc<PriceStore>,
    validator: Arc<Mutex<QuoteValidator>>,
    semaphore: Arc<Semaphore>,
    mut shutdown: Shutdown,
) {
    let mut task_id: u64 = 0;
    let mut rounds: u64 = 0;
    let mut next_worker: usize = 0;

    loop {
        for symbol in &symbols {
            // Backpressure: wait for a pool slot before dispatching.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = shutdown.changed() => return,
            };

            task_id += 1;

            // Buy and sell go to two different workers so both sides are
            // quoted in parallel (single-key pools quote sequentially).
            let buy_worker = next_worker % workers.len();
            let sell_worker = if workers.len() > 1 {
                (next_worker + 1) % workers.len()
            } else {
                buy_worker
            };
            next_worker = (next_worker + 1) % workers.len();

            let (buy_tx, buy_rx) = oneshot::channel();
            let (sell_tx, sell_rx) = oneshot::channel();

            let buy_job = QuoteJob {
                task_id,
                symbol: symbol.clone(),
                side: Side::Buy,
                reply: buy_tx,
            };
            let sell_job = QuoteJob {
                task_id,
                symbol: symbol.clone(),
                side: Side::Sell,
                reply: sell_tx,
            };

            if workers[buy_worker].send(buy_job).await.is_err()
                || workers[sell_worker].send(sell_job).await.is_err()
            {
                warn!("dex worker pool gone; coordinator stopping");
                return;
            }

            let store = store.clone();
            let validator = validator.clone();
            let symbol = symbol.clone();
            tokio::spawn(async move {
                merge_task(symbol, buy_rx, sell_rx, store, validator).await;
                drop(permit);
            });
        }

        rounds += 1;
        if rounds % STATS_LOG_EVERY_ROUNDS == 0 {
            validator.lock().log_stats();
        }

        tokio::select! {
            _ = sleep(ROUND_DELAY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Await both directions of one task, validate, and feed the store.
/// Waiting is event-driven: each side resolves when its worker sends or
/// drops its channel, bounded by one overall timeout.
async fn merge_task(
    symbol: String,
    buy_rx: oneshot::Receiver<f64>,
    sell_rx: oneshot::Receiver<f64>,
    store: Arc<PriceStore>,
    validator: Arc<Mutex<QuoteValidator>>,
) {
    let merged = timeout(MERGE_TIMEOUT, async {
        let (buy, sell) = tokio::join!(buy_rx, sell_rx);
        match (buy, sell) {
            (Ok(ask), Ok(bid)) => Some((bid, ask)),
            _ => None,
        }
    })
    .await;

    let Ok(Some((bid, ask))) = merged else {
        debug!(symbol, "dex quote pair incomplete");
        return;
    };

    if !validator.lock().validate(&symbol, bid, ask) {
        debug!(symbol, bid, ask, "dex quote pair rejected by validator");
        return;
    }

    let price = Price::top_of_book(
        symbol,
        Exchange::Odos,
        MarketType::Spot,
        bid,
        ask,
        PriceSource::Rest,
        Utc::now(),
    );
    store.update_price(price);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_accepts_tight_quotes() {
        let mut v = QuoteValidator::new(5.0, 10.0);
        assert!(v.validate("STGUSDT", 0.300, 0.301));
        let s = &v.stats["STGUSDT"];
        assert_eq!(s.merged, 1);
        assert!((s.last_mid - 0.3005).abs() < 1e-12);
    }

    #[test]
    fn test_validator_rejects_wide_spread() {
        let mut v = QuoteValidator::new(5.0, 10.0);
        // 10% wide: implied spread over threshold.
        assert!(!v.validate("STGUSDT", 0.285, 0.315));
        assert_eq!(v.stats["STGUSDT"].rejected_spread, 1);
        assert_eq!(v.stats["STGUSDT"].merged, 0);
    }

    #[test]
    fn test_validator_rejects_price_jump() {
        let mut v = QuoteValidator::new(5.0, 10.0);
        assert!(v.validate("ZROUSDT", 3.60, 3.61));
        // 50% jump against the accepted mid.
        assert!(!v.validate("ZROUSDT", 5.40, 5.42));
        assert_eq!(v.stats["ZROUSDT"].rejected_jump, 1);
        // Reference mid is unchanged by the rejection.
        assert!((v.stats["ZROUSDT"].last_mid - 3.605).abs() < 1e-12);
        // A sane follow-up is accepted again.
        assert!(v.validate("ZROUSDT", 3.62, 3.63));
    }

    #[test]
    fn test_validator_stores_crossed_quotes_with_warning() {
        let mut v = QuoteValidator::new(5.0, 10.0);
        // ask at or below bid: inconsistent, but still forwarded.
        assert!(v.validate("STGUSDT", 0.302, 0.300));
        let s = &v.stats["STGUSDT"];
        assert_eq!(s.crossed_books, 1);
        assert_eq!(s.merged, 1);

        // Even a badly crossed pair is stored, never spread-rejected.
        assert!(v.validate("STGUSDT", 0.330, 0.300));
        assert_eq!(v.stats["STGUSDT"].crossed_books, 2);
        assert_eq!(v.stats["STGUSDT"].rejected_spread, 0);
    }

    #[test]
    fn test_validator_rejects_non_positive() {
        let mut v = QuoteValidator::new(5.0, 10.0);
        assert!(!v.validate("STGUSDT", 0.0, 0.0));
    }

    #[tokio::test]
    async fn test_merge_requires_both_sides() {
        let rates = Arc::new(crate::rates::ExchangeRateManager::new(Exchange::Binance));
        let (store, _rx) = PriceStore::new(rates);
        let validator = Arc::new(Mutex::new(QuoteValidator::new(5.0, 10.0)));

        // Sell side worker "fails": its sender is dropped unanswered.
        let (buy_tx, buy_rx) = oneshot::channel();
        let (sell_tx, sell_rx) = oneshot::channel::<f64>();
        buy_tx.send(0.301).unwrap();
        drop(sell_tx);

        merge_task(
            "STGUSDT".to_string(),
            buy_rx,
            sell_rx,
            store.clone(),
            validator.clone(),
        )
        .await;
        assert!(store
            .get_price(Exchange::Odos, MarketType::Spot, "STGUSDT")
            .is_none());

        // Both sides arrive: the merged pair lands in the store.
        let (buy_tx, buy_rx) = oneshot::channel();
        let (sell_tx, sell_rx) = oneshot::channel();
        buy_tx.send(0.301).unwrap();
        sell_tx.send(0.300).unwrap();
        merge_task("STGUSDT".to_string(), buy_rx, sell_rx, store.clone(), validator).await;

        let stored = store
            .get_price(Exchange::Odos, MarketType::Spot, "STGUSDT")
            .unwrap();
        assert_eq!(stored.bid_price, 0.300);
        assert_eq!(stored.ask_price, 0.301);
        assert_eq!(stored.source, PriceSource::Rest);
    }
}
