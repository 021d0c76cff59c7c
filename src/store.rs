//! Concurrent dual-indexed price store.
//!
//! One reader/writer lock guards both indexes so they can never diverge:
//! - by_exchange[exchange]["SPOT:ETHUSDT"] -> Price
//! - by_symbol["ETHUSDT"]["binance:SPOT"] -> Price  (normalized key)
//!
//! Every write runs the freshness rule so a slow snapshot can never
//! clobber a live stream quote, and non-USDT quotes are normalized to
//! USDT on the way in. Readers always get copies, never references into
//! the maps.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{Exchange, MarketType, Price, PriceSource, QuoteCurrency, StoreStats};
use crate::rates::ExchangeRateManager;
use crate::symbols::{index_key, normalize, parse_symbol, to_usdt_symbol};

/// Entries older than this are replaced by anything, REST included.
/// The hard floor under prolonged stream loss.
pub const STALE_OVERRIDE_SECS: i64 = 60;

#[derive(Default)]
struct Indexes {
    by_exchange: HashMap<Exchange, HashMap<String, Price>>,
    by_symbol: HashMap<String, HashMap<String, Price>>,
}

fn exchange_key(market_type: MarketType, symbol: &str) -> String {
    format!("{}:{}", market_type.as_str(), normalize(symbol))
}

fn venue_key(exchange: Exchange, market_type: MarketType) -> String {
    format!("{}:{}", exchange.as_str(), market_type.as_str())
}

pub struct PriceStore {
    inner: RwLock<Indexes>,
    rates: Arc<ExchangeRateManager>,
    rate_refresh_tx: mpsc::UnboundedSender<()>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl PriceStore {
    /// Returns the store plus the receiver the supervisor drains to run
    /// rate refreshes outside the write path.
    pub fn new(rates: Arc<ExchangeRateManager>) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (rate_refresh_tx, rate_refresh_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            inner: RwLock::new(Indexes::default()),
            rates,
            rate_refresh_tx,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });
        (store, rate_refresh_rx)
    }

    pub fn rates(&self) -> &Arc<ExchangeRateManager> {
        &self.rates
    }

    /// Freshness rule. A candidate replaces the existing entry iff:
    ///   1. the existing entry is older than the 60 s hard floor, or
    ///   2. existing is REST and the candidate is a stream quote, or
    ///   3. the candidate's exchange timestamp is strictly later, or
    ///   4. the candidate's local receive time is strictly later.
    /// A live stream entry is never displaced by a snapshot short of
    /// rule 1; same-source out-of-order arrivals are dropped.
    pub fn should_update(existing: &Price, candidate: &Price, now: DateTime<Utc>) -> bool {
        if now - existing.last_updated > Duration::seconds(STALE_OVERRIDE_SECS) {
            return true;
        }
        if existing.source == PriceSource::Rest && candidate.source == PriceSource::Websocket {
            return true;
        }
        if existing.source == PriceSource::Websocket && candidate.source == PriceSource::Rest {
            return false;
        }
        if candidate.timestamp > existing.timestamp {
            return true;
        }
        if candidate.last_updated > existing.last_updated {
            return true;
        }
        false
    }

    /// Normalize, run the freshness rule, and write both indexes.
    /// Returns false when the candidate lost to the stored entry.
    pub fn update_price(&self, mut price: Price) -> bool {
        // Quote parsing + USDT normalization happen before the store lock;
        // the rate lock and the store lock are never held together.
        let (base, quote) = parse_symbol(&price.symbol);
        price.quote_currency = quote;
        price.original_bid_price = price.bid_price;
        price.original_ask_price = price.ask_price;

        if quote == QuoteCurrency::Usdt {
            price.exchange_rate = 1.0;
            price.exchange_rate_source = "identity".to_string();
        } else {
            let rate = self.rates.get_rate(quote);
            price.bid_price *= rate.rate;
            price.ask_price *= rate.rate;
            price.price *= rate.rate;
            price.exchange_rate = rate.rate;
            price.exchange_rate_source = rate.source;
        }
        price.is_normalized = true;

        let normalized_symbol = to_usdt_symbol(&base);
        let ex_key = exchange_key(price.market_type, &price.symbol);
        let sym_key = venue_key(price.exchange, price.market_type);
        let now = Utc::now();

        let accepted = {
            let mut idx = self.inner.write();

            let mut fresh = true;
            if let Some(existing) = idx
                .by_exchange
                .get(&price.exchange)
                .and_then(|m| m.get(&ex_key))
            {
                if Self::should_update(existing, &price, now) {
                    // Streams don't carry 24h volume; keep the last known one.
                    if price.volume_24h == 0.0 {
                        price.volume_24h = existing.volume_24h;
                    }
                } else {
                    fresh = false;
                }
            }

            if fresh {
                // Acceptance time; keeps last_updated non-decreasing per entry.
                if price.last_updated < now {
                    price.last_updated = now;
                }

                idx.by_exchange
                    .entry(price.exchange)
                    .or_default()
                    .insert(ex_key, price.clone());
                idx.by_symbol
                    .entry(normalized_symbol)
                    .or_default()
                    .insert(sym_key, price.clone());
            }
            fresh
        };

        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            if self
                .rates
                .rate_instrument(price.exchange, price.market_type, &normalize(&price.symbol))
                .is_some()
            {
                // Refresh runs on the supervisor task, not the write path.
                let _ = self.rate_refresh_tx.send(());
            }
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn get_price(
        &self,
        exchange: Exchange,
        market_type: MarketType,
        symbol: &str,
    ) -> Option<Price> {
        self.inner
            .read()
            .by_exchange
            .get(&exchange)?
            .get(&exchange_key(market_type, symbol))
            .cloned()
    }

    /// All venues' entries for one instrument, keyed post-normalization.
    pub fn get_prices_by_symbol(&self, symbol: &str) -> Vec<Price> {
        self.inner
            .read()
            .by_symbol
            .get(&index_key(symbol))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_prices_by_exchange(&self, exchange: Exchange) -> Vec<Price> {
        self.inner
            .read()
            .by_exchange
            .get(&exchange)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the whole cross-venue index.
    pub fn get_all_prices(&self) -> HashMap<String, Vec<Price>> {
        self.inner
            .read()
            .by_symbol
            .iter()
            .map(|(sym, m)| (sym.clone(), m.values().cloned().collect()))
            .collect()
    }

    pub fn get_all_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.inner.read().by_symbol.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Cross-venue index restricted to entries updated within `within`.
    pub fn get_active_prices(&self, within: Duration) -> HashMap<String, Vec<Price>> {
        let cutoff = Utc::now() - within;
        self.inner
            .read()
            .by_symbol
            .iter()
            .filter_map(|(sym, m)| {
                let active: Vec<Price> = m
                    .values()
                    .filter(|p| p.last_updated >= cutoff)
                    .cloned()
                    .collect();
                if active.is_empty() {
                    None
                } else {
                    Some((sym.clone(), active))
                }
            })
            .collect()
    }

    pub fn get_stats(&self) -> StoreStats {
        let idx = self.inner.read();
        let by_exchange = idx
            .by_exchange
            .iter()
            .map(|(ex, m)| (ex.as_str().to_string(), m.len()))
            .collect();
        StoreStats {
            total_prices: idx.by_exchange.values().map(|m| m.len()).sum(),
            total_symbols: idx.by_symbol.len(),
            by_exchange,
            accepted_writes: self.accepted.load(Ordering::Relaxed),
            rejected_writes: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Drop entries whose last_updated is older than `threshold` and
    /// rebuild the cross-venue index from the survivors.
    pub fn clean_stale_data(&self, threshold: Duration) -> usize {
        let cutoff = Utc::now() - threshold;
        let mut idx = self.inner.write();

        let before: usize = idx.by_exchange.values().map(|m| m.len()).sum();
        for entries in idx.by_exchange.values_mut() {
            entries.retain(|_, p| p.last_updated >= cutoff);
        }
        idx.by_exchange.retain(|_, m| !m.is_empty());

        let mut by_symbol: HashMap<String, HashMap<String, Price>> = HashMap::new();
        for (exchange, entries) in &idx.by_exchange {
            for price in entries.values() {
                by_symbol
                    .entry(index_key(&price.symbol))
                    .or_default()
                    .insert(venue_key(*exchange, price.market_type), price.clone());
            }
        }
        idx.by_symbol = by_symbol;

        let after: usize = idx.by_exchange.values().map(|m| m.len()).sum();
        let removed = before - after;
        if removed > 0 {
            debug!(removed, "stale price entries cleaned");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mid_price;

    fn test_store() -> (Arc<PriceStore>, mpsc::UnboundedReceiver<()>) {
        let rates = Arc::new(ExchangeRateManager::new(Exchange::Binance));
        PriceStore::new(rates)
    }

    fn ws_price(symbol: &str, exchange: Exchange, bid: f64, ask: f64) -> Price {
        Price::top_of_book(
            symbol,
            exchange,
            MarketType::Spot,
            bid,
            ask,
            PriceSource::Websocket,
            Utc::now(),
        )
    }

    #[test]
    fn test_rest_does_not_displace_live_stream() {
        // Scenario: same-instant stream-then-REST. Stream must win.
        let (store, _rx) = test_store();
        let ts = Utc::now();

        let mut ws = ws_price("ETHUSDT", Exchange::Aster, 3120.0, 3121.0);
        ws.timestamp = ts;
        assert!(store.update_price(ws));

        let mut rest = Price::top_of_book(
            "ETHUSDT",
            Exchange::Aster,
            MarketType::Spot,
            3119.0,
            3120.0,
            PriceSource::Rest,
            ts,
        );
        rest.last_updated = Utc::now();
        assert!(!store.update_price(rest));

        let stored = store
            .get_price(Exchange::Aster, MarketType::Spot, "ETHUSDT")
            .unwrap();
        assert_eq!(stored.bid_price, 3120.0);
        assert_eq!(stored.source, PriceSource::Websocket);
    }

    #[test]
    fn test_stream_displaces_rest_at_equal_timestamp() {
        let (store, _rx) = test_store();
        let ts = Utc::now();

        let rest = Price::top_of_book(
            "BTCUSDT",
            Exchange::Binance,
            MarketType::Spot,
            42000.0,
            42001.0,
            PriceSource::Rest,
            ts,
        );
        assert!(store.update_price(rest));

        let mut ws = ws_price("BTCUSDT", Exchange::Binance, 42002.0, 42003.0);
        ws.timestamp = ts;
        assert!(store.update_price(ws));

        let stored = store
            .get_price(Exchange::Binance, MarketType::Spot, "BTCUSDT")
            .unwrap();
        assert_eq!(stored.source, PriceSource::Websocket);
        assert_eq!(stored.bid_price, 42002.0);
    }

    #[test]
    fn test_resubmit_is_rejected_on_timestamp_tie() {
        let (store, _rx) = test_store();
        let price = ws_price("SOLUSDT", Exchange::Binance, 150.0, 150.1);
        assert!(store.update_price(price.clone()));
        assert!(!store.update_price(price));

        let stats = store.get_stats();
        assert_eq!(stats.accepted_writes, 1);
        assert_eq!(stats.rejected_writes, 1);
    }

    #[test]
    fn test_freshness_rule_is_deterministic() {
        let now = Utc::now();
        let existing = ws_price("ETHUSDT", Exchange::Binance, 1.0, 2.0);
        let candidate = ws_price("ETHUSDT", Exchange::Binance, 1.0, 2.0);
        let first = PriceStore::should_update(&existing, &candidate, now);
        for _ in 0..10 {
            assert_eq!(PriceStore::should_update(&existing, &candidate, now), first);
        }
    }

    #[test]
    fn test_stale_entry_loses_to_anything() {
        let (store, _rx) = test_store();
        let mut old = ws_price("ETHUSDT", Exchange::Binance, 3000.0, 3001.0);
        old.timestamp = Utc::now() - Duration::seconds(120);
        assert!(store.update_price(old));

        // Force the stored entry to look 2 minutes old.
        {
            let mut idx = store.inner.write();
            for m in idx.by_exchange.values_mut() {
                for p in m.values_mut() {
                    p.last_updated = Utc::now() - Duration::seconds(120);
                }
            }
        }

        let mut rest = Price::top_of_book(
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            3010.0,
            3011.0,
            PriceSource::Rest,
            Utc::now() - Duration::seconds(121),
        );
        rest.last_updated = Utc::now() - Duration::seconds(121);
        assert!(store.update_price(rest));
    }

    #[test]
    fn test_usdc_quote_normalizes_into_usdt_index() {
        // Scenario: ETHUSDC on Lighter with USDC->USDT at 0.9998.
        let rates = Arc::new(ExchangeRateManager::new(Exchange::Binance));
        rates.set_rate(QuoteCurrency::Usdc, 0.9998, "binance:USDCUSDT");
        let (store, _rx) = PriceStore::new(rates);

        let price = Price::top_of_book(
            "ETHUSDC",
            Exchange::Lighter,
            MarketType::Spot,
            3500.0,
            3501.0,
            PriceSource::Websocket,
            Utc::now(),
        );
        assert!(store.update_price(price));

        let stored = store
            .get_price(Exchange::Lighter, MarketType::Spot, "ETHUSDC")
            .unwrap();
        assert!((stored.bid_price - 3499.30).abs() < 1e-9);
        assert!((stored.ask_price - 3501.0 * 0.9998).abs() < 1e-9);
        assert_eq!(stored.original_bid_price, 3500.0);
        assert_eq!(stored.original_ask_price, 3501.0);
        assert_eq!(stored.quote_currency, QuoteCurrency::Usdc);
        assert!(stored.is_normalized);
        // Invariant: rate recovers the original within 1 ULP.
        assert!((stored.bid_price / stored.exchange_rate - stored.original_bid_price).abs() < 1e-9);

        // Cross-venue index keyed by the reshaped USDT symbol.
        let rows = store.get_prices_by_symbol("ETHUSDT");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "ETHUSDC");
    }

    #[test]
    fn test_usdt_quote_keeps_identity_rate() {
        let (store, _rx) = test_store();
        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Binance, 3120.0, 3121.0)));
        let stored = store
            .get_price(Exchange::Binance, MarketType::Spot, "ETHUSDT")
            .unwrap();
        assert_eq!(stored.exchange_rate, 1.0);
        assert_eq!(stored.original_bid_price, stored.bid_price);
        assert!(stored.is_normalized);
    }

    #[test]
    fn test_both_indexes_stay_consistent() {
        let (store, _rx) = test_store();
        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Binance, 3120.0, 3121.0)));
        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Aster, 3122.0, 3123.0)));

        let by_symbol = store.get_prices_by_symbol("ETHUSDT");
        assert_eq!(by_symbol.len(), 2);
        for p in &by_symbol {
            let via_exchange = store
                .get_price(p.exchange, p.market_type, &p.symbol)
                .unwrap();
            assert_eq!(via_exchange.bid_price, p.bid_price);
            assert_eq!(via_exchange.last_updated, p.last_updated);
        }
    }

    #[test]
    fn test_volume_carries_forward_from_snapshot() {
        let (store, _rx) = test_store();
        let rest = Price::top_of_book(
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            3120.0,
            3121.0,
            PriceSource::Rest,
            Utc::now() - Duration::seconds(1),
        )
        .with_volume(1_000_000.0);
        assert!(store.update_price(rest));

        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Binance, 3121.0, 3122.0)));
        let stored = store
            .get_price(Exchange::Binance, MarketType::Spot, "ETHUSDT")
            .unwrap();
        assert_eq!(stored.source, PriceSource::Websocket);
        assert_eq!(stored.volume_24h, 1_000_000.0);
    }

    #[test]
    fn test_clean_stale_data_rebuilds_symbol_index() {
        let (store, _rx) = test_store();
        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Binance, 3120.0, 3121.0)));
        assert!(store.update_price(ws_price("BTCUSDT", Exchange::Binance, 42000.0, 42001.0)));

        {
            let mut idx = store.inner.write();
            let entries = idx.by_exchange.get_mut(&Exchange::Binance).unwrap();
            let key = exchange_key(MarketType::Spot, "ETHUSDT");
            entries.get_mut(&key).unwrap().last_updated = Utc::now() - Duration::minutes(11);
        }

        let removed = store.clean_stale_data(Duration::minutes(10));
        assert_eq!(removed, 1);
        assert!(store.get_prices_by_symbol("ETHUSDT").is_empty());
        assert_eq!(store.get_prices_by_symbol("BTCUSDT").len(), 1);
        assert_eq!(store.get_all_symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_rate_instrument_write_signals_refresh() {
        let (store, mut rx) = test_store();
        assert!(store.update_price(ws_price("USDCUSDT", Exchange::Binance, 0.9997, 0.9998)));
        assert!(rx.try_recv().is_ok());

        // Plain instruments don't signal.
        assert!(store.update_price(ws_price("ETHUSDT", Exchange::Binance, 3120.0, 3121.0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_refresh_uses_ask_as_conversion_cost() {
        let (store, _rx) = test_store();
        assert!(store.update_price(ws_price("USDCUSDT", Exchange::Binance, 0.9996, 0.9998)));
        store.rates().refresh_from_store(&store);
        let rate = store.rates().get_rate(QuoteCurrency::Usdc);
        assert_eq!(rate.rate, 0.9998);
        assert!(!rate.is_default_rate);
        assert_eq!(rate.source, "binance:USDCUSDT");
    }

    #[test]
    fn test_mid_price_used_for_price_field() {
        let (store, _rx) = test_store();
        let p = ws_price("ETHUSDT", Exchange::Binance, 3120.0, 3121.0);
        assert_eq!(p.price, mid_price(3120.0, 3121.0));
        assert!(store.update_price(p));
    }
}
