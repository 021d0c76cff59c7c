//! Spread discovery across the cross-venue index.
//!
//! On demand, enumerates every eligible pair of venues per symbol and
//! produces ranked directed spreads. The categorized/persistence view
//! lives in `opportunity`, curated linear combinations in `strategy`.

pub mod opportunity;
pub mod strategy;

use chrono::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{Price, Spread};
use crate::store::PriceStore;

use opportunity::OpportunityRecord;
use strategy::StrategyDefinition;

/// Entries older than this don't participate in spread computation.
pub const ACTIVE_WINDOW_SECS: i64 = 60;

pub struct SpreadEngine {
    store: Arc<PriceStore>,
    /// Opportunity persistence history. Its own lock: the store lock is
    /// only held for the read snapshot, never while touching this map.
    history: Mutex<HashMap<String, OpportunityRecord>>,
    strategies: Vec<StrategyDefinition>,
}

impl SpreadEngine {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self {
            store,
            history: Mutex::new(HashMap::new()),
            strategies: strategy::builtin_strategies(),
        }
    }

    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub(crate) fn history(&self) -> &Mutex<HashMap<String, OpportunityRecord>> {
        &self.history
    }

    pub(crate) fn strategies(&self) -> &[StrategyDefinition] {
        &self.strategies
    }

    /// Enumerate all directed cross-venue spreads over the active index,
    /// ranked by spread percent, best first.
    pub fn calculate_spreads(&self) -> Vec<Spread> {
        let snapshot = self
            .store
            .get_active_prices(Duration::seconds(ACTIVE_WINDOW_SECS));

        let mut spreads = Vec::new();
        for (symbol, entries) in &snapshot {
            if entries.len() < 2 {
                continue;
            }
            for i in 0..entries.len() {
                for j in (i + 1)..entries.len() {
                    let (p1, p2) = (&entries[i], &entries[j]);
                    // A pair is eligible when venue or market type differs.
                    if p1.exchange == p2.exchange && p1.market_type == p2.market_type {
                        continue;
                    }
                    for (buy, sell) in [(p1, p2), (p2, p1)] {
                        if let Some(s) = make_spread(symbol, buy, sell) {
                            spreads.push(s);
                        }
                    }
                }
            }
        }

        spreads.sort_by(|a, b| {
            b.spread_percent
                .partial_cmp(&a.spread_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        spreads
    }
}

/// Directed cross-book economics, or None when either side has no
/// usable price.
fn make_spread(symbol: &str, buy: &Price, sell: &Price) -> Option<Spread> {
    let buy_price = buy.effective_buy_price();
    let sell_price = sell.effective_sell_price();
    if buy_price <= 0.0 || sell_price <= 0.0 {
        return None;
    }

    Some(Spread {
        symbol: symbol.to_string(),
        buy_exchange: buy.exchange,
        buy_market_type: buy.market_type,
        sell_exchange: sell.exchange,
        sell_market_type: sell.market_type,
        buy_price,
        sell_price,
        spread_percent: (sell_price - buy_price) / buy_price * 100.0,
        spread_absolute: sell_price - buy_price,
        volume_24h: buy.volume_24h.min(sell.volume_24h),
        updated_at: buy.last_updated.max(sell.last_updated),
    })
}

/// Symmetric spread percent, the shape used for opportunity and strategy
/// evaluation: (sell - buy) * 2 / (sell + buy) * 100.
pub fn symmetric_spread_percent(buy_price: f64, sell_price: f64) -> f64 {
    let denom = sell_price + buy_price;
    if denom <= 0.0 {
        return 0.0;
    }
    (sell_price - buy_price) * 2.0 / denom * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, MarketType, PriceSource};
    use crate::rates::ExchangeRateManager;
    use chrono::Utc;

    fn engine_with_store() -> SpreadEngine {
        let rates = Arc::new(ExchangeRateManager::new(Exchange::Binance));
        let (store, _rx) = PriceStore::new(rates);
        SpreadEngine::new(store)
    }

    fn seed(
        engine: &SpreadEngine,
        symbol: &str,
        exchange: Exchange,
        market_type: MarketType,
        bid: f64,
        ask: f64,
    ) {
        let p = Price::top_of_book(
            symbol,
            exchange,
            market_type,
            bid,
            ask,
            PriceSource::Websocket,
            Utc::now(),
        )
        .with_volume(1_000_000.0);
        assert!(engine.store().update_price(p));
    }

    #[test]
    fn test_cross_venue_spread_both_directions() {
        let engine = engine_with_store();
        seed(
            &engine,
            "BTCUSDT",
            Exchange::Binance,
            MarketType::Spot,
            41999.0,
            42000.0,
        );
        seed(
            &engine,
            "BTCUSDT",
            Exchange::Aster,
            MarketType::Future,
            42100.0,
            42101.0,
        );

        let spreads = engine.calculate_spreads();
        assert_eq!(spreads.len(), 2);

        // Best direction first: buy binance ask 42000, sell aster bid 42100.
        let best = &spreads[0];
        assert_eq!(best.buy_exchange, Exchange::Binance);
        assert_eq!(best.sell_exchange, Exchange::Aster);
        assert!((best.spread_percent - (42100.0 - 42000.0) / 42000.0 * 100.0).abs() < 1e-9);
        assert!((best.spread_percent - 0.238).abs() < 0.001);
        assert_eq!(best.volume_24h, 1_000_000.0);
    }

    #[test]
    fn test_spread_antisymmetry_in_absolute_terms() {
        let engine = engine_with_store();
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            3120.0,
            3120.0,
        );
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Lighter,
            MarketType::Spot,
            3125.0,
            3125.0,
        );

        let spreads = engine.calculate_spreads();
        assert_eq!(spreads.len(), 2);
        // With bid == ask on both venues the two directions mirror.
        assert!((spreads[0].spread_absolute + spreads[1].spread_absolute).abs() < 1e-9);
    }

    #[test]
    fn test_same_venue_same_market_pairs_are_skipped() {
        let engine = engine_with_store();
        // Same venue+market under two quote spellings lands on one index
        // key but those entries differ only by symbol spelling.
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            3120.0,
            3121.0,
        );
        let spreads = engine.calculate_spreads();
        assert!(spreads.is_empty());
    }

    #[test]
    fn test_spot_future_on_same_venue_is_eligible() {
        let engine = engine_with_store();
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            3120.0,
            3121.0,
        );
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Future,
            3125.0,
            3126.0,
        );
        assert_eq!(engine.calculate_spreads().len(), 2);
    }

    #[test]
    fn test_zero_priced_sides_are_rejected() {
        let engine = engine_with_store();
        let mut dead = Price::top_of_book(
            "ETHUSDT",
            Exchange::Binance,
            MarketType::Spot,
            0.0,
            0.0,
            PriceSource::Websocket,
            Utc::now(),
        );
        dead.price = 0.0;
        assert!(engine.store().update_price(dead));
        seed(
            &engine,
            "ETHUSDT",
            Exchange::Aster,
            MarketType::Spot,
            3125.0,
            3126.0,
        );
        assert!(engine.calculate_spreads().is_empty());
    }

    #[test]
    fn test_symmetric_percent_formula() {
        let pct = symmetric_spread_percent(100.0, 101.0);
        assert!((pct - 1.0 * 2.0 / 201.0 * 100.0).abs() < 1e-12);
        assert_eq!(symmetric_spread_percent(0.0, 0.0), 0.0);
    }
}
