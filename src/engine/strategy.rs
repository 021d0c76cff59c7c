//! Curated linear-combination strategies.
//!
//! A strategy is a synthetic instrument A - k*B evaluated as "buy A at
//! its ask, sell k units of B at its bid". Components are pinned to a
//! venue and market type; a leg with no active price marks the strategy
//! partial or unavailable instead of producing a bogus value.

use chrono::{Duration, Utc};

use crate::models::{
    CustomStrategy, Exchange, MarketType, StrategyComponent, StrategyStatus,
};

use super::{symmetric_spread_percent, SpreadEngine, ACTIVE_WINDOW_SECS};

/// STG/ZRO hedge ratio observed in production. Deliberately a constant.
pub const STG_ZRO_COEFFICIENT: f64 = 0.08634;

#[derive(Debug, Clone)]
pub struct StrategyLeg {
    pub symbol: String,
    pub coefficient: f64,
    pub exchange: Exchange,
    pub market_type: MarketType,
}

#[derive(Debug, Clone)]
pub struct StrategyDefinition {
    pub name: String,
    pub formula: String,
    pub strategy_type: String,
    /// Bought at its ask, coefficient 1.0
    pub long: StrategyLeg,
    /// Sold at its bid, scaled by its coefficient
    pub short: StrategyLeg,
}

pub fn builtin_strategies() -> Vec<StrategyDefinition> {
    vec![StrategyDefinition {
        name: "STG_ZRO".to_string(),
        formula: format!("STG - {STG_ZRO_COEFFICIENT}*ZRO"),
        strategy_type: "+A-B".to_string(),
        long: StrategyLeg {
            symbol: "STGUSDT".to_string(),
            coefficient: 1.0,
            exchange: Exchange::Binance,
            market_type: MarketType::Spot,
        },
        short: StrategyLeg {
            symbol: "ZROUSDT".to_string(),
            coefficient: STG_ZRO_COEFFICIENT,
            exchange: Exchange::Binance,
            market_type: MarketType::Spot,
        },
    }]
}

impl SpreadEngine {
    /// Evaluate every configured strategy against the live store.
    pub fn evaluate_custom_strategies(&self) -> Vec<CustomStrategy> {
        let cutoff = Utc::now() - Duration::seconds(ACTIVE_WINDOW_SECS);

        self.strategies()
            .iter()
            .map(|def| {
                let long_price = self
                    .store()
                    .get_price(def.long.exchange, def.long.market_type, &def.long.symbol)
                    .filter(|p| p.last_updated >= cutoff);
                let short_price = self
                    .store()
                    .get_price(def.short.exchange, def.short.market_type, &def.short.symbol)
                    .filter(|p| p.last_updated >= cutoff);

                let long_px = long_price.as_ref().map(|p| p.effective_buy_price());
                let short_px = short_price.as_ref().map(|p| p.effective_sell_price());

                let components = vec![
                    StrategyComponent {
                        symbol: def.long.symbol.clone(),
                        coefficient: def.long.coefficient,
                        exchange: def.long.exchange,
                        market_type: def.long.market_type,
                        price: long_px.unwrap_or(0.0),
                        available: long_px.is_some(),
                    },
                    StrategyComponent {
                        symbol: def.short.symbol.clone(),
                        coefficient: def.short.coefficient,
                        exchange: def.short.exchange,
                        market_type: def.short.market_type,
                        price: short_px.unwrap_or(0.0),
                        available: short_px.is_some(),
                    },
                ];

                let available = components.iter().filter(|c| c.available).count();
                let status = match available {
                    2 => StrategyStatus::Ready,
                    1 => StrategyStatus::Partial,
                    _ => StrategyStatus::Unavailable,
                };

                let (value, value_percent) = match (long_px, short_px) {
                    (Some(a_ask), Some(b_bid)) if a_ask > 0.0 && b_bid > 0.0 => {
                        let scaled_sell = def.short.coefficient * b_bid;
                        (
                            scaled_sell - a_ask,
                            symmetric_spread_percent(a_ask, scaled_sell),
                        )
                    }
                    _ => (0.0, 0.0),
                };

                CustomStrategy {
                    name: def.name.clone(),
                    formula: def.formula.clone(),
                    strategy_type: def.strategy_type.clone(),
                    value,
                    value_percent,
                    components,
                    status,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Price, PriceSource};
    use crate::rates::ExchangeRateManager;
    use crate::store::PriceStore;
    use std::sync::Arc;

    fn engine() -> SpreadEngine {
        let rates = Arc::new(ExchangeRateManager::new(Exchange::Binance));
        let (store, _rx) = PriceStore::new(rates);
        SpreadEngine::new(store)
    }

    fn seed(engine: &SpreadEngine, symbol: &str, bid: f64, ask: f64) {
        let p = Price::top_of_book(
            symbol,
            Exchange::Binance,
            MarketType::Spot,
            bid,
            ask,
            PriceSource::Websocket,
            Utc::now(),
        );
        assert!(engine.store().update_price(p));
    }

    #[test]
    fn test_unavailable_without_any_leg() {
        let eng = engine();
        let strategies = eng.evaluate_custom_strategies();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].status, StrategyStatus::Unavailable);
        assert_eq!(strategies[0].value, 0.0);
    }

    #[test]
    fn test_partial_with_one_leg() {
        let eng = engine();
        seed(&eng, "STGUSDT", 0.30, 0.301);
        let strategies = eng.evaluate_custom_strategies();
        assert_eq!(strategies[0].status, StrategyStatus::Partial);
        assert!(strategies[0].components[0].available);
        assert!(!strategies[0].components[1].available);
    }

    #[test]
    fn test_ready_evaluates_long_ask_vs_scaled_short_bid() {
        let eng = engine();
        seed(&eng, "STGUSDT", 0.300, 0.301);
        seed(&eng, "ZROUSDT", 3.60, 3.61);

        let strategies = eng.evaluate_custom_strategies();
        let s = &strategies[0];
        assert_eq!(s.status, StrategyStatus::Ready);

        let scaled = STG_ZRO_COEFFICIENT * 3.60;
        assert!((s.value - (scaled - 0.301)).abs() < 1e-12);
        let expected_pct = (scaled - 0.301) * 2.0 / (scaled + 0.301) * 100.0;
        assert!((s.value_percent - expected_pct).abs() < 1e-12);
        assert_eq!(s.strategy_type, "+A-B");
    }
}
