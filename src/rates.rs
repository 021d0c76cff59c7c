//! Stablecoin exchange-rate manager.
//!
//! Tracks {USDC,USDE,FDUSD} -> USDT conversion rates by observing the
//! designated venue's book tickers for the corresponding USDT pairs.
//! Lock discipline (the store calls us on every write, and we read the
//! store on refresh): prices are read into locals first, then the rate
//! lock is taken; the two locks are never held together. A try-lock gate
//! collapses concurrent refreshes into one.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::debug;

use crate::models::{Exchange, ExchangeRate, MarketType, QuoteCurrency};
use crate::store::PriceStore;

/// Book tickers that define a conversion rate, on the designated venue.
pub const RATE_INSTRUMENTS: &[(QuoteCurrency, &str)] = &[
    (QuoteCurrency::Usdc, "USDCUSDT"),
    (QuoteCurrency::Usde, "USDEUSDT"),
    (QuoteCurrency::Fdusd, "FDUSDUSDT"),
];

pub struct ExchangeRateManager {
    rates: RwLock<HashMap<QuoteCurrency, ExchangeRate>>,
    /// Held for the duration of a refresh; try-locked so overlapping
    /// triggers become no-ops.
    refresh_gate: Mutex<()>,
    venue: Exchange,
    market_type: MarketType,
}

impl ExchangeRateManager {
    pub fn new(venue: Exchange) -> Self {
        let mut rates = HashMap::new();
        rates.insert(QuoteCurrency::Usdt, ExchangeRate::identity());
        for (quote, _) in RATE_INSTRUMENTS {
            rates.insert(*quote, ExchangeRate::default_for(*quote));
        }
        Self {
            rates: RwLock::new(rates),
            refresh_gate: Mutex::new(()),
            venue,
            market_type: MarketType::Spot,
        }
    }

    pub fn venue(&self) -> Exchange {
        self.venue
    }

    /// Current rate for a quote currency. Always returns a usable row:
    /// USDT yields the identity, unknown entries the default 1.0.
    pub fn get_rate(&self, quote: QuoteCurrency) -> ExchangeRate {
        if quote == QuoteCurrency::Usdt {
            return ExchangeRate::identity();
        }
        self.rates
            .read()
            .get(&quote)
            .cloned()
            .unwrap_or_else(|| ExchangeRate::default_for(quote))
    }

    /// Copy of the whole rate table for observation endpoints.
    pub fn snapshot(&self) -> Vec<ExchangeRate> {
        let mut rows: Vec<ExchangeRate> = self.rates.read().values().cloned().collect();
        rows.sort_by(|a, b| a.from_currency.as_str().cmp(b.from_currency.as_str()));
        rows
    }

    /// The quote currency a symbol defines a rate for, if this write is a
    /// rate-defining book ticker on the designated venue.
    pub fn rate_instrument(
        &self,
        exchange: Exchange,
        market_type: MarketType,
        symbol: &str,
    ) -> Option<QuoteCurrency> {
        if exchange != self.venue || market_type != self.market_type {
            return None;
        }
        RATE_INSTRUMENTS
            .iter()
            .find(|(_, s)| *s == symbol)
            .map(|(q, _)| *q)
    }

    /// Re-derive rates from the designated venue's stored book tickers.
    /// Uses the current ask: the cost of one unit of the foreign quote in
    /// USDT, the conservative direction for a converter.
    pub fn refresh_from_store(&self, store: &PriceStore) {
        let Some(_gate) = self.refresh_gate.try_lock() else {
            return; // refresh already in flight
        };

        // Store reads first, rate lock second.
        let mut observed: Vec<(QuoteCurrency, f64, String)> = Vec::new();
        for (quote, symbol) in RATE_INSTRUMENTS {
            let Some(price) = store.get_price(self.venue, self.market_type, symbol) else {
                continue;
            };
            let rate = if price.ask_price > 0.0 {
                price.ask_price
            } else {
                price.price
            };
            if rate > 0.0 {
                observed.push((*quote, rate, format!("{}:{}", self.venue, symbol)));
            }
        }

        if observed.is_empty() {
            return;
        }

        let mut rates = self.rates.write();
        for (quote, rate, source) in observed {
            debug!(quote = quote.as_str(), rate, "exchange rate refreshed");
            rates.insert(
                quote,
                ExchangeRate {
                    from_currency: quote,
                    to_currency: QuoteCurrency::Usdt,
                    rate,
                    source,
                    last_updated: Utc::now(),
                    is_default_rate: false,
                },
            );
        }
    }

    /// Directly install a rate. Test and seed helper.
    pub fn set_rate(&self, quote: QuoteCurrency, rate: f64, source: &str) {
        self.rates.write().insert(
            quote,
            ExchangeRate {
                from_currency: quote,
                to_currency: QuoteCurrency::Usdt,
                rate,
                source: source.to_string(),
                last_updated: Utc::now(),
                is_default_rate: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_one() {
        let mgr = ExchangeRateManager::new(Exchange::Binance);
        let rate = mgr.get_rate(QuoteCurrency::Usdc);
        assert_eq!(rate.rate, 1.0);
        assert!(rate.is_default_rate);
    }

    #[test]
    fn test_usdt_is_identity() {
        let mgr = ExchangeRateManager::new(Exchange::Binance);
        let rate = mgr.get_rate(QuoteCurrency::Usdt);
        assert_eq!(rate.rate, 1.0);
        assert_eq!(rate.source, "identity");
        assert!(!rate.is_default_rate);
    }

    #[test]
    fn test_rate_instrument_matching() {
        let mgr = ExchangeRateManager::new(Exchange::Binance);
        assert_eq!(
            mgr.rate_instrument(Exchange::Binance, MarketType::Spot, "USDCUSDT"),
            Some(QuoteCurrency::Usdc)
        );
        // Wrong venue or market type never defines a rate.
        assert_eq!(
            mgr.rate_instrument(Exchange::Aster, MarketType::Spot, "USDCUSDT"),
            None
        );
        assert_eq!(
            mgr.rate_instrument(Exchange::Binance, MarketType::Future, "USDCUSDT"),
            None
        );
        assert_eq!(
            mgr.rate_instrument(Exchange::Binance, MarketType::Spot, "ETHUSDT"),
            None
        );
    }

    #[test]
    fn test_set_rate_overrides_default() {
        let mgr = ExchangeRateManager::new(Exchange::Binance);
        mgr.set_rate(QuoteCurrency::Usdc, 0.9998, "test");
        let rate = mgr.get_rate(QuoteCurrency::Usdc);
        assert_eq!(rate.rate, 0.9998);
        assert!(!rate.is_default_rate);
    }

    #[test]
    fn test_snapshot_contains_all_currencies() {
        let mgr = ExchangeRateManager::new(Exchange::Binance);
        let rows = mgr.snapshot();
        assert_eq!(rows.len(), 4);
    }
}
