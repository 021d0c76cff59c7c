//! Categorized opportunities with persistence tracking.
//!
//! A spread becomes an opportunity once it clears its category threshold;
//! it becomes *confirmed* only after it has been continuously present for
//! the confirmation window. This keeps downstream consumers from acting
//! on single-tick spikes.

use chrono::{DateTime, Utc};

use crate::models::{
    ArbitrageOpportunity, OpportunityCategory, Spread, StrategyStatus,
};

use super::{symmetric_spread_percent, SpreadEngine};

/// Majors get a tighter threshold than the rest of the board.
const MAJOR_COINS: &[&str] = &["BTCUSDT", "ETHUSDT", "SOLUSDT"];
const MAJOR_THRESHOLD_PCT: f64 = 0.15;

const LARGE_CAPS: &[&str] = &[
    "BNBUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "TRXUSDT", "LINKUSDT", "AVAXUSDT", "DOTUSDT",
    "MATICUSDT", "UNIUSDT", "LTCUSDT", "ATOMUSDT",
];
const LARGE_CAP_THRESHOLD_PCT: f64 = 0.3;

const STRATEGY_THRESHOLD_PCT: f64 = 0.4;

/// Anything wider than this is bad data, not an opportunity.
const NOISE_PCT: f64 = 100.0;

/// Continuous presence required before an opportunity is confirmed.
const CONFIRM_AFTER_SECS: f64 = 6.0;
/// Absence after which the sighting history is forgotten.
const EVICT_AFTER_SECS: f64 = 10.0;

/// Sighting record for one opportunity key.
#[derive(Debug, Clone)]
pub(crate) struct OpportunityRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub latest_percent: f64,
}

fn opportunity_key(spread: &Spread, category: OpportunityCategory) -> String {
    format!(
        "{}|{}|{}:{}|{}:{}",
        spread.symbol,
        category.as_str(),
        spread.buy_exchange,
        spread.buy_market_type,
        spread.sell_exchange,
        spread.sell_market_type,
    )
}

fn categorize(symbol: &str, percent: f64) -> Option<OpportunityCategory> {
    if MAJOR_COINS.contains(&symbol) && percent >= MAJOR_THRESHOLD_PCT {
        return Some(OpportunityCategory::MajorCoinSpread);
    }
    if LARGE_CAPS.contains(&symbol) && percent >= LARGE_CAP_THRESHOLD_PCT {
        return Some(OpportunityCategory::LargeCapSpread);
    }
    None
}

impl SpreadEngine {
    /// The filtered, categorized view over the current spread matrix,
    /// annotated with sighting persistence.
    pub fn arbitrage_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let mut candidates: Vec<(Spread, OpportunityCategory)> = Vec::new();

        for mut spread in self.calculate_spreads() {
            // Opportunity evaluation uses the symmetric percent.
            let percent = symmetric_spread_percent(spread.buy_price, spread.sell_price);
            if percent.abs() > NOISE_PCT {
                continue;
            }
            let Some(category) = categorize(&spread.symbol, percent) else {
                continue;
            };
            spread.spread_percent = percent;
            candidates.push((spread, category));
        }

        for strategy in self.evaluate_custom_strategies() {
            if strategy.status != StrategyStatus::Ready {
                continue;
            }
            if strategy.value_percent < STRATEGY_THRESHOLD_PCT
                || strategy.value_percent.abs() > NOISE_PCT
            {
                continue;
            }
            // Long leg is bought, short leg sold; project the combination
            // onto the spread shape so tracking and reporting are uniform.
            let long = &strategy.components[0];
            let short = &strategy.components[1];
            candidates.push((
                Spread {
                    symbol: strategy.name.clone(),
                    buy_exchange: long.exchange,
                    buy_market_type: long.market_type,
                    sell_exchange: short.exchange,
                    sell_market_type: short.market_type,
                    buy_price: long.price,
                    sell_price: short.coefficient * short.price,
                    spread_percent: strategy.value_percent,
                    spread_absolute: strategy.value,
                    volume_24h: 0.0,
                    updated_at: Utc::now(),
                },
                OpportunityCategory::StgZroSpread,
            ));
        }

        // Persistence bookkeeping under the engine's own lock; the store
        // lock was released with the snapshot.
        let now = Utc::now();
        let mut history = self.history().lock();
        history.retain(|_, rec| {
            (now - rec.last_seen).num_milliseconds() as f64 / 1000.0 <= EVICT_AFTER_SECS
        });

        let mut opportunities = Vec::with_capacity(candidates.len());
        for (spread, category) in candidates {
            let key = opportunity_key(&spread, category);
            let rec = history.entry(key).or_insert_with(|| OpportunityRecord {
                first_seen: now,
                last_seen: now,
                latest_percent: spread.spread_percent,
            });
            rec.last_seen = now;
            rec.latest_percent = spread.spread_percent;

            let duration_seconds = (now - rec.first_seen).num_milliseconds() as f64 / 1000.0;
            opportunities.push(ArbitrageOpportunity {
                first_seen: rec.first_seen,
                duration_seconds,
                is_confirmed: duration_seconds >= CONFIRM_AFTER_SECS,
                category,
                spread,
            });
        }

        opportunities.sort_by(|a, b| {
            b.spread
                .spread_percent
                .partial_cmp(&a.spread.spread_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        opportunities
    }
}
