//! Core data records: top-of-book prices, derived spreads, tracked
//! opportunities, stablecoin exchange rates and custom strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venues the ingestion layer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Aster,
    Lighter,
    Odos,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Aster => "aster",
            Exchange::Lighter => "lighter",
            Exchange::Odos => "odos",
        }
    }

    pub const ALL: [Exchange; 4] = [
        Exchange::Binance,
        Exchange::Aster,
        Exchange::Lighter,
        Exchange::Odos,
    ];
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketType {
    Spot,
    Future,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::Future => "FUTURE",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a quote came from. Streams beat snapshots of equal age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceSource {
    Websocket,
    Rest,
}

/// Quote currencies the parser recognizes. Everything is normalized to
/// USDT before it reaches the cross-venue index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteCurrency {
    Usdt,
    Usdc,
    Usde,
    Fdusd,
}

impl QuoteCurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteCurrency::Usdt => "USDT",
            QuoteCurrency::Usdc => "USDC",
            QuoteCurrency::Usde => "USDE",
            QuoteCurrency::Fdusd => "FDUSD",
        }
    }
}

impl fmt::Display for QuoteCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest top-of-book snapshot for one instrument on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    /// Venue-native symbol string
    pub symbol: String,
    pub exchange: Exchange,
    pub market_type: MarketType,
    /// Mid when both sides are known, best-effort otherwise
    pub price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    /// Rolling 24h quote volume (0 when the source doesn't publish one)
    pub volume_24h: f64,
    /// Exchange-reported time of the quote
    pub timestamp: DateTime<Utc>,
    /// Local wall-clock time of acceptance
    pub last_updated: DateTime<Utc>,
    pub source: PriceSource,
    pub quote_currency: QuoteCurrency,
    pub original_bid_price: f64,
    pub original_ask_price: f64,
    pub exchange_rate: f64,
    pub exchange_rate_source: String,
    /// True iff bid/ask/price are expressed in USDT
    pub is_normalized: bool,
}

/// Mid-price with single-sided fallback.
pub fn mid_price(bid: f64, ask: f64) -> f64 {
    if bid > 0.0 && ask > 0.0 {
        (bid + ask) / 2.0
    } else if bid > 0.0 {
        bid
    } else {
        ask
    }
}

impl Price {
    /// Build a raw (un-normalized) top-of-book record the way adapters
    /// produce them. The store fills in quote parsing and normalization.
    pub fn top_of_book(
        symbol: impl Into<String>,
        exchange: Exchange,
        market_type: MarketType,
        bid_price: f64,
        ask_price: f64,
        source: PriceSource,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            market_type,
            price: mid_price(bid_price, ask_price),
            bid_price,
            ask_price,
            bid_qty: 0.0,
            ask_qty: 0.0,
            volume_24h: 0.0,
            timestamp,
            last_updated: Utc::now(),
            source,
            quote_currency: QuoteCurrency::Usdt,
            original_bid_price: bid_price,
            original_ask_price: ask_price,
            exchange_rate: 1.0,
            exchange_rate_source: String::new(),
            is_normalized: false,
        }
    }

    pub fn with_quantities(mut self, bid_qty: f64, ask_qty: f64) -> Self {
        self.bid_qty = bid_qty;
        self.ask_qty = ask_qty;
        self
    }

    pub fn with_volume(mut self, volume_24h: f64) -> Self {
        self.volume_24h = volume_24h;
        self
    }

    /// Price to pay when buying here: best ask, mid as fallback.
    pub fn effective_buy_price(&self) -> f64 {
        if self.ask_price > 0.0 {
            self.ask_price
        } else {
            self.price
        }
    }

    /// Price received when selling here: best bid, mid as fallback.
    pub fn effective_sell_price(&self) -> f64 {
        if self.bid_price > 0.0 {
            self.bid_price
        } else {
            self.price
        }
    }
}

/// Directed cross-book economics between two venues for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spread {
    pub symbol: String,
    pub buy_exchange: Exchange,
    pub buy_market_type: MarketType,
    pub sell_exchange: Exchange,
    pub sell_market_type: MarketType,
    /// Ask on the buy venue (mid fallback)
    pub buy_price: f64,
    /// Bid on the sell venue (mid fallback)
    pub sell_price: f64,
    /// (sell - buy) / buy * 100
    pub spread_percent: f64,
    pub spread_absolute: f64,
    /// min of the two venues' 24h volumes
    pub volume_24h: f64,
    /// max of the two venues' last_updated
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityCategory {
    MajorCoinSpread,
    LargeCapSpread,
    StgZroSpread,
}

impl OpportunityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityCategory::MajorCoinSpread => "major_coin_spread",
            OpportunityCategory::LargeCapSpread => "large_cap_spread",
            OpportunityCategory::StgZroSpread => "stg_zro_spread",
        }
    }
}

/// A spread that cleared its category threshold and is tracked for
/// persistence so downstream consumers don't act on single-tick spikes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    #[serde(flatten)]
    pub spread: Spread,
    pub category: OpportunityCategory,
    pub first_seen: DateTime<Utc>,
    pub duration_seconds: f64,
    pub is_confirmed: bool,
}

/// Stablecoin conversion rate into USDT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from_currency: QuoteCurrency,
    pub to_currency: QuoteCurrency,
    pub rate: f64,
    /// e.g. "binance:USDCUSDT", "default", "identity"
    pub source: String,
    pub last_updated: DateTime<Utc>,
    pub is_default_rate: bool,
}

impl ExchangeRate {
    /// Synthetic identity row for USDT itself.
    pub fn identity() -> Self {
        Self {
            from_currency: QuoteCurrency::Usdt,
            to_currency: QuoteCurrency::Usdt,
            rate: 1.0,
            source: "identity".to_string(),
            last_updated: Utc::now(),
            is_default_rate: false,
        }
    }

    pub fn default_for(quote: QuoteCurrency) -> Self {
        Self {
            from_currency: quote,
            to_currency: QuoteCurrency::Usdt,
            rate: 1.0,
            source: "default".to_string(),
            last_updated: Utc::now(),
            is_default_rate: true,
        }
    }
}

/// One leg of a custom strategy, with its live evaluation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyComponent {
    pub symbol: String,
    pub coefficient: f64,
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub price: f64,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Ready,
    Partial,
    Unavailable,
}

/// Evaluated linear combination across instruments (e.g. STG - k*ZRO).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomStrategy {
    pub name: String,
    pub formula: String,
    pub strategy_type: String,
    pub value: f64,
    pub value_percent: f64,
    pub components: Vec<StrategyComponent>,
    pub status: StrategyStatus,
}

/// Aggregate store counts for the stats endpoint and the periodic reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_prices: usize,
    pub total_symbols: usize,
    pub by_exchange: std::collections::HashMap<String, usize>,
    pub accepted_writes: u64,
    pub rejected_writes: u64,
}
