//! Spreadbot Library
//!
//! Exposes the ingestion core for the binary and tests: venue adapters,
//! the concurrent price store, the exchange-rate manager, and the
//! spread/opportunity engine.

pub mod adapters;
pub mod api;
pub mod config;
pub mod engine;
pub mod models;
pub mod rates;
pub mod store;
pub mod symbols;

// Re-export the records API consumers actually touch.
pub use models::{
    ArbitrageOpportunity, CustomStrategy, Exchange, ExchangeRate, MarketType, Price, PriceSource,
    QuoteCurrency, Spread,
};
