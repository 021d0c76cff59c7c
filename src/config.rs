//! Application configuration.
//!
//! Everything is env-driven with sensible defaults so the binary runs
//! out of the box against public endpoints. A `.env` file is honored.

use std::env;

/// Startup configuration for the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API port
    pub port: u16,
    /// Optional HTTPS proxy applied to every REST client
    pub https_proxy: Option<String>,

    /// Binance spot REST bases, tried in order on failure
    pub binance_spot_rest_bases: Vec<String>,
    pub binance_spot_ws_url: String,
    pub binance_futures_rest_bases: Vec<String>,
    pub binance_futures_ws_url: String,

    pub aster_rest_bases: Vec<String>,
    pub aster_ws_url: String,

    pub lighter_rest_base: String,
    pub lighter_ws_url: String,
    /// Seconds between Lighter market-list refreshes (0 disables)
    pub lighter_market_refresh_secs: u64,

    pub dex_base_url: String,
    /// One worker per key, each at the vendor rate limit
    pub dex_api_keys: Vec<String>,
    /// Merged DEX quotes with a wider implied spread are rejected
    pub dex_max_spread_percent: f64,
    /// Merged DEX quotes that jump more than this vs the previous
    /// accepted quote are rejected
    pub dex_max_jump_percent: f64,

    /// Symbols quoted on the DEX aggregator (others are stream-discovered)
    pub monitored_symbols: Vec<String>,
    /// Default minimum spread percent applied by `/api/spreads` when the
    /// client does not pass its own
    pub min_spread_percent: f64,
    /// Steady-state REST poll interval in seconds
    pub rest_refresh_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = env_or("PORT", "8080").parse().unwrap_or(8080);

        let https_proxy = env::var("HTTPS_PROXY")
            .or_else(|_| env::var("https_proxy"))
            .ok()
            .filter(|s| !s.trim().is_empty());

        let binance_spot_rest_bases = env_list(
            "BINANCE_SPOT_REST_BASES",
            "https://api.binance.com,https://api1.binance.com,https://api2.binance.com,https://api3.binance.com",
        );
        let binance_spot_ws_url = env_or(
            "BINANCE_SPOT_WS_URL",
            "wss://stream.binance.com:9443/stream",
        );
        let binance_futures_rest_bases =
            env_list("BINANCE_FUTURES_REST_BASES", "https://fapi.binance.com");
        let binance_futures_ws_url =
            env_or("BINANCE_FUTURES_WS_URL", "wss://fstream.binance.com/stream");

        let aster_rest_bases = env_list("ASTER_REST_BASES", "https://fapi.asterdex.com");
        let aster_ws_url = env_or("ASTER_WS_URL", "wss://fstream.asterdex.com/stream");

        let lighter_rest_base = env_or("LIGHTER_REST_BASE", "https://mainnet.zklighter.elliot.ai");
        let lighter_ws_url = env_or("LIGHTER_WS_URL", "wss://mainnet.zklighter.elliot.ai/stream");
        let lighter_market_refresh_secs = env_or("LIGHTER_MARKET_REFRESH_SECS", "600")
            .parse()
            .unwrap_or(600);

        let dex_base_url = env_or("DEX_BASE_URL", "https://api.odos.xyz");
        let dex_api_keys = env_list("DEX_API_KEYS", "");
        let dex_max_spread_percent = env_or("DEX_MAX_SPREAD_PERCENT", "5.0")
            .parse()
            .unwrap_or(5.0);
        let dex_max_jump_percent = env_or("DEX_MAX_JUMP_PERCENT", "10.0")
            .parse()
            .unwrap_or(10.0);

        let monitored_symbols = env_list("MONITORED_SYMBOLS", "STGUSDT,ZROUSDT");

        let min_spread_percent = env_or("MIN_SPREAD_PERCENT", "0.0").parse().unwrap_or(0.0);

        let rest_refresh_secs = env_or("REST_REFRESH_SECS", "30").parse().unwrap_or(30);

        Ok(Self {
            port,
            https_proxy,
            binance_spot_rest_bases,
            binance_spot_ws_url,
            binance_futures_rest_bases,
            binance_futures_ws_url,
            aster_rest_bases,
            aster_ws_url,
            lighter_rest_base,
            lighter_ws_url,
            lighter_market_refresh_secs,
            dex_base_url,
            dex_api_keys,
            dex_max_spread_percent,
            dex_max_jump_percent,
            monitored_symbols,
            min_spread_percent,
            rest_refresh_secs,
        })
    }
}
