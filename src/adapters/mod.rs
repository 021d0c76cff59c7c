//! Venue adapters: streaming pools plus corrective REST pollers.
//!
//! Every adapter owns its connections and tasks and never escalates
//! transient I/O out of its own loops; the store's freshness rule is the
//! only arbiter between sources.

pub mod aster;
pub mod binance;
pub mod book_ticker;
pub mod dex;
pub mod lighter;

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Fixed delay before a dropped stream connection is re-dialed.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Proactive recycle age; several venues force-close at 24 h.
pub const MAX_CONNECTION_AGE: Duration = Duration::from_secs(23 * 60 * 60);

/// Silence on the server-ping channel past this is a heartbeat anomaly.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Instruments per streaming connection. Venues cap per-connection
/// subscription counts, so the universe is sharded.
pub const SYMBOLS_PER_CONNECTION: usize = 50;

/// REST retry policy: bounded attempts, fixed delay, base rotation.
pub const REST_ATTEMPTS: usize = 3;
pub const REST_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Process-wide stop signal. Tasks exit when the value flips to true.
pub type Shutdown = watch::Receiver<bool>;

pub fn is_shutdown(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}

/// Build the REST client every adapter uses: short timeout, pooled
/// connections, optional HTTPS proxy.
pub fn http_client(https_proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(proxy) = https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy).context("invalid HTTPS proxy url")?);
    }

    builder.build().context("failed to build HTTP client")
}

/// Round-robin assignment of instruments to connection shards.
pub fn shard_symbols(symbols: &[String], per_shard: usize) -> Vec<Vec<String>> {
    if symbols.is_empty() || per_shard == 0 {
        return Vec::new();
    }
    let shard_count = symbols.len().div_ceil(per_shard);
    let mut shards = vec![Vec::with_capacity(per_shard); shard_count];
    for (i, symbol) in symbols.iter().enumerate() {
        shards[i % shard_count].push(symbol.clone());
    }
    shards
}

/// Two-state REST poll cadence: accelerated while the process warms up,
/// relaxed afterwards.
#[derive(Debug, Clone)]
pub struct PollCadence {
    started: Instant,
    cold_for: Duration,
    cold_every: Duration,
    normal_every: Duration,
}

impl PollCadence {
    pub fn new(cold_for: Duration, cold_every: Duration, normal_every: Duration) -> Self {
        Self {
            started: Instant::now(),
            cold_for,
            cold_every,
            normal_every,
        }
    }

    /// Default cadence: 2 s polls for the first minute, then steady-state.
    pub fn standard(normal_every: Duration) -> Self {
        Self::new(
            Duration::from_secs(60),
            Duration::from_secs(2),
            normal_every,
        )
    }

    pub fn is_cold(&self) -> bool {
        self.started.elapsed() < self.cold_for
    }

    pub fn next_delay(&self) -> Duration {
        if self.is_cold() {
            self.cold_every
        } else {
            self.normal_every
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_symbols_round_robin() {
        let symbols: Vec<String> = (0..7).map(|i| format!("S{i}")).collect();
        let shards = shard_symbols(&symbols, 3);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0], vec!["S0", "S3", "S6"]);
        assert_eq!(shards[1], vec!["S1", "S4"]);
        assert_eq!(shards[2], vec!["S2", "S5"]);
        // Disjoint and complete.
        let total: usize = shards.iter().map(|s| s.len()).sum();
        assert_eq!(total, symbols.len());
    }

    #[test]
    fn test_shard_symbols_single_shard() {
        let symbols: Vec<String> = (0..7).map(|i| format!("S{i}")).collect();
        let shards = shard_symbols(&symbols, 50);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].len(), 7);
    }

    #[test]
    fn test_shard_symbols_empty() {
        assert!(shard_symbols(&[], 50).is_empty());
    }

    #[test]
    fn test_poll_cadence_cold_then_normal() {
        let cadence = PollCadence::new(
            Duration::from_millis(50),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        assert!(cadence.is_cold());
        assert_eq!(cadence.next_delay(), Duration::from_secs(2));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!cadence.is_cold());
        assert_eq!(cadence.next_delay(), Duration::from_secs(30));
    }
}
