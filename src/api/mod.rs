//! HTTP/JSON surface: a thin projection of the store and the spread
//! engine. Always answers; missing data is an empty list, not an error.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::Request,
    middleware::{self, Next},
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::SpreadEngine;
use crate::models::{
    ArbitrageOpportunity, CustomStrategy, ExchangeRate, Price, Spread, StoreStats,
};
use crate::rates::ExchangeRateManager;
use crate::store::PriceStore;

/// Spreads wider than this are bad data and never leave the server.
const NOISE_FILTER_PCT: f64 = 100.0;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PriceStore>,
    pub rates: Arc<ExchangeRateManager>,
    pub engine: Arc<SpreadEngine>,
    /// Applied to /api/spreads when the client sends no min_spread
    pub default_min_spread: f64,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub count: usize,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(count: usize, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            count,
            data,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/spreads", get(get_spreads))
        .route("/api/stats", get(get_stats))
        .route("/api/custom-strategies", get(get_custom_strategies))
        .route(
            "/api/arbitrage-opportunities",
            get(get_arbitrage_opportunities),
        )
        .route("/api/prices/:symbol", get(get_prices))
        .route("/api/exchange-rates", get(get_exchange_rates))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "spreadbot operational"
}

#[derive(Debug, Deserialize)]
pub struct SpreadQuery {
    pub sort: Option<String>,
    pub order: Option<String>,
    pub min_volume: Option<f64>,
    pub min_spread: Option<f64>,
    pub limit: Option<usize>,
}

async fn get_spreads(
    Query(params): Query<SpreadQuery>,
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<Spread>>> {
    let min_spread = params.min_spread.unwrap_or(state.default_min_spread);
    let min_volume = params.min_volume.unwrap_or(0.0);

    let mut spreads: Vec<Spread> = state
        .engine
        .calculate_spreads()
        .into_iter()
        .filter(|s| s.spread_percent.abs() <= NOISE_FILTER_PCT)
        .filter(|s| s.spread_percent >= min_spread)
        .filter(|s| s.volume_24h >= min_volume)
        .collect();

    let descending = !matches!(params.order.as_deref(), Some("asc"));
    match params.sort.as_deref() {
        Some("volume") => spreads.sort_by(|a, b| {
            a.volume_24h
                .partial_cmp(&b.volume_24h)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        Some("symbol") => spreads.sort_by(|a, b| a.symbol.cmp(&b.symbol)),
        // calculate_spreads already sorts by percent descending; re-sort
        // ascending-first so the shared reverse below applies uniformly.
        _ => spreads.sort_by(|a, b| {
            a.spread_percent
                .partial_cmp(&b.spread_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    if descending {
        spreads.reverse();
    }

    if let Some(limit) = params.limit {
        spreads.truncate(limit);
    }

    ApiResponse::ok(spreads.len(), spreads)
}

async fn get_stats(State(state): State<AppState>) -> Json<ApiResponse<StoreStats>> {
    let stats = state.store.get_stats();
    ApiResponse::ok(stats.total_prices, stats)
}

async fn get_custom_strategies(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<CustomStrategy>>> {
    let strategies = state.engine.evaluate_custom_strategies();
    ApiResponse::ok(strategies.len(), strategies)
}

async fn get_arbitrage_opportunities(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ArbitrageOpportunity>>> {
    let opportunities = state.engine.arbitrage_opportunities();
    ApiResponse::ok(opportunities.len(), opportunities)
}

async fn get_prices(
    Path(symbol): Path<String>,
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<Price>>> {
    let prices = state.store.get_prices_by_symbol(&symbol);
    ApiResponse::ok(prices.len(), prices)
}

async fn get_exchange_rates(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ExchangeRate>>> {
    let rates = state.rates.snapshot();
    ApiResponse::ok(rates.len(), rates)
}

/// Log every request with method, path, status and latency. Health
/// checks are skipped to keep the log readable.
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, path, status, latency_ms, "request failed");
    } else {
        info!(%method, path, status, latency_ms, "request");
    }
    response
}
