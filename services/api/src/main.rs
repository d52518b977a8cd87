//! API Service - Read-only API over the AM market explorer tables
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /companies - Search companies with filters
//! - GET /summary - Aggregate dashboard summary (cached)
//! - GET /market-sizes - Market size estimates (cached)
//! - GET /deals - M&A deal records
//!
//! The serving layer never writes; the importer owns all table mutations.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

// ============================================================================
// Response cache
// ============================================================================

#[derive(Debug)]
struct CacheEntry {
    stored_at: Instant,
    body: serde_json::Value,
}

/// TTL response cache for the aggregate endpoints. Constructed once and owned
/// by `AppState`; handlers receive it explicitly, so its lifecycle is visible
/// and tests can build their own instance.
#[derive(Debug)]
struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.body.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, body: serde_json::Value) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                body,
            },
        );
    }
}

// ============================================================================
// State
// ============================================================================

struct AppState {
    pool: PgPool,
    cache: ResponseCache,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct CompanyResponse {
    company_id: Uuid,
    name: String,
    website: Option<String>,
    city: Option<String>,
    country: Option<String>,
    segment: Option<String>,
    company_type: Option<String>,
    machine_rows: i64,
    unit_total: i64,
}

#[derive(Serialize, sqlx::FromRow)]
struct MarketSizeResponse {
    year: i32,
    segment: String,
    region: String,
    value_usd_m: Option<f64>,
    estimate_type: Option<String>,
}

#[derive(Serialize, sqlx::FromRow)]
struct DealResponse {
    acquirer: String,
    target: String,
    announced_date: Option<NaiveDate>,
    deal_size_usd_m: Option<f64>,
    country: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct CompaniesQuery {
    query: Option<String>,
    country: Option<String>,
    segment: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct MarketSizesQuery {
    year: Option<i32>,
    segment: Option<String>,
}

#[derive(Deserialize)]
struct DealsQuery {
    query: Option<String>,
    limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn companies_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompaniesQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);

    // Build dynamic query
    let mut query = String::from(
        r#"
        SELECT c.company_id, c.name, c.website, c.city, c.country, c.segment, c.company_type,
               COALESCE(e.machine_rows, 0) AS machine_rows,
               COALESCE(e.unit_total, 0) AS unit_total
        FROM companies c
        LEFT JOIN (
            SELECT company_name,
                   COUNT(*) AS machine_rows,
                   COALESCE(SUM(unit_count), 0)::bigint AS unit_total
            FROM company_equipment
            GROUP BY company_name
        ) e ON e.company_name = c.name
        WHERE 1=1
        "#,
    );

    let mut idx = 1;
    if params.query.is_some() {
        query.push_str(&format!(
            " AND (c.name ILIKE ${} OR c.website ILIKE ${})",
            idx, idx
        ));
        idx += 1;
    }
    if params.country.is_some() {
        query.push_str(&format!(" AND c.country = ${}", idx));
        idx += 1;
    }
    if params.segment.is_some() {
        query.push_str(&format!(" AND c.segment = ${}", idx));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY c.name LIMIT ${}", idx));

    let mut q = sqlx::query(&query);
    if let Some(search) = &params.query {
        q = q.bind(format!("%{}%", search));
    }
    if let Some(country) = &params.country {
        q = q.bind(country);
    }
    if let Some(segment) = &params.segment {
        q = q.bind(segment);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let companies: Vec<CompanyResponse> = rows
                .iter()
                .map(|row| CompanyResponse {
                    company_id: row.get("company_id"),
                    name: row.get("name"),
                    website: row.get("website"),
                    city: row.get("city"),
                    country: row.get("country"),
                    segment: row.get("segment"),
                    company_type: row.get("company_type"),
                    machine_rows: row.get("machine_rows"),
                    unit_total: row.get("unit_total"),
                })
                .collect();
            Json(serde_json::json!({ "companies": companies })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn count_scalar(pool: &PgPool, sql: &str) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(sql).fetch_one(pool).await?;
    Ok(row.0)
}

/// Label/count rows with each label's share of the total.
fn breakdown(rows: Vec<(Option<String>, i64)>, total: i64) -> Vec<serde_json::Value> {
    rows.into_iter()
        .map(|(label, count)| {
            let share_pct = if total > 0 {
                (count as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            serde_json::json!({
                "label": label.unwrap_or_else(|| "Unknown".to_string()),
                "count": count,
                "share_pct": share_pct,
            })
        })
        .collect()
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(cached) = state.cache.get("summary") {
        return Json(cached).into_response();
    }

    let result: Result<serde_json::Value, sqlx::Error> = async {
        let companies_total = count_scalar(&state.pool, "SELECT COUNT(*) FROM companies").await?;
        let machine_units = count_scalar(
            &state.pool,
            "SELECT COALESCE(SUM(unit_count), 0)::bigint FROM company_equipment",
        )
        .await?;
        let quotes_total = count_scalar(&state.pool, "SELECT COUNT(*) FROM pricing_quotes").await?;
        let deals_total = count_scalar(&state.pool, "SELECT COUNT(*) FROM ma_deals").await?;

        let countries: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT country, COUNT(*) FROM companies GROUP BY country ORDER BY COUNT(*) DESC, country LIMIT 10",
        )
        .fetch_all(&state.pool)
        .await?;

        let segments: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT segment, COUNT(*) FROM companies GROUP BY segment ORDER BY COUNT(*) DESC, segment",
        )
        .fetch_all(&state.pool)
        .await?;

        let years: Vec<(i32,)> =
            sqlx::query_as("SELECT DISTINCT year FROM market_sizes ORDER BY year DESC")
                .fetch_all(&state.pool)
                .await?;

        Ok(serde_json::json!({
            "companies_total": companies_total,
            "machine_units": machine_units,
            "pricing_quotes_total": quotes_total,
            "deals_total": deals_total,
            "top_countries": breakdown(countries, companies_total),
            "segments": breakdown(segments, companies_total),
            "market_size_years": years.into_iter().map(|(y,)| y).collect::<Vec<i32>>(),
        }))
    }
    .await;

    match result {
        Ok(summary) => {
            state.cache.put("summary", summary.clone());
            Json(summary).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn market_sizes_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MarketSizesQuery>,
) -> impl IntoResponse {
    let cache_key = format!(
        "market-sizes:{}:{}",
        params
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "all".to_string()),
        params.segment.as_deref().unwrap_or("all"),
    );
    if let Some(cached) = state.cache.get(&cache_key) {
        return Json(cached).into_response();
    }

    let mut query = String::from(
        "SELECT year, segment, region, value_usd_m, estimate_type FROM market_sizes WHERE 1=1",
    );
    let mut idx = 1;
    if params.year.is_some() {
        query.push_str(&format!(" AND year = ${}", idx));
        idx += 1;
    }
    if params.segment.is_some() {
        query.push_str(&format!(" AND segment = ${}", idx));
    }
    query.push_str(" ORDER BY year DESC, segment, region");

    let mut q = sqlx::query_as::<_, MarketSizeResponse>(&query);
    if let Some(year) = params.year {
        q = q.bind(year);
    }
    if let Some(segment) = &params.segment {
        q = q.bind(segment);
    }

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let body = serde_json::json!({ "market_sizes": rows });
            state.cache.put(&cache_key, body.clone());
            Json(body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn deals_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DealsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1000);

    let rows = if let Some(search) = &params.query {
        let pattern = format!("%{}%", search);
        sqlx::query_as::<_, DealResponse>(
            r#"
            SELECT acquirer, target, announced_date, deal_size_usd_m, country
            FROM ma_deals
            WHERE acquirer ILIKE $1 OR target ILIKE $1
            ORDER BY announced_date DESC NULLS LAST, acquirer
            LIMIT $2
            "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    } else {
        sqlx::query_as::<_, DealResponse>(
            r#"
            SELECT acquirer, target, announced_date, deal_size_usd_m, country
            FROM ma_deals
            ORDER BY announced_date DESC NULLS LAST, acquirer
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&state.pool)
        .await
    };

    match rows {
        Ok(deals) => Json(serde_json::json!({ "deals": deals })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let cache_ttl_secs: u64 = std::env::var("CACHE_TTL_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    println!("=== AM Market Explorer API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("failed to connect to database")?;

    println!("Database connected");
    println!("Cache TTL: {}s", cache_ttl_secs);

    let state = Arc::new(AppState {
        pool,
        cache: ResponseCache::new(Duration::from_secs(cache_ttl_secs)),
    });

    // CORS for the web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/companies", get(companies_handler))
        .route("/summary", get(summary_handler))
        .route("/market-sizes", get(market_sizes_handler))
        .route("/deals", get(deals_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /companies?query=&country=&segment=&limit=");
    println!("  GET /summary");
    println!("  GET /market-sizes?year=&segment=");
    println!("  GET /deals?query=&limit=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
