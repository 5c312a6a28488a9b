//! Read-only JSON API over the persisted chart table.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chartwatch_core::ChartRow;
use chartwatch_sync::DbConfig;
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "chartwatch-web";

pub const DEFAULT_WEB_PORT: u16 = 3001;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}

impl AppState {
    /// The pool connects on first use, so the server starts even while the
    /// database is down.
    pub fn from_db_config(db: &DbConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(db.connect_options()?);
        Ok(Self { pool })
    }
}

#[derive(Debug, Deserialize, Default)]
struct TracksQuery {
    genre: Option<String>,
    date: Option<NaiveDate>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/tracks", get(tracks_handler))
        .route("/healthz", get(healthz_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CHARTWATCH_WEB_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);
    let state = AppState::from_db_config(&DbConfig::from_env())?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving chart api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn tracks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TracksQuery>,
) -> Response {
    match load_tracks(&state.pool, &query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: sqlx::Error) -> Response {
    error!(%err, "chart query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn tracks_sql(query: &TracksQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT artist, title, rank, date, genre FROM beatport_top100");
    let mut sep = " WHERE ";
    if let Some(genre) = &query.genre {
        qb.push(sep).push("genre = ").push_bind(genre.clone());
        sep = " AND ";
    }
    if let Some(date) = query.date {
        qb.push(sep).push("date = ").push_bind(date);
    }
    qb.push(" ORDER BY date DESC, genre, rank");
    qb
}

fn row_to_chart(row: &PgRow) -> Result<ChartRow, sqlx::Error> {
    Ok(ChartRow {
        artist: row.try_get::<Option<String>, _>("artist")?.unwrap_or_default(),
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        rank: row.try_get::<Option<i32>, _>("rank")?.unwrap_or_default(),
        date: row.try_get("date")?,
        genre: row.try_get::<Option<String>, _>("genre")?.unwrap_or_default(),
    })
}

async fn load_tracks(pool: &PgPool, query: &TracksQuery) -> Result<Vec<ChartRow>, sqlx::Error> {
    let rows = tracks_sql(query).build().fetch_all(pool).await?;
    rows.iter().map(row_to_chart).collect()
}
