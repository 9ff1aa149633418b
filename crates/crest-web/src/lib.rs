//! Axum JSON API over the report store: search and the stock summary view.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use crest_store::ReportStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "crest-web";

#[derive(Clone)]
pub struct AppState {
    pub store: ReportStore,
}

impl AppState {
    pub fn new(store: ReportStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReportsQuery {
    q: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/reports", get(reports_handler))
        .route("/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving report API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count_reports().await {
        Ok(reports) => Json(serde_json::json!({
            "service": CRATE_NAME,
            "reports": reports,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Reports newest first; `?q=` filters by case-insensitive substring across
/// stock, broker, and author names.
async fn reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportsQuery>,
) -> Response {
    match state.store.search_reports(query.q.as_deref()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stock_summaries().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
