//! Control-plane HTTP API
//!
//! Read-only views over the capture store plus triggers for the replay
//! engine and the scanners. Every store read that fails, a missing id
//! included, answers 500; the contract has no distinct not-found status.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::info;

use crate::capture::{CapturedPair, CaptureStore};
use crate::config::ApiConfig;
use crate::replay::ReplayEngine;
use crate::scanner::Scanner;

pub struct ApiState {
    pub store: Arc<dyn CaptureStore>,
    pub replay: Arc<ReplayEngine>,
    pub scanner: Arc<Scanner>,
    pub wordlist: PathBuf,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/requests", get(list_requests))
        .route("/requests/:id", get(get_request))
        .route("/repeat/:id", get(repeat_request))
        .route("/scan/:id", get(scan_request))
        .with_state(Arc::new(state))
}

/// Bind the API listener and serve until shutdown
pub async fn serve(config: &ApiConfig, state: ApiState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("api listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn list_requests(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<CapturedPair>>, (StatusCode, String)> {
    let pairs = state.store.all_pairs().await.map_err(internal)?;
    Ok(Json(pairs))
}

async fn get_request(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<CapturedPair>, (StatusCode, String)> {
    let pair = state.store.pair_by_id(id).await.map_err(internal)?;
    Ok(Json(pair))
}

/// Re-send capture `id` and hand the origin's answer to the caller
async fn repeat_request(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Response, (StatusCode, String)> {
    let relayed = state.replay.replay(id, false).await.map_err(internal)?;

    let status =
        StatusCode::from_u16(relayed.code).map_err(|_| internal("invalid replayed status"))?;

    let mut response = Response::builder().status(status);
    if let Some(content_type) = relayed.headers.first("content-type") {
        response = response.header("content-type", content_type);
    }

    response.body(Body::from(relayed.body)).map_err(internal)
}

/// Run both probes against capture `id` as a template
async fn scan_request(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Response, (StatusCode, String)> {
    let template = state.store.request_by_id(id).await.map_err(internal)?;

    let hidden_params = state
        .scanner
        .discover_params(&template)
        .await
        .map_err(internal)?;

    let found_paths: Vec<String> = state
        .scanner
        .brute_force_paths(&template, &state.wordlist)
        .await
        .map_err(internal)?
        .into_iter()
        .filter_map(|(path, found)| found.then_some(path))
        .collect();

    info!(
        id,
        params = hidden_params.len(),
        paths = found_paths.len(),
        "scan complete"
    );

    Ok(Json(json!({
        "hidden_params": hidden_params,
        "found_paths": found_paths,
    }))
    .into_response())
}
