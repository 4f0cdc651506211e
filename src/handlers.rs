//! HTTP endpoints of the swap coordinator.
//!
//! Read-only surfaces (health, oracle values, the transaction listing) plus
//! the two swap entry points: `/swap/generate-signature` for burn
//! authorizations and `POST /swap` to register a burn for payout.
//!
//! Outside a whitelist of read-only paths, requests must carry
//! `Authorization: ApiKey <key>`; auth is disabled entirely when no key is
//! configured (non-production environments).

use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

use crate::chain::btc::address::validate_btc_address;
use crate::chain::evm::{EvmApi, EvmError};
use crate::endpoints::EndpointHealth;
use crate::jobs::{AggregateHealth, JobStatusStore};
use crate::oracle::{OracleError, OracleService};
use crate::store::models::TransactionFilter;
use crate::store::{Store, StoreError};
use crate::swap::{SwapError, SwapService};

/// Paths reachable without an API key.
const AUTH_WHITELIST: &[&str] = &["/healthz", "/health", "/oracle"];

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Named provider of endpoint-health snapshots for `/health/external`.
pub type EndpointHealthSource = (
    &'static str,
    Arc<dyn Fn() -> Vec<EndpointHealth> + Send + Sync>,
);

pub struct AppState {
    pub oracle: Arc<OracleService>,
    pub swap: Arc<SwapService>,
    pub store: Arc<dyn Store>,
    pub evm: Arc<dyn EvmApi>,
    pub job_status: Arc<JobStatusStore>,
    pub endpoint_health_sources: Vec<EndpointHealthSource>,
    pub api_key: Option<String>,
    pub btc_network: bitcoin::Network,
    pub min_icy_swap_amount: String,
    pub service_fee_rate: f64,
    /// Upper bound on the `/swap/info` fan-out.
    pub info_timeout: Duration,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/health/db", get(get_health_db))
        .route("/health/external", get(get_health_external))
        .route("/health/jobs", get(get_health_jobs))
        .route("/oracle/circulated-icy", get(get_circulated_icy))
        .route("/oracle/treasury-btc", get(get_treasury_btc))
        .route("/oracle/icy-btc-ratio", get(get_icy_btc_ratio))
        .route("/oracle/icy-btc-ratio-cached", get(get_icy_btc_ratio_cached))
        .route("/swap/info", get(get_swap_info))
        .route("/swap/generate-signature", post(post_generate_signature))
        .route("/swap", post(post_swap))
        .route("/transactions", get(get_transactions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };
    let path = request.uri().path();
    let whitelisted = AUTH_WHITELIST
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")));
    if whitelisted {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("ApiKey "))
        .map(str::trim);
    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "invalid or missing api key"})),
        )
            .into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Validation(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Swap(error) => match error {
                SwapError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                }
                other => (StatusCode::BAD_REQUEST, other.to_string()),
            },
            // Full detail goes to the logs, not the wire.
            ApiError::Oracle(_) | ApiError::Evm(_) | ApiError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, Json(json!({"message": message}))).into_response()
    }
}

#[instrument(skip_all)]
async fn get_healthz() -> impl IntoResponse {
    Json(json!({"message": "ok"}))
}

#[instrument(skip_all)]
async fn get_health_db(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let result = state.store.ping().await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "checks": {"database": "healthy"},
                "duration_ms": duration_ms,
            })),
        ),
        Err(error) => {
            tracing::error!(error = %error, "database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "checks": {"database": "unhealthy"},
                    "duration_ms": duration_ms,
                })),
            )
        }
    }
}

#[instrument(skip_all)]
async fn get_health_external(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let mut checks = serde_json::Map::new();
    let mut all_healthy = true;
    for (name, source) in &state.endpoint_health_sources {
        let endpoints = source();
        let healthy = endpoints.iter().any(|e| e.is_healthy);
        all_healthy &= healthy;
        checks.insert(
            (*name).to_string(),
            json!({
                "status": if healthy { "healthy" } else { "unhealthy" },
                "endpoints": endpoints,
            }),
        );
    }
    let code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if all_healthy { "healthy" } else { "unhealthy" },
            "checks": checks,
            "duration_ms": started.elapsed().as_millis() as u64,
        })),
    )
}

#[instrument(skip_all)]
async fn get_health_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let aggregate = state.job_status.aggregate();
    let code = match aggregate {
        AggregateHealth::Healthy => StatusCode::OK,
        AggregateHealth::Degraded => StatusCode::PARTIAL_CONTENT,
        AggregateHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let checks: serde_json::Map<String, serde_json::Value> = state
        .job_status
        .snapshot()
        .into_iter()
        .map(|status| (status.name.clone(), json!(status)))
        .collect();
    (
        code,
        Json(json!({
            "status": aggregate,
            "checks": checks,
            "duration_ms": started.elapsed().as_millis() as u64,
        })),
    )
}

#[instrument(skip_all)]
async fn get_circulated_icy(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.oracle.get_circulated_icy().await?))
}

#[instrument(skip_all)]
async fn get_treasury_btc(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.oracle.get_btc_supply().await?))
}

#[instrument(skip_all)]
async fn get_icy_btc_ratio(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.oracle.get_realtime_icy_btc().await?))
}

#[instrument(skip_all)]
async fn get_icy_btc_ratio_cached(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.oracle.get_cached_icy_btc_ratio().await?))
}

/// `GET /swap/info`: parallel fan-out over the oracle values under one
/// deadline. Individually failing sources are omitted with a warning; only
/// total unavailability is a 503.
#[instrument(skip_all)]
async fn get_swap_info(State(state): State<Arc<AppState>>) -> Response {
    let fan_out = tokio::time::timeout(state.info_timeout, async {
        tokio::join!(
            state.oracle.get_cached_circulated_icy(),
            state.oracle.get_cached_btc_supply(),
            state.oracle.get_cached_icy_btc_ratio(),
            state.oracle.satoshi_usd(),
        )
    })
    .await;

    let Ok((circulated, btc_supply, ratio, sat_usd)) = fan_out else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "info sources timed out"})),
        )
            .into_response();
    };

    let mut body = serde_json::Map::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut available = 0;

    match circulated {
        Ok(value) => {
            body.insert("circulated_icy".to_string(), json!(value));
            available += 1;
        }
        Err(error) => warnings.push(format!("circulated icy unavailable: {error}")),
    }
    match btc_supply {
        Ok(value) => {
            body.insert("btc_treasury".to_string(), json!(value));
            available += 1;
        }
        Err(error) => warnings.push(format!("btc treasury unavailable: {error}")),
    }
    match ratio {
        Ok(value) => {
            body.insert("icy_btc_ratio".to_string(), json!(value));
            available += 1;
        }
        Err(error) => warnings.push(format!("icy/btc ratio unavailable: {error}")),
    }
    match sat_usd {
        Ok(value) => {
            body.insert("satoshi_usd".to_string(), json!(value));
            available += 1;
        }
        Err(error) => warnings.push(format!("satoshi price unavailable: {error}")),
    }

    if available == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "all info sources unavailable", "warnings": warnings})),
        )
            .into_response();
    }

    body.insert(
        "min_icy_swap_amount".to_string(),
        json!(state.min_icy_swap_amount),
    );
    body.insert("service_fee_rate".to_string(), json!(state.service_fee_rate));
    body.insert("warnings".to_string(), json!(warnings));
    (StatusCode::OK, Json(serde_json::Value::Object(body))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct GenerateSignatureRequest {
    pub icy_amount: String,
    pub btc_address: String,
    pub btc_amount: u64,
}

#[derive(Debug, Serialize)]
pub struct GenerateSignatureResponse {
    pub signature: String,
    pub nonce: String,
    pub deadline: u64,
    pub icy_amount: String,
    pub btc_amount: u64,
}

#[instrument(skip_all, fields(btc_address = %body.btc_address))]
async fn post_generate_signature(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateSignatureRequest>,
) -> Result<Json<GenerateSignatureResponse>, ApiError> {
    let icy_amount: alloy::primitives::U256 = body
        .icy_amount
        .parse()
        .map_err(|_| ApiError::Validation("icy_amount must be a positive integer".to_string()))?;
    if icy_amount.is_zero() || body.btc_amount == 0 {
        return Err(ApiError::Validation(
            "amounts must be greater than zero".to_string(),
        ));
    }
    validate_btc_address(&body.btc_address, state.btc_network)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let permit = state
        .evm
        .generate_swap_permit(icy_amount, &body.btc_address, body.btc_amount)
        .await?;
    Ok(Json(GenerateSignatureResponse {
        signature: permit.signature,
        nonce: permit.nonce.to_string(),
        deadline: permit.deadline,
        icy_amount: body.icy_amount,
        btc_amount: body.btc_amount,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSwapRequestBody {
    pub icy_amount: String,
    pub btc_address: String,
    pub icy_tx: String,
}

#[instrument(skip_all, fields(icy_tx = %body.icy_tx))]
async fn post_swap(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSwapRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .swap
        .create_swap_request(&body.icy_amount, &body.btc_address, &body.icy_tx)
        .await?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub btc_address: Option<String>,
    pub evm_address: Option<String>,
    pub status: Option<String>,
}

#[instrument(skip_all)]
async fn get_transactions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TransactionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = TransactionFilter {
        limit: query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: query.offset.unwrap_or(0).max(0),
        btc_address: query.btc_address,
        evm_address: query.evm_address,
        status: query.status,
    };
    let (total, transactions) = state.store.list_transactions(&filter).await?;
    Ok(Json(json!({
        "total": total,
        "transactions": transactions,
    })))
}
