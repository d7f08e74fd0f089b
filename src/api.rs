// ===============================
// src/api.rs
// ===============================
//
// HTTP surface (hyper 0.14):
//   POST /allocations   (alias POST /api/v1/swap)
//   GET  /health
//   GET  /metrics
//
// A batch runs in its own task: a client that hangs up does not abort a
// half-executed basket.
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::HttpBody;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::{AllocationRequest, SwapResult};
use crate::metrics::{content_type, encode_metrics, HTTP_REQUESTS};
use crate::orchestrator::Orchestrator;
use crate::validator::from_parallel;

pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown; each batch runs under a child token.
    pub shutdown: CancellationToken,
}

// ---- Legacy wire shape ----
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyBody {
    #[serde(default)]
    total_usdc_amount: Option<Value>,
    allocations: LegacyAllocations,
}

#[derive(Deserialize)]
struct LegacyAllocations {
    #[serde(default)]
    assets: Vec<String>,
    #[serde(default)]
    allocations: Vec<f64>,
    #[serde(default)]
    analysis: Vec<LegacyAnalysis>,
}

#[derive(Deserialize)]
struct LegacyAnalysis {
    #[serde(default)]
    asset_name: String,
    #[serde(default)]
    reason: String,
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

/// Accepts `{totalAmount, items}` or `{totalUsdcAmount, allocations: {assets, allocations, analysis}}`.
/// The error is the message for a 400.
pub fn parse_allocation_body(raw: &[u8]) -> Result<AllocationRequest, String> {
    let invalid_json = |e: serde_json::Error| format!("invalid JSON body: {e}");
    let v: Value = serde_json::from_slice(raw).map_err(invalid_json)?;
    let legacy = v.get("allocations").map_or(false, Value::is_object)
        || v.get("totalUsdcAmount").is_some();
    if !legacy {
        return serde_json::from_value(v).map_err(invalid_json);
    }

    let body: LegacyBody = serde_json::from_value(v).map_err(invalid_json)?;
    // base units either way; a JSON number is taken verbatim
    let total = match body.total_usdc_amount {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    };
    let a = body.allocations;
    // analysis rows match by asset_name, falling back to position
    let rationales: Vec<String> = if a.analysis.len() == a.assets.len() {
        a.assets
            .iter()
            .enumerate()
            .map(|(i, asset)| {
                a.analysis
                    .iter()
                    .find(|x| x.asset_name.eq_ignore_ascii_case(asset))
                    .unwrap_or(&a.analysis[i])
                    .reason
                    .clone()
            })
            .collect()
    } else {
        a.analysis.iter().map(|x| x.reason.clone()).collect()
    };
    from_parallel(total, a.assets, a.allocations, rationales).map_err(|e| e.to_string())
}

async fn read_body_limited(body: &mut Body, limit: usize) -> Result<Vec<u8>, BodyError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if out.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

fn json_response(status: StatusCode, v: Value) -> Response<Body> {
    let mut rsp = Response::new(Body::from(v.to_string()));
    *rsp.status_mut() = status;
    if let Ok(ct) = "application/json".parse() {
        rsp.headers_mut().insert(CONTENT_TYPE, ct);
    }
    rsp
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    json_response(status, json!({ "error": msg.into() }))
}

async fn swap(state: AppState, req: Request<Body>) -> Response<Body> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.map_or(false, |n| n > MAX_BODY_BYTES) {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    let mut body = req.into_body();
    let raw = match read_body_limited(&mut body, MAX_BODY_BYTES).await {
        Ok(raw) => raw,
        Err(BodyError::TooLarge) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
        }
        Err(BodyError::Read(e)) => {
            return error_response(StatusCode::BAD_REQUEST, format!("failed to read body: {e}"))
        }
    };
    let request = match parse_allocation_body(&raw) {
        Ok(r) => r,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let orch = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let task = tokio::spawn(async move { orch.execute_with_cancel(&request, cancel).await });
    let result = match task.await {
        Ok(r) => r,
        Err(e) => {
            error!(?e, "batch task failed");
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "swap execution failed", "details": e.to_string(), "outcomes": [] }),
            );
        }
    };

    match result {
        Ok(report) if report.is_complete() => {
            let results: Vec<SwapResult> = report.completed().into_iter().cloned().collect();
            json_response(StatusCode::OK, json!({ "results": results }))
        }
        Ok(report) => {
            let details = report
                .first_failure()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "batch incomplete".to_string());
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "swap execution failed",
                    "details": details,
                    "batchId": report.batch_id,
                    "outcomes": report.outcomes,
                }),
            )
        }
        Err(e) if e.is_client_error() => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "swap execution failed", "details": e.to_string(), "outcomes": [] }),
        ),
    }
}

fn metrics_response() -> Response<Body> {
    let mut rsp = Response::new(Body::from(encode_metrics()));
    if let Ok(ct) = content_type().parse() {
        rsp.headers_mut().insert(CONTENT_TYPE, ct);
    }
    rsp
}

/// Scrape-only routes for the separate METRICS_PORT listener.
pub async fn handle_metrics(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_response(),
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "status": "ok" })),
        (_, "/metrics") | (_, "/health") => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(rsp)
}

pub async fn handle(state: AppState, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let (route, rsp) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => ("health", json_response(StatusCode::OK, json!({ "status": "ok" }))),
        (&Method::GET, "/metrics") => ("metrics", metrics_response()),
        (&Method::POST, "/allocations") | (&Method::POST, "/api/v1/swap") => {
            ("allocations", swap(state, req).await)
        }
        (_, "/allocations") | (_, "/api/v1/swap") | (_, "/health") | (_, "/metrics") => (
            "method_not_allowed",
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        ),
        _ => ("not_found", error_response(StatusCode::NOT_FOUND, "not found")),
    };
    HTTP_REQUESTS
        .with_label_values(&[route, rsp.status().as_str()])
        .inc();
    Ok(rsp)
}

/// Serves until `state.shutdown` is cancelled, then drains in-flight requests.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), hyper::Error> {
    let shutdown = state.shutdown.clone();
    let make = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });
    let server = Server::try_bind(&addr)?
        .serve(make)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    info!(%addr, "http listening");
    server.await
}

/// Metrics listener; stops with the api server on `shutdown`.
pub async fn serve_metrics(addr: SocketAddr, shutdown: CancellationToken) -> Result<(), hyper::Error> {
    let make = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(handle_metrics))
    });
    let server = Server::try_bind(&addr)?
        .serve(make)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    info!(%addr, "metrics listening");
    server.await
}
