//! # HTTP API
//!
//! The axum router of the node. Handlers read the validators' shared home
//! states and never touch consensus directly.
//!
//! ## Endpoints
//!
//! | Method | Path                 | Description                              |
//! |--------|----------------------|------------------------------------------|
//! | GET    | `/health`            | Liveness check                           |
//! | GET    | `/status`            | Home state of every validator            |
//! | GET    | `/validators/:index` | Home state of one validator              |
//! | POST   | `/operations`        | Queue a hex-encoded operation            |
//! | GET    | `/metrics`           | Prometheus text exposition               |

use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use isaac_protocol::consensus::{Height, NodeState, Round};

use crate::cluster::{submit, ValidatorHandle};
use crate::metrics::{metrics_handler, SharedMetrics};

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub validators: Arc<Vec<ValidatorHandle>>,
    pub metrics: SharedMetrics,
}

impl FromRef<AppState> for SharedMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorStatus {
    pub index: usize,
    pub address: String,
    pub node_state: NodeState,
    pub height: Height,
    pub round: Round,
    pub last_block: String,
    pub last_round: Round,
}

impl ValidatorStatus {
    fn of(handle: &ValidatorHandle) -> Self {
        let home = handle.snapshot();
        Self {
            index: handle.index,
            address: handle.address.to_string(),
            node_state: home.node_state,
            height: home.height,
            round: home.round,
            last_block: home.last_block.to_hex(),
            last_round: home.last_round,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_seconds: i64,
    /// Lowest committed height across validators, absent while booting.
    pub min_committed_height: Option<Height>,
    pub validators: Vec<ValidatorStatus>,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitOperation {
    /// Hex-encoded opaque operation bytes.
    pub operation: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Validators whose pool took the operation. 0 means duplicate.
    pub accepted: usize,
}

/// Builds the axum [`Router`] with all API routes and request tracing.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/validators/:index", get(validator_handler))
        .route("/operations", post(submit_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// `GET /health`: 200 while the process is up.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let validators: Vec<_> = state.validators.iter().map(ValidatorStatus::of).collect();
    let min_committed_height = validators
        .iter()
        .map(|v| v.height.checked_sub(1))
        .min()
        .flatten();
    let now = Utc::now();

    Json(StatusResponse {
        version: state.version.clone(),
        uptime_seconds: (now - state.started_at).num_seconds(),
        min_committed_height,
        validators,
        timestamp: now.to_rfc3339(),
    })
}

async fn validator_handler(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Response {
    match state.validators.get(index) {
        Some(handle) => Json(ValidatorStatus::of(handle)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("no validator {index}")),
    }
}

/// `POST /operations`: queue an operation on every validator's pool.
async fn submit_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitOperation>,
) -> Response {
    let operation = match hex::decode(body.operation.trim()) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return api_error(StatusCode::BAD_REQUEST, "empty operation"),
        Err(e) => return api_error(StatusCode::BAD_REQUEST, format!("invalid hex: {e}")),
    };

    let accepted = submit(&state.validators, &operation);
    if accepted > 0 {
        state.metrics.operations_submitted_total.inc();
    }
    tracing::debug!(bytes = operation.len(), accepted, "operation submitted");
    Json(SubmitResponse { accepted }).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use isaac_protocol::consensus::{HomeState, HomeStateCell, OperationPool};
    use isaac_protocol::crypto::Keypair;
    use isaac_protocol::storage::Block;

    use crate::metrics::NodeMetrics;

    /// Two validators: one positioned after genesis, one still booting.
    fn test_app_state() -> AppState {
        let running = Arc::new(HomeStateCell::new(HomeState::after(
            &Block::genesis(),
            NodeState::Consensus,
        )));
        let validators = [running, Arc::new(HomeStateCell::default())]
            .into_iter()
            .enumerate()
            .map(|(index, home)| ValidatorHandle {
                index,
                address: Keypair::from_seed(&[index as u8 + 1; 32]).address(),
                home,
                operations: Arc::new(OperationPool::new()),
            })
            .collect();

        AppState {
            version: "0.1.0-test".into(),
            started_at: Utc::now(),
            validators: Arc::new(validators),
            metrics: Arc::new(NodeMetrics::new().expect("metrics")),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        send(router, req).await
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_lists_every_validator() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.validators.len(), 2);
        assert_eq!(resp.validators[0].height, 1);
        assert_eq!(resp.validators[0].node_state, NodeState::Consensus);
        assert_eq!(resp.validators[0].last_block, Block::genesis().hash().to_hex());
        assert_eq!(resp.validators[1].node_state, NodeState::Booting);
        // The booting validator has committed nothing yet.
        assert_eq!(resp.min_committed_height, None);
    }

    #[tokio::test]
    async fn validator_endpoint_returns_404_for_missing() {
        let router = create_router(test_app_state());

        let (status, body) = get(&router, "/validators/0").await;
        assert_eq!(status, StatusCode::OK);
        let v: ValidatorStatus = serde_json::from_slice(&body).unwrap();
        assert_eq!(v.index, 0);

        let (status, _) = get(&router, "/validators/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operations_reach_every_pool_once() {
        let state = test_app_state();
        let router = create_router(state.clone());

        let body = serde_json::json!({ "operation": "deadbeef" });
        let (status, resp) = post_json(&router, "/operations", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let resp: SubmitResponse = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp.accepted, 2);
        assert!(state.validators.iter().all(|v| v.operations.len() == 1));

        let (_, resp) = post_json(&router, "/operations", body).await;
        let resp: SubmitResponse = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp.accepted, 0);
        assert_eq!(state.metrics.operations_submitted_total.get(), 1);
    }

    #[tokio::test]
    async fn operations_reject_bad_hex() {
        let router = create_router(test_app_state());
        let (status, _) =
            post_json(&router, "/operations", serde_json::json!({ "operation": "zz" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) =
            post_json(&router, "/operations", serde_json::json!({ "operation": "" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let state = test_app_state();
        state.metrics.validators.set(2);
        let router = create_router(state);

        let (status, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("isaac_node_validators 2"));
    }
}
