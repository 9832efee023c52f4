use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::cluster::AssignmentMap;
use crate::server::state::{PassSummary, ReconcilerState};
use crate::stream::{ArtifactStore, Disposition, VirtualAddress};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

/// Welcome page
pub async fn index() -> impl IntoResponse {
    "flipbit load balancer agent\n\nPOST /update with a service assignment map to reconcile.\n"
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Reconcile the posted assignment map.
///
/// The body is decoded by hand so every malformed payload is a 400,
/// whatever the content type says.
pub async fn update<S: ArtifactStore + 'static>(
    State(state): State<ReconcilerState<S>>,
    body: Bytes,
) -> Response {
    let desired: AssignmentMap = match serde_json::from_slice(&body) {
        Ok(desired) => desired,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Rejecting malformed update");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid assignment map: {}", e),
            );
        }
    };

    match state.run_pass(desired).await {
        Ok(summary) => Json(summary.results).into_response(),
        Err(e) => {
            error!(error = %e, "Reconciliation pass failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatus {
    addresses: usize,
    open: usize,
    allocated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pass: Option<LastPass>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LastPass {
    #[serde(flatten)]
    summary: PassSummary,
    counts: DispositionCounts,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispositionCounts {
    created: usize,
    changed: usize,
    no_change: usize,
    cannot_assign: usize,
    error: usize,
}

impl DispositionCounts {
    fn tally(summary: &PassSummary) -> Self {
        let mut counts = Self::default();
        for result in &summary.results {
            match result.status {
                Disposition::Created => counts.created += 1,
                Disposition::Changed => counts.changed += 1,
                Disposition::NoChange => counts.no_change += 1,
                Disposition::CannotAssign => counts.cannot_assign += 1,
                Disposition::Failed => counts.error += 1,
            }
        }
        counts
    }
}

/// Pool occupancy and the outcome of the last pass
pub async fn status<S: ArtifactStore + 'static>(
    State(state): State<ReconcilerState<S>>,
) -> impl IntoResponse {
    let (addresses, open) = {
        let pool = state.pool.read().await;
        (pool.len(), pool.open_addresses().len())
    };
    let last_pass = state.last_pass.read().await.clone().map(|summary| LastPass {
        counts: DispositionCounts::tally(&summary),
        summary,
    });

    Json(AgentStatus {
        addresses,
        open,
        allocated: addresses - open,
        last_pass,
    })
}

/// Every virtual address with its current occupant
pub async fn addresses<S: ArtifactStore + 'static>(
    State(state): State<ReconcilerState<S>>,
) -> impl IntoResponse {
    let pool = state.pool.read().await;
    Json(pool.iter().cloned().collect::<Vec<VirtualAddress>>())
}

/// Create the Axum router
pub fn create_router<S: ArtifactStore + 'static>(state: ReconcilerState<S>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status::<S>))
        .route("/update", post(update::<S>))
        .route("/v1/addresses", get(addresses::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
