//! HTTP API: stats, discovery descriptor and pairing payload.
//!
//! | Route                    | Body                                   |
//! |--------------------------|----------------------------------------|
//! | `GET /stats`             | latest [`StatsSnapshot`] as JSON       |
//! | `GET /castlink/discover` | [`HostDescriptor`] as JSON             |
//! | `GET /pair`              | encoded share payload (404 when off)   |

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use castlink_core::discovery::DISCOVER_PATH;
use castlink_core::{HostDescriptor, StatsSnapshot};

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    stats: watch::Receiver<StatsSnapshot>,
    descriptor: HostDescriptor,
    pairing: watch::Receiver<Option<String>>,
}

impl ApiState {
    pub fn new(
        stats: watch::Receiver<StatsSnapshot>,
        descriptor: HostDescriptor,
        pairing: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            stats,
            descriptor,
            pairing,
        }
    }
}

async fn stats_handler(State(state): State<ApiState>) -> Json<StatsSnapshot> {
    Json(state.stats.borrow().clone())
}

async fn discover_handler(State(state): State<ApiState>) -> Json<HostDescriptor> {
    Json(state.descriptor.clone())
}

async fn pair_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let payload = state.pairing.borrow().clone();
    match payload {
        Some(payload) => (StatusCode::OK, payload),
        None => (StatusCode::NOT_FOUND, "pairing disabled".to_string()),
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route(DISCOVER_PATH, get(discover_handler))
        .route("/pair", get(pair_handler))
        .with_state(state)
}

/// Serve the API on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

// ── Tests ────────────────────────────────────────────────────────
