//! Control HTTP surface.
//!
//! Serves two endpoints: `GET /connect`, the handshake bootstrap call peers
//! use to request a data channel, and `GET /status`, a JSON snapshot for
//! humans and scripts. The listener scans a small port range so several
//! nodes can share a machine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::infrastructure::network::{Broker, HandshakeError, PeerInfo};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no free control port in {base}..{}", .base + .tries)]
    NoPortAvailable { base: u16, tries: u16 },
}

#[derive(Clone)]
pub struct ControlState {
    pub broker: Broker,
    pub hostname: String,
    pub port: u16,
}

/// Builds the control router over shared state.
pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/connect", get(serve_connect))
        .route("/status", get(serve_status))
        .with_state(state)
}

/// Binds the first free port in `base..base + tries` on `bind_address`.
///
/// # Errors
///
/// Returns [`ControlError::NoPortAvailable`] when the whole range is taken.
pub async fn bind_control_listener(
    bind_address: IpAddr,
    base: u16,
    tries: u16,
) -> Result<(TcpListener, u16), ControlError> {
    for port in base..base.saturating_add(tries) {
        match TcpListener::bind(SocketAddr::new(bind_address, port)).await {
            Ok(listener) => {
                info!(%bind_address, port, "control surface bound");
                return Ok((listener, port));
            }
            Err(err) => {
                info!(port, error = %err, "control port taken, trying next");
            }
        }
    }
    Err(ControlError::NoPortAvailable { base, tries })
}

/// Runs the control server until the process exits. Connection info is
/// attached so handlers can see each caller's source address.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn serve_connect(
    State(state): State<ControlState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let claimed_host = params.get("myAddress").map(String::as_str);
    let claimed_port = params.get("myPort").and_then(|port| port.parse().ok());

    match state.broker.serve_connect(remote, claimed_host, claimed_port).await {
        Ok(dial_target) => (StatusCode::OK, dial_target).into_response(),
        Err(
            err @ (HandshakeError::ArgumentMissing
            | HandshakeError::AddressMismatch
            | HandshakeError::AlreadyConnecting),
        ) => {
            warn!(%remote, reason = %err, "handshake rejected");
            (StatusCode::NOT_IMPLEMENTED, err.to_string()).into_response()
        }
        Err(err) => {
            warn!(%remote, error = %err, "handshake failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    hostname: String,
    control_port: u16,
    pid: u32,
    peers: Vec<PeerInfo>,
}

async fn serve_status(State(state): State<ControlState>) -> Json<StatusReport> {
    Json(StatusReport {
        hostname: state.hostname.clone(),
        control_port: state.port,
        pid: std::process::id(),
        peers: state.broker.peers().await,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
