//! Gateway: the runtime's external RPC surface.
//!
//! The primary transport is a length-prefixed JSON duplex socket bound to
//! loopback only — the same framing [`crate::core::wire`] gives the secrets
//! broker and sub-agent IPC. Every accepted connection is handled by its own
//! task; each request on a connection is dispatched through
//! [`crate::core::dispatcher::Dispatcher`] independently, so one slow
//! request never blocks another on the same socket.
//!
//! An optional HTTP adapter (gated behind the `http-gateway` feature)
//! exposes the same method surface over `axum`, grounded on the same
//! `Router`/`ConnectInfo`-based IP filtering pattern used for the teacher's
//! MCP HTTP adapter.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use crate::core::dispatcher::{CorrelationId, Dispatcher};
use crate::core::wire::{read_frame, write_frame, FramingError};

#[derive(Debug, Clone)]
pub enum GatewayError {
    Bind(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Bind(msg) => write!(f, "gateway bind error: {}", msg),
        }
    }
}

impl Error for GatewayError {}

#[derive(Deserialize)]
struct Envelope {
    correlation_id: Option<uuid::Uuid>,
    method: String,
    params: serde_json::Value,
}

#[derive(Serialize)]
struct Reply {
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Framed, loopback-only duplex transport for the dispatcher's method
/// surface.
pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    envelope_cap: usize,
}

impl Gateway {
    pub fn new(dispatcher: Arc<Dispatcher>, envelope_cap: usize) -> Self {
        Gateway { dispatcher, envelope_cap }
    }

    /// Bind to `addr` (expected to be a loopback address, e.g.
    /// `127.0.0.1:0`) and accept connections until the returned future is
    /// dropped or the process exits. Each connection is handled on its own
    /// spawned task.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<std::net::SocketAddr, GatewayError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| GatewayError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| GatewayError::Bind(e.to_string()))?;

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.handle_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("gateway: accept failed: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        loop {
            let envelope: Result<Envelope, FramingError> = read_frame(&mut stream, self.envelope_cap).await;
            let envelope = match envelope {
                Ok(e) => e,
                Err(FramingError::ConnectionClosed) => return,
                Err(e) => {
                    log::warn!("gateway: framing error, closing connection: {}", e);
                    return;
                }
            };

            let correlation_id = envelope.correlation_id.map(CorrelationId);
            let (id, result) = self
                .dispatcher
                .dispatch(correlation_id, &envelope.method, envelope.params, None)
                .await;

            let reply = match result {
                Ok(value) => Reply { correlation_id: id.to_string(), result: Some(value), error: None },
                Err(e) => Reply { correlation_id: id.to_string(), result: None, error: Some(e.to_string()) },
            };

            if write_frame(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }

    /// Serve the same method surface over HTTP, gated behind the
    /// `http-gateway` feature. A single `POST /rpc` endpoint accepts
    /// `{"method": ..., "params": ...}` bodies and dispatches them through
    /// the same [`Dispatcher`] instance as [`Gateway::serve`], so method
    /// registration and the framed duplex transport both stay in sync with
    /// the HTTP surface.
    #[cfg(feature = "http-gateway")]
    pub async fn serve_http(
        self: Arc<Self>,
        addr: &str,
        allowed_ips: Vec<std::net::IpAddr>,
    ) -> Result<std::net::SocketAddr, GatewayError> {
        use axum::extract::{ConnectInfo, State};
        use axum::http::StatusCode;
        use axum::response::IntoResponse;
        use axum::routing::post;
        use axum::{Json, Router};

        let allowed_ips = Arc::new(allowed_ips);
        let state = self.clone();

        let app = Router::new()
            .route(
                "/rpc",
                post(
                    move |ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
                          State(gateway): State<Arc<Gateway>>,
                          Json(envelope): Json<Envelope>| {
                        let allowed_ips = allowed_ips.clone();
                        async move {
                            if !allowed_ips.is_empty() && !allowed_ips.contains(&peer.ip()) {
                                return (
                                    StatusCode::FORBIDDEN,
                                    Json(serde_json::json!({"error": "ip_not_allowed"})),
                                )
                                    .into_response();
                            }

                            let correlation_id = envelope.correlation_id.map(CorrelationId);
                            let (id, result) = gateway
                                .dispatcher
                                .dispatch(correlation_id, &envelope.method, envelope.params, None)
                                .await;

                            let reply = match result {
                                Ok(value) => {
                                    Reply { correlation_id: id.to_string(), result: Some(value), error: None }
                                }
                                Err(e) => Reply {
                                    correlation_id: id.to_string(),
                                    result: None,
                                    error: Some(e.to_string()),
                                },
                            };
                            (StatusCode::OK, Json(reply)).into_response()
                        }
                    },
                ),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| GatewayError::Bind(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            {
                log::warn!("gateway: http server exited: {}", e);
            }
        });

        Ok(local_addr)
    }
}
