// Copyright 2025 cloudpool contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The pool's management HTTP surface: Prometheus exposition, an
//! unauthenticated liveness probe, and an authenticated introspection
//! endpoint for operators.
//!
//! Grounded in the same start-a-router-and-hand-back-a-handle shape this
//! codebase's REST server helper uses, trimmed to what the pool actually
//! needs (no gRPC, no OpenTelemetry middleware — the pool's Non-goals don't
//! include an outer service surface beyond this).

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{Request, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use cloudpool_pool::Pool;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use smart_default::SmartDefault;
use snafu::ResultExt;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::{BindSnafu, ParseAddressSnafu, Result};

/// Configuration for the management HTTP server.
#[derive(Clone, Debug, SmartDefault, serde::Serialize, serde::Deserialize, bon::Builder)]
pub struct ManagementServerConfig {
    /// Address the management server listens on.
    #[default = "127.0.0.1:9006"]
    #[builder(default = "127.0.0.1:9006".to_string())]
    pub bind_address: String,

    /// Bearer token `GET /v1/dispatch/instances` requires. An empty token
    /// means the endpoint is disabled: every request to it is refused with
    /// `403`, matching the system this pool reimplements (an operator must
    /// opt in to exposing instance introspection).
    #[builder(into)]
    pub management_token: String,

    /// Whether to attach a permissive CORS layer (useful for a browser-based
    /// operator dashboard hitting this server directly).
    #[default = true]
    #[builder(default = true)]
    pub enable_cors: bool,
}

#[derive(Clone)]
struct ManagementState {
    pool: Pool,
    management_token: Arc<String>,
}

#[derive(Serialize)]
struct InstancesResponse {
    items: Vec<cloudpool_pool::InstanceView>,
}

/// Handle for a running management server: wait for it to start accepting
/// connections, signal shutdown, and wait for it to fully stop.
pub struct ServiceHandler {
    join_handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
    started_rx: Option<oneshot::Receiver<()>>,
}

impl ServiceHandler {
    /// Blocks until the server has bound its address and is ready to accept
    /// connections.
    ///
    /// # Panics
    /// Panics if called more than once; the start signal is consumed.
    pub async fn wait_for_start(&mut self) {
        let _ = self.started_rx.take().expect("server start signal already consumed").await;
    }

    /// Signals the server to begin shutting down. Does not block; call
    /// [`ServiceHandler::wait_for_stop`] to wait for completion.
    pub fn shutdown(&self) { self.cancellation_token.cancel(); }

    /// Consumes the handle and waits for the server task to finish.
    ///
    /// # Panics
    /// Panics if the server task itself panicked.
    pub async fn wait_for_stop(self) { self.join_handle.await.expect("management server task panicked"); }
}

/// Starts the management server bound to `config.bind_address`, serving
/// `pool`'s metrics and instance snapshot. Returns a [`ServiceHandler`] for
/// lifecycle control; the server runs until [`ServiceHandler::shutdown`] is
/// called.
pub async fn start_management_server(config: ManagementServerConfig, pool: Pool) -> Result<ServiceHandler> {
    let bind_addr = config.bind_address.parse::<SocketAddr>().context(ParseAddressSnafu { addr: config.bind_address.clone() })?;

    let state = ManagementState { pool, management_token: Arc::new(config.management_token) };

    let authenticated = Router::new()
        .route("/v1/dispatch/instances", get(instances_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_management_token));

    let mut router = Router::new().route("/healthz", get(healthz_handler)).route("/metrics", get(metrics_handler)).merge(authenticated).with_state(state);

    if config.enable_cors {
        router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
    }

    let listener = TcpListener::bind(bind_addr).await.context(BindSnafu { addr: bind_addr })?;
    let cancellation_token = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel();

    let serve_token = cancellation_token.clone();
    let join_handle = tokio::spawn(async move {
        info!(addr = %bind_addr, "management server starting");
        let _ = started_tx.send(());
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                serve_token.cancelled().await;
            })
            .await;
        info!(addr = %bind_addr, ?result, "management server stopped");
    });

    Ok(ServiceHandler { join_handle, cancellation_token, started_rx: Some(started_rx) })
}

/// Rejects requests per the auth surface: missing bearer token → 401, wrong
/// token (or an empty configured token, which disables the endpoint
/// entirely) → 403, correct token → pass through.
async fn require_management_token(State(state): State<ManagementState>, req: Request<axum::body::Body>, next: Next) -> Response {
    if state.management_token.is_empty() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(header) = req.headers().get(AUTHORIZATION) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let presented = header.to_str().ok().and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(state.management_token.as_str()) {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await
}

async fn healthz_handler() -> impl IntoResponse { (StatusCode::OK, "ok") }

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buf) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (StatusCode::OK, buf)
}

async fn instances_handler(State(state): State<ManagementState>) -> impl IntoResponse {
    axum::Json(InstancesResponse { items: state.pool.instances() })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudpool_cloud::fake::{FakeExecutorFactory, FakeInstanceSet};
    use cloudpool_pool::{Pool, PoolConfig, clock::FakeClock};

    use super::{ManagementServerConfig, start_management_server};

    async fn get_available_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn test_pool() -> Pool {
        let config = PoolConfig::builder()
            .instance_set_id("disp1")
            .boot_probe_command("true")
            .image_id("img-123")
            .driver("fake")
            .dispatch_private_key_path("/dev/null")
            .build();
        Pool::new(config, Arc::new(FakeInstanceSet::new()), Arc::new(FakeExecutorFactory::new()), Arc::new(FakeClock::default()))
    }

    #[tokio::test]
    async fn healthz_is_unauthenticated() {
        let port = get_available_port().await;
        let config = ManagementServerConfig::builder().bind_address(format!("127.0.0.1:{port}")).management_token("").build();
        let mut handle = start_management_server(config, test_pool()).await.unwrap();
        handle.wait_for_start().await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 200);

        handle.shutdown();
        handle.wait_for_stop().await;
    }

    #[tokio::test]
    async fn instances_without_token_is_unauthorized() {
        let port = get_available_port().await;
        let config = ManagementServerConfig::builder().bind_address(format!("127.0.0.1:{port}")).management_token("s3cr3t").build();
        let mut handle = start_management_server(config, test_pool()).await.unwrap();
        handle.wait_for_start().await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/v1/dispatch/instances")).await.unwrap();
        assert_eq!(resp.status(), 401);

        handle.shutdown();
        handle.wait_for_stop().await;
    }

    #[tokio::test]
    async fn instances_with_wrong_token_is_forbidden() {
        let port = get_available_port().await;
        let config = ManagementServerConfig::builder().bind_address(format!("127.0.0.1:{port}")).management_token("s3cr3t").build();
        let mut handle = start_management_server(config, test_pool()).await.unwrap();
        handle.wait_for_start().await;

        let client = reqwest::Client::new();
        let resp = client.get(format!("http://127.0.0.1:{port}/v1/dispatch/instances")).bearer_auth("wrong").send().await.unwrap();
        assert_eq!(resp.status(), 403);

        handle.shutdown();
        handle.wait_for_stop().await;
    }

    #[tokio::test]
    async fn instances_with_correct_token_succeeds() {
        let port = get_available_port().await;
        let config = ManagementServerConfig::builder().bind_address(format!("127.0.0.1:{port}")).management_token("s3cr3t").build();
        let mut handle = start_management_server(config, test_pool()).await.unwrap();
        handle.wait_for_start().await;

        let client = reqwest::Client::new();
        let resp = client.get(format!("http://127.0.0.1:{port}/v1/dispatch/instances")).bearer_auth("s3cr3t").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["items"].as_array().unwrap().is_empty());

        handle.shutdown();
        handle.wait_for_stop().await;
    }

    #[tokio::test]
    async fn empty_management_token_forbids_every_request() {
        let port = get_available_port().await;
        let config = ManagementServerConfig::builder().bind_address(format!("127.0.0.1:{port}")).management_token("").build();
        let mut handle = start_management_server(config, test_pool()).await.unwrap();
        handle.wait_for_start().await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/v1/dispatch/instances")).await.unwrap();
        assert_eq!(resp.status(), 403);

        handle.shutdown();
        handle.wait_for_stop().await;
    }
}
