// Copyright 2025 Cassop Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Liveness and readiness probes of the operator pod.

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tower_http::trace::TraceLayer;

#[derive(Clone, Debug, Default)]
pub struct ProbeState {
    ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(ready_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(port: u16, state: ProbeState) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("probe server listening on http://{}", addr);

    axum::serve(listener, router(state)).await
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the controller has started watching clusters.
async fn ready_check(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Starting")
    }
}
