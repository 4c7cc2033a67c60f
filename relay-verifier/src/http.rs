// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Health and metrics side server.
//!
//! Serves `/healthz` for the deployment's probes and `/metrics` for the
//! Prometheus scraper.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

/// Starts the side server. Runs until the process exits.
pub async fn start(port: u16, registry: Registry) -> Result<(), hyper::Error> {
    let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port);
    tracing::info!(%addr, "starting the health and metrics server");

    let registry = Arc::new(Mutex::new(registry));
    let router = Router::new()
        .route("/healthz", get(|| async { "" }))
        .route("/metrics", get(|| get_metrics(registry)));

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
}

/// Returns the metrics in the Prometheus text exposition format.
async fn get_metrics(registry: Arc<Mutex<Registry>>) -> String {
    let registry = registry.lock().unwrap();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).unwrap();
    buffer
}
