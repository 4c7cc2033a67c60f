// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

const METRICS_PREFIX: &str = "relay_verifier";

fn prefixed(name: &str) -> String {
    format!("{}_{}", METRICS_PREFIX, name)
}

/// Labels of the per-outcome verification counter.
#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Counters shared between the verification engine and the side server.
/// Cloning is cheap; the counters are reference counted.
#[derive(Debug, Clone, Default)]
pub struct VerifierMetrics {
    pub verification_results: Family<OutcomeLabels, Counter>,
    pub registry_messages_sent: Counter,
    pub artifacts_uploaded: Counter,
}

impl From<VerifierMetrics> for Registry {
    fn from(metrics: VerifierMetrics) -> Self {
        let mut registry = Registry::default();
        registry.register(
            prefixed("verification_results"),
            "Counts verification results per outcome",
            metrics.verification_results,
        );
        registry.register(
            prefixed("registry_messages_sent"),
            "Counts messages accepted by the operator registry",
            metrics.registry_messages_sent,
        );
        registry.register(
            prefixed("artifacts_uploaded"),
            "Counts artifacts stored on the permaweb",
            metrics.artifacts_uploaded,
        );
        registry
    }
}
