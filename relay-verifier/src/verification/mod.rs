// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Registry reconciliation.
//!
//! One verification pass reads the registry state exactly once and classifies
//! every relay of the run against that snapshot, so a relay whose registry
//! entry changes mid-pass cannot land in two outcome buckets. Relays that
//! survive classification are submitted in fixed-size chunks; a rejected
//! chunk keeps its own outcome while a transport error ends the pass and
//! fails everything still queued. Retries happen at the pipeline level, not
//! here.

pub mod stats;

use std::time::Duration;

use async_trait::async_trait;
use relay_data::{
    RelayRecord, Repository, ScoredRelay, TaskServiceState, VerificationData,
};
use relay_events::{EvmAddress, Fingerprint};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::ans104::Tag;
use crate::attestation::Attestor;
use crate::metrics::{OutcomeLabels, VerifierMetrics};
use crate::registry::{CertificateEntry, RegistryError, RegistryMessenger};
use crate::uploader::Uploader;

pub use stats::{relay_hex_map, validation_stats, HexCellStats, ValidationStats};

/// Relay records pulled from the store per classification page.
const CLASSIFY_PAGE_SIZE: usize = 1000;

/// Queued relays submitted to the registry per message.
const SUBMIT_CHUNK_SIZE: usize = 100;

/// Pause between chunk submissions, respecting registry rate limits.
const SUBMIT_CHUNK_DELAY: Duration = Duration::from_secs(1);

/// Artifact ids reported instead of uploading when the verifier is not live.
const NOT_LIVE_METRICS_ID: &str = "not-live-skipped-store-relay-metrics";
const NOT_LIVE_STATS_ID: &str = "not-live-skipped-store-validation-stats";
const NOT_LIVE_HEX_MAP_ID: &str = "not-live-skipped-store-relay-hex-map";

#[derive(Debug, Snafu)]
pub enum VerificationError {
    #[snafu(display("error reading the registry state snapshot"))]
    SnapshotError { source: RegistryError },

    #[snafu(display("error loading relay records for verification"))]
    RecordLoadError { source: relay_data::Error },
}

/// Closed set of per-relay reconciliation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationOutcome {
    #[serde(rename = "OK")]
    Ok,
    AlreadyRegistered,
    AlreadyVerified,
    Failed,
    HardwareProofFailed,
    #[serde(rename = "AOMessageFailed")]
    AoMessageFailed,
}

impl VerificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationOutcome::Ok => "OK",
            VerificationOutcome::AlreadyRegistered => "AlreadyRegistered",
            VerificationOutcome::AlreadyVerified => "AlreadyVerified",
            VerificationOutcome::Failed => "Failed",
            VerificationOutcome::HardwareProofFailed => "HardwareProofFailed",
            VerificationOutcome::AoMessageFailed => "AOMessageFailed",
        }
    }

    /// Outcomes that leave the relay registered or verified in the registry.
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            VerificationOutcome::Ok
                | VerificationOutcome::AlreadyRegistered
                | VerificationOutcome::AlreadyVerified
        )
    }
}

impl std::fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of reconciling one relay, carrying the relay snapshot the stats
/// and persistence stages aggregate over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub result: VerificationOutcome,
    pub fingerprint: Fingerprint,
    pub relay: RelayRecord,
}

impl VerificationResult {
    pub fn new(result: VerificationOutcome, relay: RelayRecord) -> Self {
        Self {
            result,
            fingerprint: relay.fingerprint,
            relay,
        }
    }
}

/// Store operations the verification pipeline depends on. The engine uses
/// the record and summary operations; the task worker also flags validation
/// runs through the task state.
#[async_trait]
pub trait RelayStore: std::fmt::Debug + Send + Sync {
    async fn upsert_relay_records(
        &self,
        records: &[RelayRecord],
    ) -> Result<(), relay_data::Error>;

    async fn relay_records_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<RelayRecord>, relay_data::Error>;

    async fn insert_verification_data(
        &self,
        data: &VerificationData,
    ) -> Result<(), relay_data::Error>;

    async fn delete_all_relay_records(&self) -> Result<u64, relay_data::Error>;

    async fn load_task_state(
        &self,
    ) -> Result<TaskServiceState, relay_data::Error>;

    async fn set_validating(
        &self,
        is_validating: bool,
    ) -> Result<(), relay_data::Error>;
}

#[async_trait]
impl RelayStore for Repository {
    async fn upsert_relay_records(
        &self,
        records: &[RelayRecord],
    ) -> Result<(), relay_data::Error> {
        Repository::upsert_relay_records(self, records).await
    }

    async fn relay_records_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<RelayRecord>, relay_data::Error> {
        Repository::relay_records_by_fingerprints(self, fingerprints).await
    }

    async fn insert_verification_data(
        &self,
        data: &VerificationData,
    ) -> Result<(), relay_data::Error> {
        Repository::insert_verification_data(self, data).await
    }

    async fn delete_all_relay_records(&self) -> Result<u64, relay_data::Error> {
        Repository::delete_all_relay_records(self).await
    }

    async fn load_task_state(
        &self,
    ) -> Result<TaskServiceState, relay_data::Error> {
        Repository::load_task_state(self).await
    }

    async fn set_validating(
        &self,
        is_validating: bool,
    ) -> Result<(), relay_data::Error> {
        Repository::set_validating(self, is_validating).await
    }
}

/// Reconciles validated relays against the operator registry.
#[derive(Debug)]
pub struct VerificationEngine<M, S, U, A> {
    registry: M,
    store: S,
    uploader: U,
    attestor: A,
    is_live: bool,
    metrics: VerifierMetrics,
}

impl<M, S, U, A> VerificationEngine<M, S, U, A>
where
    M: RegistryMessenger,
    S: RelayStore,
    U: Uploader,
    A: Attestor,
{
    pub fn new(
        registry: M,
        store: S,
        uploader: U,
        attestor: A,
        is_live: bool,
    ) -> Self {
        Self {
            registry,
            store,
            uploader,
            attestor,
            is_live,
            metrics: VerifierMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: VerifierMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Classifies every relay of the run and submits the remainder to the
    /// registry. Every input fingerprint with a stored record comes back in
    /// exactly one outcome bucket.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn verify_relays(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<VerificationResult>, VerificationError> {
        let state =
            self.registry.view_state().await.context(SnapshotSnafu)?;

        let mut results = vec![];
        let mut queued: Vec<(RelayRecord, bool)> = vec![];
        for page in fingerprints.chunks(CLASSIFY_PAGE_SIZE) {
            let records = self
                .store
                .relay_records_by_fingerprints(page)
                .await
                .context(RecordLoadSnafu)?;
            tracing::debug!(
                requested = page.len(),
                loaded = records.len(),
                "classifying a page of relays"
            );

            for mut relay in records {
                if relay.operator_address == EvmAddress::DUMMY {
                    tracing::info!(
                        fingerprint = %relay.fingerprint,
                        "failing relay with the dummy operator address"
                    );
                    results.push(VerificationResult::new(
                        VerificationOutcome::Failed,
                        relay,
                    ));
                } else if state.is_claimable(&relay.fingerprint) {
                    tracing::debug!(
                        fingerprint = %relay.fingerprint,
                        "relay already registered, awaiting its operator claim"
                    );
                    results.push(VerificationResult::new(
                        VerificationOutcome::AlreadyRegistered,
                        relay,
                    ));
                } else if state.is_verified(&relay.fingerprint) {
                    tracing::debug!(
                        fingerprint = %relay.fingerprint,
                        "relay already verified"
                    );
                    results.push(VerificationResult::new(
                        VerificationOutcome::AlreadyVerified,
                        relay,
                    ));
                } else if relay.hardware_info.is_none() {
                    queued.push((relay, false));
                } else if state.is_verified_hardware(&relay.fingerprint) {
                    // The registry already accepted a proof for this relay;
                    // re-attesting would reject the serial as a duplicate.
                    relay.hardware_validated = true;
                    queued.push((relay, false));
                } else if self
                    .attestor
                    .serial_bound_to_other_fingerprint(&relay, &state)
                    .await
                {
                    tracing::info!(
                        fingerprint = %relay.fingerprint,
                        "hardware serial is bound to another live relay"
                    );
                    results.push(VerificationResult::new(
                        VerificationOutcome::HardwareProofFailed,
                        relay,
                    ));
                } else if self.attestor.is_hardware_proof_valid(&relay).await {
                    relay.hardware_validated = true;
                    relay.hardware_validated_at =
                        Some(crate::unix_time_millis());
                    queued.push((relay, true));
                } else {
                    results.push(VerificationResult::new(
                        VerificationOutcome::HardwareProofFailed,
                        relay,
                    ));
                }
            }
        }

        results.extend(self.submit_claimable(queued).await);
        for entry in &results {
            self.metrics
                .verification_results
                .get_or_create(&OutcomeLabels {
                    outcome: entry.result.as_str().to_owned(),
                })
                .inc();
        }
        Ok(results)
    }

    /// Submits queued relays chunk by chunk. An application-level rejection
    /// marks only its chunk and moves on; a transport error fails the chunk
    /// and everything still queued, ending the pass.
    async fn submit_claimable(
        &self,
        queued: Vec<(RelayRecord, bool)>,
    ) -> Vec<VerificationResult> {
        if queued.is_empty() {
            tracing::info!("no claimable relays to add");
            return vec![];
        }
        if !self.is_live {
            tracing::warn!(
                relays = queued.len(),
                "NOT LIVE - skipped the registry call to add claimable relays"
            );
            return queued
                .into_iter()
                .map(|(relay, _)| {
                    VerificationResult::new(VerificationOutcome::Ok, relay)
                })
                .collect();
        }

        tracing::info!(
            relays = queued.len(),
            "adding claimable relays and verified hardware"
        );
        let mut results = vec![];
        let mut pending = queued;
        while !pending.is_empty() {
            let rest = if pending.len() > SUBMIT_CHUNK_SIZE {
                pending.split_off(SUBMIT_CHUNK_SIZE)
            } else {
                vec![]
            };
            let chunk = pending;

            match self.submit_chunk(&chunk).await {
                Ok(accepted) => {
                    let outcome = if accepted {
                        VerificationOutcome::Ok
                    } else {
                        VerificationOutcome::AoMessageFailed
                    };
                    results.extend(chunk.into_iter().map(|(relay, _)| {
                        VerificationResult::new(outcome, relay)
                    }));
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        relays = chunk.len() + rest.len(),
                        "registry submission failed, failing the remaining queue"
                    );
                    results.extend(chunk.into_iter().chain(rest).map(
                        |(relay, _)| {
                            VerificationResult::new(
                                VerificationOutcome::Failed,
                                relay,
                            )
                        },
                    ));
                    return results;
                }
            }

            pending = rest;
            if !pending.is_empty() {
                tokio::time::sleep(SUBMIT_CHUNK_DELAY).await;
            }
        }
        results
    }

    /// Submits one chunk; `Ok(false)` means the registry process rejected
    /// the message even though the transport delivered it.
    async fn submit_chunk(
        &self,
        chunk: &[(RelayRecord, bool)],
    ) -> Result<bool, RegistryError> {
        let hardware: Vec<Fingerprint> = chunk
            .iter()
            .filter(|(_, attested)| *attested)
            .map(|(relay, _)| relay.fingerprint)
            .collect();
        if !hardware.is_empty() {
            let receipt =
                self.registry.add_verified_hardware(&hardware).await?;
            if !receipt.success {
                tracing::error!(
                    message_id = %receipt.message_id,
                    fingerprints = hardware.len(),
                    "registry rejected the verified hardware message"
                );
                return Ok(false);
            }
            tracing::info!(
                message_id = %receipt.message_id,
                fingerprints = hardware.len(),
                "added verified hardware fingerprints"
            );
            self.metrics.registry_messages_sent.inc();
        }

        let entries: Vec<CertificateEntry> = chunk
            .iter()
            .map(|(relay, _)| CertificateEntry {
                address: relay.operator_address,
                fingerprint: relay.fingerprint,
            })
            .collect();
        let receipt =
            self.registry.submit_operator_certificates(&entries).await?;
        if !receipt.success {
            tracing::error!(
                message_id = %receipt.message_id,
                relays = entries.len(),
                "registry rejected the operator certificates message"
            );
            return Ok(false);
        }
        tracing::info!(
            message_id = %receipt.message_id,
            relays = entries.len(),
            "added claimable relays"
        );
        self.metrics.registry_messages_sent.inc();
        Ok(true)
    }

    /// Publishes the metrics and stats artifacts and stores the run summary.
    ///
    /// A transaction id already supplied by a recovery attempt skips the
    /// matching upload; a failed upload leaves its id empty so the recovery
    /// flow can retry it. Store write failures are logged, never raised.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn persist_verification(
        &self,
        results: &[VerificationResult],
        metrics_tx: String,
        stats_tx: String,
    ) -> VerificationData {
        let verified_at = crate::unix_time_millis();
        let successful: Vec<&VerificationResult> = results
            .iter()
            .filter(|entry| entry.result.is_successful())
            .collect();

        let relay_metrics_tx = if metrics_tx.is_empty() {
            self.store_relay_metrics(verified_at, &successful).await
        } else {
            metrics_tx
        };
        let validation_stats_tx = if stats_tx.is_empty() {
            let stats = validation_stats(results);
            self.store_validation_stats(verified_at, &stats).await
        } else {
            stats_tx
        };

        let data = VerificationData {
            verified_at,
            relay_metrics_tx,
            validation_stats_tx,
            relays: successful
                .iter()
                .filter(|entry| {
                    entry.result == VerificationOutcome::AlreadyVerified
                })
                .map(|entry| ScoredRelay {
                    fingerprint: entry.relay.fingerprint,
                    address: entry.relay.operator_address,
                    score: entry.relay.consensus_weight,
                })
                .collect(),
        };
        if let Err(error) = self.store.insert_verification_data(&data).await {
            tracing::error!(%error, "error storing the verification data record");
        }
        data
    }

    /// Publishes the per-cell relay map. Best effort: failures come back as
    /// an empty id and are not retried.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn store_relay_hex_map(
        &self,
        results: &[VerificationResult],
    ) -> String {
        if !self.is_live {
            tracing::warn!("NOT LIVE: not storing the relay hex map");
            return NOT_LIVE_HEX_MAP_ID.to_owned();
        }

        let stamp = crate::unix_time_millis();
        let cells = relay_hex_map(results);
        let body = match serde_json::to_vec(&cells) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "error encoding the relay hex map");
                return String::new();
            }
        };
        match self
            .uploader
            .upload(body, &artifact_tags(stamp, "relay/hex-map"))
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    stamp,
                    relays = results.len(),
                    id = %receipt.id,
                    "permanently stored the relay hex map"
                );
                self.metrics.artifacts_uploaded.inc();
                receipt.id
            }
            Err(error) => {
                tracing::warn!(%error, "error storing the relay hex map");
                String::new()
            }
        }
    }

    /// Per-outcome summary of a finished pass.
    pub fn log_verification(&self, results: &[VerificationResult]) {
        let failed: Vec<String> = results
            .iter()
            .filter(|entry| entry.result == VerificationOutcome::Failed)
            .map(|entry| entry.fingerprint.to_string())
            .collect();
        if !failed.is_empty() {
            tracing::warn!(
                fingerprints = ?failed,
                "failed verification of {} relay(s)",
                failed.len()
            );
        }

        let count = |outcome: VerificationOutcome| {
            results.iter().filter(|entry| entry.result == outcome).count()
        };
        let claimable = count(VerificationOutcome::AlreadyRegistered);
        if claimable > 0 {
            tracing::info!(
                "skipped {} already registered/claimable relay(s)",
                claimable
            );
        }
        let verified = count(VerificationOutcome::AlreadyVerified);
        if verified > 0 {
            tracing::info!("skipped {} verified relay(s)", verified);
        }
        let ok = count(VerificationOutcome::Ok);
        if ok > 0 {
            tracing::info!("registered (for user claims) {} relay(s)", ok);
        }
        tracing::info!("total verified relays: {}", verified);
    }

    /// Drops the transient relay records once the run that consumed them has
    /// persisted its outcome.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn purge_relay_records(&self) {
        match self.store.delete_all_relay_records().await {
            Ok(deleted) => {
                tracing::info!(deleted, "cleaned up relay records")
            }
            Err(error) => {
                tracing::error!(%error, "error cleaning up relay records")
            }
        }
    }

    async fn store_relay_metrics(
        &self,
        stamp: i64,
        results: &[&VerificationResult],
    ) -> String {
        if !self.is_live {
            tracing::warn!(
                stamp,
                relays = results.len(),
                "NOT LIVE: not storing relay/metrics"
            );
            return NOT_LIVE_METRICS_ID.to_owned();
        }

        let body = match serde_json::to_vec(results) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "error encoding relay metrics");
                return String::new();
            }
        };
        match self
            .uploader
            .upload(body, &artifact_tags(stamp, "relay/metrics"))
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    stamp,
                    relays = results.len(),
                    id = %receipt.id,
                    "permanently stored relay/metrics"
                );
                self.metrics.artifacts_uploaded.inc();
                receipt.id
            }
            Err(error) => {
                tracing::warn!(%error, "error storing relay metrics");
                String::new()
            }
        }
    }

    async fn store_validation_stats(
        &self,
        stamp: i64,
        stats: &ValidationStats,
    ) -> String {
        if !self.is_live {
            tracing::warn!(stamp, "NOT LIVE: not storing validation/stats");
            return NOT_LIVE_STATS_ID.to_owned();
        }

        let body = match serde_json::to_vec(stats) {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(%error, "error encoding validation stats");
                return String::new();
            }
        };
        match self
            .uploader
            .upload(body, &artifact_tags(stamp, "validation/stats"))
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    stamp,
                    id = %receipt.id,
                    "permanently stored validation/stats"
                );
                self.metrics.artifacts_uploaded.inc();
                receipt.id
            }
            Err(error) => {
                tracing::warn!(%error, "error storing validation stats");
                String::new()
            }
        }
    }
}

fn artifact_tags(stamp: i64, entity_type: &str) -> Vec<Tag> {
    vec![
        Tag::new("Protocol", "ator"),
        Tag::new("Protocol-Version", "0.1"),
        Tag::new("Content-Timestamp", stamp.to_string()),
        Tag::new("Content-Type", "application/json"),
        Tag::new("Entity-Type", entity_type),
    ]
}
