// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Job consumption and processing.
//!
//! Every replica runs a [`Worker`]; leadership only matters for scheduling,
//! not for processing. A job is acknowledged whether it succeeds or fails.
//! Failed jobs are not retried by the queue; a stage failure stalls its flow
//! and the next scheduled run supersedes it, except for persistence, which
//! carries its own bounded retry through the recovery job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_events::{
    Delivery, Job, JobKind, JobQueue, QueueError, QueueName,
};
use serde_json::json;
use snafu::{ResultExt, Snafu};

use crate::attestation::Attestor;
use crate::directory::{
    self, DirectoryClient, DirectoryRelay, GeoLookup,
};
use crate::registry::RegistryMessenger;
use crate::uploader::Uploader;
use crate::verification::{
    RelayStore, VerificationEngine, VerificationResult,
};

use super::{
    validation_flow, verification_flow, TaskManager, ValidationSummary,
    VerificationRecovery,
};

/// Persistence attempts before a run's results are given up on.
const MAX_PERSIST_RETRIES: u32 = 3;

/// Pause after a consume failure that exhausted the queue's own backoff.
const CONSUME_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
enum ProcessError {
    #[snafu(display("error scheduling follow-up jobs"))]
    ScheduleError { source: QueueError },

    #[snafu(display("error storing validated relay records"))]
    StoreValidatedError { source: relay_data::Error },
}

/// Consumes jobs from all queues and dispatches them to the pipeline
/// stages.
pub struct Worker<M, S, U, A> {
    queue: JobQueue,
    manager: Arc<TaskManager>,
    engine: VerificationEngine<M, S, U, A>,
    store: S,
    directory: DirectoryClient,
    geo: GeoLookup,
    banned_fingerprints: HashSet<String>,
    consumer: String,
}

impl<M, S, U, A> Worker<M, S, U, A>
where
    M: RegistryMessenger,
    S: RelayStore,
    U: Uploader,
    A: Attestor,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: JobQueue,
        manager: Arc<TaskManager>,
        engine: VerificationEngine<M, S, U, A>,
        store: S,
        directory: DirectoryClient,
        geo: GeoLookup,
        banned_fingerprints: HashSet<String>,
    ) -> Self {
        Self {
            queue,
            manager,
            engine,
            store,
            directory,
            geo,
            banned_fingerprints,
            consumer: format!("verifier-{}", uuid::Uuid::new_v4()),
        }
    }

    pub async fn run(self) {
        tracing::info!(
            consumer = self.consumer.as_str(),
            "starting the job worker"
        );
        loop {
            match self.queue.consume(&self.consumer).await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.handle(delivery).await;
                    }
                }
                Err(QueueError::ConsumeTimeout) => {}
                Err(error) => {
                    tracing::error!(%error, "error consuming jobs");
                    tokio::time::sleep(CONSUME_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery {
            queue,
            stream_id,
            job,
        } = delivery;
        tracing::info!(kind = %job.kind, id = %job.id, "dequeueing job");

        match self.process(&job).await {
            Ok(output) => {
                if let Err(error) = self.queue.complete(&job, &output).await
                {
                    tracing::error!(
                        %error,
                        kind = %job.kind,
                        id = %job.id,
                        "error completing the job's flow"
                    );
                } else {
                    tracing::info!(kind = %job.kind, id = %job.id, "finished job");
                }
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    id = %job.id,
                    "[alarm=failed-job-{}] failed job",
                    job.kind
                );
            }
        }

        // Failed jobs are acknowledged too; the queue holds no failed set.
        if let Err(error) = self.queue.ack(&queue, &stream_id).await {
            tracing::error!(
                %error,
                stream_id = stream_id.as_str(),
                "error acknowledging the job"
            );
        }
    }

    async fn process(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        match job.kind {
            JobKind::Validate => self.process_validate().await,
            JobKind::Verify => self.process_verify(job).await,
            JobKind::FetchRelays => self.process_fetch_relays().await,
            JobKind::FilterRelays => self.process_filter_relays(job),
            JobKind::ValidateRelays => self.process_validate_relays(job).await,
            JobKind::VerifyRelays => self.process_verify_relays(job).await,
            JobKind::ConfirmVerification => self.process_confirm(job),
            JobKind::PersistVerification => self.process_persist(job).await,
            JobKind::RecoverPersistVerification => {
                self.process_recover(job).await
            }
        }
    }

    /// Starts a validation flow and re-arms the next run. Losing the flow is
    /// recoverable (the next run supersedes it); losing the re-arm would end
    /// the cycle, so that error fails the job.
    async fn process_validate(
        &self,
    ) -> Result<serde_json::Value, ProcessError> {
        if let Err(error) = self.queue.enqueue_flow(&validation_flow()).await
        {
            tracing::error!(%error, "error adding the validation flow");
        }
        // This job is still unacknowledged, so the guard must skip the
        // active check or the re-arm would always see itself and bail.
        self.manager
            .queue_validate_relays(self.manager.validation_interval(), true)
            .await
            .context(ScheduleSnafu)?;
        Ok(serde_json::Value::Null)
    }

    async fn process_verify(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let summaries: Vec<ValidationSummary> = parse_input(&job.input);
        match summaries.first() {
            Some(summary) => {
                self.queue
                    .enqueue_flow(&verification_flow(summary))
                    .await
                    .context(ScheduleSnafu)?;
                tracing::info!(
                    validated_at = summary.validated_at,
                    relays = summary.relays.len(),
                    "started the verification flow"
                );
            }
            None => {
                tracing::warn!("nothing to publish, this should not happen")
            }
        }
        Ok(serde_json::Value::Null)
    }

    async fn process_fetch_relays(
        &self,
    ) -> Result<serde_json::Value, ProcessError> {
        match self.directory.fetch_relays().await {
            Ok(relays) => Ok(json!(relays)),
            Err(error) => {
                tracing::error!(%error, "error fetching relays");
                Ok(json!([]))
            }
        }
    }

    fn process_filter_relays(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let relays: Vec<DirectoryRelay> = parse_input(&job.input);
        let filtered =
            directory::filter_relays(relays, &self.banned_fingerprints);
        Ok(json!(filtered))
    }

    async fn process_validate_relays(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let relays: Vec<DirectoryRelay> = parse_input(&job.input);
        if let Err(error) = self.store.set_validating(true).await {
            tracing::warn!(%error, "error flagging the validation run");
        }

        let records = directory::validate_relays(relays, &self.geo).await;
        let summary = ValidationSummary {
            validated_at: crate::unix_time_millis(),
            relays: records.iter().map(|record| record.fingerprint).collect(),
        };
        tracing::info!(
            validated_at = summary.validated_at,
            relays = records.len(),
            "storing validated relay records"
        );
        let stored = self
            .store
            .upsert_relay_records(&records)
            .await
            .context(StoreValidatedSnafu);

        // Clear the flag even when the store write failed; the leader only
        // resets a flag left dangling by a crash.
        if let Err(error) = self.store.set_validating(false).await {
            tracing::warn!(%error, "error clearing the validation flag");
        }
        stored?;

        Ok(json!(summary))
    }

    async fn process_verify_relays(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let raw: Vec<String> = match serde_json::from_value(job.data.clone())
        {
            Ok(raw) => raw,
            Err(error) => {
                tracing::error!(%error, "verify-relays job carries malformed data");
                return Ok(json!([]));
            }
        };

        let mut fingerprints = Vec::with_capacity(raw.len());
        for value in raw {
            match value.parse() {
                Ok(fingerprint) => fingerprints.push(fingerprint),
                Err(error) => tracing::warn!(
                    %error,
                    fingerprint = value.as_str(),
                    "incorrect fingerprint, this should not happen"
                ),
            }
        }

        tracing::info!(relays = fingerprints.len(), "verifying relays");
        match self.engine.verify_relays(&fingerprints).await {
            Ok(results) => {
                tracing::info!(results = results.len(), "verified relays");
                Ok(json!(results))
            }
            Err(error) => {
                tracing::error!(%error, "error verifying relays");
                Ok(json!([]))
            }
        }
    }

    fn process_confirm(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let results: Vec<VerificationResult> = parse_input(&job.input);
        if results.is_empty() {
            tracing::info!("no verification results to confirm");
            return Ok(json!([]));
        }
        tracing::info!(
            validated_at = job.data.as_i64(),
            results = results.len(),
            "confirming verification"
        );
        self.engine.log_verification(&results);
        Ok(json!(results))
    }

    async fn process_persist(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let results: Vec<VerificationResult> = parse_input(&job.input);
        if results.is_empty() {
            tracing::info!("no verified relays found to store");
            return Ok(serde_json::Value::Null);
        }
        tracing::info!(
            validated_at = job.data.as_i64(),
            results = results.len(),
            "persisting verification results"
        );

        let data = self
            .engine
            .persist_verification(&results, String::new(), String::new())
            .await;

        // A failed metrics upload alone does not trigger recovery; the
        // stats artifact gates the hex map and the record purge.
        if !data.validation_stats_tx.is_empty() {
            self.engine.store_relay_hex_map(&results).await;
            self.engine.purge_relay_records().await;
        } else {
            self.queue_recovery(VerificationRecovery {
                retries_left: MAX_PERSIST_RETRIES,
                verification_results: results,
                verification_data: data,
            })
            .await;
        }
        Ok(serde_json::Value::Null)
    }

    async fn process_recover(
        &self,
        job: &Job,
    ) -> Result<serde_json::Value, ProcessError> {
        let recovery: VerificationRecovery =
            match serde_json::from_value(job.data.clone()) {
                Ok(recovery) => recovery,
                Err(error) => {
                    tracing::error!(%error, "recovery job carries malformed data");
                    return Ok(serde_json::Value::Null);
                }
            };
        let VerificationRecovery {
            retries_left,
            verification_results,
            verification_data,
        } = recovery;

        if retries_left == 0 {
            tracing::error!(
                data = ?verification_data,
                results = verification_results.len(),
                "[alarm=failed-persist-verification] no retries left on persisting verification"
            );
            return Ok(serde_json::Value::Null);
        }
        if verification_results.is_empty() {
            tracing::info!("no verified relays found to store");
            return Ok(serde_json::Value::Null);
        }

        tracing::warn!(
            retries_left,
            results = verification_results.len(),
            "recovering verification persistence"
        );
        let data = self
            .engine
            .persist_verification(
                &verification_results,
                verification_data.relay_metrics_tx,
                verification_data.validation_stats_tx,
            )
            .await;

        if !data.relay_metrics_tx.is_empty()
            && !data.validation_stats_tx.is_empty()
        {
            self.engine.store_relay_hex_map(&verification_results).await;
            self.engine.purge_relay_records().await;
        } else {
            // Carry the fresh summary forward so ids obtained on this
            // attempt are not uploaded again on the next one.
            self.queue_recovery(VerificationRecovery {
                retries_left: retries_left - 1,
                verification_results,
                verification_data: data,
            })
            .await;
        }
        Ok(serde_json::Value::Null)
    }

    async fn queue_recovery(&self, recovery: VerificationRecovery) {
        tracing::warn!(
            retries_left = recovery.retries_left,
            "scheduling a verification persistence retry"
        );
        if let Err(error) = self
            .queue
            .enqueue(
                &QueueName::Verification,
                JobKind::RecoverPersistVerification,
                json!(recovery),
            )
            .await
        {
            tracing::error!(
                %error,
                data = ?recovery.verification_data,
                "[alarm=failed-persist-verification] error scheduling the persistence retry"
            );
        }
    }
}

/// Deserializes the merged child outputs of a flow parent, dropping entries
/// that do not parse.
fn parse_input<T: serde::de::DeserializeOwned>(
    input: &[serde_json::Value],
) -> Vec<T> {
    let mut items = Vec::with_capacity(input.len());
    for value in input {
        match serde_json::from_value(value.clone()) {
            Ok(item) => items.push(item),
            Err(error) => {
                tracing::warn!(%error, "dropping a malformed job input entry")
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_input_drops_malformed_entries() {
        let input = vec![
            json!({"validated_at": 1, "relays": []}),
            json!("not a summary"),
            json!({"validated_at": 2, "relays": []}),
        ];
        let summaries: Vec<ValidationSummary> = parse_input(&input);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].validated_at, 1);
        assert_eq!(summaries[1].validated_at, 2);
    }

    #[test]
    fn parse_input_fills_relay_defaults() {
        let input = vec![json!({"fingerprint": "A1B2"})];
        let relays: Vec<DirectoryRelay> = parse_input(&input);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].fingerprint, "A1B2");
        assert!(relays[0].contact.is_none());
    }
}
