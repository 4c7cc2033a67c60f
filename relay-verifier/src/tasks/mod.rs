// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Pipeline orchestration.
//!
//! Two job flows drive the verifier. The validation flow fetches, filters
//! and validates the relay directory, ending in a `verify` job that starts
//! the verification flow for the run's output. The `validate` job re-arms
//! itself with a delay, making the pipeline self-perpetuating once the
//! leader has seeded the first run at startup.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use relay_events::{
    Fingerprint, FlowJob, JobKind, JobQueue, QueueError, QueueName,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cluster::Leadership;
use crate::verification::{RelayStore, VerificationResult};

pub use worker::Worker;

/// Interval of the delayed-job promotion tick.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Output of a validation run, threaded into the verification flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub validated_at: i64,
    #[serde(default)]
    pub relays: Vec<Fingerprint>,
}

/// Payload of a bounded persistence retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecovery {
    pub retries_left: u32,
    #[serde(default)]
    pub verification_results: Vec<VerificationResult>,
    pub verification_data: relay_data::VerificationData,
}

/// The recurring validation flow. The leaf stages run on the validation
/// queue; the root `verify` job runs on the tasks queue and starts the
/// verification flow.
pub fn validation_flow() -> FlowJob {
    FlowJob::new(QueueName::Tasks, JobKind::Verify, serde_json::Value::Null)
        .with_child(
            FlowJob::new(
                QueueName::Validation,
                JobKind::ValidateRelays,
                serde_json::Value::Null,
            )
            .with_child(
                FlowJob::new(
                    QueueName::Validation,
                    JobKind::FilterRelays,
                    serde_json::Value::Null,
                )
                .with_child(FlowJob::new(
                    QueueName::Validation,
                    JobKind::FetchRelays,
                    serde_json::Value::Null,
                )),
            ),
        )
}

/// The verification flow for one validation run. The fingerprints ride on
/// the leaf job; the confirmation and persistence stages carry the run
/// stamp for logging.
pub fn verification_flow(summary: &ValidationSummary) -> FlowJob {
    FlowJob::new(
        QueueName::Verification,
        JobKind::PersistVerification,
        json!(summary.validated_at),
    )
    .with_child(
        FlowJob::new(
            QueueName::Verification,
            JobKind::ConfirmVerification,
            json!(summary.validated_at),
        )
        .with_child(FlowJob::new(
            QueueName::Verification,
            JobKind::VerifyRelays,
            json!(summary.relays),
        )),
    )
}

/// Leader-side scheduling: startup maintenance, the re-entrancy guard
/// around new runs, and the delayed-job promotion tick.
#[derive(Debug)]
pub struct TaskManager {
    queue: JobQueue,
    leadership: Arc<dyn Leadership>,
    validation_interval: Duration,
    is_live: bool,
    do_clean: bool,
}

impl TaskManager {
    pub fn new(
        queue: JobQueue,
        leadership: Arc<dyn Leadership>,
        validation_interval: Duration,
        is_live: bool,
        do_clean: bool,
    ) -> Self {
        Self {
            queue,
            leadership,
            validation_interval,
            is_live,
            do_clean,
        }
    }

    pub fn validation_interval(&self) -> Duration {
        self.validation_interval
    }

    /// Startup maintenance and the first run. Only the leader acts; every
    /// other replica stays a passive consumer.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn bootstrap<S: RelayStore>(
        &self,
        store: &S,
    ) -> Result<(), QueueError> {
        if !self.leadership.is_leader().await {
            tracing::info!(
                "not the leader, skipping queue cleanup and the first run"
            );
            return Ok(());
        }
        tracing::info!(
            "leader replica, checking queue cleanup and starting the first run"
        );

        if !self.is_live || self.do_clean {
            tracing::info!(
                is_live = self.is_live,
                do_clean = self.do_clean,
                "obliterating the job queues"
            );
            for queue in QueueName::ALL {
                self.queue.obliterate(&queue).await?;
            }
        }

        // A crash during a validation run leaves the flag set.
        match store.load_task_state().await {
            Ok(state) if state.is_validating => {
                tracing::warn!(
                    "a previous run left the validation flag set, resetting it"
                );
                if let Err(error) = store.set_validating(false).await {
                    tracing::error!(%error, "error resetting the validation flag");
                }
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(%error, "error loading the task state")
            }
        }

        self.queue_validate_relays(Duration::ZERO, false).await
    }

    /// Schedules the next validation run unless the tasks queue already
    /// holds one. The guard keeps the cycle from piling up jobs; it is best
    /// effort, not a lock.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn queue_validate_relays(
        &self,
        delay: Duration,
        skip_active_check: bool,
    ) -> Result<(), QueueError> {
        let mut enqueued = self.queue.waiting_count(&QueueName::Tasks).await?;
        if !skip_active_check {
            enqueued += self.queue.active_count(&QueueName::Tasks).await?;
        }
        if enqueued > 0 {
            tracing::warn!(
                enqueued,
                "tasks queue is not empty, not queueing a validate job"
            );
            return Ok(());
        }

        tracing::info!(
            delay_millis = delay.as_millis() as u64,
            "queueing a validate job"
        );
        self.queue
            .enqueue_in(
                &QueueName::Tasks,
                JobKind::Validate,
                serde_json::Value::Null,
                delay,
            )
            .await?;
        tracing::info!("[alarm=enqueued-validate-relays] queued validation of relays");
        Ok(())
    }

    /// Promotion tick for delayed jobs. Leader-only: two replicas promoting
    /// concurrently could put the same parked job on a stream twice.
    pub async fn run_scheduler(&self) {
        loop {
            if self.leadership.is_leader().await {
                if let Err(error) = self.queue.promote_due().await {
                    tracing::error!(%error, "error promoting delayed jobs");
                }
            }
            tokio::time::sleep(SCHEDULER_TICK).await;
        }
    }
}
