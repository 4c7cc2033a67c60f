// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Durable job queue on top of Redis streams.
//!
//! Each named queue is one stream with a single consumer group shared by all
//! worker replicas. Jobs are JSON payloads in a single `payload` field.
//! Delayed jobs park in a sorted set scored by their due time until the
//! scheduler promotes them onto the stream. There is no stalled-job reclaim;
//! a job delivered to a worker that dies stays in the pending entries list
//! until the next queue obliteration.

pub mod flow;
pub mod lease;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backoff::future::retry;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use clap::Parser;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamInfoGroupsReply, StreamMaxlen, StreamPendingReply,
    StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

use crate::redacted::{RedactedUrl, Url};
pub use flow::FlowJob;
pub use lease::LeaderLease;

/// Consumer group shared by every worker replica.
const WORKERS_GROUP: &str = "workers";

/// Group start position; existing entries are delivered to the first reader.
const GROUP_START_ID: &str = "0";

/// Approximate cap on entries kept per stream.
const STREAM_TRIM_LEN: usize = 10_000;

/// Upper bound when counting undelivered entries for the re-entrancy guard.
const WAITING_SCAN_LIMIT: usize = 10_000;

/// Due jobs moved from the parked set per promotion pass.
const PROMOTE_BATCH: isize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "tasks-queue")]
    Tasks,
    #[serde(rename = "validation-queue")]
    Validation,
    #[serde(rename = "verification-queue")]
    Verification,
}

impl QueueName {
    pub const ALL: [QueueName; 3] =
        [QueueName::Tasks, QueueName::Validation, QueueName::Verification];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Tasks => "tasks-queue",
            QueueName::Validation => "validation-queue",
            QueueName::Verification => "verification-queue",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<QueueName> {
        QueueName::ALL.into_iter().find(|queue| queue.as_str() == name)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "validate")]
    Validate,
    #[serde(rename = "verify")]
    Verify,
    #[serde(rename = "fetch-relays")]
    FetchRelays,
    #[serde(rename = "filter-relays")]
    FilterRelays,
    #[serde(rename = "validate-relays")]
    ValidateRelays,
    #[serde(rename = "verify-relays")]
    VerifyRelays,
    #[serde(rename = "confirm-verification")]
    ConfirmVerification,
    #[serde(rename = "persist-verification")]
    PersistVerification,
    #[serde(rename = "recover-persist-verification")]
    RecoverPersistVerification,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Validate => "validate",
            JobKind::Verify => "verify",
            JobKind::FetchRelays => "fetch-relays",
            JobKind::FilterRelays => "filter-relays",
            JobKind::ValidateRelays => "validate-relays",
            JobKind::VerifyRelays => "verify-relays",
            JobKind::ConfirmVerification => "confirm-verification",
            JobKind::PersistVerification => "persist-verification",
            JobKind::RecoverPersistVerification => "recover-persist-verification",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<JobKind> {
        const ALL: [JobKind; 9] = [
            JobKind::Validate,
            JobKind::Verify,
            JobKind::FetchRelays,
            JobKind::FilterRelays,
            JobKind::ValidateRelays,
            JobKind::VerifyRelays,
            JobKind::ConfirmVerification,
            JobKind::PersistVerification,
            JobKind::RecoverPersistVerification,
        ];
        ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit of work moving through a queue.
///
/// `data` is set when the job is enqueued; `input` is filled on flow parents
/// with the merged outputs of their children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub input: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
            input: vec![],
            parent: None,
        }
    }
}

/// A job handed to a worker, with the stream entry to acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: QueueName,
    pub stream_id: String,
    pub job: Job,
}

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("error connecting to Redis"))]
    ConnectionError { source: RedisError },

    #[snafu(display("job entry is missing the payload field"))]
    InvalidJob,

    #[snafu(display("error parsing job payload"))]
    InvalidPayload { source: serde_json::Error },

    #[snafu(display("timed out while waiting for a job"))]
    ConsumeTimeout,

    #[snafu(display("flow entry {} is missing field {}", key, field))]
    CorruptedFlow { key: String, field: String },
}

#[derive(Clone)]
pub struct JobQueue {
    connection: ConnectionManager,
    backoff: ExponentialBackoff,
    consume_timeout: usize,
    namespace: String,
}

impl JobQueue {
    /// Connects to Redis and creates the consumer groups for every queue.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn new(config: QueueConfig) -> Result<Self, QueueError> {
        tracing::trace!(?config, "connecting to the job queue");

        let connection = retry(config.backoff.clone(), || async {
            tracing::trace!("creating Redis connection manager");
            let client = Client::open(config.redis_endpoint.inner().as_str())?;
            let connection = ConnectionManager::new(client).await?;
            Ok(connection)
        })
        .await
        .context(ConnectionSnafu)?;

        let queue = Self {
            connection,
            backoff: config.backoff,
            consume_timeout: config.consume_timeout,
            namespace: config.namespace,
        };
        queue.register().await?;
        Ok(queue)
    }

    /// Creates the consumer group of every queue, tolerating groups created
    /// by another replica.
    async fn register(&self) -> Result<(), QueueError> {
        for queue in QueueName::ALL {
            let key = self.stream_key(&queue);
            retry(self.backoff.clone(), || async {
                tracing::trace!(key, "creating consumer group");
                let created: Result<String, RedisError> = self
                    .connection
                    .clone()
                    .xgroup_create_mkstream(&key, WORKERS_GROUP, GROUP_START_ID)
                    .await;
                match created {
                    Ok(_) => Ok(()),
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .context(ConnectionSnafu)?;
        }
        Ok(())
    }

    /// Enqueues a job for immediate delivery; returns the job id.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn enqueue(
        &self,
        queue: &QueueName,
        kind: JobKind,
        data: serde_json::Value,
    ) -> Result<String, QueueError> {
        let job = Job::new(kind, data);
        self.push_job(queue, &job).await?;
        Ok(job.id)
    }

    /// Parks a job in the delayed set until `promote_due` moves it onto the
    /// stream. A zero delay enqueues directly.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn enqueue_in(
        &self,
        queue: &QueueName,
        kind: JobKind,
        data: serde_json::Value,
        delay: Duration,
    ) -> Result<String, QueueError> {
        if delay.is_zero() {
            return self.enqueue(queue, kind, data).await;
        }
        let job = Job::new(kind, data);
        let payload = serde_json::to_string(&job).context(InvalidPayloadSnafu)?;
        let due_at = unix_millis() + delay.as_millis() as u64;
        let key = self.delayed_key(queue);
        retry(self.backoff.clone(), || async {
            tracing::trace!(key, due_at, "parking delayed job");
            let _: usize =
                self.connection.clone().zadd(&key, &payload, due_at).await?;
            Ok(())
        })
        .await
        .context(ConnectionSnafu)?;
        Ok(job.id)
    }

    /// Moves due delayed jobs onto their streams; returns how many moved.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = unix_millis();
        let mut promoted = 0;
        for queue in QueueName::ALL {
            let delayed = self.delayed_key(&queue);
            let stream = self.stream_key(&queue);
            let due: Vec<String> = retry(self.backoff.clone(), || async {
                let due: Vec<String> = self
                    .connection
                    .clone()
                    .zrangebyscore_limit(&delayed, "-inf", now, 0, PROMOTE_BATCH)
                    .await?;
                Ok(due)
            })
            .await
            .context(ConnectionSnafu)?;

            for payload in due {
                retry(self.backoff.clone(), || async {
                    tracing::trace!(stream, payload, "promoting delayed job");
                    let mut connection = self.connection.clone();
                    let _: String = connection
                        .xadd_maxlen(
                            &stream,
                            StreamMaxlen::Approx(STREAM_TRIM_LEN),
                            "*",
                            &[("payload", &payload)],
                        )
                        .await?;
                    let _: usize = connection.zrem(&delayed, &payload).await?;
                    Ok(())
                })
                .await
                .context(ConnectionSnafu)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Blocking read across every queue; delivers at most one job per queue.
    ///
    /// Returns `ConsumeTimeout` when no queue produced a job within the
    /// configured timeout; callers are expected to just poll again.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn consume(
        &self,
        consumer: &str,
    ) -> Result<Vec<Delivery>, QueueError> {
        let stream_keys =
            QueueName::ALL.map(|queue| self.stream_key(&queue));
        let reply = retry(self.backoff.clone(), || async {
            tracing::trace!(?stream_keys, consumer, "consuming jobs");
            let opts = StreamReadOptions::default()
                .group(WORKERS_GROUP, consumer)
                .count(1)
                .block(self.consume_timeout);
            let reply: StreamReadReply = self
                .connection
                .clone()
                .xread_options(&stream_keys, &[">", ">", ">"], &opts)
                .await?;
            Ok(reply)
        })
        .await
        .context(ConnectionSnafu)?;

        let mut deliveries = vec![];
        for stream in reply.keys {
            let queue = QueueName::ALL
                .iter()
                .find(|queue| self.stream_key(queue) == stream.key)
                .copied();
            if let Some(queue) = queue {
                for entry in stream.ids {
                    deliveries.push(parse_entry(queue, entry)?);
                }
            }
        }
        if deliveries.is_empty() {
            tracing::trace!("job consume timed out");
            return Err(QueueError::ConsumeTimeout);
        }
        Ok(deliveries)
    }

    /// Acknowledges a delivered job, removing it from the pending list.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn ack(
        &self,
        queue: &QueueName,
        stream_id: &str,
    ) -> Result<(), QueueError> {
        let key = self.stream_key(queue);
        retry(self.backoff.clone(), || async {
            tracing::trace!(key, stream_id, "acknowledging job");
            let _: usize = self
                .connection
                .clone()
                .xack(&key, WORKERS_GROUP, &[stream_id])
                .await?;
            Ok(())
        })
        .await
        .context(ConnectionSnafu)
    }

    /// Jobs not yet delivered to any worker, including parked delayed jobs.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn waiting_count(
        &self,
        queue: &QueueName,
    ) -> Result<usize, QueueError> {
        let stream = self.stream_key(queue);
        let delayed = self.delayed_key(queue);
        let count = retry(self.backoff.clone(), || async {
            let mut connection = self.connection.clone();
            let groups: StreamInfoGroupsReply =
                connection.xinfo_groups(&stream).await?;
            let last_delivered = groups
                .groups
                .iter()
                .find(|group| group.name == WORKERS_GROUP)
                .map(|group| group.last_delivered_id.clone())
                .unwrap_or_else(|| GROUP_START_ID.to_owned());
            let undelivered: StreamRangeReply = connection
                .xrange_count(
                    &stream,
                    format!("({}", last_delivered),
                    "+",
                    WAITING_SCAN_LIMIT,
                )
                .await?;
            let parked: usize = connection.zcard(&delayed).await?;
            Ok(undelivered.ids.len() + parked)
        })
        .await
        .context(ConnectionSnafu)?;
        Ok(count)
    }

    /// Jobs delivered to a worker and not yet acknowledged.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn active_count(
        &self,
        queue: &QueueName,
    ) -> Result<usize, QueueError> {
        let key = self.stream_key(queue);
        let count = retry(self.backoff.clone(), || async {
            let pending: StreamPendingReply = self
                .connection
                .clone()
                .xpending(&key, WORKERS_GROUP)
                .await?;
            let count = match pending {
                StreamPendingReply::Empty => 0,
                StreamPendingReply::Data(data) => data.count,
            };
            Ok(count)
        })
        .await
        .context(ConnectionSnafu)?;
        Ok(count)
    }

    /// Drops every stored job of the queue and recreates its consumer group.
    /// Startup-only maintenance.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn obliterate(&self, queue: &QueueName) -> Result<(), QueueError> {
        let stream = self.stream_key(queue);
        let delayed = self.delayed_key(queue);
        retry(self.backoff.clone(), || async {
            tracing::trace!(stream, "obliterating queue");
            let mut connection = self.connection.clone();
            let _: usize = connection.del(&[&stream, &delayed]).await?;
            let created: Result<String, RedisError> = connection
                .xgroup_create_mkstream(&stream, WORKERS_GROUP, GROUP_START_ID)
                .await;
            match created {
                Ok(_) => Ok(()),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
        .context(ConnectionSnafu)
    }

    pub(crate) async fn push_job(
        &self,
        queue: &QueueName,
        job: &Job,
    ) -> Result<String, QueueError> {
        tracing::trace!("converting job to JSON string");
        let payload = serde_json::to_string(job).context(InvalidPayloadSnafu)?;
        let key = self.stream_key(queue);
        let entry_id = retry(self.backoff.clone(), || async {
            tracing::trace!(key, payload, "adding job to stream");
            let entry_id: String = self
                .connection
                .clone()
                .xadd_maxlen(
                    &key,
                    StreamMaxlen::Approx(STREAM_TRIM_LEN),
                    "*",
                    &[("payload", &payload)],
                )
                .await?;
            Ok(entry_id)
        })
        .await
        .context(ConnectionSnafu)?;
        Ok(entry_id)
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        self.backoff.clone()
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    fn stream_key(&self, queue: &QueueName) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn delayed_key(&self, queue: &QueueName) -> String {
        format!("{}:queue:{}:delayed", self.namespace, queue)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("namespace", &self.namespace)
            .field("consume_timeout", &self.consume_timeout)
            .finish()
    }
}

fn parse_entry(queue: QueueName, entry: StreamId) -> Result<Delivery, QueueError> {
    let payload = entry
        .get::<String>("payload")
        .ok_or(QueueError::InvalidJob)?;
    let job = serde_json::from_str(&payload).context(InvalidPayloadSnafu)?;
    Ok(Delivery {
        queue,
        stream_id: entry.id,
        job,
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Parser)]
#[command(name = "queue")]
pub struct QueueCLIConfig {
    /// Redis address
    #[arg(long, env, default_value = "redis://127.0.0.1:6379")]
    pub redis_endpoint: String,

    /// Timeout when consuming jobs (in millis)
    #[arg(long, env, default_value = "5000")]
    pub queue_consume_timeout: usize,

    /// The max elapsed time for retrying queue operations (in millis)
    #[arg(long, env, default_value = "120000")]
    pub queue_backoff_max_elapsed_duration: u64,

    /// Key prefix shared by every queue structure
    #[arg(long, env, default_value = "relay-verifier")]
    pub queue_namespace: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_endpoint: RedactedUrl,
    pub consume_timeout: usize,
    pub backoff: ExponentialBackoff,
    pub namespace: String,
}

impl From<QueueCLIConfig> for QueueConfig {
    fn from(cli_config: QueueCLIConfig) -> QueueConfig {
        let redis_endpoint = RedactedUrl::new(
            Url::parse(&cli_config.redis_endpoint)
                .expect("failed to parse Redis URL"),
        );
        let backoff_max_elapsed_duration =
            Duration::from_millis(cli_config.queue_backoff_max_elapsed_duration);
        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(backoff_max_elapsed_duration))
            .build();
        QueueConfig {
            redis_endpoint,
            consume_timeout: cli_config.queue_consume_timeout,
            backoff,
            namespace: cli_config.queue_namespace,
        }
    }
}
