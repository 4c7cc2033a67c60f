// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Pipeline runs against a real Redis-backed job queue. The directory and
//! network APIs are served by a local mock server; the registry, store,
//! uploader and attestor seams are mocked in-process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use httpmock::prelude::*;
use serde_json::json;
use testcontainers::{
    clients::Cli, core::WaitFor, images::generic::GenericImage, Container,
};

use relay_data::{RelayRecord, TaskServiceState, VerificationData};
use relay_events::{
    Fingerprint, JobKind, JobQueue, QueueConfig, QueueError, QueueName,
    RedactedUrl, Url,
};
use relay_verifier::ans104::Tag;
use relay_verifier::attestation::Attestor;
use relay_verifier::cluster::Leadership;
use relay_verifier::directory::{DirectoryClient, GeoLookup};
use relay_verifier::registry::{
    CertificateEntry, MessageReceipt, OperatorRegistryState, RegistryError,
    RegistryMessenger,
};
use relay_verifier::tasks::{
    verification_flow, TaskManager, ValidationSummary, Worker,
};
use relay_verifier::uploader::{UploadError, UploadReceipt, Uploader};
use relay_verifier::verification::{RelayStore, VerificationEngine};

const NAMESPACE: &str = "test-verifier";
const CONSUME_TIMEOUT: usize = 10;

const FINGERPRINT: &str = "9E7AE121AB0CF01C73C16258D02FC91BE7DE3591";
const UNCLAIMED_FINGERPRINT: &str = "89A5EF566C85E88391886220F7439DEDD967EF62";
const BANNED_FINGERPRINT: &str = "AAAAABBBBBCCCCCDDDDDEEEEEFFFFF0000011111";
const ADDRESS: &str = "0xAaE162E8cBCA6434Fd2CFDbD0B8970F3AF59b1AF";

struct TestState<'d> {
    _node: Container<'d, GenericImage>,
    endpoint: RedactedUrl,
}

impl TestState<'_> {
    async fn setup(docker: &Cli) -> TestState<'_> {
        let image = GenericImage::new("redis", "6.2").with_wait_for(
            WaitFor::message_on_stdout("Ready to accept connections"),
        );
        let node = docker.run(image);
        let port = node.get_host_port_ipv4(6379);
        let endpoint = Url::parse(&format!("redis://127.0.0.1:{}", port))
            .map(RedactedUrl::new)
            .expect("failed to parse Redis Url");
        TestState {
            _node: node,
            endpoint,
        }
    }

    async fn create_queue(&self) -> JobQueue {
        let config = QueueConfig {
            redis_endpoint: self.endpoint.clone(),
            consume_timeout: CONSUME_TIMEOUT,
            backoff: ExponentialBackoff::default(),
            namespace: NAMESPACE.to_owned(),
        };
        JobQueue::new(config)
            .await
            .expect("failed to initialize queue")
    }
}

#[derive(Debug)]
struct AlwaysLeader;

#[async_trait]
impl Leadership for AlwaysLeader {
    async fn is_leader(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct NeverLeader;

#[async_trait]
impl Leadership for NeverLeader {
    async fn is_leader(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct MockRegistry {
    hardware_calls: Arc<Mutex<Vec<Vec<Fingerprint>>>>,
    certificate_calls: Arc<Mutex<Vec<Vec<CertificateEntry>>>>,
}

#[async_trait]
impl RegistryMessenger for MockRegistry {
    async fn view_state(
        &self,
    ) -> Result<OperatorRegistryState, RegistryError> {
        Ok(OperatorRegistryState::default())
    }

    async fn add_verified_hardware(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<MessageReceipt, RegistryError> {
        self.hardware_calls.lock().unwrap().push(fingerprints.to_vec());
        Ok(MessageReceipt {
            message_id: "hardware-message".to_owned(),
            success: true,
        })
    }

    async fn submit_operator_certificates(
        &self,
        entries: &[CertificateEntry],
    ) -> Result<MessageReceipt, RegistryError> {
        self.certificate_calls.lock().unwrap().push(entries.to_vec());
        Ok(MessageReceipt {
            message_id: "certificates-message".to_owned(),
            success: true,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct MockStore {
    records: Arc<Mutex<Vec<RelayRecord>>>,
    data: Arc<Mutex<Vec<VerificationData>>>,
    validating: Arc<Mutex<bool>>,
}

#[async_trait]
impl RelayStore for MockStore {
    async fn upsert_relay_records(
        &self,
        records: &[RelayRecord],
    ) -> Result<(), relay_data::Error> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn relay_records_by_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<RelayRecord>, relay_data::Error> {
        let wanted: HashSet<Fingerprint> =
            fingerprints.iter().copied().collect();
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| wanted.contains(&record.fingerprint))
            .cloned()
            .collect())
    }

    async fn insert_verification_data(
        &self,
        data: &VerificationData,
    ) -> Result<(), relay_data::Error> {
        self.data.lock().unwrap().push(data.clone());
        Ok(())
    }

    async fn delete_all_relay_records(&self) -> Result<u64, relay_data::Error> {
        let mut records = self.records.lock().unwrap();
        let deleted = records.len() as u64;
        records.clear();
        Ok(deleted)
    }

    async fn load_task_state(
        &self,
    ) -> Result<TaskServiceState, relay_data::Error> {
        Ok(TaskServiceState {
            is_validating: *self.validating.lock().unwrap(),
        })
    }

    async fn set_validating(
        &self,
        is_validating: bool,
    ) -> Result<(), relay_data::Error> {
        *self.validating.lock().unwrap() = is_validating;
        Ok(())
    }
}

/// Fails the next `fail_next` uploads, then hands out ids in call order.
#[derive(Debug, Default)]
struct MockUploader {
    fail_next: Arc<Mutex<usize>>,
    uploads: Arc<Mutex<Vec<Vec<Tag>>>>,
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(
        &self,
        _data: Vec<u8>,
        tags: &[Tag],
    ) -> Result<UploadReceipt, UploadError> {
        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(UploadError::RejectedUploadError { status: 503 });
            }
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(tags.to_vec());
        Ok(UploadReceipt {
            id: format!("tx-{}", uploads.len()),
        })
    }
}

#[derive(Debug)]
struct MockAttestor;

#[async_trait]
impl Attestor for MockAttestor {
    async fn is_hardware_proof_valid(&self, _relay: &RelayRecord) -> bool {
        false
    }

    async fn serial_bound_to_other_fingerprint(
        &self,
        _relay: &RelayRecord,
        _state: &OperatorRegistryState,
    ) -> bool {
        false
    }
}

fn relay_record(fingerprint: &str) -> RelayRecord {
    RelayRecord {
        fingerprint: fingerprint.parse().expect("bad fingerprint"),
        operator_address: ADDRESS.parse().expect("bad address"),
        contact: format!("@anon:{}", ADDRESS),
        nickname: "relay-one".to_owned(),
        running: true,
        consensus_weight: 200,
        consensus_weight_fraction: 0.001,
        consensus_measured: true,
        observed_bandwidth: 1_000_000,
        bandwidth_rate: 0,
        bandwidth_burst: 0,
        advertised_bandwidth: 0,
        version: "0.4.8.3".to_owned(),
        version_status: "recommended".to_owned(),
        effective_family: vec![],
        geo_hex: "?".to_owned(),
        hardware_info: None,
        hardware_validated: false,
        hardware_validated_at: None,
    }
}

async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[test_log::test(tokio::test)]
async fn test_it_bootstraps_a_clean_tasks_queue() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    // Leftovers of a previous run plus a validation flag left dangling.
    queue
        .enqueue(&QueueName::Validation, JobKind::FetchRelays, json!(null))
        .await
        .expect("failed to enqueue");
    let store = MockStore::default();
    *store.validating.lock().unwrap() = true;

    let manager = TaskManager::new(
        queue.clone(),
        Arc::new(AlwaysLeader),
        Duration::from_secs(3600),
        false,
        true,
    );
    manager.bootstrap(&store).await.expect("failed to bootstrap");

    assert_eq!(
        queue.waiting_count(&QueueName::Validation).await.unwrap(),
        0
    );
    assert!(!*store.validating.lock().unwrap());

    let mut deliveries = queue
        .consume("bootstrap-test")
        .await
        .expect("failed to consume");
    let delivery = deliveries.pop().expect("no job after bootstrap");
    assert_eq!(delivery.queue, QueueName::Tasks);
    assert_eq!(delivery.job.kind, JobKind::Validate);
}

#[test_log::test(tokio::test)]
async fn test_it_leaves_bootstrap_to_the_leader() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    let store = MockStore::default();
    *store.validating.lock().unwrap() = true;

    let manager = TaskManager::new(
        queue.clone(),
        Arc::new(NeverLeader),
        Duration::from_secs(3600),
        true,
        false,
    );
    manager.bootstrap(&store).await.expect("failed to bootstrap");

    assert_eq!(queue.waiting_count(&QueueName::Tasks).await.unwrap(), 0);
    // A non-leader must not touch the dangling flag either.
    assert!(*store.validating.lock().unwrap());
}

#[test_log::test(tokio::test)]
async fn test_it_queues_at_most_one_validate_job() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    let manager = TaskManager::new(
        queue.clone(),
        Arc::new(AlwaysLeader),
        Duration::from_secs(3600),
        true,
        false,
    );
    manager
        .queue_validate_relays(Duration::ZERO, false)
        .await
        .expect("failed to queue");
    manager
        .queue_validate_relays(Duration::ZERO, false)
        .await
        .expect("failed to queue");

    assert_eq!(queue.waiting_count(&QueueName::Tasks).await.unwrap(), 1);
}

#[test_log::test(tokio::test)]
async fn test_it_promotes_due_jobs_while_leading() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    let manager = Arc::new(TaskManager::new(
        queue.clone(),
        Arc::new(AlwaysLeader),
        Duration::from_secs(3600),
        true,
        false,
    ));
    manager
        .queue_validate_relays(Duration::from_millis(200), false)
        .await
        .expect("failed to queue");

    // Parked until the scheduler promotes it.
    let err = queue
        .consume("scheduler-test")
        .await
        .expect_err("expected timeout");
    assert!(matches!(err, QueueError::ConsumeTimeout));

    let scheduler = manager.clone();
    let handle = tokio::spawn(async move { scheduler.run_scheduler().await });

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut delivered = None;
    while Instant::now() < deadline && delivered.is_none() {
        match queue.consume("scheduler-test").await {
            Ok(mut deliveries) => delivered = deliveries.pop(),
            Err(QueueError::ConsumeTimeout) => {}
            Err(error) => panic!("consume failed: {error}"),
        }
    }
    handle.abort();

    let delivery = delivered.expect("validate job never promoted");
    assert_eq!(delivery.job.kind, JobKind::Validate);
}

#[test_log::test(tokio::test)]
async fn test_it_runs_the_validation_and_verification_flows() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/details");
            then.status(200)
                .header("last-modified", "Mon, 18 Aug 2025 12:00:00 GMT")
                .json_body(json!({
                    "relays": [
                        {
                            "nickname": "relay-one",
                            "fingerprint": FINGERPRINT,
                            "contact": format!("@anon:{}", ADDRESS),
                            "running": true,
                            "consensus_weight": 200,
                        },
                        { "fingerprint": UNCLAIMED_FINGERPRINT },
                        {
                            "fingerprint": BANNED_FINGERPRINT,
                            "contact": format!("@anon:{}", ADDRESS),
                        },
                    ],
                }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/fingerprint-map");
            then.status(200).json_body(json!({
                FINGERPRINT: { "coordinates": [51.5074, -0.1278] },
            }));
        })
        .await;

    let registry = MockRegistry::default();
    let certificate_calls = registry.certificate_calls.clone();
    let hardware_calls = registry.hardware_calls.clone();
    let store = MockStore::default();
    let uploader = MockUploader::default();
    let uploads = uploader.uploads.clone();

    let engine = VerificationEngine::new(
        registry,
        store.clone(),
        uploader,
        MockAttestor,
        true,
    );
    let geo = GeoLookup::new(&server.base_url());
    geo.refresh().await.expect("failed to load the map");
    let directory = DirectoryClient::new(&server.url("/details"), "");
    let manager = Arc::new(TaskManager::new(
        queue.clone(),
        Arc::new(AlwaysLeader),
        Duration::from_secs(3600),
        true,
        false,
    ));
    let worker = Worker::new(
        queue.clone(),
        manager,
        engine,
        store.clone(),
        directory,
        geo,
        HashSet::from([BANNED_FINGERPRINT.to_owned()]),
    );
    let handle = tokio::spawn(worker.run());

    queue
        .enqueue(&QueueName::Tasks, JobKind::Validate, json!(null))
        .await
        .expect("failed to enqueue");

    let persisted = store.data.clone();
    let records = store.records.clone();
    wait_until("the verification run to persist and purge", || {
        !persisted.lock().unwrap().is_empty()
            && records.lock().unwrap().is_empty()
    })
    .await;
    handle.abort();

    // Only the claimed, unbanned relay made it through to the registry.
    let certificates = certificate_calls.lock().unwrap();
    assert_eq!(certificates.len(), 1);
    assert_eq!(certificates[0].len(), 1);
    assert_eq!(certificates[0][0].fingerprint.to_string(), FINGERPRINT);
    assert_eq!(certificates[0][0].address.to_string(), ADDRESS);
    // No relay carried hardware, so no hardware message went out.
    assert!(hardware_calls.lock().unwrap().is_empty());

    // Metrics, stats and the hex map all uploaded in one pass.
    assert_eq!(uploads.lock().unwrap().len(), 3);
    let data = persisted.lock().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].relay_metrics_tx, "tx-1");
    assert_eq!(data[0].validation_stats_tx, "tx-2");
    assert!(data[0].relays.is_empty());

    assert!(!*store.validating.lock().unwrap());
}

#[test_log::test(tokio::test)]
async fn test_it_retries_persistence_through_the_recovery_job() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;
    let queue = state.create_queue().await;

    let registry = MockRegistry::default();
    let store = MockStore::default();
    store
        .upsert_relay_records(&[relay_record(FINGERPRINT)])
        .await
        .expect("failed to seed records");
    // Both artifact uploads fail on the first persistence attempt.
    let uploader = MockUploader::default();
    *uploader.fail_next.lock().unwrap() = 2;
    let uploads = uploader.uploads.clone();

    let engine = VerificationEngine::new(
        registry,
        store.clone(),
        uploader,
        MockAttestor,
        true,
    );
    let geo = GeoLookup::new("http://unused.local");
    let directory = DirectoryClient::new("http://unused.local/details", "");
    let manager = Arc::new(TaskManager::new(
        queue.clone(),
        Arc::new(AlwaysLeader),
        Duration::from_secs(3600),
        true,
        false,
    ));
    let worker = Worker::new(
        queue.clone(),
        manager,
        engine,
        store.clone(),
        directory,
        geo,
        HashSet::new(),
    );
    let handle = tokio::spawn(worker.run());

    let flow = verification_flow(&ValidationSummary {
        validated_at: 1_700_000_000_000,
        relays: vec![FINGERPRINT.parse::<Fingerprint>().unwrap()],
    });
    queue.enqueue_flow(&flow).await.expect("failed to enqueue flow");

    let persisted = store.data.clone();
    let records = store.records.clone();
    wait_until("the recovery attempt to persist and purge", || {
        persisted.lock().unwrap().len() == 2
            && records.lock().unwrap().is_empty()
    })
    .await;
    handle.abort();

    let data = persisted.lock().unwrap();
    // First attempt lost both artifacts and went to recovery empty-handed.
    assert!(data[0].relay_metrics_tx.is_empty());
    assert!(data[0].validation_stats_tx.is_empty());
    // The retry uploaded both artifacts and then the hex map.
    assert_eq!(data[1].relay_metrics_tx, "tx-1");
    assert_eq!(data[1].validation_stats_tx, "tx-2");
    assert_eq!(uploads.lock().unwrap().len(), 3);
}
