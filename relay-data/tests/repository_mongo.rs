// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use backoff::ExponentialBackoff;
use testcontainers::{
    clients::Cli, core::WaitFor, images::generic::GenericImage, Container,
};

use relay_data::{
    HardwareVerificationFailure, KnownDevice, RelayRecord, Repository,
    RepositoryConfig, ScoredRelay, VerificationData, VerifiedHardware,
};
use relay_events::{EvmAddress, Fingerprint, Redacted};

struct TestState<'d> {
    _node: Container<'d, GenericImage>,
    repository: Repository,
}

impl TestState<'_> {
    async fn setup(docker: &Cli) -> TestState {
        let image = GenericImage::new("mongo", "6.0").with_wait_for(
            WaitFor::message_on_stdout("Waiting for connections"),
        );
        let node = docker.run(image);
        let port = node.get_host_port_ipv4(27017);
        let config = RepositoryConfig {
            uri: Redacted::new(format!("mongodb://127.0.0.1:{}", port)),
            database: "test-verifier".to_owned(),
            backoff: ExponentialBackoff::default(),
        };
        let repository = Repository::new(config)
            .await
            .expect("failed to connect to mongo");
        TestState {
            _node: node,
            repository,
        }
    }
}

fn sample_record(tag: u8) -> RelayRecord {
    RelayRecord {
        fingerprint: Fingerprint::new([tag; 20]),
        operator_address: EvmAddress::new([tag; 20]),
        contact: format!("@anon:0x{}", hex::encode([tag; 20])),
        nickname: format!("relay-{}", tag),
        running: true,
        consensus_weight: i64::from(tag) * 10,
        consensus_weight_fraction: 0.01,
        consensus_measured: true,
        observed_bandwidth: 1000,
        bandwidth_rate: 0,
        bandwidth_burst: 0,
        advertised_bandwidth: 0,
        version: "1.0.0".to_owned(),
        version_status: "recommended".to_owned(),
        effective_family: vec![],
        geo_hex: "?".to_owned(),
        hardware_info: None,
        hardware_validated: false,
        hardware_validated_at: None,
    }
}

fn sample_verified_hardware(atec_serial: &str) -> VerifiedHardware {
    VerifiedHardware {
        verified_at: 1_700_000_000_000,
        device_serial: "6995B81FF0FE55AD".to_owned(),
        atec_serial: atec_serial.to_owned(),
        fingerprint: Fingerprint::new([0x0a; 20]),
        operator_address: EvmAddress::new([0x0b; 20]),
        public_key: "ce657c7d".to_owned(),
        signature: "8d2b2239".to_owned(),
        nft_id: 0,
    }
}

#[test_log::test(tokio::test)]
async fn test_it_upserts_and_pages_relay_records() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    let first = sample_record(1);
    let second = sample_record(2);
    state
        .repository
        .upsert_relay_records(&[first.clone(), second.clone()])
        .await
        .expect("failed to upsert");

    let page = state
        .repository
        .relay_records_by_fingerprints(&[first.fingerprint])
        .await
        .expect("failed to fetch");
    assert_eq!(page, vec![first.clone()]);

    // upserting again with the same fingerprint replaces the record
    let mut renamed = first.clone();
    renamed.nickname = "renamed".to_owned();
    state
        .repository
        .upsert_relay_records(&[renamed.clone()])
        .await
        .expect("failed to upsert");
    let page = state
        .repository
        .relay_records_by_fingerprints(&[first.fingerprint])
        .await
        .expect("failed to fetch");
    assert_eq!(page, vec![renamed]);

    let deleted = state
        .repository
        .delete_all_relay_records()
        .await
        .expect("failed to delete");
    assert_eq!(deleted, 2);
    let page = state
        .repository
        .relay_records_by_fingerprints(&[first.fingerprint, second.fingerprint])
        .await
        .expect("failed to fetch");
    assert!(page.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_it_finds_verified_hardware_by_serials() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    let record = sample_verified_hardware("0123c58919bd5b13d9");
    state
        .repository
        .insert_verified_hardware(&record)
        .await
        .expect("failed to insert");

    assert!(state
        .repository
        .verified_hardware_exists_by_device_serial("6995B81FF0FE55AD")
        .await
        .unwrap());
    assert!(!state
        .repository
        .verified_hardware_exists_by_device_serial("c2eeef8a42a50073")
        .await
        .unwrap());

    let found = state
        .repository
        .verified_hardware_by_atec_serial("0123c58919bd5b13d9")
        .await
        .unwrap();
    assert_eq!(found, vec![record]);
    assert!(state
        .repository
        .verified_hardware_by_atec_serial("0123000000000000ff")
        .await
        .unwrap()
        .is_empty());
}

#[test_log::test(tokio::test)]
async fn test_it_keeps_verification_failures() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    let failure = HardwareVerificationFailure {
        fingerprint: Fingerprint::new([0x0c; 20]),
        operator_address: EvmAddress::DUMMY,
        timestamp: 1_700_000_000_000,
        hardware_info: None,
    };
    state
        .repository
        .insert_hardware_verification_failure(&failure)
        .await
        .expect("failed to insert failure");
}

#[test_log::test(tokio::test)]
async fn test_it_returns_latest_verification_data() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    assert!(state
        .repository
        .latest_verification_data()
        .await
        .unwrap()
        .is_none());

    for (verified_at, tx) in [(100, "tx-old"), (300, "tx-new"), (200, "tx-mid")] {
        let data = VerificationData {
            verified_at,
            relay_metrics_tx: tx.to_owned(),
            validation_stats_tx: tx.to_owned(),
            relays: vec![ScoredRelay {
                fingerprint: Fingerprint::new([0x0d; 20]),
                address: EvmAddress::new([0x0e; 20]),
                score: 1,
            }],
        };
        state
            .repository
            .insert_verification_data(&data)
            .await
            .expect("failed to insert");
    }

    let latest = state
        .repository
        .latest_verification_data()
        .await
        .unwrap()
        .expect("expected stored data");
    assert_eq!(latest.verified_at, 300);
    assert_eq!(latest.relay_metrics_tx, "tx-new");
}

#[test_log::test(tokio::test)]
async fn test_it_tracks_task_state() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    let initial = state.repository.load_task_state().await.unwrap();
    assert!(!initial.is_validating);

    state.repository.set_validating(true).await.unwrap();
    let updated = state.repository.load_task_state().await.unwrap();
    assert!(updated.is_validating);

    state.repository.set_validating(false).await.unwrap();
    let reset = state.repository.load_task_state().await.unwrap();
    assert!(!reset.is_validating);
}

#[test_log::test(tokio::test)]
async fn test_it_checks_known_devices() {
    let docker = Cli::default();
    let state = TestState::setup(&docker).await;

    let device = KnownDevice {
        unique_id: "0123c58919bd5b13d9".to_owned(),
        pub_key_hex: "ce657c7d".to_owned(),
        created_at: 1_700_000_000_000,
    };
    state
        .repository
        .insert_known_device(&device)
        .await
        .expect("failed to insert device");

    assert!(state
        .repository
        .known_device_exists("0123c58919bd5b13d9")
        .await
        .unwrap());
    assert!(!state
        .repository
        .known_device_exists("0123000000000000ff")
        .await
        .unwrap());
}
