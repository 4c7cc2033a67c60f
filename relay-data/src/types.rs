// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Typed documents stored by the verifier.
//!
//! `RelayRecord` is transient: one validation run writes the records and the
//! matching verification run deletes them after persisting its outcome. The
//! hardware collections are append-only audit logs.

use relay_events::{EvmAddress, Fingerprint};
use serde::{Deserialize, Serialize};

/// One relay as seen by a validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub fingerprint: Fingerprint,
    pub operator_address: EvmAddress,
    pub contact: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub consensus_weight: i64,
    #[serde(default)]
    pub consensus_weight_fraction: f64,
    #[serde(default)]
    pub consensus_measured: bool,
    #[serde(default)]
    pub observed_bandwidth: i64,
    #[serde(default)]
    pub bandwidth_rate: i64,
    #[serde(default)]
    pub bandwidth_burst: i64,
    #[serde(default)]
    pub advertised_bandwidth: i64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_status: String,
    #[serde(default)]
    pub effective_family: Vec<String>,
    /// H3 resolution-4 cell of the relay location, or `"?"` when unknown.
    #[serde(default)]
    pub geo_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_info: Option<HardwareInfo>,
    #[serde(default)]
    pub hardware_validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_validated_at: Option<i64>,
}

/// Hardware attestation payload published by a relay.
///
/// The nested field names are fixed by the relays' wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nftid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(rename = "serNums", default, skip_serializing_if = "Vec::is_empty")]
    pub ser_nums: Vec<HardwareEntry>,
    #[serde(rename = "pubKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub pub_keys: Vec<HardwareEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certs: Vec<HardwareCert>,
}

const DEVICE_ENTRY: &str = "DEVICE";
const ATEC_ENTRY: &str = "ATEC";

impl HardwareInfo {
    pub fn device_serial(&self) -> Option<&str> {
        find_entry(&self.ser_nums, DEVICE_ENTRY)
    }

    pub fn atec_serial(&self) -> Option<&str> {
        find_entry(&self.ser_nums, ATEC_ENTRY)
    }

    pub fn device_public_key(&self) -> Option<&str> {
        find_entry(&self.pub_keys, DEVICE_ENTRY)
    }

    pub fn device_signature(&self) -> Option<&str> {
        self.device_cert_entry().and_then(|cert| cert.signature.as_deref())
    }

    pub fn device_cert(&self) -> Option<&str> {
        self.device_cert_entry().and_then(|cert| cert.cert.as_deref())
    }

    fn device_cert_entry(&self) -> Option<&HardwareCert> {
        self.certs
            .iter()
            .find(|cert| cert.kind.as_deref() == Some(DEVICE_ENTRY))
    }
}

fn find_entry<'a>(entries: &'a [HardwareEntry], kind: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|entry| entry.kind.as_deref() == Some(kind))
        .and_then(|entry| entry.number.as_deref())
}

/// A typed serial number or public key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareEntry {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareCert {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
}

/// Successful hardware attestation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedHardware {
    pub verified_at: i64,
    pub device_serial: String,
    pub atec_serial: String,
    pub fingerprint: Fingerprint,
    pub operator_address: EvmAddress,
    pub public_key: String,
    pub signature: String,
    pub nft_id: i64,
}

/// Failed hardware attestation with the offending payload. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareVerificationFailure {
    pub fingerprint: Fingerprint,
    pub operator_address: EvmAddress,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_info: Option<HardwareInfo>,
}

/// Outcome of one verification run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationData {
    pub verified_at: i64,
    #[serde(default)]
    pub relay_metrics_tx: String,
    #[serde(default)]
    pub validation_stats_tx: String,
    #[serde(default)]
    pub relays: Vec<ScoredRelay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRelay {
    pub fingerprint: Fingerprint,
    pub address: EvmAddress,
    pub score: i64,
}

/// Singleton flag guarding the validation stage across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskServiceState {
    #[serde(default)]
    pub is_validating: bool,
}

/// Factory-registered attestation chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub unique_id: String,
    pub pub_key_hex: String,
    pub created_at: i64,
}
