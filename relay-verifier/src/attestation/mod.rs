// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Hardware attestation for relays claiming physical devices.
//!
//! Two proof routes exist. A relay carrying a non-zero NFT id proves that its
//! operator owns the matching relay NFT on-chain. A relay without one proves
//! possession of a factory-registered attestation chip by signing the serial
//! message with the device key. Every failed attempt is appended to an audit
//! collection; attestation itself never fails with an error, it only decides.

pub mod certs;
pub mod chain;
pub mod vault;

use std::sync::Arc;

use async_trait::async_trait;
use relay_data::{
    HardwareInfo, HardwareVerificationFailure, RelayRecord, Repository,
    VerifiedHardware,
};

use crate::crypto;
use crate::registry::state::OperatorRegistryState;

pub use certs::{DeviceCertCheck, DeviceCertValidator};
pub use chain::{ChainNftOwnership, NftOwnership};
pub use vault::{IssuerLookup, VaultClient, VaultIssuer};

/// Node id signed into every relay serial proof.
const SERIAL_PROOF_NODE_ID: &str = "relay";

/// Persistence needed by the attestation engine.
///
/// The verified hardware and failure collections are append-only; the known
/// device set is imported out of band from the factory.
#[async_trait]
pub trait AttestationStore: std::fmt::Debug + Send + Sync {
    async fn exists_by_device_serial(
        &self,
        device_serial: &str,
    ) -> Result<bool, relay_data::Error>;

    async fn verified_hardware_by_atec_serial(
        &self,
        atec_serial: &str,
    ) -> Result<Vec<VerifiedHardware>, relay_data::Error>;

    async fn known_device_exists(
        &self,
        atec_serial: &str,
    ) -> Result<bool, relay_data::Error>;

    async fn insert_verified_hardware(
        &self,
        record: VerifiedHardware,
    ) -> Result<(), relay_data::Error>;

    async fn insert_failure(
        &self,
        failure: HardwareVerificationFailure,
    ) -> Result<(), relay_data::Error>;
}

#[async_trait]
impl AttestationStore for Repository {
    async fn exists_by_device_serial(
        &self,
        device_serial: &str,
    ) -> Result<bool, relay_data::Error> {
        self.verified_hardware_exists_by_device_serial(device_serial)
            .await
    }

    async fn verified_hardware_by_atec_serial(
        &self,
        atec_serial: &str,
    ) -> Result<Vec<VerifiedHardware>, relay_data::Error> {
        Repository::verified_hardware_by_atec_serial(self, atec_serial).await
    }

    async fn known_device_exists(
        &self,
        atec_serial: &str,
    ) -> Result<bool, relay_data::Error> {
        Repository::known_device_exists(self, atec_serial).await
    }

    async fn insert_verified_hardware(
        &self,
        record: VerifiedHardware,
    ) -> Result<(), relay_data::Error> {
        Repository::insert_verified_hardware(self, &record).await
    }

    async fn insert_failure(
        &self,
        failure: HardwareVerificationFailure,
    ) -> Result<(), relay_data::Error> {
        self.insert_hardware_verification_failure(&failure).await
    }
}

/// Attestation decisions consumed by the verification engine.
///
/// Both operations are total. Store and provider faults surface as a negative
/// decision, never as an error the caller has to handle.
#[async_trait]
pub trait Attestor: std::fmt::Debug + Send + Sync {
    /// Decides whether the relay's hardware claim holds, persisting a
    /// `VerifiedHardware` record on success and a failure record otherwise.
    async fn is_hardware_proof_valid(&self, relay: &RelayRecord) -> bool;

    /// Whether the relay's attestation chip serial is already bound to a
    /// different fingerprint that the registry still considers live.
    async fn serial_bound_to_other_fingerprint(
        &self,
        relay: &RelayRecord,
        state: &OperatorRegistryState,
    ) -> bool;
}

/// A serial proof as carried in a relay's hardware payload.
#[derive(Debug, Clone, Copy)]
pub struct SerialProof<'a> {
    pub node_id: &'a str,
    pub nft_id: u16,
    pub device_serial: &'a str,
    pub atec_serial: &'a str,
    pub fingerprint: &'a str,
    pub address: &'a str,
    pub public_key: &'a str,
    pub signature: &'a str,
}

/// Verifies a device serial proof.
///
/// The proof binds both serials to the relay fingerprint and the operator
/// address; the device signs the message with the attestation chip key.
/// Fields with the wrong width are rejected before any crypto runs.
pub fn verify_serial_proof(proof: &SerialProof<'_>) -> bool {
    if !is_hex_of_len(proof.fingerprint, 40) {
        tracing::info!(
            fingerprint = proof.fingerprint,
            "malformed fingerprint in serial proof"
        );
        return false;
    }
    if !is_hex_of_len(proof.device_serial, 16) {
        tracing::info!(
            device_serial = proof.device_serial,
            "malformed device serial in serial proof"
        );
        return false;
    }
    if !is_hex_of_len(proof.atec_serial, 18) {
        tracing::info!(
            atec_serial = proof.atec_serial,
            "malformed atec serial in serial proof"
        );
        return false;
    }
    if !is_hex_of_len(proof.signature, 128) {
        tracing::info!("malformed signature in serial proof");
        return false;
    }

    let digest = match crypto::serial_proof_digest(
        proof.node_id,
        proof.nft_id,
        proof.device_serial,
        proof.atec_serial,
        proof.fingerprint,
        proof.address,
    ) {
        Some(digest) => digest,
        None => {
            tracing::info!("serial proof message is not valid hex");
            return false;
        }
    };
    let raw_key = match hex::decode(proof.public_key) {
        Ok(raw) if raw.len() == 64 => raw,
        _ => {
            tracing::info!("malformed public key in serial proof");
            return false;
        }
    };
    let compressed = match crypto::compress_point(&raw_key[..32], &raw_key[32..])
    {
        Ok(compressed) => compressed,
        Err(_) => return false,
    };
    crypto::verify_signature(proof.signature, &digest, &compressed)
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Store-backed attestor with on-chain ownership checks and an optional
/// device certificate gate in front of the serial proof route.
#[derive(Debug)]
pub struct HardwareAttestor<S, N> {
    store: S,
    ownership: N,
    device_certs: Option<DeviceCertValidator<Arc<dyn IssuerLookup>>>,
}

impl<S: AttestationStore, N: NftOwnership> HardwareAttestor<S, N> {
    pub fn new(store: S, ownership: N) -> Self {
        Self {
            store,
            ownership,
            device_certs: None,
        }
    }

    /// Requires a valid device certificate before any serial proof is
    /// accepted. Off unless configured.
    pub fn with_device_certs(mut self, issuers: Arc<dyn IssuerLookup>) -> Self {
        self.device_certs = Some(DeviceCertValidator::new(issuers));
        self
    }

    async fn check_proof(
        &self,
        relay: &RelayRecord,
    ) -> Option<VerifiedHardware> {
        let hardware = match &relay.hardware_info {
            Some(hardware) => hardware,
            None => {
                tracing::info!(
                    fingerprint = %relay.fingerprint,
                    "no hardware info to verify"
                );
                return None;
            }
        };
        match parse_nft_id(hardware.nftid.as_deref()) {
            Ok(0) => self.check_serial_proof(relay, hardware).await,
            Ok(nft_id) => {
                self.check_nft_ownership(relay, hardware, nft_id).await
            }
            Err(raw) => {
                tracing::info!(
                    fingerprint = %relay.fingerprint,
                    nftid = raw,
                    "unparsable nft id in hardware info"
                );
                None
            }
        }
    }

    async fn check_nft_ownership(
        &self,
        relay: &RelayRecord,
        hardware: &HardwareInfo,
        nft_id: u64,
    ) -> Option<VerifiedHardware> {
        let owned = self
            .ownership
            .is_owner_of(&relay.operator_address, nft_id)
            .await;
        if !owned {
            tracing::info!(
                nft_id,
                address = %relay.operator_address,
                "nft is not owned by the operator"
            );
            return None;
        }
        Some(self.verified_record(relay, hardware, nft_id as i64))
    }

    async fn check_serial_proof(
        &self,
        relay: &RelayRecord,
        hardware: &HardwareInfo,
    ) -> Option<VerifiedHardware> {
        let fingerprint = &relay.fingerprint;
        let device_serial = match hardware.device_serial() {
            Some(serial) => serial,
            None => {
                tracing::info!(
                    %fingerprint,
                    "missing device serial in hardware info"
                );
                return None;
            }
        };
        let atec_serial = match hardware.atec_serial() {
            Some(serial) => serial,
            None => {
                tracing::info!(
                    %fingerprint,
                    "missing atec serial in hardware info"
                );
                return None;
            }
        };

        if let Some(validator) = &self.device_certs {
            let matches = self
                .device_cert_matches(validator, relay, hardware, atec_serial)
                .await;
            if !matches {
                return None;
            }
        }

        match self.store.exists_by_device_serial(device_serial).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(
                    %fingerprint,
                    device_serial,
                    "device serial was already verified"
                );
                return None;
            }
            Err(error) => {
                tracing::error!(%error, "failed to look up the device serial");
                return None;
            }
        }
        match self.store.verified_hardware_by_atec_serial(atec_serial).await {
            Ok(existing) if existing.is_empty() => {}
            Ok(_) => {
                tracing::info!(
                    %fingerprint,
                    atec_serial,
                    "atec serial was already verified"
                );
                return None;
            }
            Err(error) => {
                tracing::error!(%error, "failed to look up the atec serial");
                return None;
            }
        }
        match self.store.known_device_exists(atec_serial).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    %fingerprint,
                    atec_serial,
                    "atec serial is not a known device"
                );
                return None;
            }
            Err(error) => {
                tracing::error!(%error, "failed to look up the known device");
                return None;
            }
        }

        let public_key = match hardware.device_public_key() {
            Some(key) => key,
            None => {
                tracing::info!(
                    %fingerprint,
                    "missing public key in hardware info"
                );
                return None;
            }
        };
        let signature = match hardware.device_signature() {
            Some(signature) => signature,
            None => {
                tracing::info!(
                    %fingerprint,
                    "missing signature in hardware info"
                );
                return None;
            }
        };

        let fingerprint_hex = fingerprint.to_string();
        let address_hex = relay.operator_address.to_string();
        let proof = SerialProof {
            node_id: SERIAL_PROOF_NODE_ID,
            nft_id: 0,
            device_serial,
            atec_serial,
            fingerprint: &fingerprint_hex,
            address: &address_hex,
            public_key,
            signature,
        };
        if !verify_serial_proof(&proof) {
            return None;
        }
        Some(self.verified_record(relay, hardware, 0))
    }

    async fn device_cert_matches(
        &self,
        validator: &DeviceCertValidator<Arc<dyn IssuerLookup>>,
        relay: &RelayRecord,
        hardware: &HardwareInfo,
        atec_serial: &str,
    ) -> bool {
        let pem = match hardware.device_cert() {
            Some(pem) => pem,
            None => {
                tracing::info!(
                    fingerprint = %relay.fingerprint,
                    "missing device certificate in hardware info"
                );
                return false;
            }
        };
        let check = validator.validate(pem, &relay.fingerprint).await;
        if !check.valid {
            tracing::info!(
                fingerprint = %relay.fingerprint,
                "device certificate validation failed"
            );
            return false;
        }
        match &check.atec_serial {
            Some(cert_serial)
                if !cert_serial.eq_ignore_ascii_case(atec_serial) =>
            {
                tracing::info!(
                    fingerprint = %relay.fingerprint,
                    cert_serial = %cert_serial,
                    atec_serial,
                    "device certificate serial does not match the chip"
                );
                false
            }
            _ => true,
        }
    }

    fn verified_record(
        &self,
        relay: &RelayRecord,
        hardware: &HardwareInfo,
        nft_id: i64,
    ) -> VerifiedHardware {
        VerifiedHardware {
            verified_at: crate::unix_time_millis(),
            device_serial: hardware
                .device_serial()
                .unwrap_or_default()
                .to_owned(),
            atec_serial: hardware.atec_serial().unwrap_or_default().to_owned(),
            fingerprint: relay.fingerprint,
            operator_address: relay.operator_address,
            public_key: hardware
                .device_public_key()
                .unwrap_or_default()
                .to_owned(),
            signature: hardware
                .device_signature()
                .unwrap_or_default()
                .to_owned(),
            nft_id,
        }
    }
}

#[async_trait]
impl<S: AttestationStore, N: NftOwnership> Attestor for HardwareAttestor<S, N> {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn is_hardware_proof_valid(&self, relay: &RelayRecord) -> bool {
        match self.check_proof(relay).await {
            Some(record) => {
                if let Err(error) =
                    self.store.insert_verified_hardware(record).await
                {
                    tracing::error!(
                        %error,
                        fingerprint = %relay.fingerprint,
                        "failed to store the verified hardware"
                    );
                }
                true
            }
            None => {
                tracing::info!(
                    fingerprint = %relay.fingerprint,
                    "storing hardware verification failure"
                );
                let failure = HardwareVerificationFailure {
                    fingerprint: relay.fingerprint,
                    operator_address: relay.operator_address,
                    timestamp: crate::unix_time_millis(),
                    hardware_info: relay.hardware_info.clone(),
                };
                if let Err(error) = self.store.insert_failure(failure).await {
                    tracing::error!(
                        %error,
                        fingerprint = %relay.fingerprint,
                        "failed to store the verification failure"
                    );
                }
                false
            }
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn serial_bound_to_other_fingerprint(
        &self,
        relay: &RelayRecord,
        state: &OperatorRegistryState,
    ) -> bool {
        let atec_serial = match relay
            .hardware_info
            .as_ref()
            .and_then(HardwareInfo::atec_serial)
        {
            Some(serial) => serial,
            None => return false,
        };
        let existing =
            match self.store.verified_hardware_by_atec_serial(atec_serial).await
            {
                Ok(existing) => existing,
                Err(error) => {
                    tracing::error!(
                        %error,
                        "failed to look up the atec serial"
                    );
                    return false;
                }
            };
        existing.iter().any(|record| {
            record.fingerprint != relay.fingerprint
                && state.is_live_fingerprint(&record.fingerprint)
        })
    }
}

fn parse_nft_id(raw: Option<&str>) -> Result<u64, &str> {
    match raw.map(str::trim) {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse::<u64>().map_err(|_| raw),
    }
}
