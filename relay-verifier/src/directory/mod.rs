// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Relay directory intake.
//!
//! The pipeline starts here: fetch the published relay details, keep the
//! relays that claim an operator, then resolve the claims into typed records
//! for the verification stages. Fetching is conditional on the directory's
//! last-modified stamp, so an unchanged directory yields an empty batch.

pub mod contact;
pub mod geo;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use relay_data::{HardwareInfo, RelayRecord};
use relay_events::{Fingerprint, Redacted};
use reqwest::header::{AUTHORIZATION, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

pub use geo::GeoLookup;

#[derive(Debug, Snafu)]
pub enum DirectoryError {
    #[snafu(display("error fetching relay details"))]
    DetailsRequestError { source: reqwest::Error },

    #[snafu(display("relay details request failed with status {status}"))]
    DetailsStatusError { status: u16 },
}

/// One relay entry of the published details document.
///
/// Everything but the fingerprint is optional on the wire; absent numbers
/// come out as zero and an absent version as `"?"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRelay {
    pub fingerprint: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub consensus_weight: i64,
    #[serde(default)]
    pub consensus_weight_fraction: f64,
    #[serde(default)]
    pub measured: bool,
    #[serde(default)]
    pub observed_bandwidth: i64,
    #[serde(default)]
    pub bandwidth_rate: i64,
    #[serde(default)]
    pub bandwidth_burst: i64,
    #[serde(default)]
    pub advertised_bandwidth: i64,
    #[serde(default = "unknown_version")]
    pub version: String,
    #[serde(default)]
    pub version_status: String,
    #[serde(default)]
    pub effective_family: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_info: Option<HardwareInfo>,
}

fn unknown_version() -> String {
    "?".to_owned()
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    relays: Vec<DirectoryRelay>,
}

/// Client for the relay details endpoint.
#[derive(Debug)]
pub struct DirectoryClient {
    client: Client,
    details_uri: String,
    details_auth: Redacted<String>,
    last_seen: Mutex<String>,
}

impl DirectoryClient {
    pub fn new(details_uri: &str, details_auth: &str) -> Self {
        Self {
            client: Client::new(),
            details_uri: details_uri.to_owned(),
            details_auth: Redacted::new(details_auth.to_owned()),
            last_seen: Mutex::new(String::new()),
        }
    }

    /// Fetches the relay list, remembering the directory's modification
    /// stamp. A not-modified answer yields an empty batch.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn fetch_relays(
        &self,
    ) -> Result<Vec<DirectoryRelay>, DirectoryError> {
        let mut last_seen = self.last_seen.lock().await;
        tracing::info!(last_seen = last_seen.as_str(), "fetching new relays");
        let request_stamp = Utc::now();

        let mut request = self.client.get(&self.details_uri);
        if !self.details_auth.inner().is_empty() {
            request = request.header(AUTHORIZATION, self.details_auth.inner());
        }
        if !last_seen.is_empty() {
            request = request.header(IF_MODIFIED_SINCE, last_seen.as_str());
        }

        let response =
            request.send().await.context(DetailsRequestSnafu)?;
        match response.status() {
            StatusCode::NOT_MODIFIED => {
                tracing::debug!("no relay updates from the directory");
                Ok(Vec::new())
            }
            StatusCode::OK => {
                // A stamp from the future (or one that does not parse)
                // would pin If-Modified-Since past every real update, so
                // only a stamp predating this request is kept.
                let modified = response
                    .headers()
                    .get(LAST_MODIFIED)
                    .and_then(|value| value.to_str().ok())
                    .filter(|modified| {
                        DateTime::parse_from_rfc2822(modified)
                            .map(|parsed| parsed < request_stamp)
                            .unwrap_or(false)
                    });
                match modified {
                    Some(modified) => *last_seen = modified.to_owned(),
                    None => last_seen.clear(),
                }
                let details: DetailsResponse =
                    response.json().await.context(DetailsRequestSnafu)?;
                tracing::info!(
                    relays = details.relays.len(),
                    last_seen = last_seen.as_str(),
                    "received relays from the directory"
                );
                Ok(details.relays)
            }
            status => DetailsStatusSnafu {
                status: status.as_u16(),
            }
            .fail(),
        }
    }
}

/// Drops relays without an operator claim marker plus everything on the ban
/// list.
pub fn filter_relays(
    relays: Vec<DirectoryRelay>,
    banned_fingerprints: &HashSet<String>,
) -> Vec<DirectoryRelay> {
    let total = relays.len();
    tracing::debug!(total, "filtering relays");

    let matching: Vec<DirectoryRelay> = relays
        .into_iter()
        .filter(|relay| {
            !banned_fingerprints.contains(&relay.fingerprint)
                && relay
                    .contact
                    .as_deref()
                    .map(contact::has_claim_marker)
                    .unwrap_or(false)
        })
        .collect();

    if !matching.is_empty() {
        tracing::info!(matching = matching.len(), "filtered relays");
    } else if total > 0 {
        tracing::info!("no interesting relays found");
    }
    matching
}

/// Resolves operator claims and locations into relay records, dropping
/// relays whose claim or fingerprint does not parse.
pub async fn validate_relays(
    relays: Vec<DirectoryRelay>,
    geo: &GeoLookup,
) -> Vec<RelayRecord> {
    let mut records = Vec::with_capacity(relays.len());
    for relay in relays {
        let contact = relay.contact.clone().unwrap_or_default();
        let operator_address = match contact::operator_address(&contact) {
            Some(address) => address,
            None => continue,
        };
        let fingerprint = match relay.fingerprint.parse::<Fingerprint>() {
            Ok(fingerprint) => fingerprint,
            Err(error) => {
                tracing::warn!(
                    %error,
                    fingerprint = relay.fingerprint.as_str(),
                    "skipping relay with a malformed fingerprint"
                );
                continue;
            }
        };
        let geo_hex = geo.geo_hex(&relay.fingerprint).await;
        records.push(RelayRecord {
            fingerprint,
            operator_address,
            contact,
            nickname: relay.nickname,
            running: relay.running,
            consensus_weight: relay.consensus_weight,
            consensus_weight_fraction: relay.consensus_weight_fraction,
            consensus_measured: relay.measured,
            observed_bandwidth: relay.observed_bandwidth,
            bandwidth_rate: relay.bandwidth_rate,
            bandwidth_burst: relay.bandwidth_burst,
            advertised_bandwidth: relay.advertised_bandwidth,
            version: relay.version,
            version_status: relay.version_status,
            effective_family: relay.effective_family,
            geo_hex,
            hardware_info: relay.hardware_info,
            hardware_validated: false,
            hardware_validated_at: None,
        });
    }
    tracing::info!(validated = records.len(), "validated relays");
    records
}
