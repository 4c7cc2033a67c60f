// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Relay geolocation via the network API's fingerprint map.
//!
//! The map is fetched once at startup and kept in memory; relays missing from
//! it get the `"?"` placeholder cell.

use std::collections::HashMap;

use h3o::{LatLng, Resolution};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::RwLock;

/// Cell value for relays without a known location.
pub const UNKNOWN_GEO_HEX: &str = "?";

/// Average hex area of about 1770 km².
const GEO_HEX_RESOLUTION: Resolution = Resolution::Four;

#[derive(Debug, Snafu)]
pub enum GeoError {
    #[snafu(display("error fetching the fingerprint map"))]
    FingerprintMapRequestError { source: reqwest::Error },

    #[snafu(display("fingerprint map request failed with status {status}"))]
    FingerprintMapStatusError { status: u16 },
}

#[derive(Debug, Clone, Deserialize)]
struct FingerprintLocation {
    /// Latitude and longitude, in that order.
    coordinates: [f64; 2],
}

/// In-memory fingerprint to location map.
#[derive(Debug)]
pub struct GeoLookup {
    client: Client,
    api_url: String,
    map: RwLock<HashMap<String, FingerprintLocation>>,
}

impl GeoLookup {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_owned(),
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the map with a fresh copy from the network API.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn refresh(&self) -> Result<(), GeoError> {
        let response = self
            .client
            .get(format!("{}/fingerprint-map", self.api_url))
            .send()
            .await
            .context(FingerprintMapRequestSnafu)?;
        ensure!(
            response.status() == StatusCode::OK,
            FingerprintMapStatusSnafu {
                status: response.status().as_u16()
            }
        );
        let map: HashMap<String, FingerprintLocation> = response
            .json()
            .await
            .context(FingerprintMapRequestSnafu)?;
        tracing::info!(cells = map.len(), "fetched the fingerprint map");
        *self.map.write().await = map;
        Ok(())
    }

    /// The H3 resolution-4 cell of the relay, or `"?"` when unknown.
    pub async fn geo_hex(&self, fingerprint: &str) -> String {
        let map = self.map.read().await;
        if map.is_empty() {
            tracing::warn!("fingerprint map is empty, cannot look up relays");
            return UNKNOWN_GEO_HEX.to_owned();
        }
        let location = match map.get(fingerprint) {
            Some(location) => location,
            None => {
                tracing::warn!(fingerprint, "no geolocation for fingerprint");
                return UNKNOWN_GEO_HEX.to_owned();
            }
        };
        let [lat, lng] = location.coordinates;
        match LatLng::new(lat, lng) {
            Ok(coordinates) => {
                coordinates.to_cell(GEO_HEX_RESOLUTION).to_string()
            }
            Err(error) => {
                tracing::warn!(%error, fingerprint, "invalid coordinates");
                UNKNOWN_GEO_HEX.to_owned()
            }
        }
    }

    #[cfg(test)]
    async fn insert(&self, fingerprint: &str, coordinates: [f64; 2]) {
        self.map
            .write()
            .await
            .insert(fingerprint.to_owned(), FingerprintLocation { coordinates });
    }
}
