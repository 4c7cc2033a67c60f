// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Aggregates published after a verification run.
//!
//! The field names of these types are the wire format of the published
//! artifacts and are consumed by external dashboards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{VerificationOutcome, VerificationResult};

/// Totals published as the `validation/stats` artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub consensus_weight: i64,
    pub consensus_weight_fraction: f64,
    pub observed_bandwidth: i64,
    pub verification: VerificationCounts,
    pub verified_and_running: CapacityTotals,
}

/// Per-outcome relay counts. `unclaimed` covers relays registered but not
/// yet claimed by an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCounts {
    pub failed: usize,
    pub unclaimed: usize,
    pub verified: usize,
    pub running: usize,
}

/// Capacity sub-totals over the verified relays that are also running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityTotals {
    pub consensus_weight: i64,
    pub consensus_weight_fraction: f64,
    pub observed_bandwidth: i64,
}

/// One geo cell of the published relay hex map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HexCellStats {
    pub h3cell: String,
    pub claimable: usize,
    pub verified: usize,
    pub running: usize,
    pub running_verified: usize,
}

/// Folds a run's results into the published validation stats.
pub fn validation_stats(results: &[VerificationResult]) -> ValidationStats {
    let mut stats = ValidationStats::default();
    for entry in results {
        let relay = &entry.relay;
        stats.consensus_weight += relay.consensus_weight;
        stats.consensus_weight_fraction += relay.consensus_weight_fraction;
        stats.observed_bandwidth += relay.observed_bandwidth;

        match entry.result {
            VerificationOutcome::Failed => stats.verification.failed += 1,
            VerificationOutcome::Ok | VerificationOutcome::AlreadyRegistered => {
                stats.verification.unclaimed += 1
            }
            VerificationOutcome::AlreadyVerified => {
                stats.verification.verified += 1
            }
            _ => {}
        }
        if relay.running {
            stats.verification.running += 1;
        }
        if entry.result == VerificationOutcome::AlreadyVerified && relay.running
        {
            stats.verified_and_running.consensus_weight +=
                relay.consensus_weight;
            stats.verified_and_running.consensus_weight_fraction +=
                relay.consensus_weight_fraction;
            stats.verified_and_running.observed_bandwidth +=
                relay.observed_bandwidth;
        }
    }
    stats
}

/// Groups a run's results by geo cell, counting claimable, verified and
/// running relays per cell. Cells come out in lexicographic order.
pub fn relay_hex_map(results: &[VerificationResult]) -> Vec<HexCellStats> {
    let mut cells: BTreeMap<&str, HexCellStats> = BTreeMap::new();
    for entry in results {
        let cell = cells
            .entry(entry.relay.geo_hex.as_str())
            .or_insert_with(|| HexCellStats {
                h3cell: entry.relay.geo_hex.clone(),
                claimable: 0,
                verified: 0,
                running: 0,
                running_verified: 0,
            });
        match entry.result {
            VerificationOutcome::Ok | VerificationOutcome::AlreadyRegistered => {
                cell.claimable += 1
            }
            VerificationOutcome::AlreadyVerified => cell.verified += 1,
            _ => {}
        }
        if entry.relay.running {
            cell.running += 1;
            if entry.result == VerificationOutcome::AlreadyVerified {
                cell.running_verified += 1;
            }
        }
    }
    cells.into_values().collect()
}
