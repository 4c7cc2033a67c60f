// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Operator registry process state.
//!
//! The registry process serializes its Lua tables to JSON, where an empty
//! table comes out as `[]` instead of `{}`. The deserializer accepts both so
//! a freshly deployed registry reads as empty sets.

use std::collections::HashMap;

use relay_events::Fingerprint;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};

/// Snapshot of the registry process, read through a dry-run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorRegistryState {
    #[serde(
        rename = "ClaimableFingerprintsToOperatorAddresses",
        deserialize_with = "lua_table",
        default
    )]
    pub claimable: HashMap<String, String>,

    #[serde(
        rename = "VerifiedFingerprintsToOperatorAddresses",
        deserialize_with = "lua_table",
        default
    )]
    pub verified: HashMap<String, String>,

    #[serde(
        rename = "VerifiedHardwareFingerprints",
        deserialize_with = "lua_table",
        default
    )]
    pub verified_hardware: HashMap<String, bool>,
}

impl OperatorRegistryState {
    /// The relay is awaiting an operator claim in the registry.
    pub fn is_claimable(&self, fingerprint: &Fingerprint) -> bool {
        self.claimable.contains_key(&fingerprint.to_string())
    }

    /// The relay has already been claimed and verified.
    pub fn is_verified(&self, fingerprint: &Fingerprint) -> bool {
        self.verified.contains_key(&fingerprint.to_string())
    }

    /// The registry already accepted a hardware proof for the relay.
    pub fn is_verified_hardware(&self, fingerprint: &Fingerprint) -> bool {
        matches!(
            self.verified_hardware.get(&fingerprint.to_string()),
            Some(true)
        )
    }

    /// Fingerprints still live in the registry, claimable or verified.
    pub fn is_live_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.is_claimable(fingerprint) || self.is_verified(fingerprint)
    }
}

fn lua_table<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Table<V> {
        Map(HashMap<String, V>),
        List(Vec<IgnoredAny>),
    }

    match Table::deserialize(deserializer)? {
        Table::Map(map) => Ok(map),
        Table::List(items) if items.is_empty() => Ok(HashMap::new()),
        Table::List(_) => Err(serde::de::Error::custom(
            "expected a table keyed by fingerprint",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FINGERPRINT: &str = "AAAAABBBBBCCCCCDDDDDEEEEEFFFFF0000011111";

    #[test]
    fn deserializes_populated_tables() {
        let state: OperatorRegistryState = serde_json::from_str(&format!(
            r#"{{
                "ClaimableFingerprintsToOperatorAddresses":
                    {{"{FINGERPRINT}": "0x8ba1f109551bD432803012645Ac136ddd64DBA72"}},
                "VerifiedFingerprintsToOperatorAddresses": [],
                "VerifiedHardwareFingerprints": {{"{FINGERPRINT}": true}}
            }}"#
        ))
        .unwrap();

        let fingerprint: Fingerprint = FINGERPRINT.parse().unwrap();
        assert!(state.is_claimable(&fingerprint));
        assert!(!state.is_verified(&fingerprint));
        assert!(state.is_verified_hardware(&fingerprint));
        assert!(state.is_live_fingerprint(&fingerprint));
    }

    #[test]
    fn normalizes_empty_lua_tables() {
        let state: OperatorRegistryState = serde_json::from_str(
            r#"{
                "ClaimableFingerprintsToOperatorAddresses": [],
                "VerifiedFingerprintsToOperatorAddresses": [],
                "VerifiedHardwareFingerprints": []
            }"#,
        )
        .unwrap();

        assert!(state.claimable.is_empty());
        assert!(state.verified.is_empty());
        assert!(state.verified_hardware.is_empty());
    }

    #[test]
    fn missing_tables_read_as_empty() {
        let state: OperatorRegistryState = serde_json::from_str("{}").unwrap();
        assert!(state.claimable.is_empty());
        assert!(state.verified.is_empty());
        assert!(state.verified_hardware.is_empty());
    }

    #[test]
    fn rejects_non_empty_arrays() {
        let result: Result<OperatorRegistryState, _> = serde_json::from_str(
            r#"{"VerifiedHardwareFingerprints": ["not-a-table"]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn ignores_untracked_state_fields() {
        let state: OperatorRegistryState = serde_json::from_str(
            r#"{
                "TotalSupply": 100,
                "VerifiedFingerprintsToOperatorAddresses":
                    {"AAAAABBBBBCCCCCDDDDDEEEEEFFFFF0000011111": "0x0"}
            }"#,
        )
        .unwrap();
        assert_eq!(state.verified.len(), 1);
    }
}
