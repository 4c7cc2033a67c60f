// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Operator claims embedded in relay contact lines.
//!
//! A relay claims an operator by publishing `@anon:` followed by an EVM
//! address somewhere in its directory contact string. The marker and the hex
//! digits are matched case-insensitively, but a mixed-case address must carry
//! a valid EIP-55 checksum.

use relay_events::EvmAddress;

/// The marker is matched case-insensitively.
const CLAIM_MARKER: &str = "@anon:";

const ADDRESS_LEN: usize = 42;

/// Whether the contact line carries an operator claim marker at all.
pub fn has_claim_marker(contact: &str) -> bool {
    find_ignore_ascii_case(contact, CLAIM_MARKER).is_some()
}

/// Extracts the claimed operator address from a contact line.
///
/// The address is the first `0x`-prefixed 42-char window after the marker;
/// there may be unrelated text in between.
pub fn operator_address(contact: &str) -> Option<EvmAddress> {
    if contact.is_empty() {
        tracing::warn!("attempting to extract a claim from an empty contact");
        return None;
    }
    let marker = match find_ignore_ascii_case(contact, CLAIM_MARKER) {
        Some(index) => index,
        None => {
            tracing::warn!(contact, "no claim marker in relay contact");
            return None;
        }
    };
    let tail = &contact[marker + CLAIM_MARKER.len()..];
    let key_index = match find_ignore_ascii_case(tail, "0x") {
        Some(index) => index,
        None => {
            tracing::warn!(contact, "no address after the claim marker");
            return None;
        }
    };
    let candidate = match tail.get(key_index..key_index + ADDRESS_LEN) {
        Some(candidate) => candidate,
        None => {
            tracing::warn!(contact, "truncated address after the claim marker");
            return None;
        }
    };
    match candidate.parse::<EvmAddress>() {
        Ok(address) => Some(address),
        Err(error) => {
            tracing::warn!(
                %error,
                candidate,
                "invalid address after the claim marker"
            );
            None
        }
    }
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}
