// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! P-256 primitives for hardware serial proofs.
//!
//! Malformed input is a verification failure, not an error: relays submit
//! arbitrary strings and the attestation decision must always be a boolean.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum CryptoError {
    #[snafu(display("mismatched coordinate lengths for point compression"))]
    MalformedKey,
}

/// SEC1 point compression: prefix 0x02/0x03 by the parity of y, then x.
pub fn compress_point(x: &[u8], y: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if x.is_empty() || x.len() != y.len() {
        return Err(CryptoError::MalformedKey);
    }
    let parity = y.last().copied().unwrap_or_default() & 1;
    let mut compressed = Vec::with_capacity(x.len() + 1);
    compressed.push(0x02 + parity);
    compressed.extend_from_slice(x);
    Ok(compressed)
}

/// Digest of the serial-proof message signed by the device.
///
/// The message is the hex concatenation of the utf-8 node id, the nft id as
/// two little-endian bytes, both serials, the fingerprint and the operator
/// address without its 0x prefix, lower-cased and decoded to raw bytes.
/// Returns `None` when any segment is not valid hex.
pub fn serial_proof_digest(
    node_id: &str,
    nft_id: u16,
    device_serial: &str,
    atec_serial: &str,
    fingerprint: &str,
    address: &str,
) -> Option<[u8; 32]> {
    let nft_hex: Vec<char> = format!("{:04x}", nft_id).chars().collect();
    let nft_le: String = [nft_hex[2], nft_hex[3], nft_hex[0], nft_hex[1]]
        .iter()
        .collect();
    let address_tail = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    let message_hex = format!(
        "{}{}{}{}{}{}",
        hex::encode(node_id.as_bytes()),
        nft_le,
        device_serial,
        atec_serial,
        fingerprint,
        address_tail
    )
    .to_lowercase();
    let message = hex::decode(message_hex).ok()?;
    Some(Sha256::digest(message).into())
}

/// P-256 ECDSA verification over a prehashed 32-byte digest.
///
/// The signature is 128 hex chars of r ∥ s and the key is an SEC1 compressed
/// point. Any malformed input yields `false`.
pub fn verify_signature(
    signature_hex: &str,
    digest: &[u8; 32],
    compressed_key: &[u8],
) -> bool {
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(compressed_key) else {
        return false;
    };
    key.verify_prehash(digest, &signature).is_ok()
}
