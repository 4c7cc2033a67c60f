// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use snafu::Snafu;
use std::str::FromStr;

pub const FINGERPRINT_SIZE: usize = 20;
pub const ADDRESS_SIZE: usize = 20;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseIdentityError {
    #[snafu(display("expected {} hex characters, got {}", expected, got))]
    WrongLength { expected: usize, got: usize },

    #[snafu(display("invalid hex encoding"))]
    InvalidHex,

    #[snafu(display("missing 0x prefix"))]
    MissingPrefix,

    #[snafu(display("mixed-case address failed the checksum"))]
    ChecksumMismatch,
}

/// SHA-1 digest of a relay identity key.
///
/// The canonical form is 40 uppercase hex characters; that is what goes over
/// the wire and into the database, so serialization always upcases.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub const fn new(data: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(data)
    }

    pub fn inner(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn into_inner(self) -> [u8; FINGERPRINT_SIZE] {
        self.0
    }
}

impl From<[u8; FINGERPRINT_SIZE]> for Fingerprint {
    fn from(data: [u8; FINGERPRINT_SIZE]) -> Self {
        Self::new(data)
    }
}

impl FromStr for Fingerprint {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * FINGERPRINT_SIZE {
            return Err(ParseIdentityError::WrongLength {
                expected: 2 * FINGERPRINT_SIZE,
                got: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|_| ParseIdentityError::InvalidHex)?;
        let data = bytes
            .try_into()
            .map_err(|_| ParseIdentityError::InvalidHex)?;
        Ok(Self::new(data))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.inner()))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.inner()))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&hex::encode_upper(self.inner()), serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_data = String::deserialize(deserializer)?;
        Fingerprint::from_str(&string_data).map_err(|e| {
            serde::de::Error::custom(format!("fail to decode fingerprint ({})", e))
        })
    }
}

/// Ethereum account address.
///
/// Parsing follows the EIP-55 rules: the `0x` prefix is mandatory, single-case
/// input is taken as-is, and mixed-case input must match its checksum. The
/// canonical serialized form is the checksummed string.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EvmAddress([u8; ADDRESS_SIZE]);

impl EvmAddress {
    /// Placeholder bound to hardware proofs that arrive without an operator
    /// address. It is a valid account no one holds keys for.
    pub const DUMMY: EvmAddress = EvmAddress([0xff; ADDRESS_SIZE]);

    pub const fn new(data: [u8; ADDRESS_SIZE]) -> Self {
        Self(data)
    }

    pub fn inner(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn into_inner(self) -> [u8; ADDRESS_SIZE] {
        self.0
    }

    /// Bare lowercase hex, without the `0x` prefix.
    pub fn to_hex_lower(&self) -> String {
        hex::encode(self.inner())
    }

    /// EIP-55 mixed-case form, with the `0x` prefix.
    pub fn to_checksum_string(&self) -> String {
        let lower = hex::encode(self.inner());
        let digest = Keccak256::digest(lower.as_bytes());
        let mut out = String::with_capacity(2 + 2 * ADDRESS_SIZE);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = if i % 2 == 0 {
                digest[i / 2] >> 4
            } else {
                digest[i / 2] & 0x0f
            };
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl From<[u8; ADDRESS_SIZE]> for EvmAddress {
    fn from(data: [u8; ADDRESS_SIZE]) -> Self {
        Self::new(data)
    }
}

impl FromStr for EvmAddress {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or(ParseIdentityError::MissingPrefix)?;
        if hex_part.len() != 2 * ADDRESS_SIZE {
            return Err(ParseIdentityError::WrongLength {
                expected: 2 * ADDRESS_SIZE,
                got: hex_part.len(),
            });
        }
        let bytes = hex::decode(hex_part).map_err(|_| ParseIdentityError::InvalidHex)?;
        let data: [u8; ADDRESS_SIZE] = bytes
            .try_into()
            .map_err(|_| ParseIdentityError::InvalidHex)?;
        let address = Self::new(data);
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower && address.to_checksum_string()[2..] != *hex_part {
            return Err(ParseIdentityError::ChecksumMismatch);
        }
        Ok(address)
    }
}

impl std::fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_checksum_string())
    }
}

impl std::fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_checksum_string())
    }
}

impl Serialize for EvmAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.to_checksum_string(), serializer)
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_data = String::deserialize(deserializer)?;
        EvmAddress::from_str(&string_data).map_err(|e| {
            serde::de::Error::custom(format!("fail to decode address ({})", e))
        })
    }
}
