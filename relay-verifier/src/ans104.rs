// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! ANS-104 data items with the Ethereum signature type.
//!
//! A data item is signed over the deep-hash of its fields (SHA-384 tree
//! hash), with an EIP-191 personal signature. The item id is the SHA-256 of
//! the signature. Tags use the Avro array-of-records block encoding the
//! bundler network expects.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ethers::signers::{LocalWallet, Signer, WalletError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};
use snafu::{ResultExt, Snafu};

/// ANS-104 signature type for secp256k1 personal signatures.
const SIGNATURE_TYPE_ETHEREUM: u16 = 3;

const SIGNATURE_LENGTH: usize = 65;
const OWNER_LENGTH: usize = 65;

#[derive(Debug, Snafu)]
pub enum Ans104Error {
    #[snafu(display("error signing data item"))]
    SigningError { source: WalletError },

    #[snafu(display("target {} is not a 32-byte base64url id", target))]
    InvalidTarget { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A signed, serializable data item.
#[derive(Debug, Clone)]
pub struct DataItem {
    signature: Vec<u8>,
    owner: Vec<u8>,
    target: Option<[u8; 32]>,
    anchor: Option<[u8; 32]>,
    tag_bytes: Vec<u8>,
    tag_count: usize,
    data: Vec<u8>,
}

impl DataItem {
    /// Signs a data item with the wallet's secp256k1 key.
    pub async fn sign(
        wallet: &LocalWallet,
        target: Option<[u8; 32]>,
        tags: &[Tag],
        data: Vec<u8>,
    ) -> Result<Self, Ans104Error> {
        let owner = wallet
            .signer()
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let tag_bytes = encode_tags(tags);
        let empty: &[u8] = &[];
        let digest = deep_hash(&DeepHashChunk::List(vec![
            DeepHashChunk::Blob(b"dataitem"),
            DeepHashChunk::Blob(b"1"),
            DeepHashChunk::Blob(b"3"),
            DeepHashChunk::Blob(&owner),
            DeepHashChunk::Blob(target.as_ref().map_or(empty, |t| t.as_slice())),
            DeepHashChunk::Blob(empty),
            DeepHashChunk::Blob(&tag_bytes),
            DeepHashChunk::Blob(&data),
        ]));
        let signature = wallet
            .sign_message(digest)
            .await
            .context(SigningSnafu)?
            .to_vec();
        Ok(Self {
            signature,
            owner,
            target,
            anchor: None,
            tag_bytes,
            tag_count: tags.len(),
            data,
        })
    }

    /// Item id: base64url of the SHA-256 of the signature.
    pub fn id(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(&self.signature))
    }

    /// Binary layout POSTed to bundler and messenger nodes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + SIGNATURE_LENGTH
                + OWNER_LENGTH
                + 2
                + 64
                + 16
                + self.tag_bytes.len()
                + self.data.len(),
        );
        out.extend_from_slice(&SIGNATURE_TYPE_ETHEREUM.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.owner);
        match &self.target {
            Some(target) => {
                out.push(1);
                out.extend_from_slice(target);
            }
            None => out.push(0),
        }
        match &self.anchor {
            Some(anchor) => {
                out.push(1);
                out.extend_from_slice(anchor);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.tag_count as u64).to_le_bytes());
        out.extend_from_slice(&(self.tag_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.tag_bytes);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Decodes a base64url transaction/process id into a data item target.
pub fn parse_target(target: &str) -> Result<[u8; 32], Ans104Error> {
    URL_SAFE_NO_PAD
        .decode(target)
        .ok()
        .and_then(|raw| <[u8; 32]>::try_from(raw).ok())
        .ok_or_else(|| Ans104Error::InvalidTarget {
            target: target.to_owned(),
        })
}

enum DeepHashChunk<'a> {
    Blob(&'a [u8]),
    List(Vec<DeepHashChunk<'a>>),
}

fn deep_hash(chunk: &DeepHashChunk) -> [u8; 48] {
    match chunk {
        DeepHashChunk::Blob(data) => {
            let tag = [b"blob".as_slice(), data.len().to_string().as_bytes()]
                .concat();
            let tagged = [
                Sha384::digest(tag).as_slice(),
                Sha384::digest(data).as_slice(),
            ]
            .concat();
            Sha384::digest(tagged).into()
        }
        DeepHashChunk::List(items) => {
            let tag = [b"list".as_slice(), items.len().to_string().as_bytes()]
                .concat();
            let mut acc: [u8; 48] = Sha384::digest(tag).into();
            for item in items {
                let pair = [acc.as_slice(), deep_hash(item).as_slice()].concat();
                acc = Sha384::digest(pair).into();
            }
            acc
        }
    }
}

/// Avro block encoding of `array<record {name: string, value: string}>`.
fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    if tags.is_empty() {
        return vec![];
    }
    let mut out = Vec::new();
    write_zigzag(tags.len() as i64, &mut out);
    for tag in tags {
        write_string(&tag.name, &mut out);
        write_string(&tag.value, &mut out);
    }
    write_zigzag(0, &mut out);
    out
}

fn write_string(value: &str, out: &mut Vec<u8>) {
    write_zigzag(value.len() as i64, out);
    out.extend_from_slice(value.as_bytes());
}

fn write_zigzag(value: i64, out: &mut Vec<u8>) {
    let mut encoded = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let mut byte = (encoded & 0x7f) as u8;
        encoded >>= 7;
        if encoded != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if encoded == 0 {
            break;
        }
    }
}
