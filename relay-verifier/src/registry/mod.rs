// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Client for the operator registry process.
//!
//! Reads go through a compute-unit dry-run, which evaluates a message against
//! the process without committing it. Writes are signed data items posted to
//! a messenger-unit; the message id is the hash of the item signature, so it
//! is known before the messenger answers. A write settles in two steps: the
//! messenger accepts the item, then the compute-unit result for the message
//! id tells whether the process handler raised an error.

pub mod state;

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use relay_events::{EvmAddress, Fingerprint};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::ans104::{Ans104Error, DataItem, Tag};

pub use state::OperatorRegistryState;

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("registry process id is not a valid message target"))]
    InvalidProcessError { source: Ans104Error },

    #[snafu(display("error signing registry message"))]
    RegistrySigningError { source: Ans104Error },

    #[snafu(display("error talking to the registry"))]
    RegistryRequestError { source: reqwest::Error },

    #[snafu(display("registry endpoint answered with status {}", status))]
    RegistryStatusError { status: u16 },

    #[snafu(display("registry dry-run returned no state message"))]
    EmptyStateError,

    #[snafu(display("error encoding certificate entries"))]
    EntryEncodeError { source: serde_json::Error },

    #[snafu(display("error parsing registry state"))]
    StateParseError { source: serde_json::Error },
}

/// Outcome of a registry write.
///
/// An `Err` from the messenger means the message may not exist at all; a
/// receipt with `success == false` means it exists but the process handler
/// rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    pub message_id: String,
    pub success: bool,
}

/// One relay in an operator certificate submission.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateEntry {
    pub address: EvmAddress,
    pub fingerprint: Fingerprint,
}

#[async_trait]
pub trait RegistryMessenger: std::fmt::Debug + Send + Sync {
    /// Reads the current registry state without committing a message.
    async fn view_state(&self)
        -> Result<OperatorRegistryState, RegistryError>;

    /// Marks fingerprints as backed by a valid hardware proof.
    async fn add_verified_hardware(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<MessageReceipt, RegistryError>;

    /// Submits operator certificates so relays become claimable.
    async fn submit_operator_certificates(
        &self,
        entries: &[CertificateEntry],
    ) -> Result<MessageReceipt, RegistryError>;
}

pub struct AoRegistryClient {
    client: Client,
    cu_url: String,
    mu_url: String,
    process_id: String,
    target: [u8; 32],
    wallet: LocalWallet,
}

impl AoRegistryClient {
    pub fn new(
        cu_url: String,
        mu_url: String,
        process_id: String,
        wallet: LocalWallet,
    ) -> Result<Self, RegistryError> {
        let target = crate::ans104::parse_target(&process_id)
            .context(InvalidProcessSnafu)?;
        Ok(Self {
            client: Client::new(),
            cu_url: cu_url.trim_end_matches('/').to_owned(),
            mu_url: mu_url.trim_end_matches('/').to_owned(),
            process_id,
            target,
            wallet,
        })
    }

    fn message_tags(action: &str) -> Vec<Tag> {
        vec![
            Tag::new("Action", action),
            Tag::new("Data-Protocol", "ao"),
            Tag::new("Variant", "ao.TN.1"),
            Tag::new("Type", "Message"),
        ]
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn send_message(
        &self,
        action: &str,
        data: String,
    ) -> Result<MessageReceipt, RegistryError> {
        let tags = Self::message_tags(action);
        let item = DataItem::sign(
            &self.wallet,
            Some(self.target),
            &tags,
            data.into_bytes(),
        )
        .await
        .context(RegistrySigningSnafu)?;
        let message_id = item.id();

        let response = self
            .client
            .post(&self.mu_url)
            .header("content-type", "application/octet-stream")
            .header("accept", "application/json")
            .body(item.to_bytes())
            .send()
            .await
            .context(RegistryRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::RegistryStatusError {
                status: status.as_u16(),
            });
        }

        let response = self
            .client
            .get(format!("{}/result/{}", self.cu_url, message_id))
            .query(&[("process-id", self.process_id.as_str())])
            .send()
            .await
            .context(RegistryRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::RegistryStatusError {
                status: status.as_u16(),
            });
        }
        let result: MessageResult =
            response.json().await.context(RegistryRequestSnafu)?;

        if let Some(error) = &result.error {
            tracing::warn!(
                action,
                %message_id,
                %error,
                "registry process raised an error"
            );
        }
        Ok(MessageReceipt {
            message_id,
            success: result.error.is_none(),
        })
    }
}

impl std::fmt::Debug for AoRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AoRegistryClient")
            .field("cu_url", &self.cu_url)
            .field("mu_url", &self.mu_url)
            .field("process_id", &self.process_id)
            .finish()
    }
}

#[async_trait]
impl RegistryMessenger for AoRegistryClient {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn view_state(
        &self,
    ) -> Result<OperatorRegistryState, RegistryError> {
        let body = DryRunMessage {
            id: "1234",
            target: &self.process_id,
            owner: "1234",
            anchor: "0",
            data: "1234",
            tags: Self::message_tags("View-State"),
        };
        let response = self
            .client
            .post(format!("{}/dry-run", self.cu_url))
            .query(&[("process-id", self.process_id.as_str())])
            .json(&body)
            .send()
            .await
            .context(RegistryRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::RegistryStatusError {
                status: status.as_u16(),
            });
        }
        let result: DryRunResponse =
            response.json().await.context(RegistryRequestSnafu)?;
        let message = result
            .messages
            .into_iter()
            .next()
            .context(EmptyStateSnafu)?;
        serde_json::from_str(&message.data).context(StateParseSnafu)
    }

    async fn add_verified_hardware(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<MessageReceipt, RegistryError> {
        let data = fingerprints
            .iter()
            .map(|fingerprint| fingerprint.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let receipt = self.send_message("Add-Verified-Hardware", data).await?;
        if receipt.success {
            tracing::info!(
                message_id = %receipt.message_id,
                fingerprints = fingerprints.len(),
                "Add-Verified-Hardware accepted"
            );
        }
        Ok(receipt)
    }

    async fn submit_operator_certificates(
        &self,
        entries: &[CertificateEntry],
    ) -> Result<MessageReceipt, RegistryError> {
        let data =
            serde_json::to_string(entries).context(EntryEncodeSnafu)?;
        let receipt = self
            .send_message("Admin-Submit-Operator-Certificates", data)
            .await?;
        if receipt.success {
            tracing::info!(
                message_id = %receipt.message_id,
                relays = entries.len(),
                "Admin-Submit-Operator-Certificates accepted"
            );
        }
        Ok(receipt)
    }
}

#[derive(Serialize)]
struct DryRunMessage<'a> {
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Target")]
    target: &'a str,
    #[serde(rename = "Owner")]
    owner: &'a str,
    #[serde(rename = "Anchor")]
    anchor: &'a str,
    #[serde(rename = "Data")]
    data: &'a str,
    #[serde(rename = "Tags")]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct DryRunResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<AoMessage>,
}

#[derive(Deserialize)]
struct AoMessage {
    #[serde(rename = "Data", default)]
    data: String,
}

#[derive(Deserialize)]
struct MessageResult {
    #[serde(rename = "Error", default)]
    error: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use httpmock::prelude::*;
    use serde_json::json;

    const TEST_KEY: &str =
        "0123456789012345678901234567890123456789012345678901234567890123";
    const FINGERPRINT: &str = "AAAAABBBBBCCCCCDDDDDEEEEEFFFFF0000011111";

    fn process_id() -> String {
        URL_SAFE_NO_PAD.encode([1u8; 32])
    }

    fn client(server: &MockServer) -> AoRegistryClient {
        AoRegistryClient::new(
            server.base_url(),
            server.base_url(),
            process_id(),
            TEST_KEY.parse().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_malformed_process_ids() {
        let result = AoRegistryClient::new(
            "http://cu".to_owned(),
            "http://mu".to_owned(),
            "definitely-not-an-id".to_owned(),
            TEST_KEY.parse().unwrap(),
        );
        assert!(matches!(
            result,
            Err(RegistryError::InvalidProcessError { .. })
        ));
    }

    #[tokio::test]
    async fn reads_state_through_a_dry_run() {
        let server = MockServer::start_async().await;
        let state_json = json!({
            "ClaimableFingerprintsToOperatorAddresses": [],
            "VerifiedFingerprintsToOperatorAddresses": {
                FINGERPRINT: "0x8ba1f109551bD432803012645Ac136ddd64DBA72"
            },
            "VerifiedHardwareFingerprints": []
        })
        .to_string();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/dry-run")
                    .query_param("process-id", process_id())
                    .json_body_partial(
                        json!({
                            "Target": process_id(),
                            "Tags": [
                                { "name": "Action", "value": "View-State" }
                            ]
                        })
                        .to_string(),
                    );
                then.status(200)
                    .json_body(json!({ "Messages": [{ "Data": state_json }] }));
            })
            .await;

        let state = client(&server).view_state().await.unwrap();

        mock.assert_async().await;
        let fingerprint: Fingerprint = FINGERPRINT.parse().unwrap();
        assert!(state.is_verified(&fingerprint));
        assert!(state.claimable.is_empty());
    }

    #[tokio::test]
    async fn dry_run_without_messages_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/dry-run");
                then.status(200).json_body(json!({ "Messages": [] }));
            })
            .await;

        let err = client(&server).view_state().await.unwrap_err();
        assert!(matches!(err, RegistryError::EmptyStateError));
    }

    #[tokio::test]
    async fn sends_hardware_fingerprints_as_signed_items() {
        let server = MockServer::start_async().await;
        let fingerprint: Fingerprint = FINGERPRINT.parse().unwrap();
        let mu = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/")
                    .header("content-type", "application/octet-stream")
                    .matches(|req: &HttpMockRequest| {
                        // the data item carries the joined fingerprints
                        req.body
                            .as_ref()
                            .map(|body| body.ends_with(FINGERPRINT.as_bytes()))
                            .unwrap_or(false)
                    });
                then.status(200).json_body(json!({ "id": "ignored" }));
            })
            .await;
        let cu = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path_matches(Regex::new("^/result/").unwrap())
                    .query_param("process-id", process_id());
                then.status(200)
                    .json_body(json!({ "Messages": [], "Spawns": [] }));
            })
            .await;

        let receipt = client(&server)
            .add_verified_hardware(&[fingerprint])
            .await
            .unwrap();

        mu.assert_async().await;
        cu.assert_async().await;
        assert!(receipt.success);
        assert_eq!(receipt.message_id.len(), 43);
    }

    #[tokio::test]
    async fn process_errors_are_unsuccessful_receipts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(200).json_body(json!({ "id": "ignored" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path_matches(Regex::new("^/result/").unwrap());
                then.status(200)
                    .json_body(json!({ "Error": "not authorized" }));
            })
            .await;

        let entries = vec![CertificateEntry {
            address: "0x8ba1f109551bD432803012645Ac136ddd64DBA72"
                .parse()
                .unwrap(),
            fingerprint: FINGERPRINT.parse().unwrap(),
        }];
        let receipt = client(&server)
            .submit_operator_certificates(&entries)
            .await
            .unwrap();
        assert!(!receipt.success);
    }

    #[tokio::test]
    async fn messenger_failures_are_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(502);
            })
            .await;

        let err = client(&server)
            .add_verified_hardware(&[FINGERPRINT.parse().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::RegistryStatusError { status: 502 }
        ));
    }

    #[test]
    fn certificate_entries_serialize_with_checksummed_addresses() {
        let entries = vec![CertificateEntry {
            address: "0x8ba1f109551bd432803012645ac136ddd64dba72"
                .parse()
                .unwrap(),
            fingerprint: FINGERPRINT.parse().unwrap(),
        }];
        assert_eq!(
            serde_json::to_string(&entries).unwrap(),
            format!(
                r#"[{{"address":"0x8ba1f109551bD432803012645Ac136ddd64DBA72","fingerprint":"{FINGERPRINT}"}}]"#
            )
        );
    }
}
