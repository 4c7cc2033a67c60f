// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Vault PKI access for hardware issuer certificates.
//!
//! Issuers are found by subject key identifier: the device certificate names
//! its authority key id, and the matching Vault issuer is the one whose key
//! id equals it after stripping colons and case. Vault tokens are periodic,
//! so the client renews its own token on a timer; a failed renewal keeps the
//! current token and retries on the next tick.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum VaultError {
    #[snafu(display("error talking to vault"))]
    VaultRequestError { source: reqwest::Error },

    #[snafu(display("vault answered with status {}", status))]
    VaultStatusError { status: u16 },
}

/// Issuer entry of a Vault PKI mount, as returned by a read-issuer call.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultIssuer {
    #[serde(default)]
    pub ca_chain: Vec<String>,
    pub certificate: String,
    pub issuer_id: String,
    #[serde(default)]
    pub issuer_name: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub usage: String,
}

#[async_trait]
pub trait IssuerLookup: std::fmt::Debug + Send + Sync {
    /// Finds the issuer whose key id matches the subject key identifier,
    /// given as hex with or without colons.
    async fn issuer_by_ski(&self, ski: &str) -> Option<VaultIssuer>;
}

pub struct VaultClient {
    client: Client,
    addr: String,
    token: RwLock<String>,
}

impl VaultClient {
    pub fn new(addr: String, token: String) -> Self {
        Self {
            client: Client::new(),
            addr: addr.trim_end_matches('/').to_owned(),
            token: RwLock::new(token),
        }
    }

    async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Renews the periodic token and swaps in the returned client token.
    pub async fn renew_token(&self) -> Result<(), VaultError> {
        let response = self
            .client
            .post(format!("{}/v1/auth/token/renew-self", self.addr))
            .header("X-Vault-Token", self.token().await)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context(VaultRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::VaultStatusError {
                status: status.as_u16(),
            });
        }
        let renewal: TokenRenewal =
            response.json().await.context(VaultRequestSnafu)?;
        *self.token.write().await = renewal.auth.client_token;
        tracing::info!("renewed the vault token");
        Ok(())
    }

    /// Renews the token on an interval until the task is dropped.
    pub async fn renew_token_periodically(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(error) = self.renew_token().await {
                tracing::error!(%error, "failed to renew the vault token");
            }
        }
    }

    async fn list_issuer_refs(&self) -> Result<Vec<String>, VaultError> {
        let response = self
            .client
            .get(format!("{}/v1/pki/issuers", self.addr))
            .query(&[("list", "true")])
            .header("X-Vault-Token", self.token().await)
            .send()
            .await
            .context(VaultRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::VaultStatusError {
                status: status.as_u16(),
            });
        }
        let list: VaultResponse<IssuerKeys> =
            response.json().await.context(VaultRequestSnafu)?;
        Ok(list.data.keys)
    }

    async fn read_issuer(
        &self,
        issuer_ref: &str,
    ) -> Result<VaultIssuer, VaultError> {
        let response = self
            .client
            .get(format!("{}/v1/pki/issuer/{}", self.addr, issuer_ref))
            .header("X-Vault-Token", self.token().await)
            .send()
            .await
            .context(VaultRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::VaultStatusError {
                status: status.as_u16(),
            });
        }
        let issuer: VaultResponse<VaultIssuer> =
            response.json().await.context(VaultRequestSnafu)?;
        Ok(issuer.data)
    }
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("addr", &self.addr)
            .finish()
    }
}

fn normalize_key_id(key_id: &str) -> String {
    key_id
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_lowercase()
}

#[async_trait]
impl IssuerLookup for VaultClient {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn issuer_by_ski(&self, ski: &str) -> Option<VaultIssuer> {
        let wanted = normalize_key_id(ski);
        let refs = match self.list_issuer_refs().await {
            Ok(refs) => refs,
            Err(error) => {
                tracing::error!(%error, "failed to list vault issuers");
                return None;
            }
        };
        for issuer_ref in refs {
            match self.read_issuer(&issuer_ref).await {
                Ok(issuer) => {
                    if normalize_key_id(&issuer.key_id) == wanted {
                        return Some(issuer);
                    }
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        issuer_ref,
                        "failed to read vault issuer"
                    );
                }
            }
        }
        tracing::debug!(ski, "no vault issuer matches the subject key id");
        None
    }
}

#[async_trait]
impl<L: IssuerLookup + ?Sized> IssuerLookup for std::sync::Arc<L> {
    async fn issuer_by_ski(&self, ski: &str) -> Option<VaultIssuer> {
        (**self).issuer_by_ski(ski).await
    }
}

#[derive(Deserialize)]
struct VaultResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct IssuerKeys {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct TokenRenewal {
    auth: TokenAuth,
}

#[derive(Deserialize)]
struct TokenAuth {
    client_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn issuer_body(key_id: &str, certificate: &str) -> serde_json::Value {
        json!({
            "data": {
                "ca_chain": [certificate],
                "certificate": certificate,
                "issuer_id": "11111111-2222-3333-4444-555555555555",
                "issuer_name": "hardware-root",
                "key_id": key_id,
                "revoked": false,
                "usage": "issuing-certificates,read-only",
            }
        })
    }

    #[tokio::test]
    async fn renews_the_token_and_uses_the_new_one() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/auth/token/renew-self")
                    .header("X-Vault-Token", "initial-token");
                then.status(200).json_body(json!({
                    "auth": { "client_token": "renewed-token" }
                }));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/auth/token/renew-self")
                    .header("X-Vault-Token", "renewed-token");
                then.status(200).json_body(json!({
                    "auth": { "client_token": "renewed-again" }
                }));
            })
            .await;

        let client =
            VaultClient::new(server.base_url(), "initial-token".to_owned());
        client.renew_token().await.unwrap();
        client.renew_token().await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn failed_renewals_keep_the_current_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/auth/token/renew-self");
                then.status(403);
            })
            .await;

        let client =
            VaultClient::new(server.base_url(), "initial-token".to_owned());
        let err = client.renew_token().await.unwrap_err();
        assert!(matches!(err, VaultError::VaultStatusError { status: 403 }));
        assert_eq!(client.token().await, "initial-token");
    }

    #[tokio::test]
    async fn finds_the_issuer_matching_the_ski() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/pki/issuers")
                    .query_param("list", "true")
                    .header("X-Vault-Token", "token");
                then.status(200)
                    .json_body(json!({ "data": { "keys": ["ref-1", "ref-2"] } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/pki/issuer/ref-1");
                then.status(200)
                    .json_body(issuer_body("AA:BB:CC", "other-pem"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/pki/issuer/ref-2");
                then.status(200)
                    .json_body(issuer_body("DD:EE:FF", "wanted-pem"));
            })
            .await;

        let client = VaultClient::new(server.base_url(), "token".to_owned());
        let issuer = client.issuer_by_ski("ddeeff").await.unwrap();
        assert_eq!(issuer.certificate, "wanted-pem");
        assert!(client.issuer_by_ski("123456").await.is_none());
    }

    #[tokio::test]
    async fn lookup_failures_are_no_match() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/pki/issuers");
                then.status(403);
            })
            .await;

        let client = VaultClient::new(server.base_url(), "token".to_owned());
        assert!(client.issuer_by_ski("ddeeff").await.is_none());
    }
}
