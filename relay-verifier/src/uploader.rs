// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Permanent-storage uploads of verification artifacts.
//!
//! Metrics and stats blobs are wrapped in signed data items and posted to a
//! bundler node. Callers treat a failed upload as a missing transaction id,
//! so errors here surface as warnings upstream, not hard failures.

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use reqwest::Client;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::ans104::{Ans104Error, DataItem, Tag};

#[derive(Debug, Snafu)]
pub enum UploadError {
    #[snafu(display("error signing upload"))]
    UploadSigningError { source: Ans104Error },

    #[snafu(display("error sending upload to bundler"))]
    UploadRequestError { source: reqwest::Error },

    #[snafu(display("bundler rejected upload with status {}", status))]
    RejectedUploadError { status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
}

#[async_trait]
pub trait Uploader: std::fmt::Debug + Send + Sync {
    async fn upload(
        &self,
        data: Vec<u8>,
        tags: &[Tag],
    ) -> Result<UploadReceipt, UploadError>;
}

pub struct BundlerUploader {
    client: Client,
    url: String,
    wallet: LocalWallet,
}

impl BundlerUploader {
    pub fn new(url: String, wallet: LocalWallet) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_owned(),
            wallet,
        }
    }
}

impl std::fmt::Debug for BundlerUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerUploader")
            .field("url", &self.url)
            .finish()
    }
}

#[derive(Deserialize)]
struct BundlerResponse {
    id: String,
}

#[async_trait]
impl Uploader for BundlerUploader {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn upload(
        &self,
        data: Vec<u8>,
        tags: &[Tag],
    ) -> Result<UploadReceipt, UploadError> {
        let item = DataItem::sign(&self.wallet, None, tags, data)
            .await
            .context(UploadSigningSnafu)?;
        let response = self
            .client
            .post(format!("{}/tx/ethereum", self.url))
            .header("content-type", "application/octet-stream")
            .body(item.to_bytes())
            .send()
            .await
            .context(UploadRequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::RejectedUploadError {
                status: status.as_u16(),
            });
        }
        let body: BundlerResponse =
            response.json().await.context(UploadRequestSnafu)?;
        tracing::debug!(id = %body.id, "upload accepted by bundler");
        Ok(UploadReceipt { id: body.id })
    }
}
