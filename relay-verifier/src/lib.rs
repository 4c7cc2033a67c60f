// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethers::signers::LocalWallet;
use prometheus_client::registry::Registry;
use relay_data::Repository;
use relay_events::JobQueue;
use snafu::ResultExt;

use attestation::{ChainNftOwnership, HardwareAttestor, VaultClient};
use cluster::LeaseLeadership;
use config::Config;
use directory::{DirectoryClient, GeoLookup};
use metrics::VerifierMetrics;
use registry::AoRegistryClient;
use tasks::{TaskManager, Worker};
use uploader::BundlerUploader;
use verification::VerificationEngine;

pub use error::VerifierError;

pub mod ans104;
pub mod attestation;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod directory;
mod error;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod tasks;
pub mod uploader;
pub mod verification;

const VAULT_RENEW_PERIOD: Duration = Duration::from_secs(60 * 60);

#[tracing::instrument(level = "trace", skip_all)]
pub async fn run(config: Config) -> Result<(), VerifierError> {
    tracing::info!(?config, "starting relay verifier");

    let metrics = VerifierMetrics::default();
    let http_handle = http::start(
        config.verifier_config.http_server_port,
        Registry::from(metrics.clone()),
    );

    let queue = JobQueue::new(config.queue_config)
        .await
        .context(error::QueueAccessSnafu)?;
    let repository = Repository::new(config.repository_config)
        .await
        .context(error::RepositorySnafu)?;
    tracing::trace!("connected to the queue and the repository");

    let verifier_config = config.verifier_config;
    let leadership = Arc::new(LeaseLeadership::new(
        queue.lease(verifier_config.leader_lease_ttl),
    ));

    let wallet = verifier_config
        .signer_key
        .inner()
        .parse::<LocalWallet>()
        .context(error::SignerSnafu)?;
    let registry_client = AoRegistryClient::new(
        verifier_config.ao_cu_url,
        verifier_config.ao_mu_url,
        verifier_config.registry_process_id,
        wallet.clone(),
    )
    .context(error::RegistryClientSnafu)?;
    let uploader = BundlerUploader::new(verifier_config.bundler_url, wallet);

    let ownership = ChainNftOwnership::new(
        &verifier_config.evm_rpc_url,
        &verifier_config.evm_rpc_url_backup,
        verifier_config.evm_chain_id,
        verifier_config.nft_contract_address,
    )
    .await
    .context(error::ChainAccessSnafu)?;

    let mut attestor = HardwareAttestor::new(repository.clone(), ownership);
    let vault = if verifier_config.device_certs_enabled {
        let vault = Arc::new(VaultClient::new(
            verifier_config.vault_addr,
            verifier_config.vault_token.inner().to_owned(),
        ));
        attestor = attestor.with_device_certs(vault.clone());
        Some(vault)
    } else {
        None
    };

    let engine = VerificationEngine::new(
        registry_client,
        repository.clone(),
        uploader,
        attestor,
        verifier_config.is_live,
    )
    .with_metrics(metrics);

    // The fingerprint map never refreshes after startup, so failing to load
    // it here must abort instead of running a whole process lifetime with an
    // empty map that marks every relay as unknown.
    let geo = GeoLookup::new(&verifier_config.geo_api_url);
    geo.refresh().await.context(error::GeoBootstrapSnafu)?;
    tracing::trace!("loaded the fingerprint map");

    let directory = DirectoryClient::new(
        &verifier_config.details_uri,
        verifier_config.details_auth.inner(),
    );

    let manager = Arc::new(TaskManager::new(
        queue.clone(),
        leadership,
        verifier_config.validation_interval,
        verifier_config.is_live,
        verifier_config.do_clean,
    ));
    manager
        .bootstrap(&repository)
        .await
        .context(error::QueueAccessSnafu)?;

    let worker = Worker::new(
        queue,
        manager.clone(),
        engine,
        repository,
        directory,
        geo,
        verifier_config.banned_fingerprints,
    );

    tokio::select! {
        ret = http_handle => {
            ret.context(error::HttpServerSnafu)
        }
        _ = manager.run_scheduler() => {
            Ok(())
        }
        _ = worker.run() => {
            Ok(())
        }
        _ = renew_vault_token(vault) => {
            Ok(())
        }
    }
}

/// Keeps the vault token alive while the other tasks run. With device
/// certificates disabled there is no token and the future never resolves.
async fn renew_vault_token(vault: Option<Arc<VaultClient>>) {
    match vault {
        Some(vault) => vault.renew_token_periodically(VAULT_RENEW_PERIOD).await,
        None => std::future::pending::<()>().await,
    }
}

/// Milliseconds since the Unix epoch; zero if the clock reads before it.
pub(crate) fn unix_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
