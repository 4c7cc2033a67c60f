// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Process configuration, read from the command line or the environment.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use snafu::{ResultExt, Snafu};

use relay_data::{RepositoryCLIConfig, RepositoryConfig};
use relay_events::common::ParseIdentityError;
use relay_events::{
    EvmAddress, QueueCLIConfig, QueueConfig, Redacted,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_config: QueueConfig,
    pub repository_config: RepositoryConfig,
    pub verifier_config: VerifierConfig,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub is_live: bool,
    pub do_clean: bool,
    pub validation_interval: Duration,
    pub leader_lease_ttl: Duration,
    pub banned_fingerprints: HashSet<String>,
    pub details_uri: String,
    pub details_auth: Redacted<String>,
    pub geo_api_url: String,
    pub registry_process_id: String,
    pub ao_cu_url: String,
    pub ao_mu_url: String,
    pub bundler_url: String,
    pub signer_key: Redacted<String>,
    pub evm_rpc_url: String,
    pub evm_rpc_url_backup: String,
    pub evm_chain_id: u64,
    pub nft_contract_address: EvmAddress,
    pub device_certs_enabled: bool,
    pub vault_addr: String,
    pub vault_token: Redacted<String>,
    pub http_server_port: u16,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("invalid NFT contract address"))]
    InvalidContractAddressError { source: ParseIdentityError },
}

impl Config {
    pub fn parse() -> Result<Self, ConfigError> {
        Self::from_cli(CLIConfig::parse())
    }

    fn from_cli(cli_config: CLIConfig) -> Result<Self, ConfigError> {
        let nft_contract_address = cli_config
            .nft_contract_address
            .parse()
            .context(InvalidContractAddressSnafu)?;
        let banned_fingerprints = cli_config
            .banned_fingerprints
            .into_iter()
            .filter(|fingerprint| !fingerprint.is_empty())
            .map(|fingerprint| fingerprint.to_uppercase())
            .collect();
        let evm_rpc_url_backup = cli_config
            .evm_rpc_url_backup
            .unwrap_or_else(|| cli_config.evm_rpc_url.clone());

        let verifier_config = VerifierConfig {
            is_live: cli_config.is_live,
            do_clean: cli_config.do_clean,
            validation_interval: Duration::from_secs(
                cli_config.validation_interval_seconds,
            ),
            leader_lease_ttl: Duration::from_millis(
                cli_config.leader_lease_ttl,
            ),
            banned_fingerprints,
            details_uri: cli_config.details_uri,
            details_auth: Redacted::new(cli_config.details_auth),
            geo_api_url: cli_config.geo_api_url,
            registry_process_id: cli_config.registry_process_id,
            ao_cu_url: cli_config.ao_cu_url,
            ao_mu_url: cli_config.ao_mu_url,
            bundler_url: cli_config.bundler_url,
            signer_key: Redacted::new(cli_config.signer_key),
            evm_rpc_url: cli_config.evm_rpc_url,
            evm_rpc_url_backup,
            evm_chain_id: cli_config.evm_chain_id,
            nft_contract_address,
            device_certs_enabled: cli_config.device_certs_enabled,
            vault_addr: cli_config.vault_addr,
            vault_token: Redacted::new(cli_config.vault_token),
            http_server_port: cli_config.http_server_port,
        };

        Ok(Self {
            queue_config: cli_config.queue_cli_config.into(),
            repository_config: cli_config.repository_cli_config.into(),
            verifier_config,
        })
    }
}

#[derive(Parser, Debug)]
struct CLIConfig {
    #[command(flatten)]
    queue_cli_config: QueueCLIConfig,

    #[command(flatten)]
    repository_cli_config: RepositoryCLIConfig,

    /// Enables registry writes and artifact uploads
    #[arg(long, env)]
    is_live: bool,

    /// Drops every queued job at startup
    #[arg(long, env)]
    do_clean: bool,

    /// Seconds between validation runs
    #[arg(long, env, default_value = "3600")]
    validation_interval_seconds: u64,

    /// Leader lease time-to-live (in millis)
    #[arg(long, env, default_value = "10000")]
    leader_lease_ttl: u64,

    /// Comma-separated fingerprints excluded from every run
    #[arg(long, env, value_delimiter = ',')]
    banned_fingerprints: Vec<String>,

    /// Relay directory details endpoint
    #[arg(long, env, default_value = "https://onionoo.torproject.org/details")]
    details_uri: String,

    /// Bearer token for the details endpoint, empty disables the header
    #[arg(long, env, default_value = "")]
    details_auth: String,

    /// Geo service base URL serving the fingerprint map
    #[arg(long, env)]
    geo_api_url: String,

    /// Operator registry process id
    #[arg(long, env)]
    registry_process_id: String,

    /// AO compute unit URL
    #[arg(long, env, default_value = "https://cu.ao-testnet.xyz")]
    ao_cu_url: String,

    /// AO messenger unit URL
    #[arg(long, env, default_value = "https://mu.ao-testnet.xyz")]
    ao_mu_url: String,

    /// Bundler node receiving artifact uploads
    #[arg(long, env, default_value = "https://node2.irys.xyz")]
    bundler_url: String,

    /// Hex private key signing registry messages and uploads
    #[arg(long, env)]
    signer_key: String,

    /// Primary JSON-RPC endpoint for NFT ownership checks
    #[arg(long, env)]
    evm_rpc_url: String,

    /// Backup JSON-RPC endpoint, defaults to the primary
    #[arg(long, env)]
    evm_rpc_url_backup: Option<String>,

    /// Chain id both JSON-RPC endpoints must answer for
    #[arg(long, env, default_value = "1")]
    evm_chain_id: u64,

    /// Relay NFT contract address
    #[arg(long, env)]
    nft_contract_address: String,

    /// Requires a valid device certificate before accepting serial proofs
    #[arg(long, env)]
    device_certs_enabled: bool,

    /// Vault address serving the device certificate issuers
    #[arg(long, env, default_value = "http://127.0.0.1:8200")]
    vault_addr: String,

    /// Vault token
    #[arg(long, env, default_value = "")]
    vault_token: String,

    /// Port of the health and metrics endpoint
    #[arg(long, env, default_value = "8080")]
    http_server_port: u16,
}
