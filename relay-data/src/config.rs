// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use clap::Parser;
use relay_events::Redacted;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Connection URI, including any credentials. Kept redacted because the
    /// whole config is logged at startup.
    pub uri: Redacted<String>,
    pub database: String,
    pub backoff: ExponentialBackoff,
}

#[derive(Debug, Parser)]
pub struct RepositoryCLIConfig {
    /// MongoDB connection URI
    #[arg(long, env, default_value = "mongodb://127.0.0.1:27017")]
    pub mongo_uri: String,

    /// Database holding the verifier collections
    #[arg(long, env, default_value = "relay-verifier")]
    pub mongo_database: String,

    /// The max elapsed time for retrying the first connection (in millis)
    #[arg(long, env, default_value = "120000")]
    pub mongo_backoff_max_elapsed_duration: u64,
}

impl From<RepositoryCLIConfig> for RepositoryConfig {
    fn from(cli_config: RepositoryCLIConfig) -> RepositoryConfig {
        let backoff_max_elapsed_duration =
            Duration::from_millis(cli_config.mongo_backoff_max_elapsed_duration);
        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(backoff_max_elapsed_duration))
            .build();
        RepositoryConfig {
            uri: Redacted::new(cli_config.mongo_uri),
            database: cli_config.mongo_database,
            backoff,
        }
    }
}
