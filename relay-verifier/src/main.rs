// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use relay_verifier::config::Config;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:?}", e);
    }
}

async fn run() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::parse().context("config error")?;

    relay_verifier::run(config)
        .await
        .context("relay verifier error")?;

    Ok(())
}
