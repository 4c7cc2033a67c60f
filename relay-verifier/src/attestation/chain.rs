// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! On-chain ownership checks for relay NFTs.
//!
//! Two providers are configured; the backup is only consulted when the
//! primary fails for a reason other than the token not existing. A missing
//! token is a definitive answer, not a provider fault.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::contract::{abigen, ContractError};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, U256};
use relay_events::EvmAddress;
use snafu::{ensure, ResultExt, Snafu};

abigen!(
    RelayNft,
    r#"[
        function ownerOf(uint256 tokenId) external view returns (address)
    ]"#
);

const MISSING_TOKEN_REASON: &str = "ERC721: invalid token ID";

#[derive(Debug, Snafu)]
pub enum ChainError {
    #[snafu(display("failed to parse evm provider url"))]
    ParseProviderError { source: url::ParseError },

    #[snafu(display("error querying the evm provider"))]
    ProviderRequestError {
        source: ethers::providers::ProviderError,
    },

    #[snafu(display("evm provider is on chain {}, expected {}", got, expected))]
    WrongChainError { expected: u64, got: U256 },
}

#[async_trait]
pub trait NftOwnership: std::fmt::Debug + Send + Sync {
    /// Whether `address` currently owns the relay NFT `nft_id`.
    async fn is_owner_of(&self, address: &EvmAddress, nft_id: u64) -> bool;
}

#[derive(Debug)]
pub struct ChainNftOwnership {
    contract: RelayNft<Provider<Http>>,
    backup_contract: RelayNft<Provider<Http>>,
}

impl ChainNftOwnership {
    /// Connects both providers, checking that each one answers for the
    /// configured chain before any ownership query is made.
    pub async fn new(
        primary_url: &str,
        backup_url: &str,
        chain_id: u64,
        contract_address: EvmAddress,
    ) -> Result<Self, ChainError> {
        let address = Address::from(*contract_address.inner());
        let primary = Self::connect(primary_url, chain_id).await?;
        let backup = Self::connect(backup_url, chain_id).await?;
        Ok(Self {
            contract: RelayNft::new(address, primary),
            backup_contract: RelayNft::new(address, backup),
        })
    }

    async fn connect(
        url: &str,
        chain_id: u64,
    ) -> Result<Arc<Provider<Http>>, ChainError> {
        let provider =
            Provider::<Http>::try_from(url).context(ParseProviderSnafu)?;
        let reported = provider
            .get_chainid()
            .await
            .context(ProviderRequestSnafu)?;
        ensure!(
            reported == U256::from(chain_id),
            WrongChainSnafu {
                expected: chain_id,
                got: reported,
            }
        );
        Ok(Arc::new(provider))
    }
}

fn is_missing_token(error: &ContractError<Provider<Http>>) -> bool {
    error
        .decode_revert::<String>()
        .map(|reason| reason.contains(MISSING_TOKEN_REASON))
        .unwrap_or(false)
}

#[async_trait]
impl NftOwnership for ChainNftOwnership {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn is_owner_of(&self, address: &EvmAddress, nft_id: u64) -> bool {
        let expected = Address::from(*address.inner());
        let token = U256::from(nft_id);

        match self.contract.owner_of(token).call().await {
            Ok(owner) => {
                tracing::debug!(%owner, %address, nft_id, "owner lookup");
                return owner == expected;
            }
            Err(error) if is_missing_token(&error) => {
                tracing::debug!(nft_id, "relay NFT does not exist");
                return false;
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    nft_id,
                    "owner lookup failed, trying the backup provider"
                );
            }
        }

        match self.backup_contract.owner_of(token).call().await {
            Ok(owner) => owner == expected,
            Err(error) => {
                if is_missing_token(&error) {
                    tracing::debug!(nft_id, "relay NFT does not exist");
                } else {
                    tracing::error!(%error, nft_id, "backup owner lookup failed");
                }
                false
            }
        }
    }
}
