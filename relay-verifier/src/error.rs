// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use snafu::Snafu;

use crate::attestation::chain::ChainError;
use crate::directory::geo::GeoError;
use crate::registry::RegistryError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VerifierError {
    #[snafu(display("queue error"))]
    QueueAccessError { source: relay_events::QueueError },

    #[snafu(display("repository error"))]
    RepositoryError { source: relay_data::Error },

    #[snafu(display("invalid signer key"))]
    SignerError { source: ethers::signers::WalletError },

    #[snafu(display("registry client error"))]
    RegistryClientError { source: RegistryError },

    #[snafu(display("chain access error"))]
    ChainAccessError { source: ChainError },

    #[snafu(display("error loading the fingerprint map"))]
    GeoBootstrapError { source: GeoError },

    #[snafu(display("health and metrics server error"))]
    HttpServerError { source: hyper::Error },
}
