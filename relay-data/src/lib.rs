// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

pub mod config;
pub mod error;
pub mod repository;
pub mod types;

pub use config::{RepositoryCLIConfig, RepositoryConfig};
pub use error::Error;
pub use repository::Repository;
pub use types::{
    HardwareCert, HardwareEntry, HardwareInfo, HardwareVerificationFailure,
    KnownDevice, RelayRecord, ScoredRelay, TaskServiceState, VerificationData,
    VerifiedHardware,
};
