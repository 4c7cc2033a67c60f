// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

pub mod common;
pub mod queue;
pub mod redacted;

pub use common::{EvmAddress, Fingerprint, ADDRESS_SIZE, FINGERPRINT_SIZE};
pub use queue::flow::FlowJob;
pub use queue::lease::LeaderLease;
pub use queue::{
    Delivery, Job, JobKind, JobQueue, QueueCLIConfig, QueueConfig, QueueError,
    QueueName,
};
pub use redacted::{Redacted, RedactedUrl, Url};
