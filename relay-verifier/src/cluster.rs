// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Cluster role of a verifier replica.
//!
//! Any number of replicas consume jobs, but only the leader schedules new
//! pipeline runs and performs startup queue cleanup. The role is decided by
//! a Redis lease; holding it is re-checked on every decision point rather
//! than cached, so a partitioned replica demotes itself within one TTL.

use async_trait::async_trait;
use relay_events::LeaderLease;

#[async_trait]
pub trait Leadership: std::fmt::Debug + Send + Sync {
    /// Whether this replica currently holds the leader role.
    async fn is_leader(&self) -> bool;
}

/// Leadership backed by the job queue's leader lease.
#[derive(Debug)]
pub struct LeaseLeadership {
    lease: LeaderLease,
}

impl LeaseLeadership {
    pub fn new(lease: LeaderLease) -> Self {
        Self { lease }
    }
}

#[async_trait]
impl Leadership for LeaseLeadership {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn is_leader(&self) -> bool {
        match self.lease.ensure().await {
            Ok(held) => held,
            Err(error) => {
                // A replica that cannot reach the lease cannot prove it is
                // the leader, so it demotes itself.
                tracing::warn!(%error, "error refreshing the leader lease");
                false
            }
        }
    }
}
