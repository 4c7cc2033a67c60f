// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Single-holder lease on a Redis key, used for leader election.
//!
//! The lease is a plain `SET NX PX` claim. Refreshing only ever extends the
//! key's lifetime; a holder that lost the lease observes another id under
//! the key and demotes itself.

use backoff::future::retry;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use snafu::ResultExt;
use std::time::Duration;
use uuid::Uuid;

use super::{ConnectionSnafu, JobQueue, QueueError};

#[derive(Clone)]
pub struct LeaderLease {
    queue: JobQueue,
    key: String,
    id: String,
    ttl: Duration,
}

impl JobQueue {
    /// Creates a lease handle sharing this queue's connection.
    pub fn lease(&self, ttl: Duration) -> LeaderLease {
        LeaderLease {
            queue: self.clone(),
            key: format!("{}:leader", self.namespace()),
            id: Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

impl LeaderLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims the lease when free, or extends it when already held by this
    /// instance. Returns whether this instance is the current holder.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn ensure(&self) -> Result<bool, QueueError> {
        let ttl_millis = self.ttl.as_millis() as usize;
        let held = retry(self.queue.backoff(), || async {
            let mut connection = self.queue.connection();
            let options = SetOptions::default()
                .conditional_set(ExistenceCheck::NX)
                .with_expiration(SetExpiry::PX(ttl_millis));
            let claimed: Option<String> = connection
                .set_options(&self.key, &self.id, options)
                .await?;
            if claimed.is_some() {
                tracing::trace!(key = %self.key, "lease claimed");
                return Ok(true);
            }
            let holder: Option<String> = connection.get(&self.key).await?;
            if holder.as_deref() == Some(self.id.as_str()) {
                let _: bool = connection.pexpire(&self.key, ttl_millis).await?;
                return Ok(true);
            }
            Ok(false)
        })
        .await
        .context(ConnectionSnafu)?;
        Ok(held)
    }

    /// Drops the lease if this instance still holds it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn release(&self) -> Result<(), QueueError> {
        retry(self.queue.backoff(), || async {
            let mut connection = self.queue.connection();
            let holder: Option<String> = connection.get(&self.key).await?;
            if holder.as_deref() == Some(self.id.as_str()) {
                let _: usize = connection.del(&self.key).await?;
            }
            Ok(())
        })
        .await
        .context(ConnectionSnafu)
    }
}

impl std::fmt::Debug for LeaderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .finish()
    }
}
