// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Job-flow extension for the queue.
//!
//! A flow is a tree of jobs where a parent may only run after every child
//! finished, with the child outputs merged into the parent's input. The
//! bookkeeping lives in one Redis hash per parent plus a list collecting the
//! child outputs; the extension is kept in this crate so that all Redis
//! access stays behind the queue interface.

use std::collections::HashMap;

use backoff::future::retry;
use redis::AsyncCommands;
use snafu::ResultExt;
use uuid::Uuid;

use super::{
    ConnectionSnafu, InvalidPayloadSnafu, Job, JobKind, JobQueue, QueueError,
    QueueName,
};

/// Flow bookkeeping keys outlive the longest expected run by a wide margin.
const FLOW_KEY_TTL_SECONDS: usize = 2 * 24 * 60 * 60;

/// Tree of dependent jobs. Leaves run first; every parent runs once, after
/// all of its children, with their merged outputs as input.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowJob {
    pub queue: QueueName,
    pub kind: JobKind,
    pub data: serde_json::Value,
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    pub fn new(queue: QueueName, kind: JobKind, data: serde_json::Value) -> Self {
        Self {
            queue,
            kind,
            data,
            children: vec![],
        }
    }

    pub fn with_child(mut self, child: FlowJob) -> Self {
        self.children.push(child);
        self
    }
}

#[derive(Debug)]
struct FlowHash {
    key: String,
    queue: QueueName,
    kind: JobKind,
    data: String,
    parent: Option<String>,
    remaining: usize,
}

#[derive(Debug)]
struct FlowPlan {
    hashes: Vec<FlowHash>,
    leaves: Vec<(QueueName, Job)>,
}

fn plan_flow(namespace: &str, root: &FlowJob) -> Result<FlowPlan, QueueError> {
    let mut plan = FlowPlan {
        hashes: vec![],
        leaves: vec![],
    };
    let mut stack: Vec<(&FlowJob, Option<String>)> = vec![(root, None)];
    while let Some((node, parent)) = stack.pop() {
        if node.children.is_empty() {
            let mut job = Job::new(node.kind, node.data.clone());
            job.parent = parent;
            plan.leaves.push((node.queue, job));
        } else {
            let key = format!("{}:flow:{}", namespace, Uuid::new_v4());
            plan.hashes.push(FlowHash {
                key: key.clone(),
                queue: node.queue,
                kind: node.kind,
                data: serde_json::to_string(&node.data)
                    .context(InvalidPayloadSnafu)?,
                parent,
                remaining: node.children.len(),
            });
            for child in &node.children {
                stack.push((child, Some(key.clone())));
            }
        }
    }
    Ok(plan)
}

/// Splices array outputs and appends scalar ones, in completion order.
fn merge_child_outputs(raw: &[String]) -> Result<Vec<serde_json::Value>, QueueError> {
    let mut input = vec![];
    for encoded in raw {
        let value: serde_json::Value =
            serde_json::from_str(encoded).context(InvalidPayloadSnafu)?;
        match value {
            serde_json::Value::Array(items) => input.extend(items),
            other => input.push(other),
        }
    }
    Ok(input)
}

impl JobQueue {
    /// Stores the flow bookkeeping and enqueues the leaf jobs.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn enqueue_flow(&self, flow: &FlowJob) -> Result<(), QueueError> {
        let plan = plan_flow(self.namespace(), flow)?;
        for hash in &plan.hashes {
            self.write_flow_hash(hash).await?;
        }
        for (queue, job) in &plan.leaves {
            self.push_job(queue, job).await?;
        }
        Ok(())
    }

    /// Records the output of a finished job. When the job was the last
    /// outstanding child of a flow parent, the parent is enqueued with every
    /// child output merged into its input and the bookkeeping is dropped.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn complete(
        &self,
        job: &Job,
        output: &serde_json::Value,
    ) -> Result<(), QueueError> {
        let flow_key = match &job.parent {
            Some(key) => key.clone(),
            None => return Ok(()),
        };
        let results_key = format!("{}:results", flow_key);
        let payload = serde_json::to_string(output).context(InvalidPayloadSnafu)?;

        retry(self.backoff(), || async {
            tracing::trace!(results_key, "recording child output");
            let mut connection = self.connection();
            let _: usize = connection.rpush(&results_key, &payload).await?;
            let _: bool = connection
                .expire(&results_key, FLOW_KEY_TTL_SECONDS)
                .await?;
            Ok(())
        })
        .await
        .context(ConnectionSnafu)?;

        let remaining: i64 = retry(self.backoff(), || async {
            let remaining: i64 = self
                .connection()
                .hincr(&flow_key, "remaining", -1)
                .await?;
            Ok(remaining)
        })
        .await
        .context(ConnectionSnafu)?;

        if remaining > 0 {
            tracing::trace!(flow_key, remaining, "flow parent still waiting");
            return Ok(());
        }
        if remaining < 0 {
            tracing::warn!(flow_key, remaining, "flow parent already promoted");
            return Ok(());
        }
        self.promote_flow_parent(&flow_key, &results_key).await
    }

    async fn write_flow_hash(&self, hash: &FlowHash) -> Result<(), QueueError> {
        retry(self.backoff(), || async {
            tracing::trace!(key = %hash.key, "writing flow entry");
            let fields = [
                ("queue", hash.queue.as_str().to_owned()),
                ("kind", hash.kind.as_str().to_owned()),
                ("data", hash.data.clone()),
                ("parent", hash.parent.clone().unwrap_or_default()),
                ("remaining", hash.remaining.to_string()),
            ];
            let mut connection = self.connection();
            let _: () = connection.hset_multiple(&hash.key, &fields).await?;
            let _: bool = connection
                .expire(&hash.key, FLOW_KEY_TTL_SECONDS)
                .await?;
            Ok(())
        })
        .await
        .context(ConnectionSnafu)
    }

    async fn promote_flow_parent(
        &self,
        flow_key: &str,
        results_key: &str,
    ) -> Result<(), QueueError> {
        let fields: HashMap<String, String> = retry(self.backoff(), || async {
            let fields: HashMap<String, String> =
                self.connection().hgetall(flow_key).await?;
            Ok(fields)
        })
        .await
        .context(ConnectionSnafu)?;

        let queue = fields
            .get("queue")
            .and_then(|name| QueueName::from_name(name))
            .ok_or_else(|| QueueError::CorruptedFlow {
                key: flow_key.to_owned(),
                field: "queue".to_owned(),
            })?;
        let kind = fields
            .get("kind")
            .and_then(|name| JobKind::from_name(name))
            .ok_or_else(|| QueueError::CorruptedFlow {
                key: flow_key.to_owned(),
                field: "kind".to_owned(),
            })?;
        let data = fields
            .get("data")
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .context(InvalidPayloadSnafu)?
            .unwrap_or(serde_json::Value::Null);
        let parent = fields.get("parent").filter(|p| !p.is_empty()).cloned();

        let raw_results: Vec<String> = retry(self.backoff(), || async {
            let raw: Vec<String> =
                self.connection().lrange(results_key, 0, -1).await?;
            Ok(raw)
        })
        .await
        .context(ConnectionSnafu)?;

        let mut job = Job::new(kind, data);
        job.input = merge_child_outputs(&raw_results)?;
        job.parent = parent;
        tracing::trace!(flow_key, job_id = %job.id, "promoting flow parent");
        self.push_job(&queue, &job).await?;

        retry(self.backoff(), || async {
            let _: usize = self
                .connection()
                .del(&[flow_key, results_key])
                .await?;
            Ok(())
        })
        .await
        .context(ConnectionSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_flow() -> FlowJob {
        FlowJob::new(
            QueueName::Validation,
            JobKind::ValidateRelays,
            json!(null),
        )
        .with_child(
            FlowJob::new(QueueName::Validation, JobKind::FilterRelays, json!(null))
                .with_child(FlowJob::new(
                    QueueName::Validation,
                    JobKind::FetchRelays,
                    json!(null),
                )),
        )
    }

    #[test]
    fn plan_chain_links_each_stage_to_its_parent() {
        let plan = plan_flow("test", &chain_flow()).unwrap();
        assert_eq!(plan.hashes.len(), 2);
        assert_eq!(plan.leaves.len(), 1);

        let root = &plan.hashes[0];
        assert_eq!(root.kind, JobKind::ValidateRelays);
        assert_eq!(root.remaining, 1);
        assert!(root.parent.is_none());
        assert!(root.key.starts_with("test:flow:"));

        let middle = &plan.hashes[1];
        assert_eq!(middle.kind, JobKind::FilterRelays);
        assert_eq!(middle.remaining, 1);
        assert_eq!(middle.parent.as_deref(), Some(root.key.as_str()));

        let (queue, leaf) = &plan.leaves[0];
        assert_eq!(*queue, QueueName::Validation);
        assert_eq!(leaf.kind, JobKind::FetchRelays);
        assert_eq!(leaf.parent.as_deref(), Some(middle.key.as_str()));
    }

    #[test]
    fn plan_counts_every_direct_child() {
        let flow = FlowJob::new(
            QueueName::Verification,
            JobKind::ConfirmVerification,
            json!({"validated_at": 1}),
        )
        .with_child(FlowJob::new(
            QueueName::Verification,
            JobKind::VerifyRelays,
            json!(["A"]),
        ))
        .with_child(FlowJob::new(
            QueueName::Verification,
            JobKind::VerifyRelays,
            json!(["B"]),
        ));
        let plan = plan_flow("test", &flow).unwrap();
        assert_eq!(plan.hashes.len(), 1);
        assert_eq!(plan.hashes[0].remaining, 2);
        assert_eq!(plan.leaves.len(), 2);
        for (_, leaf) in &plan.leaves {
            assert_eq!(
                leaf.parent.as_deref(),
                Some(plan.hashes[0].key.as_str())
            );
        }
    }

    #[test]
    fn merge_splices_arrays_and_appends_scalars() {
        let raw = vec![
            r#"[1,2]"#.to_owned(),
            r#"{"fingerprint":"A"}"#.to_owned(),
            r#"[]"#.to_owned(),
            r#"3"#.to_owned(),
        ];
        let merged = merge_child_outputs(&raw).unwrap();
        assert_eq!(
            merged,
            vec![json!(1), json!(2), json!({"fingerprint": "A"}), json!(3)]
        );
    }

    #[test]
    fn merge_rejects_invalid_json() {
        let raw = vec!["not json".to_owned()];
        assert!(matches!(
            merge_child_outputs(&raw).unwrap_err(),
            QueueError::InvalidPayload { .. }
        ));
    }
}
