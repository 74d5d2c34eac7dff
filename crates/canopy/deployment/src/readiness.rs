//! Readiness checks: probe streams gating "ready for traffic".
//!
//! The executor is an external collaborator; this module owns the running
//! subscriptions and guarantees every probe is cancelled on every exit
//! path, including controller teardown.

use crate::error::Result;
use canopy_types::{DeploymentId, InstanceId, ReadinessCheck, TaskId};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Key of one running readiness subscription.
pub type SubscriptionKey = (TaskId, String);

/// Effective readiness check for one task of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheckSpec {
    pub check: ReadinessCheck,
    pub instance_id: InstanceId,
    pub task_id: TaskId,
}

impl ReadinessCheckSpec {
    pub fn for_task(check: &ReadinessCheck, instance_id: &InstanceId, task_id: &TaskId) -> Self {
        Self {
            check: check.clone(),
            instance_id: instance_id.clone(),
            task_id: task_id.clone(),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        (self.task_id.clone(), self.check.name.clone())
    }
}

/// One result emitted by a readiness probe stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheckResult {
    /// Name of the readiness check
    pub name: String,
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    pub ready: bool,
}

/// Readiness progress notification for the parent deployment supervisor.
#[derive(Debug, Clone)]
pub struct ReadinessCheckUpdate {
    pub deployment_id: DeploymentId,
    pub result: ReadinessCheckResult,
}

/// Executes one readiness check spec as a lazy result stream.
///
/// The stream yields one result per probe round and ends when the probe
/// source completes; dropping it cancels the probe.
pub trait ReadinessCheckExecutor: Send + Sync {
    fn execute(&self, spec: ReadinessCheckSpec) -> BoxStream<'static, Result<ReadinessCheckResult>>;
}

/// Event a subscription forwards into its owning controller.
#[derive(Debug)]
pub enum SubscriptionEvent {
    Result(ReadinessCheckResult),
    /// Stream completed; carries the error message when it failed.
    Done(SubscriptionKey, Option<String>),
}

/// Registry of running readiness subscriptions, keyed by task and check
/// name.
///
/// Each subscription is a background task consuming one probe stream;
/// dropping the registry aborts them all, so no probe outlives its
/// controller.
#[derive(Default)]
pub struct ReadinessSubscriptions {
    subscriptions: HashMap<SubscriptionKey, JoinHandle<()>>,
}

impl ReadinessSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Start consuming `stream`; every result and exactly one completion
    /// notice are forwarded on `events`.
    pub fn subscribe<M>(
        &mut self,
        key: SubscriptionKey,
        mut stream: BoxStream<'static, Result<ReadinessCheckResult>>,
        events: mpsc::UnboundedSender<M>,
    ) where
        M: From<SubscriptionEvent> + Send + 'static,
    {
        if self.subscriptions.contains_key(&key) {
            warn!(task_id = %key.0, check = %key.1, "Readiness subscription already running");
            return;
        }

        debug!(task_id = %key.0, check = %key.1, "Subscribing to readiness check");
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let failure = loop {
                match stream.next().await {
                    Some(Ok(result)) => {
                        if events.send(SubscriptionEvent::Result(result).into()).is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => break Some(error.to_string()),
                    None => break None,
                }
            };
            let _ = events.send(SubscriptionEvent::Done(task_key, failure).into());
        });

        self.subscriptions.insert(key, handle);
    }

    /// Cancel and forget one subscription. Idempotent.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey) {
        if let Some(handle) = self.subscriptions.remove(key) {
            handle.abort();
            debug!(task_id = %key.0, check = %key.1, "Readiness subscription cancelled");
        }
    }

    /// Forget a subscription whose stream already completed.
    pub fn forget(&mut self, key: &SubscriptionKey) {
        self.subscriptions.remove(key);
    }

    /// Cancel every subscription.
    pub fn clear(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

impl Drop for ReadinessSubscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}
