//! Pluggable external collaborators.
//!
//! Every dependency the control plane has on infrastructure outside this
//! crate — a durable task mirror, a workflow engine, a metrics sink, an
//! autoscaler, a hosted queue, an event bus — is expressed as a narrow
//! `async_trait` here, the same way `session::SessionStore` abstracts
//! session persistence. Each trait ships an in-memory default
//! implementation so the crate is fully testable without network access;
//! a real deployment swaps in an HTTP- or SDK-backed implementation
//! without touching the component that calls through the trait.

mod memory;

pub use memory::{
    InMemoryAutoscaler, InMemoryEventBus, InMemoryHostedQueue, InMemoryMetricSink,
    InMemoryTaskStore, InMemoryWorkflowExecutor,
};

use crate::models::{KvValue, TaskId};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Durable mirror of task records, keyed by task id with a secondary
/// index by client id. Failures here are soft: the distributor logs and
/// continues rather than blocking assignment on store availability.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put(&self, task_id: &TaskId, record: BTreeMap<String, KvValue>) -> Result<()>;
    async fn get(&self, task_id: &TaskId) -> Result<Option<BTreeMap<String, KvValue>>>;
    async fn list_by_client(&self, client_id: &str) -> Result<Vec<BTreeMap<String, KvValue>>>;
}

/// A named external state machine execution, analogous to a Step
/// Functions execution ARN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowHandle {
    pub execution_name: String,
    pub reference: String,
}

/// Offloads a task to a durable external workflow. Naming follows
/// `{client_id}-{state_machine}-{unix_ts}` so repeated starts for the same
/// tenant/workflow pair remain distinguishable and sortable.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn start_execution(
        &self,
        state_machine: &str,
        client_id: Option<&str>,
        input: &serde_json::Value,
    ) -> Result<WorkflowHandle>;
}

/// A FIFO-capable hosted queue (SQS-shaped).
#[async_trait]
pub trait HostedQueue: Send + Sync {
    async fn create_queue(&self, name: &str, fifo: bool) -> Result<String>;
    async fn send(
        &self,
        queue_url: &str,
        body: &serde_json::Value,
        dedup_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<()>;
    async fn receive(&self, queue_url: &str, max_messages: u32) -> Result<Vec<serde_json::Value>>;
    async fn delete_queue(&self, queue_url: &str) -> Result<()>;
}

/// An event bus (EventBridge-shaped): publish plus rule/target registration.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, source: &str, detail_type: &str, detail: &serde_json::Value) -> Result<()>;
    async fn create_rule(&self, name: &str, event_pattern: &serde_json::Value) -> Result<()>;
    async fn add_target(&self, rule_name: &str, target_arn: &str) -> Result<()>;
}

/// Sink for resource-utilization samples (CloudWatch `PutMetricData`-shaped).
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn put_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        value: f64,
        unit: &str,
        dimensions: &BTreeMap<String, String>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScalingGroupState {
    pub desired: u32,
    pub min: u32,
    pub max: u32,
}

/// Autoscaling group control surface the resource monitor's feedback loop
/// drives at threshold transitions.
#[async_trait]
pub trait Autoscaler: Send + Sync {
    async fn describe(&self, group_id: &str) -> Result<ScalingGroupState>;
    async fn set_desired_capacity(&self, group_id: &str, desired: u32) -> Result<()>;
}
