use super::{Autoscaler, EventBus, HostedQueue, MetricSink, ScalingGroupState, TaskStore, WorkflowExecutor, WorkflowHandle};
use crate::error::AwcpError;
use crate::models::{KvValue, TaskId};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory `TaskStore`, keyed by task id with a client-id secondary index.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Arc<RwLock<HashMap<TaskId, BTreeMap<String, KvValue>>>>,
    by_client: Arc<RwLock<HashMap<String, Vec<TaskId>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, task_id: &TaskId, record: BTreeMap<String, KvValue>) -> Result<()> {
        if let Some(KvValue::S(client_id)) = record.get("client_id") {
            if !client_id.is_empty() {
                let mut index = self.by_client.write().await;
                let entry = index.entry(client_id.clone()).or_default();
                if !entry.contains(task_id) {
                    entry.push(task_id.clone());
                }
            }
        }
        self.records.write().await.insert(task_id.clone(), record);
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<BTreeMap<String, KvValue>>> {
        Ok(self.records.read().await.get(task_id).cloned())
    }

    async fn list_by_client(&self, client_id: &str) -> Result<Vec<BTreeMap<String, KvValue>>> {
        let index = self.by_client.read().await;
        let records = self.records.read().await;
        Ok(index
            .get(client_id)
            .into_iter()
            .flatten()
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }
}

/// In-memory `WorkflowExecutor`. Never fails: offload in the local adapter
/// always "succeeds" since there is nowhere for the execution to actually
/// run, matching the fail-soft contract the distributor expects.
pub struct InMemoryWorkflowExecutor {
    executions: Arc<RwLock<Vec<WorkflowHandle>>>,
}

impl Default for InMemoryWorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkflowExecutor {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait]
impl WorkflowExecutor for InMemoryWorkflowExecutor {
    async fn start_execution(
        &self,
        state_machine: &str,
        client_id: Option<&str>,
        _input: &serde_json::Value,
    ) -> Result<WorkflowHandle> {
        let unix_ts = chrono::Utc::now().timestamp();
        let execution_name = match client_id {
            Some(cid) if !cid.is_empty() => format!("{cid}-{state_machine}-{unix_ts}"),
            _ => format!("system-{state_machine}-{unix_ts}"),
        };
        let handle = WorkflowHandle {
            reference: format!("arn:local:states:execution:{execution_name}"),
            execution_name,
        };
        self.executions.write().await.push(handle.clone());
        Ok(handle)
    }
}

struct QueueState {
    fifo: bool,
    messages: VecDeque<serde_json::Value>,
    seen_dedup_ids: std::collections::HashSet<String>,
}

/// In-memory `HostedQueue`. FIFO dedup is enforced here per-queue (a real
/// SQS FIFO queue dedups within a 5-minute window; this adapter dedups for
/// the lifetime of the process, which is sufficient for tests).
#[derive(Default)]
pub struct InMemoryHostedQueue {
    queues: Arc<RwLock<HashMap<String, QueueState>>>,
}

impl InMemoryHostedQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostedQueue for InMemoryHostedQueue {
    async fn create_queue(&self, name: &str, fifo: bool) -> Result<String> {
        let url_name = if fifo && !name.ends_with(".fifo") {
            format!("{name}.fifo")
        } else {
            name.to_string()
        };
        let mut queues = self.queues.write().await;
        queues.entry(url_name.clone()).or_insert_with(|| QueueState {
            fifo,
            messages: VecDeque::new(),
            seen_dedup_ids: std::collections::HashSet::new(),
        });
        Ok(format!("local://queues/{url_name}"))
    }

    async fn send(
        &self,
        queue_url: &str,
        body: &serde_json::Value,
        dedup_id: Option<&str>,
        _group_id: Option<&str>,
    ) -> Result<()> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_url)
            .ok_or_else(|| AwcpError::not_found(format!("queue {queue_url} does not exist")))?;

        if queue.fifo {
            let dedup_id = dedup_id
                .ok_or_else(|| AwcpError::invalid("FIFO queue send requires a dedup id"))?;
            if !queue.seen_dedup_ids.insert(dedup_id.to_string()) {
                // Duplicate within the dedup window: silently accepted, not re-enqueued.
                return Ok(());
            }
        }
        queue.messages.push_back(body.clone());
        Ok(())
    }

    async fn receive(&self, queue_url: &str, max_messages: u32) -> Result<Vec<serde_json::Value>> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_url)
            .ok_or_else(|| AwcpError::not_found(format!("queue {queue_url} does not exist")))?;
        let mut out = Vec::new();
        for _ in 0..max_messages {
            match queue.messages.pop_front() {
                Some(m) => out.push(m),
                None => break,
            }
        }
        Ok(out)
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.queues
            .write()
            .await
            .remove(queue_url)
            .map(|_| ())
            .ok_or_else(|| AwcpError::not_found(format!("queue {queue_url} does not exist")))
    }
}

struct Rule {
    pattern: serde_json::Value,
    targets: Vec<String>,
}

/// In-memory `EventBus`. Published events are matched against registered
/// rule patterns by simple key/value containment, enough to exercise
/// routing logic in tests without an actual pattern-matching engine.
#[derive(Default)]
pub struct InMemoryEventBus {
    rules: Arc<RwLock<HashMap<String, Rule>>>,
    published: Arc<RwLock<Vec<serde_json::Value>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_events(&self) -> Vec<serde_json::Value> {
        self.published.read().await.clone()
    }

    pub async fn matched_targets(&self, event: &serde_json::Value) -> Vec<String> {
        let rules = self.rules.read().await;
        let mut targets = Vec::new();
        for rule in rules.values() {
            if pattern_matches(&rule.pattern, event) {
                targets.extend(rule.targets.iter().cloned());
            }
        }
        targets
    }
}

fn pattern_matches(pattern: &serde_json::Value, event: &serde_json::Value) -> bool {
    match (pattern, event) {
        (serde_json::Value::Object(pmap), serde_json::Value::Object(emap)) => {
            pmap.iter().all(|(k, v)| match emap.get(k) {
                Some(ev) => pattern_matches(v, ev),
                None => false,
            })
        }
        (p, e) => p == e,
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, source: &str, detail_type: &str, detail: &serde_json::Value) -> Result<()> {
        let envelope = serde_json::json!({
            "source": source,
            "detail-type": detail_type,
            "detail": detail,
        });
        self.published.write().await.push(envelope);
        Ok(())
    }

    async fn create_rule(&self, name: &str, event_pattern: &serde_json::Value) -> Result<()> {
        let mut rules = self.rules.write().await;
        rules
            .entry(name.to_string())
            .or_insert_with(|| Rule {
                pattern: event_pattern.clone(),
                targets: Vec::new(),
            })
            .pattern = event_pattern.clone();
        Ok(())
    }

    async fn add_target(&self, rule_name: &str, target_arn: &str) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_name)
            .ok_or_else(|| AwcpError::not_found(format!("rule {rule_name} not registered")))?;
        rule.targets.push(target_arn.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedMetric {
    pub namespace: String,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub dimensions: BTreeMap<String, String>,
}

/// In-memory `MetricSink` that just accumulates samples for inspection.
#[derive(Default)]
pub struct InMemoryMetricSink {
    samples: Arc<RwLock<Vec<RecordedMetric>>>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn samples(&self) -> Vec<RecordedMetric> {
        self.samples.read().await.clone()
    }
}

#[async_trait]
impl MetricSink for InMemoryMetricSink {
    async fn put_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        value: f64,
        unit: &str,
        dimensions: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.samples.write().await.push(RecordedMetric {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            value,
            unit: unit.to_string(),
            dimensions: dimensions.clone(),
        });
        Ok(())
    }
}

struct GroupState {
    desired: AtomicU64,
    min: u32,
    max: u32,
}

/// In-memory `Autoscaler` seeded with a single default group; real
/// deployments back this with an Auto Scaling Groups (or k8s HPA) client.
pub struct InMemoryAutoscaler {
    groups: Arc<RwLock<HashMap<String, GroupState>>>,
}

impl Default for InMemoryAutoscaler {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAutoscaler {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_group(&self, group_id: impl Into<String>, desired: u32, min: u32, max: u32) {
        self.groups.write().await.insert(
            group_id.into(),
            GroupState {
                desired: AtomicU64::new(desired as u64),
                min,
                max,
            },
        );
    }
}

#[async_trait]
impl Autoscaler for InMemoryAutoscaler {
    async fn describe(&self, group_id: &str) -> Result<ScalingGroupState> {
        let groups = self.groups.read().await;
        let group = groups
            .get(group_id)
            .ok_or_else(|| AwcpError::not_found(format!("autoscaling group {group_id} unknown")))?;
        Ok(ScalingGroupState {
            desired: group.desired.load(Ordering::SeqCst) as u32,
            min: group.min,
            max: group.max,
        })
    }

    async fn set_desired_capacity(&self, group_id: &str, desired: u32) -> Result<()> {
        let groups = self.groups.read().await;
        let group = groups
            .get(group_id)
            .ok_or_else(|| AwcpError::not_found(format!("autoscaling group {group_id} unknown")))?;
        let clamped = desired.clamp(group.min, group.max);
        group.desired.store(clamped as u64, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_queue_dedups_within_process_lifetime() {
        let q = InMemoryHostedQueue::new();
        let url = q.create_queue("orders", true).await.unwrap();
        q.send(&url, &serde_json::json!({"n": 1}), Some("dedup-1"), Some("group-a"))
            .await
            .unwrap();
        q.send(&url, &serde_json::json!({"n": 2}), Some("dedup-1"), Some("group-a"))
            .await
            .unwrap();
        let received = q.receive(&url, 10).await.unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn autoscaler_clamps_to_group_bounds() {
        let a = InMemoryAutoscaler::new();
        a.register_group("asg-1", 2, 1, 5).await;
        a.set_desired_capacity("asg-1", 100).await.unwrap();
        let state = a.describe("asg-1").await.unwrap();
        assert_eq!(state.desired, 5);
    }
}
