//! Task Distributor: agent registry, owner-scoped priority queues, and the
//! capability/capacity matching loop that assigns pending tasks to agents.

use crate::error::AwcpError;
use crate::external::{TaskStore, WorkflowExecutor, WorkflowHandle};
use crate::models::{Agent, AgentId, KvValue, Task, TaskId, TaskStatus};
use crate::ownership::{OwnerId, Ownership};
use crate::quality::QualityController;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    priority: i64,
    submitted_at: DateTime<Utc>,
    task_id: TaskId,
}

fn queue_order(a: &QueueEntry, b: &QueueEntry) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.submitted_at.cmp(&b.submitted_at))
}

fn ownership_eligible(task: &Task, agent: &Agent) -> bool {
    match &task.client_id {
        Some(client_id) => matches!(&agent.ownership.owner_id, OwnerId::Tenant(id) if id == client_id),
        None => true,
    }
}

/// Cloneable handle over shared distributor state: agents, tasks, and
/// per-owner priority queues (a distinguished `"global"` key for tasks
/// with no `client_id`).
#[derive(Clone)]
pub struct Distributor {
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    queues: Arc<RwLock<HashMap<String, Vec<QueueEntry>>>>,
    quality: Option<QualityController>,
    workflow_executor: Option<Arc<dyn WorkflowExecutor>>,
    task_store: Option<Arc<dyn TaskStore>>,
    round_robin_cursor: Arc<AtomicUsize>,
}

impl Distributor {
    pub fn new(
        quality: Option<QualityController>,
        workflow_executor: Option<Arc<dyn WorkflowExecutor>>,
        task_store: Option<Arc<dyn TaskStore>>,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            quality,
            workflow_executor,
            task_store,
            round_robin_cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn register_agent(
        &self,
        agent_id: impl Into<String>,
        capabilities: HashSet<String>,
        capacity: u32,
        client_id: Option<String>,
    ) -> Result<()> {
        if capacity < 1 {
            return Err(AwcpError::invalid("agent capacity must be >= 1"));
        }
        let agent_id = agent_id.into();
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent_id) {
            return Err(AwcpError::invalid(format!("agent {agent_id} is already registered")));
        }
        let mut agent = Agent::new(agent_id.clone(), capabilities, capacity);
        agent.ownership = match client_id {
            Some(cid) => Ownership::client(cid),
            None => Ownership::system(),
        };
        tracing::info!(agent_id, capacity, "agent registered");
        agents.insert(agent_id, agent);
        Ok(())
    }

    pub async fn submit_task(
        &self,
        task_type: impl Into<String>,
        requirements: HashSet<String>,
        priority: i64,
        client_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<TaskId> {
        let task = Task::new(task_type, requirements, priority, client_id, payload);
        let task_id = task.task_id.clone();
        let queue_key = task.queue_key();
        let entry = QueueEntry {
            priority: task.priority,
            submitted_at: task.submitted_at,
            task_id: task_id.clone(),
        };

        {
            let mut queues = self.queues.write().await;
            let queue = queues.entry(queue_key.clone()).or_default();
            if queue.len() >= crate::constants::MAX_QUEUE_SIZE_PER_OWNER {
                return Err(AwcpError::Unavailable(format!(
                    "queue for owner {queue_key} is at capacity ({} pending tasks)",
                    crate::constants::MAX_QUEUE_SIZE_PER_OWNER
                )));
            }
            queue.push(entry);
            queue.sort_by(queue_order);
        }
        self.tasks.write().await.insert(task_id.clone(), task);
        self.mirror_task(&task_id).await;
        Ok(task_id)
    }

    /// Assigns as many pending tasks as possible and returns only the
    /// assignments made on this call. Passing `client_id` restricts
    /// matching to that tenant's queue; passing `None` processes every
    /// queue, round-robin across tenants so steady load never starves one
    /// tenant behind another (the cursor persists across calls).
    pub async fn distribute(&self, client_id: Option<&str>) -> Result<HashMap<TaskId, AgentId>> {
        let mut assignments = HashMap::new();

        if let Some(cid) = client_id {
            while let Some((task_id, agent_id)) = self.assign_one(cid).await? {
                self.mirror_task(&task_id).await;
                assignments.insert(task_id, agent_id);
            }
            return Ok(assignments);
        }

        let owner_keys = self.rotated_queue_keys().await;
        if owner_keys.is_empty() {
            return Ok(assignments);
        }

        loop {
            let mut progressed = false;
            for key in &owner_keys {
                if let Some((task_id, agent_id)) = self.assign_one(key).await? {
                    self.mirror_task(&task_id).await;
                    assignments.insert(task_id, agent_id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(assignments)
    }

    async fn rotated_queue_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.queues.read().await.keys().cloned().collect();
        if keys.is_empty() {
            return keys;
        }
        keys.sort();
        let cursor = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % keys.len();
        keys.rotate_left(cursor);
        keys
    }

    /// Scans one owner's queue front-to-back (priority desc, submission
    /// asc) and assigns the first task with at least one eligible agent.
    /// Returns `None` if no task in the queue currently has an eligible
    /// agent. Locks on `queues`/`tasks`/`agents` are held for the duration
    /// so a single assignment is atomic; the quality controller lookup
    /// reads its own independent lock and introduces no risk of deadlock.
    async fn assign_one(&self, owner_key: &str) -> Result<Option<(TaskId, AgentId)>> {
        let mut queues = self.queues.write().await;
        let queue = match queues.get(owner_key) {
            Some(q) if !q.is_empty() => q.clone(),
            _ => return Ok(None),
        };

        let mut tasks = self.tasks.write().await;
        let agents = self.agents.write().await;

        let mut chosen: Option<(usize, TaskId, AgentId)> = None;
        for (idx, entry) in queue.iter().enumerate() {
            let task = match tasks.get(&entry.task_id) {
                Some(t) if t.status == TaskStatus::Pending => t,
                _ => continue,
            };

            let mut candidates: Vec<AgentId> = agents
                .values()
                .filter(|a| ownership_eligible(task, a))
                .filter(|a| task.requirements.is_subset(&a.capabilities))
                .filter(|a| (a.current_tasks.len() as u32) < a.capacity)
                .map(|a| a.agent_id.clone())
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort();

            let agent_id = if candidates.len() == 1 {
                candidates.into_iter().next().unwrap()
            } else {
                let routed = match &self.quality {
                    Some(qc) => qc.route_to_best_agent(&candidates, &task.task_type).await,
                    None => None,
                };
                routed.unwrap_or_else(|| Self::min_utilization(&candidates, &agents))
            };

            chosen = Some((idx, entry.task_id.clone(), agent_id));
            break;
        }
        drop(agents);

        let (idx, task_id, agent_id) = match chosen {
            Some(v) => v,
            None => return Ok(None),
        };

        if let Some(task) = tasks.get_mut(&task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_to = Some(agent_id.clone());
            task.assigned_at = Some(Utc::now());
        }
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(&agent_id) {
            agent.current_tasks.insert(task_id.clone());
        }
        if let Some(q) = queues.get_mut(owner_key) {
            q.remove(idx);
        }

        tracing::debug!(task_id, agent_id, "task assigned");
        Ok(Some((task_id, agent_id)))
    }

    fn min_utilization(candidates: &[AgentId], agents: &HashMap<AgentId, Agent>) -> AgentId {
        candidates
            .iter()
            .min_by(|a, b| {
                let ua = agents.get(*a).map(Agent::utilization).unwrap_or(1.0);
                let ub = agents.get(*b).map(Agent::utilization).unwrap_or(1.0);
                ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .expect("candidates is non-empty")
    }

    /// Releases the agent's slot and moves the task to a terminal status.
    /// Only a task currently `Assigned` can complete — an already-terminal
    /// task (`Completed`/`Failed`) rejects a second transition rather than
    /// silently overwriting its outcome.
    pub async fn complete_task(&self, task_id: &str, outcome: TaskOutcome) -> Result<()> {
        let agent_id = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| AwcpError::not_found(format!("task {task_id} not found")))?;
            if task.status != TaskStatus::Assigned {
                return Err(AwcpError::invalid(format!(
                    "task {task_id} is already {:?}; cannot transition from a terminal state",
                    task.status
                )));
            }
            task.status = match outcome {
                TaskOutcome::Completed => TaskStatus::Completed,
                TaskOutcome::Failed => TaskStatus::Failed,
            };
            task.completed_at = Some(Utc::now());
            task.assigned_to.take()
        };

        if let Some(agent_id) = agent_id {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.current_tasks.shift_remove(task_id);
            }
        }

        self.mirror_task(task_id).await;
        Ok(())
    }

    /// Offloads to a durable external workflow when one is wired. Failures
    /// are logged and surfaced as `None`, leaving no partial state —
    /// matching the "null handle on failure" contract.
    pub async fn start_workflow(
        &self,
        state_machine: &str,
        input: Option<serde_json::Value>,
        client_id: Option<&str>,
    ) -> Option<WorkflowHandle> {
        let executor = self.workflow_executor.as_ref()?;
        let input = input.unwrap_or(serde_json::Value::Null);
        match executor.start_execution(state_machine, client_id, &input).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(state_machine, error = %e, "workflow start failed, returning no handle");
                None
            }
        }
    }

    pub async fn get_client_tasks(&self, client_id: &str) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.client_id.as_deref() == Some(client_id))
            .cloned()
            .collect()
    }

    /// Projects a task's current state into the external KV store, if one
    /// is configured. Failures are logged and swallowed — the durable
    /// mirror is best-effort and never blocks scheduling.
    async fn mirror_task(&self, task_id: &str) {
        let Some(store) = &self.task_store else { return };
        let Some(task) = self.tasks.read().await.get(task_id).cloned() else { return };

        let mut record = BTreeMap::new();
        record.insert("task_id".to_string(), KvValue::S(task.task_id.clone()));
        record.insert("type".to_string(), KvValue::S(task.task_type.clone()));
        record.insert("priority".to_string(), KvValue::N(task.priority as f64));
        record.insert(
            "requirements".to_string(),
            KvValue::L(task.requirements.iter().cloned().map(KvValue::S).collect()),
        );
        record.insert("status".to_string(), KvValue::S(format!("{:?}", task.status).to_lowercase()));
        record.insert("submitted_at".to_string(), KvValue::S(task.submitted_at.to_rfc3339()));
        if let Some(cid) = &task.client_id {
            record.insert("client_id".to_string(), KvValue::S(cid.clone()));
        }
        if let Some(agent_id) = &task.assigned_to {
            record.insert("assigned_to".to_string(), KvValue::S(agent_id.clone()));
        }
        if let Some(ts) = task.assigned_at {
            record.insert("assigned_at".to_string(), KvValue::S(ts.to_rfc3339()));
        }
        if let Some(ts) = task.completed_at {
            record.insert("completed_at".to_string(), KvValue::S(ts.to_rfc3339()));
        }

        if let Err(e) = store.put(&task.task_id, record).await {
            tracing::warn!(task_id, error = %e, "task store unavailable, continuing");
        }
    }
}
