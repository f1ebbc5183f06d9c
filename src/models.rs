//! Core entities shared across components: agents, tasks, and the typed
//! key-value encoding used to mirror state into an external store.

use crate::ownership::Ownership;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub type AgentId = String;
pub type TaskId = String;

/// A worker capable of executing tasks that match its capability set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub capabilities: HashSet<String>,
    pub capacity: u32,
    /// Tasks currently assigned, oldest first.
    pub current_tasks: IndexSet<TaskId>,
    pub ownership: Ownership,
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, capabilities: HashSet<String>, capacity: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            capacity,
            current_tasks: IndexSet::new(),
            ownership: Ownership::system(),
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.current_tasks.len() as f64 / self.capacity as f64
        }
    }

    pub fn has_spare_capacity(&self) -> bool {
        (self.current_tasks.len() as u32) < self.capacity
    }

    pub fn satisfies(&self, requirements: &HashSet<String>) -> bool {
        requirements.is_subset(&self.capabilities)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: String,
    pub requirements: HashSet<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub client_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque task payload, kept as JSON at the boundary and not
    /// interpreted by the distributor itself.
    pub payload: serde_json::Value,
    /// Reference to a durable workflow execution, if this task was
    /// offloaded to one via `start_workflow`.
    pub workflow_ref: Option<String>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        requirements: HashSet<String>,
        priority: i64,
        client_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            requirements,
            priority,
            status: TaskStatus::Pending,
            assigned_to: None,
            client_id,
            submitted_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            payload,
            workflow_ref: None,
        }
    }

    pub fn queue_key(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| "global".to_string())
    }
}

/// Typed encoding mirroring the attribute-value scheme of a DynamoDB-style
/// document store: `String`/`Number`/`Bool`/`Map`/`List`, so round-tripping
/// through an external KV store preserves type information JSON alone
/// would erase (e.g. distinguishing `"3"` from `3`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum KvValue {
    S(String),
    N(f64),
    B(bool),
    M(BTreeMap<String, KvValue>),
    L(Vec<KvValue>),
}

impl KvValue {
    /// Encodes a `serde_json::Value` into the typed KV representation.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => KvValue::S(String::new()),
            serde_json::Value::Bool(b) => KvValue::B(*b),
            serde_json::Value::Number(n) => KvValue::N(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => KvValue::S(s.clone()),
            serde_json::Value::Array(items) => {
                KvValue::L(items.iter().map(KvValue::from_json).collect())
            }
            serde_json::Value::Object(map) => KvValue::M(
                map.iter()
                    .map(|(k, v)| (k.clone(), KvValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Decodes back to `serde_json::Value`. Not a perfect inverse of
    /// `from_json` for `Null` (encoded as an empty string), mirroring the
    /// lossy behavior of the system this replaces.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            KvValue::S(s) => serde_json::Value::String(s.clone()),
            KvValue::N(n) => serde_json::json!(n),
            KvValue::B(b) => serde_json::Value::Bool(*b),
            KvValue::M(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            KvValue::L(items) => serde_json::Value::Array(items.iter().map(KvValue::to_json).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_round_trip_through_json() {
        let original = serde_json::json!({
            "name": "acme",
            "count": 3,
            "active": true,
            "tags": ["a", "b"],
        });
        let encoded = KvValue::from_json(&original);
        let decoded = encoded.to_json();
        assert_eq!(original, decoded);
    }

    #[test]
    fn agent_capacity_respected() {
        let mut agent = Agent::new("a1", HashSet::from(["rust".to_string()]), 1);
        assert!(agent.has_spare_capacity());
        agent.current_tasks.insert("t1".to_string());
        assert!(!agent.has_spare_capacity());
    }

    #[test]
    fn satisfies_requires_subset() {
        let agent = Agent::new(
            "a1",
            HashSet::from(["rust".to_string(), "gpu".to_string()]),
            1,
        );
        assert!(agent.satisfies(&HashSet::from(["rust".to_string()])));
        assert!(!agent.satisfies(&HashSet::from(["java".to_string()])));
    }
}
