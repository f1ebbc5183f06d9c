//! Quality Controller: scores agent output against registered metrics and
//! verification steps, records feedback, and biases task routing toward
//! historically well-performing agents.

use crate::models::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A named evaluator producing a score in `[0, 1]` plus a pass/fail
/// threshold. Evaluator errors count as a failed metric rather than
/// aborting the rest of the evaluation.
pub struct QualityMetric {
    pub name: String,
    pub threshold: f64,
    pub evaluator: Box<dyn Fn(&serde_json::Value) -> Result<f64, String> + Send + Sync>,
}

/// A verification step scoped to one task type, returning pass/fail plus
/// human-readable feedback.
pub struct VerificationStep {
    pub task_type: String,
    pub check: Box<dyn Fn(&serde_json::Value) -> (bool, String) + Send + Sync>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricOutcome {
    pub score: Option<f64>,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub passed: bool,
    pub overall_score: f64,
    pub metrics: HashMap<String, MetricOutcome>,
    pub verification: Vec<VerificationOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub task_id: String,
    pub task_type: Option<String>,
    pub agent_id: Option<AgentId>,
    pub source: String,
    pub content: String,
    pub rating: Option<f64>,
    pub score: Option<f64>,
    pub client_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityStandards {
    pub thresholds: HashMap<String, f64>,
}

#[derive(Default)]
struct State {
    feedback: HashMap<String, Vec<FeedbackRecord>>,
    anonymized_feedback: HashMap<String, Vec<FeedbackRecord>>,
    client_standards: HashMap<String, QualityStandards>,
}

/// Cloneable handle over shared quality-control state, following the same
/// `Arc<RwLock<_>>`-behind-a-handle shape used by the other components.
#[derive(Clone)]
pub struct QualityController {
    metrics: Arc<RwLock<Vec<QualityMetric>>>,
    verifications: Arc<RwLock<Vec<VerificationStep>>>,
    state: Arc<RwLock<State>>,
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityController {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Vec::new())),
            verifications: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    pub async fn register_metric(&self, metric: QualityMetric) {
        self.metrics.write().await.push(metric);
    }

    pub async fn add_verification(&self, step: VerificationStep) {
        self.verifications.write().await.push(step);
    }

    /// Scores `output` against every registered metric and every
    /// verification step scoped to `task_type`. `passed` is true iff every
    /// metric clears its threshold and every verification step passes.
    pub async fn evaluate(&self, task_type: &str, output: &serde_json::Value) -> EvaluationReport {
        let metrics = self.metrics.read().await;
        let mut metric_scores = Vec::new();
        let mut outcomes = HashMap::new();
        let mut passed = true;

        for metric in metrics.iter() {
            match (metric.evaluator)(output) {
                Ok(score) => {
                    let metric_passed = score >= metric.threshold;
                    if !metric_passed {
                        passed = false;
                    }
                    metric_scores.push(score);
                    outcomes.insert(
                        metric.name.clone(),
                        MetricOutcome {
                            score: Some(score),
                            passed: metric_passed,
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    passed = false;
                    outcomes.insert(
                        metric.name.clone(),
                        MetricOutcome {
                            score: None,
                            passed: false,
                            error: Some(e),
                        },
                    );
                }
            }
        }

        let overall_score = if metric_scores.is_empty() {
            0.0
        } else {
            metric_scores.iter().sum::<f64>() / metric_scores.len() as f64
        };

        let verifications = self.verifications.read().await;
        let mut verification_outcomes = Vec::new();
        for step in verifications.iter().filter(|s| s.task_type == task_type) {
            let (step_passed, feedback) = (step.check)(output);
            if !step_passed {
                passed = false;
            }
            verification_outcomes.push(VerificationOutcome {
                passed: step_passed,
                feedback,
            });
        }

        EvaluationReport {
            passed,
            overall_score,
            metrics: outcomes,
            verification: verification_outcomes,
        }
    }

    pub async fn record_feedback(
        &self,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        agent_id: Option<AgentId>,
        source: impl Into<String>,
        content: impl Into<String>,
        rating: Option<f64>,
        score: Option<f64>,
        client_id: Option<String>,
    ) {
        let record = FeedbackRecord {
            task_id: task_id.into(),
            task_type: Some(task_type.into()),
            agent_id,
            source: source.into(),
            content: content.into(),
            rating,
            score,
            client_id,
            timestamp: Utc::now(),
        };
        let mut state = self.state.write().await;
        state
            .feedback
            .entry(record.task_id.clone())
            .or_default()
            .push(record);
    }

    /// Records feedback with no agent or source identity attached, for
    /// contexts where the reviewer must remain anonymous.
    pub async fn record_anonymized(
        &self,
        task_id: impl Into<String>,
        content: impl Into<String>,
        rating: Option<f64>,
    ) {
        let task_id = task_id.into();
        let record = FeedbackRecord {
            task_id: task_id.clone(),
            task_type: None,
            agent_id: None,
            source: "anonymous".to_string(),
            content: content.into(),
            rating,
            score: None,
            client_id: None,
            timestamp: Utc::now(),
        };
        let mut state = self.state.write().await;
        state
            .anonymized_feedback
            .entry(task_id)
            .or_default()
            .push(record);
    }

    pub async fn get_agent_feedback(&self, agent_id: &AgentId) -> Vec<FeedbackRecord> {
        let state = self.state.read().await;
        state
            .feedback
            .values()
            .flatten()
            .filter(|f| f.agent_id.as_ref() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// Picks the candidate with the highest mean historical score, scored
    /// only from feedback recorded against the same `task_type` — an
    /// agent's track record on unrelated work says nothing about how it
    /// will do on this one. Candidates with no matching feedback default
    /// to a score of `0.0`, matching the conservative tie-break of routing
    /// unproven agents last.
    pub async fn route_to_best_agent(&self, candidates: &[AgentId], task_type: &str) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        let state = self.state.read().await;
        let mut best: Option<(AgentId, f64)> = None;
        for agent_id in candidates {
            let scores: Vec<f64> = state
                .feedback
                .values()
                .flatten()
                .filter(|f| f.agent_id.as_ref() == Some(agent_id))
                .filter(|f| f.task_type.as_deref() == Some(task_type))
                .filter_map(|f| f.score)
                .collect();
            let mean = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            best = match best {
                Some((_, best_score)) if best_score >= mean => best,
                _ => Some((agent_id.clone(), mean)),
            };
        }
        best.map(|(id, _)| id)
    }

    pub async fn set_client_standards(&self, client_id: impl Into<String>, standards: QualityStandards) {
        self.state
            .write()
            .await
            .client_standards
            .insert(client_id.into(), standards);
    }

    pub async fn get_client_standards(&self, client_id: &str) -> Option<QualityStandards> {
        self.state.read().await.client_standards.get(client_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_metric() -> QualityMetric {
        QualityMetric {
            name: "length".to_string(),
            threshold: 0.5,
            evaluator: Box::new(|output| {
                Ok(output.as_str().map(|s| s.len() as f64 / 10.0).unwrap_or(0.0))
            }),
        }
    }

    #[tokio::test]
    async fn evaluate_fails_when_metric_below_threshold() {
        let qc = QualityController::new();
        qc.register_metric(passing_metric()).await;
        let report = qc.evaluate("any", &serde_json::json!("x")).await;
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn evaluate_passes_when_metric_meets_threshold() {
        let qc = QualityController::new();
        qc.register_metric(passing_metric()).await;
        let report = qc.evaluate("any", &serde_json::json!("0123456789")).await;
        assert!(report.passed);
        assert!((report.overall_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn evaluator_error_fails_without_aborting() {
        let qc = QualityController::new();
        qc.register_metric(QualityMetric {
            name: "broken".to_string(),
            threshold: 0.5,
            evaluator: Box::new(|_| Err("boom".to_string())),
        })
        .await;
        let report = qc.evaluate("any", &serde_json::json!("x")).await;
        assert!(!report.passed);
        assert_eq!(
            report.metrics.get("broken").unwrap().error.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn routes_to_agent_with_highest_mean_score() {
        let qc = QualityController::new();
        qc.record_feedback("t1", "build", Some("agent-a".to_string()), "system", "ok", None, Some(0.9), None)
            .await;
        qc.record_feedback("t2", "build", Some("agent-b".to_string()), "system", "ok", None, Some(0.2), None)
            .await;
        let best = qc
            .route_to_best_agent(&["agent-a".to_string(), "agent-b".to_string()], "build")
            .await;
        assert_eq!(best, Some("agent-a".to_string()));
    }

    #[tokio::test]
    async fn unscored_candidate_defaults_to_zero() {
        let qc = QualityController::new();
        qc.record_feedback("t1", "build", Some("agent-a".to_string()), "system", "ok", None, Some(-0.1), None)
            .await;
        let best = qc
            .route_to_best_agent(&["agent-a".to_string(), "agent-new".to_string()], "build")
            .await;
        assert_eq!(best, Some("agent-new".to_string()));
    }

    #[tokio::test]
    async fn feedback_from_a_different_task_type_is_not_averaged_in() {
        let qc = QualityController::new();
        qc.record_feedback("t1", "build", Some("agent-a".to_string()), "system", "ok", None, Some(0.1), None)
            .await;
        qc.record_feedback("t2", "review", Some("agent-a".to_string()), "system", "ok", None, Some(0.9), None)
            .await;
        let best = qc
            .route_to_best_agent(&["agent-a".to_string(), "agent-new".to_string()], "review")
            .await;
        assert_eq!(
            best,
            Some("agent-a".to_string()),
            "agent-a's review-type score must win, not its unrelated build-type score"
        );

        let best_for_deploy = qc
            .route_to_best_agent(&["agent-a".to_string(), "agent-new".to_string()], "deploy")
            .await;
        assert_eq!(
            best_for_deploy,
            Some("agent-new".to_string()),
            "neither candidate has deploy feedback, so both default to 0.0 and the first wins no ties"
        );
    }

    #[tokio::test]
    async fn get_agent_feedback_returns_superset_of_recorded_entries() {
        let qc = QualityController::new();
        qc.record_feedback("t1", "build", Some("agent-a".to_string()), "system", "first", None, Some(0.5), None)
            .await;
        let before = qc.get_agent_feedback(&"agent-a".to_string()).await;
        assert_eq!(before.len(), 1);

        qc.record_feedback("t2", "build", Some("agent-a".to_string()), "system", "second", None, Some(0.8), None)
            .await;
        let after = qc.get_agent_feedback(&"agent-a".to_string()).await;
        assert_eq!(after.len(), 2);
        assert!(before.iter().all(|b| after.contains(b)));
    }

    #[tokio::test]
    async fn record_anonymized_never_surfaces_an_agent_id() {
        let qc = QualityController::new();
        qc.record_anonymized("t1", "candid feedback", Some(0.4)).await;
        let agent_feedback = qc.get_agent_feedback(&"agent-a".to_string()).await;
        assert!(agent_feedback.is_empty());
    }
}
