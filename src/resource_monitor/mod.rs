//! Resource Monitor: per-owner usage sampling, threshold-transition
//! callbacks, autoscaling feedback, and linear-regression forecasting.

use crate::constants::{MIN_SAMPLES_FOR_FORECAST, RESOURCE_HISTORY_RETENTION_HOURS};
use crate::error::AwcpError;
use crate::external::{Autoscaler, MetricSink};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Status band a resource falls into relative to its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Normal,
    Warning,
    Critical,
}

impl Band {
    fn classify(utilization: f64, warning: f64, critical: f64) -> Self {
        if utilization >= critical {
            Band::Critical
        } else if utilization >= warning {
            Band::Warning
        } else {
            Band::Normal
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub resource_id: String,
    pub capacity: f64,
    pub used: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub status: Band,
    pub history: VecDeque<(DateTime<Utc>, f64)>,
    pub autoscaling_group: Option<String>,
    pub client_id: Option<String>,
}

impl Resource {
    pub fn utilization(&self) -> f64 {
        if self.capacity <= 0.0 {
            0.0
        } else {
            self.used / self.capacity
        }
    }
}

/// One point of a usage forecast: the projected value plus a 95%
/// confidence band derived from the regression's residual variance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ForecastPoint {
    pub hours_ahead: u32,
    pub predicted: f64,
    pub lower: f64,
    pub upper: f64,
}

pub type ThresholdCallback = Box<dyn Fn(&str, Band, f64) + Send + Sync>;

/// Supplies fresh usage readings for a registered resource when the
/// background sampler ticks. A real deployment backs this with an OS or
/// cloud-provider metrics query; tests can stub it with a closure.
#[async_trait]
pub trait UsageSampler: Send + Sync {
    async fn sample(&self, resource_id: &str, client_id: Option<&str>) -> Option<f64>;
}

struct SamplerState {
    shutdown_tx: mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Cloneable handle over shared resource-monitoring state.
#[derive(Clone)]
pub struct ResourceMonitor {
    resources: Arc<RwLock<HashMap<String, Resource>>>,
    callbacks: Arc<RwLock<HashMap<String, Vec<ThresholdCallback>>>>,
    metric_sink: Arc<dyn MetricSink>,
    autoscaler: Arc<dyn Autoscaler>,
    metric_namespace: String,
    sampler_state: Arc<Mutex<Option<SamplerState>>>,
}

impl ResourceMonitor {
    pub fn new(metric_sink: Arc<dyn MetricSink>, autoscaler: Arc<dyn Autoscaler>) -> Self {
        Self {
            resources: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            metric_sink,
            autoscaler,
            metric_namespace: "AgentBuilder/Resources".to_string(),
            sampler_state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metric_namespace = namespace.into();
        self
    }

    pub async fn register_resource(
        &self,
        resource_id: impl Into<String>,
        capacity: f64,
        warning: f64,
        critical: f64,
        client_id: Option<String>,
    ) -> Result<()> {
        if capacity <= 0.0 {
            return Err(AwcpError::invalid("resource capacity must be > 0"));
        }
        if warning >= critical || critical > 1.0 || warning <= 0.0 {
            return Err(AwcpError::invalid(
                "thresholds must satisfy 0 < warning < critical <= 1",
            ));
        }
        let resource_id = resource_id.into();
        let resource = Resource {
            resource_id: resource_id.clone(),
            capacity,
            used: 0.0,
            warning_threshold: warning,
            critical_threshold: critical,
            status: Band::Normal,
            history: VecDeque::new(),
            autoscaling_group: None,
            client_id,
        };
        self.resources.write().await.insert(resource_id, resource);
        Ok(())
    }

    pub async fn set_autoscaling_group(&self, resource_id: &str, group_id: impl Into<String>) -> Result<()> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(resource_id)
            .ok_or_else(|| AwcpError::not_found(format!("resource {resource_id} not registered")))?;
        resource.autoscaling_group = Some(group_id.into());
        Ok(())
    }

    pub async fn register_threshold_callback(&self, resource_id: impl Into<String>, callback: ThresholdCallback) {
        self.callbacks
            .write()
            .await
            .entry(resource_id.into())
            .or_default()
            .push(callback);
    }

    /// Appends a usage sample, recomputes the status band, and — only on a
    /// band transition — fires callbacks and consults the autoscaler.
    /// External sink/scaler failures are logged and swallowed; they never
    /// prevent the local state update.
    pub async fn update_usage(&self, resource_id: &str, used: f64, client_id: Option<&str>) -> Result<()> {
        let (previous_band, new_band, utilization, group, dims, warning_threshold) = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(resource_id)
                .ok_or_else(|| AwcpError::not_found(format!("resource {resource_id} not registered")))?;

            let now = Utc::now();
            resource.used = used;
            resource.history.push_back((now, used));
            let cutoff = now - Duration::hours(RESOURCE_HISTORY_RETENTION_HOURS);
            while resource
                .history
                .front()
                .map(|(ts, _)| *ts < cutoff)
                .unwrap_or(false)
            {
                resource.history.pop_front();
            }

            let utilization = resource.utilization();
            let previous_band = resource.status;
            let new_band = Band::classify(utilization, resource.warning_threshold, resource.critical_threshold);
            resource.status = new_band;

            let mut dims = BTreeMap::new();
            dims.insert("ResourceId".to_string(), resource_id.to_string());
            if let Some(cid) = client_id.or(resource.client_id.as_deref()) {
                dims.insert("ClientId".to_string(), cid.to_string());
            }

            (
                previous_band,
                new_band,
                utilization,
                resource.autoscaling_group.clone(),
                dims,
                resource.warning_threshold,
            )
        };

        if let Err(e) = self
            .metric_sink
            .put_metric(&self.metric_namespace, "ResourceUtilization", utilization, "Percent", &dims)
            .await
        {
            tracing::warn!(resource_id, error = %e, "metric sink unavailable, continuing");
        }

        if new_band != previous_band {
            let callbacks = self.callbacks.read().await;
            if let Some(fns) = callbacks.get(resource_id) {
                for cb in fns {
                    cb(resource_id, new_band, utilization);
                }
            }
            drop(callbacks);

            if let Some(group_id) = group {
                if let Err(e) = self
                    .apply_autoscaling_feedback(&group_id, new_band, utilization, warning_threshold)
                    .await
                {
                    tracing::warn!(resource_id, group_id, error = %e, "autoscaler unavailable, continuing");
                }
            }
        }

        Ok(())
    }

    /// On a critical transition, request one more instance (capped at
    /// `max`). When utilization drops below half the warning threshold,
    /// request one fewer (floored at `min`). Never exceeds either bound.
    async fn apply_autoscaling_feedback(
        &self,
        group_id: &str,
        band: Band,
        utilization: f64,
        warning_threshold: f64,
    ) -> Result<()> {
        let state = self.autoscaler.describe(group_id).await?;
        let desired = if band == Band::Critical && state.desired < state.max {
            Some(state.desired + 1)
        } else if utilization < warning_threshold / 2.0 && state.desired > state.min {
            Some(state.desired - 1)
        } else {
            None
        };

        if let Some(desired) = desired {
            self.autoscaler.set_desired_capacity(group_id, desired).await?;
        }
        Ok(())
    }

    /// Linear-regression projection of `used` over hours elapsed since the
    /// first retained sample, evaluated `1..=horizon_hours` hours ahead.
    /// Returns empty when there are fewer than
    /// [`MIN_SAMPLES_FOR_FORECAST`] samples or the regression is degenerate
    /// (no variance in the time axis).
    pub async fn forecast(&self, resource_id: &str, horizon_hours: u32) -> Result<Vec<ForecastPoint>> {
        let resources = self.resources.read().await;
        let resource = resources
            .get(resource_id)
            .ok_or_else(|| AwcpError::not_found(format!("resource {resource_id} not registered")))?;

        if resource.history.len() < MIN_SAMPLES_FOR_FORECAST {
            return Ok(Vec::new());
        }

        let first_ts = resource.history.front().unwrap().0;
        let points: Vec<(f64, f64)> = resource
            .history
            .iter()
            .map(|(ts, used)| ((*ts - first_ts).num_seconds() as f64 / 3600.0, *used))
            .collect();

        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let ss_xx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        if ss_xx <= f64::EPSILON {
            return Ok(Vec::new());
        }
        let ss_xy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
        let beta = ss_xy / ss_xx;
        let alpha = mean_y - beta * mean_x;

        let residual_variance = points
            .iter()
            .map(|(x, y)| {
                let predicted = alpha + beta * x;
                (y - predicted).powi(2)
            })
            .sum::<f64>()
            / (n - 2.0).max(1.0);
        let sigma = residual_variance.sqrt();
        let margin = 1.96 * sigma;

        let last_x = points.last().unwrap().0;
        Ok((1..=horizon_hours)
            .map(|i| {
                let x = last_x + i as f64;
                let predicted = alpha + beta * x;
                ForecastPoint {
                    hours_ahead: i,
                    predicted,
                    lower: predicted - margin,
                    upper: predicted + margin,
                }
            })
            .collect())
    }

    pub async fn get_client_usage(&self, client_id: &str) -> HashMap<String, Vec<f64>> {
        let resources = self.resources.read().await;
        resources
            .values()
            .filter(|r| r.client_id.as_deref() == Some(client_id))
            .map(|r| (r.resource_id.clone(), r.history.iter().map(|(_, v)| *v).collect()))
            .collect()
    }

    pub async fn status(&self, resource_id: &str) -> Option<Band> {
        self.resources.read().await.get(resource_id).map(|r| r.status)
    }

    /// Starts the background sampler. Idempotent: calling this while a
    /// sampler is already running stops the old one first. Mirrors the
    /// `tokio::select!` plus `mpsc` shutdown-channel pattern used elsewhere
    /// in the control plane for cooperative background tasks.
    pub async fn start_monitoring(&self, interval_s: u64, sampler: Arc<dyn UsageSampler>) {
        self.stop_monitoring().await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let resources = self.resources.clone();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_s));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let targets: Vec<(String, Option<String>)> = resources
                            .read()
                            .await
                            .values()
                            .map(|r| (r.resource_id.clone(), r.client_id.clone()))
                            .collect();
                        for (resource_id, client_id) in targets {
                            if let Some(used) = sampler.sample(&resource_id, client_id.as_deref()).await {
                                if let Err(e) = this.update_usage(&resource_id, used, client_id.as_deref()).await {
                                    tracing::warn!(resource_id, error = %e, "background sample failed to apply");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        *self.sampler_state.lock().await = Some(SamplerState { shutdown_tx, handle });
    }

    /// Stops the sampler started by `start_monitoring`, joining within a
    /// bounded timeout. Idempotent: a no-op if nothing is running.
    pub async fn stop_monitoring(&self) {
        if let Some(state) = self.sampler_state.lock().await.take() {
            let _ = state.shutdown_tx.send(()).await;
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), state.handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryAutoscaler, InMemoryMetricSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor() -> (ResourceMonitor, Arc<InMemoryMetricSink>, Arc<InMemoryAutoscaler>) {
        let sink = Arc::new(InMemoryMetricSink::new());
        let scaler = Arc::new(InMemoryAutoscaler::new());
        let monitor = ResourceMonitor::new(sink.clone(), scaler.clone());
        (monitor, sink, scaler)
    }

    #[tokio::test]
    async fn register_resource_rejects_bad_thresholds() {
        let (monitor, _, _) = monitor();
        let err = monitor
            .register_resource("cpu", 100.0, 0.95, 0.8, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AwcpError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn update_usage_classifies_band() {
        let (monitor, _, _) = monitor();
        monitor.register_resource("cpu", 100.0, 0.8, 0.95, None).await.unwrap();
        monitor.update_usage("cpu", 50.0, None).await.unwrap();
        assert_eq!(monitor.status("cpu").await, Some(Band::Normal));
        monitor.update_usage("cpu", 99.0, None).await.unwrap();
        assert_eq!(monitor.status("cpu").await, Some(Band::Critical));
    }

    #[tokio::test]
    async fn callback_fires_only_on_band_transition() {
        let (monitor, _, _) = monitor();
        monitor.register_resource("cpu", 100.0, 0.8, 0.95, None).await.unwrap();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        monitor
            .register_threshold_callback(
                "cpu",
                Box::new(move |_id, _band, _util| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        monitor.update_usage("cpu", 50.0, None).await.unwrap();
        monitor.update_usage("cpu", 55.0, None).await.unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 0, "no transition out of Normal yet");

        monitor.update_usage("cpu", 85.0, None).await.unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        monitor.update_usage("cpu", 86.0, None).await.unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 1, "still Warning, no new fire");
    }

    #[tokio::test]
    async fn forecast_empty_under_minimum_samples() {
        let (monitor, _, _) = monitor();
        monitor.register_resource("cpu", 100.0, 0.8, 0.95, None).await.unwrap();
        monitor.update_usage("cpu", 50.0, None).await.unwrap();
        let points = monitor.forecast("cpu", 3).await.unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn critical_transition_requests_scale_up() {
        let (monitor, _, scaler) = monitor();
        scaler.register_group("asg-1", 2, 1, 5).await;
        monitor.register_resource("cpu", 100.0, 0.8, 0.95, None).await.unwrap();
        monitor.set_autoscaling_group("cpu", "asg-1").await.unwrap();

        monitor.update_usage("cpu", 99.0, None).await.unwrap();
        let state = scaler.describe("asg-1").await.unwrap();
        assert_eq!(state.desired, 3);
    }

    #[tokio::test]
    async fn client_usage_scoped_to_owner() {
        let (monitor, _, _) = monitor();
        monitor
            .register_resource("cpu", 100.0, 0.8, 0.95, Some("acme".to_string()))
            .await
            .unwrap();
        monitor
            .register_resource("mem", 100.0, 0.8, 0.95, Some("other".to_string()))
            .await
            .unwrap();
        monitor.update_usage("cpu", 10.0, None).await.unwrap();
        monitor.update_usage("mem", 20.0, None).await.unwrap();

        let usage = monitor.get_client_usage("acme").await;
        assert!(usage.contains_key("cpu"));
        assert!(!usage.contains_key("mem"));
    }

    #[tokio::test]
    async fn scenario_c_threshold_band_transition() {
        let (monitor, _, _) = monitor();
        monitor.register_resource("r", 100.0, 0.8, 0.95, None).await.unwrap();
        let fired: Arc<std::sync::Mutex<Vec<(Band, f64)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = fired.clone();
        monitor
            .register_threshold_callback(
                "r",
                Box::new(move |_id, band, util| {
                    sink.lock().unwrap().push((band, util));
                }),
            )
            .await;

        monitor.update_usage("r", 50.0, None).await.unwrap();
        assert_eq!(monitor.status("r").await, Some(Band::Normal));
        assert!(fired.lock().unwrap().is_empty());

        monitor.update_usage("r", 85.0, None).await.unwrap();
        assert_eq!(monitor.status("r").await, Some(Band::Warning));
        assert_eq!(fired.lock().unwrap().as_slice(), &[(Band::Warning, 0.85)]);

        monitor.update_usage("r", 86.0, None).await.unwrap();
        assert_eq!(monitor.status("r").await, Some(Band::Warning));
        assert_eq!(fired.lock().unwrap().len(), 1, "no new fire on intra-band change");

        monitor.update_usage("r", 96.0, None).await.unwrap();
        assert_eq!(monitor.status("r").await, Some(Band::Critical));
        assert_eq!(
            fired.lock().unwrap().as_slice(),
            &[(Band::Warning, 0.85), (Band::Critical, 0.96)]
        );
    }
}
