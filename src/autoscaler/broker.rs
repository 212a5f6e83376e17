//! CPU-driven autoscaling of broker sets.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{AutoscalerContext, AutoscalerTask, ComponentSetKey, ScaleDecision, ScaleDirection, collector};
use crate::crd::BrokerAutoscalerSpec;
use crate::error::{Error, Result};
use crate::kubernetes::readiness;

/// CPU snapshot of one broker pod
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerNodeInfo {
    pub pod: String,
    /// Cores in use
    pub used_cpu: f64,
    /// Cores requested
    pub requested_cpu: f64,
}

impl BrokerNodeInfo {
    pub fn usage(&self) -> f64 {
        self.used_cpu / self.requested_cpu
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuVote {
    Below,
    Above,
    InBand,
}

fn vote(node: &BrokerNodeInfo, spec: &BrokerAutoscalerSpec) -> CpuVote {
    let usage = node.usage();
    if usage < spec.lower_cpu_threshold {
        CpuVote::Below
    } else if usage > spec.higher_cpu_threshold {
        CpuVote::Above
    } else {
        CpuVote::InBand
    }
}

/// Scale only when every broker agrees on the direction.
///
/// Nodes whose request is not positive carry no usable ratio and are ignored.
pub fn decide(nodes: &[BrokerNodeInfo], spec: &BrokerAutoscalerSpec) -> ScaleDecision {
    let votes: Vec<CpuVote> = nodes
        .iter()
        .filter(|n| n.requested_cpu > 0.0)
        .map(|n| vote(n, spec))
        .collect();
    let Some(first) = votes.first().copied() else {
        return ScaleDecision::none();
    };
    if votes.iter().any(|v| *v != first) {
        return ScaleDecision::none();
    }
    match first {
        CpuVote::Below => ScaleDecision::down(spec.scale_down_by.max(0) as u32),
        CpuVote::Above => ScaleDecision::up(spec.scale_up_by.max(0) as u32),
        CpuVote::InBand => ScaleDecision::none(),
    }
}

/// Reject specs whose bounds or thresholds contradict each other.
pub fn validate_spec(spec: &BrokerAutoscalerSpec) -> Result<()> {
    if let Some(max) = spec.max {
        if max < spec.min.max(1) {
            return Err(Error::InvalidConfig(format!(
                "max ({}) must be >= min ({}) and at least 1",
                max, spec.min
            )));
        }
    }
    if spec.lower_cpu_threshold > spec.higher_cpu_threshold {
        return Err(Error::InvalidConfig(format!(
            "lowerCpuThreshold ({}) must be <= higherCpuThreshold ({})",
            spec.lower_cpu_threshold, spec.higher_cpu_threshold
        )));
    }
    if spec.scale_up_by < 1 || spec.scale_down_by < 1 {
        return Err(Error::InvalidConfig(
            "scaleUpBy and scaleDownBy must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Replica count to patch: at least one, then within `[min, max]`.
///
/// The result never moves against the decision, so a set that is already
/// outside the bounds is left alone until the load says otherwise.
pub fn target_replicas(current: i32, decision: ScaleDecision, spec: &BrokerAutoscalerSpec) -> i32 {
    let mut target = current.saturating_add(decision.delta()).max(1);
    target = target.max(spec.min);
    if let Some(max) = spec.max {
        target = target.min(max);
    }
    match decision.direction {
        ScaleDirection::None => current,
        ScaleDirection::Up => target.max(current),
        ScaleDirection::Down => target.min(current),
    }
}

/// Periodic autoscaler for one broker set
pub struct BrokerAutoscaler {
    key: ComponentSetKey,
    spec: BrokerAutoscalerSpec,
    ctx: Arc<AutoscalerContext>,
}

impl BrokerAutoscaler {
    pub fn new(key: ComponentSetKey, spec: BrokerAutoscalerSpec, ctx: Arc<AutoscalerContext>) -> Self {
        Self { key, spec, ctx }
    }
}

#[async_trait]
impl AutoscalerTask for BrokerAutoscaler {
    fn key(&self) -> &ComponentSetKey {
        &self.key
    }

    async fn run_once(&self, _cancel: &CancellationToken) -> Result<()> {
        if let Err(e) = validate_spec(&self.spec) {
            error!(set = %self.key, error = %e, "broker autoscaler misconfigured");
            return Err(e);
        }

        let resources = self.ctx.resources.as_ref();
        let Some(current) = resources.current_replicas(&self.key).await? else {
            info!(set = %self.key, "broker set not found, skipping");
            return Ok(());
        };

        let ready = readiness::is_ready_to_scale(
            resources,
            &self.key,
            &self.ctx.config.broker_container,
            current,
            Duration::from_millis(self.spec.stabilization_window_ms),
        )
        .await?;
        if !ready {
            info!(set = %self.key, "broker set not ready to scale, skipping");
            return Ok(());
        }

        let nodes = collector::collect_broker_nodes(resources, &self.key).await?;
        if nodes.is_empty() {
            info!(set = %self.key, "no broker cpu samples, skipping");
            return Ok(());
        }
        debug!(set = %self.key, ?nodes, "broker cpu samples");

        let decision = decide(&nodes, &self.spec);
        if decision.direction == ScaleDirection::None {
            info!(set = %self.key, replicas = current, "broker cpu in band or votes split, holding");
            return Ok(());
        }
        let target = target_replicas(current, decision, &self.spec);
        if target == current {
            info!(set = %self.key, replicas = current, ?decision, "broker set is stable");
            return Ok(());
        }

        resources.patch_replicas(&self.key, target).await?;
        info!(set = %self.key, from = current, to = target, "patched broker replicas");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::Component;
    use crate::testing::{FakeExecutor, FakeResources, context, ready_pod};
    use chrono::Utc;

    fn node(pod: &str, used: f64) -> BrokerNodeInfo {
        BrokerNodeInfo {
            pod: pod.to_string(),
            used_cpu: used,
            requested_cpu: 1.0,
        }
    }

    fn spec() -> BrokerAutoscalerSpec {
        BrokerAutoscalerSpec {
            enabled: true,
            scale_up_by: 2,
            scale_down_by: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_below_scales_down_by_step() {
        let nodes = vec![node("b-0", 0.1), node("b-1", 0.2)];
        assert_eq!(decide(&nodes, &spec()), ScaleDecision::down(1));
    }

    #[test]
    fn test_all_above_scales_up_by_step() {
        let nodes = vec![node("b-0", 0.9), node("b-1", 0.95)];
        assert_eq!(decide(&nodes, &spec()), ScaleDecision::up(2));
    }

    #[test]
    fn test_mixed_votes_hold() {
        let spec = spec();
        assert_eq!(decide(&[node("b-0", 0.1), node("b-1", 0.9)], &spec), ScaleDecision::none());
        assert_eq!(decide(&[node("b-0", 0.1), node("b-1", 0.5)], &spec), ScaleDecision::none());
        assert_eq!(decide(&[node("b-0", 0.9), node("b-1", 0.5)], &spec), ScaleDecision::none());
        assert_eq!(decide(&[node("b-0", 0.5)], &spec), ScaleDecision::none());
    }

    #[test]
    fn test_no_samples_hold() {
        assert_eq!(decide(&[], &spec()), ScaleDecision::none());
        let zero_request = BrokerNodeInfo {
            pod: "b-0".to_string(),
            used_cpu: 0.0,
            requested_cpu: 0.0,
        };
        assert_eq!(decide(&[zero_request], &spec()), ScaleDecision::none());
    }

    #[test]
    fn test_target_clamped_to_min_and_max() {
        let mut spec = spec();
        spec.min = 2;
        spec.max = Some(4);
        assert_eq!(target_replicas(2, ScaleDecision::down(1), &spec), 2);
        assert_eq!(target_replicas(3, ScaleDecision::up(2), &spec), 4);
        assert_eq!(target_replicas(3, ScaleDecision::up(1), &spec), 4);

        spec.min = 0;
        spec.max = None;
        assert_eq!(target_replicas(1, ScaleDecision::down(3), &spec), 1);
    }

    #[test]
    fn test_target_never_moves_against_decision() {
        let mut spec = spec();
        spec.min = 3;
        spec.max = Some(5);
        assert_eq!(target_replicas(1, ScaleDecision::none(), &spec), 1);
        assert_eq!(target_replicas(8, ScaleDecision::none(), &spec), 8);
        // Below min: scaling down must not raise the count
        assert_eq!(target_replicas(2, ScaleDecision::down(1), &spec), 2);
        // Above max: scaling up must not lower it
        assert_eq!(target_replicas(8, ScaleDecision::up(1), &spec), 8);
        assert_eq!(target_replicas(8, ScaleDecision::down(1), &spec), 5);
        assert_eq!(target_replicas(1, ScaleDecision::up(1), &spec), 3);
    }

    #[test]
    fn test_validate_spec() {
        assert!(validate_spec(&spec()).is_ok());
        let mut bad = spec();
        bad.min = 4;
        bad.max = Some(2);
        assert!(matches!(validate_spec(&bad), Err(Error::InvalidConfig(_))));
        let mut bad = spec();
        bad.max = Some(0);
        bad.min = 0;
        assert!(validate_spec(&bad).is_err());
        let mut bad = spec();
        bad.lower_cpu_threshold = 0.9;
        assert!(validate_spec(&bad).is_err());
    }

    fn key() -> ComponentSetKey {
        ComponentSetKey::new("pulsar", "pulsar", Component::Broker, "default")
    }

    fn broker_cluster(usage: &[f64], started_secs_ago: i64) -> Arc<FakeResources> {
        let resources = Arc::new(FakeResources::default());
        let now = Utc::now();
        let pods = (0..usage.len())
            .map(|i| ready_pod(&format!("pulsar-broker-{}", i), "broker", now, started_secs_ago))
            .collect();
        resources.set_pods(pods);
        for (i, used) in usage.iter().enumerate() {
            resources.set_cpu_usage(&format!("pulsar-broker-{}", i), *used);
        }
        resources.set_statefulset_ready("pulsar", "pulsar-broker", usage.len() as i32);
        resources.set_replicas(&key(), usage.len() as i32);
        resources
    }

    #[tokio::test]
    async fn test_task_scales_up_hot_brokers() {
        let resources = broker_cluster(&[0.9, 0.95, 0.99], 600);
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let task = BrokerAutoscaler::new(key(), spec(), ctx);

        task.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(resources.patches(), vec![(key(), 5)]);
    }

    #[tokio::test]
    async fn test_task_does_not_patch_at_min() {
        let resources = broker_cluster(&[0.05], 600);
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let task = BrokerAutoscaler::new(key(), spec(), ctx);

        task.run_once(&CancellationToken::new()).await.unwrap();
        assert!(resources.patches().is_empty());
    }

    #[tokio::test]
    async fn test_task_in_band_below_min_is_not_patched() {
        let resources = broker_cluster(&[0.5], 600);
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let spec = BrokerAutoscalerSpec { min: 3, ..spec() };
        let task = BrokerAutoscaler::new(key(), spec, ctx);

        task.run_once(&CancellationToken::new()).await.unwrap();
        assert!(resources.patches().is_empty());
    }

    #[tokio::test]
    async fn test_task_rejects_min_above_max() {
        let resources = broker_cluster(&[0.9], 600);
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let spec = BrokerAutoscalerSpec {
            min: 4,
            max: Some(2),
            ..spec()
        };
        let task = BrokerAutoscaler::new(key(), spec, ctx);

        let result = task.run_once(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(resources.patches().is_empty());
    }

    #[tokio::test]
    async fn test_task_skips_recently_started_pods() {
        let resources = broker_cluster(&[0.9, 0.95], 10);
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let task = BrokerAutoscaler::new(key(), spec(), ctx);

        task.run_once(&CancellationToken::new()).await.unwrap();
        assert!(resources.patches().is_empty());
    }

    #[tokio::test]
    async fn test_task_missing_cluster_is_noop() {
        let resources = Arc::new(FakeResources::default());
        let ctx = context(resources.clone(), Arc::new(FakeExecutor::default()));
        let task = BrokerAutoscaler::new(key(), spec(), ctx);

        assert!(task.run_once(&CancellationToken::new()).await.is_ok());
        assert!(resources.patches().is_empty());
    }
}
