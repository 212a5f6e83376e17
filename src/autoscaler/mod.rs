//! Autoscaling control loop for broker and bookie sets.
//!
//! One periodic task runs per autoscaled component set:
//!
//! ```text
//! readiness gate -> collect node info -> decide -> (bookies) safe removal -> patch replicas
//! ```
//!
//! The [`SchedulingDaemon`] keeps exactly one task alive per enabled set and
//! replaces it whenever the set's autoscaler spec changes.

pub mod bookkeeper;
pub mod broker;
pub mod collector;
pub mod scheduler;

use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::AutoscalerConfig;
use crate::crd::{BookKeeperAutoscalerSpec, BrokerAutoscalerSpec};
use crate::error::Result;
use crate::kubernetes::{ClusterResources, PodExecutor};

pub use scheduler::SchedulingDaemon;

/// Internal name of the implicit set used when a component defines no sets
pub const DEFAULT_SET: &str = "default";

/// Label carrying the cluster name
pub const LABEL_CLUSTER: &str = "app.kubernetes.io/instance";
/// Label carrying the component name
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Label carrying the resource set name
pub const LABEL_RESOURCE_SET: &str = "pulsar.oss.dev/resource-set";

/// Autoscaled component kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// CPU-scaled compute tier
    Broker,
    /// Disk-scaled storage tier
    Bookkeeper,
}

impl Component {
    /// Field name of this component in the cluster spec
    pub fn spec_field(&self) -> &'static str {
        match self {
            Component::Broker => "broker",
            Component::Bookkeeper => "bookkeeper",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec_field())
    }
}

/// Identifies one schedulable pool of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentSetKey {
    pub namespace: String,
    pub cluster: String,
    pub component: Component,
    pub set: String,
}

impl ComponentSetKey {
    pub fn new(namespace: &str, cluster: &str, component: Component, set: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            component,
            set: set.to_string(),
        }
    }

    pub fn is_default_set(&self) -> bool {
        self.set == DEFAULT_SET
    }

    /// Name of the StatefulSet backing this set
    pub fn statefulset_name(&self) -> String {
        if self.is_default_set() {
            format!("{}-{}", self.cluster, self.component)
        } else {
            format!("{}-{}-{}", self.cluster, self.component, self.set)
        }
    }

    /// Label selector matching the pods (and volumes) of this set
    pub fn pod_selector(&self) -> String {
        format!(
            "{}={},{}={},{}={}",
            LABEL_CLUSTER, self.cluster, LABEL_COMPONENT, self.component, LABEL_RESOURCE_SET, self.set
        )
    }

    /// Merge patch setting this set's desired replicas on the cluster resource.
    ///
    /// The default set lives at `spec.<component>.replicas`, named sets at
    /// `spec.<component>.sets.<set>.replicas`.
    pub fn replicas_patch(&self, replicas: i32) -> serde_json::Value {
        let component = self.component.spec_field();
        if self.is_default_set() {
            json!({ "spec": { component: { "replicas": replicas } } })
        } else {
            json!({ "spec": { component: { "sets": { self.set.as_str(): { "replicas": replicas } } } } })
        }
    }
}

impl fmt::Display for ComponentSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.cluster, self.component, self.set
        )
    }
}

/// Autoscaler settings of one component set
#[derive(Debug, Clone, PartialEq)]
pub enum AutoscalerSpec {
    Broker(BrokerAutoscalerSpec),
    Bookkeeper(BookKeeperAutoscalerSpec),
}

impl AutoscalerSpec {
    pub fn enabled(&self) -> bool {
        match self {
            AutoscalerSpec::Broker(s) => s.enabled,
            AutoscalerSpec::Bookkeeper(s) => s.enabled,
        }
    }

    /// Fixed delay between the end of one run and the start of the next
    pub fn period(&self) -> Duration {
        let ms = match self {
            AutoscalerSpec::Broker(s) => s.period_ms,
            AutoscalerSpec::Bookkeeper(s) => s.period_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn stabilization_window(&self) -> Duration {
        let ms = match self {
            AutoscalerSpec::Broker(s) => s.stabilization_window_ms,
            AutoscalerSpec::Bookkeeper(s) => s.stabilization_window_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Direction of a scaling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
    None,
}

/// Output of a scaling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    pub direction: ScaleDirection,
    pub magnitude: u32,
}

impl ScaleDecision {
    pub fn none() -> Self {
        Self {
            direction: ScaleDirection::None,
            magnitude: 0,
        }
    }

    pub fn up(magnitude: u32) -> Self {
        if magnitude == 0 {
            return Self::none();
        }
        Self {
            direction: ScaleDirection::Up,
            magnitude,
        }
    }

    pub fn down(magnitude: u32) -> Self {
        if magnitude == 0 {
            return Self::none();
        }
        Self {
            direction: ScaleDirection::Down,
            magnitude,
        }
    }

    /// Signed replica change
    pub fn delta(&self) -> i32 {
        let magnitude = i32::try_from(self.magnitude).unwrap_or(i32::MAX);
        match self.direction {
            ScaleDirection::Up => magnitude,
            ScaleDirection::Down => -magnitude,
            ScaleDirection::None => 0,
        }
    }
}

/// Everything a task needs to talk to the cluster
pub struct AutoscalerContext {
    pub resources: Arc<dyn ClusterResources>,
    pub executor: Arc<dyn PodExecutor>,
    pub config: AutoscalerConfig,
}

impl AutoscalerContext {
    pub fn new(
        resources: Arc<dyn ClusterResources>,
        executor: Arc<dyn PodExecutor>,
        config: AutoscalerConfig,
    ) -> Self {
        Self {
            resources,
            executor,
            config,
        }
    }
}

/// One evaluation of a component set, run on a fixed-delay schedule
#[async_trait]
pub trait AutoscalerTask: Send + Sync {
    fn key(&self) -> &ComponentSetKey;

    /// Evaluate the set once and apply the resulting scale change.
    ///
    /// `cancel` fires when the daemon replaces or drops this task.
    async fn run_once(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Build the task matching a spec's component kind.
pub fn build_task(
    key: ComponentSetKey,
    spec: AutoscalerSpec,
    ctx: Arc<AutoscalerContext>,
) -> Arc<dyn AutoscalerTask> {
    match spec {
        AutoscalerSpec::Broker(spec) => Arc::new(broker::BrokerAutoscaler::new(key, spec, ctx)),
        AutoscalerSpec::Bookkeeper(spec) => {
            Arc::new(bookkeeper::BookKeeperAutoscaler::new(key, spec, ctx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statefulset_names() {
        let default = ComponentSetKey::new("ns", "pulsar", Component::Broker, DEFAULT_SET);
        assert_eq!(default.statefulset_name(), "pulsar-broker");
        let named = ComponentSetKey::new("ns", "pulsar", Component::Bookkeeper, "ssd");
        assert_eq!(named.statefulset_name(), "pulsar-bookkeeper-ssd");
    }

    #[test]
    fn test_pod_selector() {
        let key = ComponentSetKey::new("ns", "pulsar", Component::Broker, "shared");
        assert_eq!(
            key.pod_selector(),
            "app.kubernetes.io/instance=pulsar,app.kubernetes.io/component=broker,pulsar.oss.dev/resource-set=shared"
        );
    }

    #[test]
    fn test_replicas_patch_addresses_default_and_named_sets() {
        let default = ComponentSetKey::new("ns", "pulsar", Component::Bookkeeper, DEFAULT_SET);
        assert_eq!(
            default.replicas_patch(4),
            json!({"spec": {"bookkeeper": {"replicas": 4}}})
        );
        let named = ComponentSetKey::new("ns", "pulsar", Component::Broker, "shared");
        assert_eq!(
            named.replicas_patch(2),
            json!({"spec": {"broker": {"sets": {"shared": {"replicas": 2}}}}})
        );
    }

    #[test]
    fn test_decision_delta() {
        assert_eq!(ScaleDecision::up(2).delta(), 2);
        assert_eq!(ScaleDecision::down(3).delta(), -3);
        assert_eq!(ScaleDecision::down(0), ScaleDecision::none());
        assert_eq!(ScaleDecision::none().delta(), 0);
    }

    #[test]
    fn test_spec_equality_is_by_value() {
        let a = AutoscalerSpec::Broker(BrokerAutoscalerSpec::default());
        let b = AutoscalerSpec::Broker(BrokerAutoscalerSpec::default());
        assert_eq!(a, b);
        let c = AutoscalerSpec::Broker(BrokerAutoscalerSpec {
            period_ms: 1,
            ..Default::default()
        });
        assert_ne!(a, c);
    }
}
