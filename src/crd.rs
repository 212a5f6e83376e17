//! Kubernetes CRD types for PulsarCluster resources.
//!
//! Only the parts of the cluster spec the autoscaler reads or writes are
//! modelled here: per-component replica counts, the named resource sets and
//! the autoscaler settings attached to each of them.

use anyhow::{Context, Result};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::autoscaler::{AutoscalerSpec, Component, ComponentSetKey, DEFAULT_SET};

// ===== Autoscaler defaults =====

pub const DEFAULT_BROKER_PERIOD_MS: u64 = 60_000;
pub const DEFAULT_BROKER_MIN: i32 = 1;
pub const DEFAULT_LOWER_CPU_THRESHOLD: f64 = 0.3;
pub const DEFAULT_HIGHER_CPU_THRESHOLD: f64 = 0.8;

pub const DEFAULT_BOOKKEEPER_PERIOD_MS: u64 = 10_000;
pub const DEFAULT_DISK_USAGE_HWM: f64 = 0.92;
pub const DEFAULT_DISK_USAGE_LWM: f64 = 0.75;
pub const DEFAULT_MIN_WRITABLE_BOOKIES: i32 = 3;
pub const DEFAULT_SCALE_UP_MAX_LIMIT: i32 = 30;

pub const DEFAULT_STABILIZATION_WINDOW_MS: u64 = 300_000;
pub const DEFAULT_SCALE_STEP: i32 = 1;

fn default_broker_period_ms() -> u64 {
    DEFAULT_BROKER_PERIOD_MS
}
fn default_bookkeeper_period_ms() -> u64 {
    DEFAULT_BOOKKEEPER_PERIOD_MS
}
fn default_stabilization_window_ms() -> u64 {
    DEFAULT_STABILIZATION_WINDOW_MS
}
fn default_broker_min() -> i32 {
    DEFAULT_BROKER_MIN
}
fn default_lower_cpu_threshold() -> f64 {
    DEFAULT_LOWER_CPU_THRESHOLD
}
fn default_higher_cpu_threshold() -> f64 {
    DEFAULT_HIGHER_CPU_THRESHOLD
}
fn default_scale_step() -> i32 {
    DEFAULT_SCALE_STEP
}
fn default_disk_usage_hwm() -> f64 {
    DEFAULT_DISK_USAGE_HWM
}
fn default_disk_usage_lwm() -> f64 {
    DEFAULT_DISK_USAGE_LWM
}
fn default_min_writable_bookies() -> i32 {
    DEFAULT_MIN_WRITABLE_BOOKIES
}
fn default_scale_up_max_limit() -> i32 {
    DEFAULT_SCALE_UP_MAX_LIMIT
}
fn default_true() -> bool {
    true
}

// ===== CRD: PulsarCluster =====

/// Spec for the PulsarCluster custom resource
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "pulsar.oss.dev",
    version = "v1alpha1",
    kind = "PulsarCluster",
    plural = "pulsarclusters",
    shortname = "pc",
    status = "PulsarClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PulsarClusterSpec {
    /// Broker (compute tier) settings
    #[serde(default)]
    pub broker: Option<BrokerSpec>,
    /// BookKeeper (storage tier) settings
    #[serde(default)]
    pub bookkeeper: Option<BookKeeperSpec>,
}

/// Broker component settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Desired replicas of the default set (also the fallback for named sets)
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Autoscaler for the default set, inherited by named sets
    #[serde(default)]
    pub autoscaler: Option<BrokerAutoscalerSpec>,
    /// Named broker sets; when present the default set is not deployed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sets: BTreeMap<String, BrokerSetSpec>,
}

/// One named broker set
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSetSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub autoscaler: Option<BrokerAutoscalerSpec>,
}

/// CPU-driven autoscaler settings for a broker set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAutoscalerSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Delay between two runs, measured from the end of the previous run
    #[serde(default = "default_broker_period_ms")]
    pub period_ms: u64,
    /// Minimum pod age before the set is evaluated
    #[serde(default = "default_stabilization_window_ms")]
    pub stabilization_window_ms: u64,
    #[serde(default = "default_broker_min")]
    pub min: i32,
    #[serde(default)]
    pub max: Option<i32>,
    /// Usage ratio (used / requested) under which a broker votes to scale down
    #[serde(default = "default_lower_cpu_threshold")]
    pub lower_cpu_threshold: f64,
    /// Usage ratio above which a broker votes to scale up
    #[serde(default = "default_higher_cpu_threshold")]
    pub higher_cpu_threshold: f64,
    #[serde(default = "default_scale_step")]
    pub scale_up_by: i32,
    #[serde(default = "default_scale_step")]
    pub scale_down_by: i32,
}

impl Default for BrokerAutoscalerSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: DEFAULT_BROKER_PERIOD_MS,
            stabilization_window_ms: DEFAULT_STABILIZATION_WINDOW_MS,
            min: DEFAULT_BROKER_MIN,
            max: None,
            lower_cpu_threshold: DEFAULT_LOWER_CPU_THRESHOLD,
            higher_cpu_threshold: DEFAULT_HIGHER_CPU_THRESHOLD,
            scale_up_by: DEFAULT_SCALE_STEP,
            scale_down_by: DEFAULT_SCALE_STEP,
        }
    }
}

/// BookKeeper component settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub autoscaler: Option<BookKeeperAutoscalerSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sets: BTreeMap<String, BookKeeperSetSpec>,
}

/// One named bookie set
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperSetSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub autoscaler: Option<BookKeeperAutoscalerSpec>,
}

/// Disk-driven autoscaler settings for a bookie set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperAutoscalerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bookkeeper_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_stabilization_window_ms")]
    pub stabilization_window_ms: u64,
    /// Disk usage ratio at or above which a disk is considered full
    #[serde(default = "default_disk_usage_hwm")]
    pub disk_usage_tolerance_hwm: f64,
    /// Disk usage ratio every writable disk must stay under before scaling down
    #[serde(default = "default_disk_usage_lwm")]
    pub disk_usage_tolerance_lwm: f64,
    /// Number of writable bookies the set must keep
    #[serde(default = "default_min_writable_bookies")]
    pub min_writable_bookies: i32,
    #[serde(default = "default_scale_step")]
    pub scale_up_by: i32,
    #[serde(default = "default_scale_step")]
    pub scale_down_by: i32,
    /// Replica ceiling for scale-up
    #[serde(default = "default_scale_up_max_limit")]
    pub scale_up_max_limit: i32,
    /// Delete detached volumes of removed bookies
    #[serde(default = "default_true")]
    pub clean_up_pvcs: bool,
}

impl Default for BookKeeperAutoscalerSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: DEFAULT_BOOKKEEPER_PERIOD_MS,
            stabilization_window_ms: DEFAULT_STABILIZATION_WINDOW_MS,
            disk_usage_tolerance_hwm: DEFAULT_DISK_USAGE_HWM,
            disk_usage_tolerance_lwm: DEFAULT_DISK_USAGE_LWM,
            min_writable_bookies: DEFAULT_MIN_WRITABLE_BOOKIES,
            scale_up_by: DEFAULT_SCALE_STEP,
            scale_down_by: DEFAULT_SCALE_STEP,
            scale_up_max_limit: DEFAULT_SCALE_UP_MAX_LIMIT,
            clean_up_pvcs: true,
        }
    }
}

/// Status reported by the operator on the PulsarCluster CR
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PulsarClusterStatus {
    /// Component sets with a live autoscaler task, as `component/set`
    #[serde(default)]
    pub autoscaled_sets: Vec<String>,
    /// When `autoscaledSets` last changed
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl PulsarCluster {
    /// Every component set of this cluster that carries an autoscaler spec.
    ///
    /// Named sets inherit the component-level autoscaler when they have none
    /// of their own. Sets without any autoscaler spec are omitted.
    pub fn autoscaler_specs(&self) -> Vec<(ComponentSetKey, AutoscalerSpec)> {
        let namespace = self.namespace().unwrap_or_else(|| "default".to_string());
        let cluster = self.name_any();
        let key = |component, set: &str| ComponentSetKey::new(&namespace, &cluster, component, set);
        let mut specs = Vec::new();

        if let Some(broker) = &self.spec.broker {
            if broker.sets.is_empty() {
                if let Some(autoscaler) = &broker.autoscaler {
                    specs.push((
                        key(Component::Broker, DEFAULT_SET),
                        AutoscalerSpec::Broker(autoscaler.clone()),
                    ));
                }
            }
            for (name, set) in &broker.sets {
                if let Some(autoscaler) = set.autoscaler.as_ref().or(broker.autoscaler.as_ref()) {
                    specs.push((
                        key(Component::Broker, name),
                        AutoscalerSpec::Broker(autoscaler.clone()),
                    ));
                }
            }
        }

        if let Some(bookkeeper) = &self.spec.bookkeeper {
            if bookkeeper.sets.is_empty() {
                if let Some(autoscaler) = &bookkeeper.autoscaler {
                    specs.push((
                        key(Component::Bookkeeper, DEFAULT_SET),
                        AutoscalerSpec::Bookkeeper(autoscaler.clone()),
                    ));
                }
            }
            for (name, set) in &bookkeeper.sets {
                if let Some(autoscaler) = set
                    .autoscaler
                    .as_ref()
                    .or(bookkeeper.autoscaler.as_ref())
                {
                    specs.push((
                        key(Component::Bookkeeper, name),
                        AutoscalerSpec::Bookkeeper(autoscaler.clone()),
                    ));
                }
            }
        }

        specs
    }

    /// Desired replica count currently recorded for a component set.
    ///
    /// Named sets without their own count fall back to the component count.
    pub fn replicas_for(&self, component: Component, set: &str) -> Option<i32> {
        let (replicas, set_replicas) = match component {
            Component::Broker => {
                let broker = self.spec.broker.as_ref()?;
                (broker.replicas, broker.sets.get(set).and_then(|s| s.replicas))
            }
            Component::Bookkeeper => {
                let bookkeeper = self.spec.bookkeeper.as_ref()?;
                (
                    bookkeeper.replicas,
                    bookkeeper.sets.get(set).and_then(|s| s.replicas),
                )
            }
        };
        if set == DEFAULT_SET {
            replicas
        } else {
            set_replicas.or(replicas)
        }
    }
}

/// Generate the PulsarCluster CRD manifest as YAML.
pub fn generate_crd_manifest() -> Result<String> {
    use kube::CustomResourceExt;
    serde_yaml::to_string(&PulsarCluster::crd()).context("Failed to serialize PulsarCluster CRD")
}
