//! Disk-driven autoscaling of bookie sets.
//!
//! Scale-up is driven by the number of writable bookies and how full their
//! disks are. Scale-down only happens when every writable bookie is
//! comfortably under the low watermark and replication is healthy, and it
//! always goes through the [`removal`] protocol before replicas are lowered.

pub mod admin;
pub mod removal;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AutoscalerContext, AutoscalerTask, ComponentSetKey, ScaleDecision, ScaleDirection, collector};
use crate::crd::BookKeeperAutoscalerSpec;
use crate::error::{Error, Result};
use crate::kubernetes::{ordinal_of, readiness};

pub use admin::BookieAdmin;
pub use removal::{RemovalOutcome, RemovalSummary};

/// Usage of one bookie disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub max_bytes: u64,
    pub used_bytes: u64,
}

impl DiskUsage {
    /// Used fraction of the disk; an empty disk of size zero counts as full
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.max_bytes as f64
    }
}

/// Snapshot of one bookie pod
#[derive(Debug, Clone, PartialEq)]
pub struct BookieNodeInfo {
    pub pod: String,
    /// Identity the bookie registers under (`host:port`)
    pub bookie_id: String,
    pub is_writable: bool,
    pub disks: Vec<DiskUsage>,
}

impl BookieNodeInfo {
    /// Writable bookie whose every disk is at or above the high watermark
    pub fn is_at_risk(&self, hwm: f64) -> bool {
        self.is_writable && !self.disks.is_empty() && self.disks.iter().all(|d| d.usage_ratio() >= hwm)
    }

    /// Any disk above `threshold`
    pub fn any_disk_above(&self, threshold: f64) -> bool {
        self.disks.iter().any(|d| d.usage_ratio() > threshold)
    }
}

/// Aggregate of a set's bookie snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub writable_bookies_total: u32,
    pub at_risk_writable_bookies: u32,
    pub read_only_bookies: u32,
}

impl ClusterStats {
    pub fn from_nodes(nodes: &[BookieNodeInfo], hwm: f64) -> Self {
        let mut stats = ClusterStats::default();
        for node in nodes {
            if node.is_writable {
                stats.writable_bookies_total += 1;
                if node.is_at_risk(hwm) {
                    stats.at_risk_writable_bookies += 1;
                }
            } else {
                stats.read_only_bookies += 1;
            }
        }
        stats
    }
}

/// What the disk picture calls for, before replication health is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePlan {
    ScaleUp(u32),
    /// Remove this many bookies, provided no ledgers are under-replicated
    ScaleDownIfReplicated(u32),
    Hold,
}

/// Reject specs whose thresholds contradict each other.
pub fn validate_spec(spec: &BookKeeperAutoscalerSpec) -> Result<()> {
    if spec.min_writable_bookies < 0 {
        return Err(Error::InvalidConfig(format!(
            "minWritableBookies must not be negative (got {})",
            spec.min_writable_bookies
        )));
    }
    if spec.scale_up_max_limit < spec.min_writable_bookies {
        return Err(Error::InvalidConfig(format!(
            "scaleUpMaxLimit ({}) must be >= minWritableBookies ({})",
            spec.scale_up_max_limit, spec.min_writable_bookies
        )));
    }
    if spec.disk_usage_tolerance_lwm > spec.disk_usage_tolerance_hwm {
        return Err(Error::InvalidConfig(format!(
            "diskUsageToleranceLwm ({}) must be <= diskUsageToleranceHwm ({})",
            spec.disk_usage_tolerance_lwm, spec.disk_usage_tolerance_hwm
        )));
    }
    if spec.scale_up_by < 1 || spec.scale_down_by < 1 {
        return Err(Error::InvalidConfig(
            "scaleUpBy and scaleDownBy must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Work out the scale change the disks call for.
pub fn plan(
    stats: &ClusterStats,
    nodes: &[BookieNodeInfo],
    spec: &BookKeeperAutoscalerSpec,
) -> ScalePlan {
    let target = spec.min_writable_bookies.max(0) as u32;
    let writable = stats.writable_bookies_total;
    let mut scale_up = 0u32;

    if writable < target {
        scale_up = target - writable;
    }

    // Bookies with every disk full still count as writable but will flip to
    // read-only soon; add a step when the healthy remainder stays short.
    if stats.at_risk_writable_bookies > 0 {
        let healthy_after = (writable - stats.at_risk_writable_bookies) + scale_up;
        if healthy_after < target {
            scale_up += spec.scale_up_by.max(1) as u32;
        }
    }

    if scale_up > 0 {
        return ScalePlan::ScaleUp(scale_up);
    }

    if writable > target {
        let lwm = spec.disk_usage_tolerance_lwm;
        let all_below_lwm = nodes
            .iter()
            .filter(|n| n.is_writable)
            .all(|n| !n.any_disk_above(lwm));
        if all_below_lwm {
            let step = (spec.scale_down_by.max(1) as u32).min(writable - target);
            return ScalePlan::ScaleDownIfReplicated(step);
        }
    }

    ScalePlan::Hold
}

/// Turn a plan into a decision given the cluster's replication health.
pub fn decide(plan: ScalePlan, no_under_replicated: bool) -> ScaleDecision {
    match plan {
        ScalePlan::ScaleUp(n) => ScaleDecision::up(n),
        ScalePlan::ScaleDownIfReplicated(n) if no_under_replicated => ScaleDecision::down(n),
        ScalePlan::ScaleDownIfReplicated(_) | ScalePlan::Hold => ScaleDecision::none(),
    }
}

/// Clamp a bookie replica count to `[minWritableBookies, scaleUpMaxLimit]`.
pub fn clamp_replicas(replicas: i32, spec: &BookKeeperAutoscalerSpec) -> i32 {
    replicas
        .min(spec.scale_up_max_limit)
        .max(spec.min_writable_bookies)
}

/// Replica count to patch after applying `delta` to `current`.
///
/// The clamp never moves the count against the change: a scale-up never
/// lowers it, and a scale-down never goes below `current + delta`, which is
/// exactly the number of bookies the removal protocol cleared.
pub fn target_replicas(current: i32, delta: i32, spec: &BookKeeperAutoscalerSpec) -> i32 {
    let proposed = current.saturating_add(delta);
    let clamped = clamp_replicas(proposed, spec);
    match delta.signum() {
        1 => clamped.max(current),
        -1 => clamped.max(proposed).min(current),
        _ => current,
    }
}

/// Periodic autoscaler for one bookie set
pub struct BookKeeperAutoscaler {
    key: ComponentSetKey,
    spec: BookKeeperAutoscalerSpec,
    ctx: Arc<AutoscalerContext>,
    admin: BookieAdmin,
}

impl BookKeeperAutoscaler {
    pub fn new(
        key: ComponentSetKey,
        spec: BookKeeperAutoscalerSpec,
        ctx: Arc<AutoscalerContext>,
    ) -> Self {
        let admin = BookieAdmin::new(ctx.executor.clone(), &key.namespace, &ctx.config);
        Self {
            key,
            spec,
            ctx,
            admin,
        }
    }

    /// Identity a bookie pod registers under: its stable DNS name and client port
    fn bookie_id(&self, pod: &str) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local:{}",
            pod,
            self.key.statefulset_name(),
            self.key.namespace,
            self.ctx.config.bookie_port
        )
    }

    async fn patch_replicas(&self, current: i32, target: i32) -> Result<()> {
        if target == current {
            info!(set = %self.key, replicas = current, "clamped target equals current, nothing to patch");
            return Ok(());
        }
        self.ctx.resources.patch_replicas(&self.key, target).await?;
        info!(set = %self.key, from = current, to = target, "patched bookie replicas");
        Ok(())
    }

    /// Delete volumes of removed bookies once no pod mounts them.
    ///
    /// Returns how many volumes were deleted.
    async fn clean_up_pvcs(&self, replicas: i32) -> Result<usize> {
        let resources = &self.ctx.resources;
        let selector = self.key.pod_selector();
        let pvcs = resources.list_pvcs(&self.key.namespace, &selector).await?;
        if pvcs.is_empty() {
            return Ok(0);
        }

        let pods = resources.list_pods(&self.key.namespace, &selector).await?;
        let mounted: Vec<String> = pods
            .iter()
            .filter_map(|p| p.spec.as_ref())
            .flat_map(|s| s.volumes.iter().flatten())
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.clone())
            .collect();

        let mut deleted = 0;
        for pvc in pvcs {
            let Some(name) = pvc.metadata.name else {
                continue;
            };
            let Some(ordinal) = ordinal_of(&name) else {
                continue;
            };
            if i64::from(ordinal) < i64::from(replicas) || mounted.contains(&name) {
                continue;
            }
            match resources.delete_pvc(&self.key.namespace, &name).await {
                Ok(()) => {
                    info!(set = %self.key, pvc = %name, "deleted volume of removed bookie");
                    deleted += 1;
                }
                Err(e) => warn!(set = %self.key, pvc = %name, error = %e, "failed to delete volume"),
            }
        }
        Ok(deleted)
    }

    async fn run_pvc_cleanup(&self, replicas: i32, cancel: &CancellationToken) {
        match self.clean_up_pvcs(replicas).await {
            Ok(0) => {}
            Ok(deleted) => {
                // Any remaining bookie can trigger the audit; it only speeds up
                // re-replication bookkeeping.
                let pods = collector::pod_names(self.ctx.resources.as_ref(), &self.key).await;
                if let Some(pod) = pods.ok().and_then(|p| p.into_iter().next()) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Err(e) = self.admin.trigger_audit(&pod).await {
                        warn!(set = %self.key, error = %e, "failed to trigger audit");
                    } else {
                        info!(set = %self.key, deleted, "triggered audit after volume cleanup");
                    }
                }
            }
            Err(e) => warn!(set = %self.key, error = %e, "volume cleanup failed"),
        }
    }
}

#[async_trait]
impl AutoscalerTask for BookKeeperAutoscaler {
    fn key(&self) -> &ComponentSetKey {
        &self.key
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        if let Err(e) = validate_spec(&self.spec) {
            error!(set = %self.key, error = %e, "bookkeeper autoscaler misconfigured");
            return Err(e);
        }

        let Some(current) = self.ctx.resources.current_replicas(&self.key).await? else {
            info!(set = %self.key, "bookkeeper set not found, skipping");
            return Ok(());
        };

        if self.spec.clean_up_pvcs {
            self.run_pvc_cleanup(current, cancel).await;
        }

        let ready = readiness::is_ready_to_scale(
            self.ctx.resources.as_ref(),
            &self.key,
            &self.ctx.config.bookie_container,
            current,
            std::time::Duration::from_millis(self.spec.stabilization_window_ms),
        )
        .await?;
        if !ready {
            info!(set = %self.key, "bookkeeper set not ready to scale, skipping");
            return Ok(());
        }

        let nodes = collector::collect_bookie_nodes(
            self.ctx.resources.as_ref(),
            &self.admin,
            &self.key,
            |pod| self.bookie_id(pod),
            cancel,
        )
        .await?;

        let stats = ClusterStats::from_nodes(&nodes, self.spec.disk_usage_tolerance_hwm);
        let plan = plan(&stats, &nodes, &self.spec);
        debug!(set = %self.key, ?stats, ?plan, "bookkeeper scale plan");

        let no_under_replicated = match plan {
            ScalePlan::ScaleDownIfReplicated(_) => match nodes.first() {
                Some(node) => self.admin.no_under_replicated_ledgers(&node.pod).await,
                None => false,
            },
            _ => false,
        };
        let decision = decide(plan, no_under_replicated);

        match decision.direction {
            ScaleDirection::None => {
                info!(set = %self.key, ?stats, "bookkeeper set is stable");
                Ok(())
            }
            ScaleDirection::Up => {
                let target = target_replicas(current, decision.delta(), &self.spec);
                info!(set = %self.key, ?stats, current, target, "scaling bookies up");
                self.patch_replicas(current, target).await
            }
            ScaleDirection::Down => {
                let Some(query_pod) = nodes.first().map(|n| n.pod.clone()) else {
                    return Ok(());
                };
                let candidates = removal::candidates(&nodes, decision.magnitude as usize);
                let protocol = removal::RemovalProtocol::new(
                    &self.admin,
                    self.ctx.config.settle_delay(),
                    self.ctx.config.cookie_delete_attempts,
                );
                let summary = protocol.run(candidates, &query_pod, cancel).await;
                let applied = summary.applied_delta();
                if applied == 0 {
                    warn!(set = %self.key, outcome = ?summary.outcome, "bookie downscale aborted, no replicas removed");
                    return Ok(());
                }
                let target = target_replicas(current, applied, &self.spec);
                info!(
                    set = %self.key,
                    requested = decision.magnitude,
                    removed = summary.removed,
                    current,
                    target,
                    "scaling bookies down"
                );
                self.patch_replicas(current, target).await
            }
        }
    }
}
