//! PulsarCluster controller.
//!
//! Every reconcile hands the cluster's autoscaler specs to the
//! [`SchedulingDaemon`] and reports which sets are autoscaled in the status.
//! Scaling itself happens in the scheduled tasks, not here.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::autoscaler::{ComponentSetKey, SchedulingDaemon};
use crate::crd::{PulsarCluster, PulsarClusterStatus};

const REQUEUE_AFTER: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_AFTER: Duration = Duration::from_secs(60);

/// Shared state for the reconciler
struct ControllerContext {
    client: Client,
    daemon: Arc<SchedulingDaemon>,
}

/// Error type for the reconciler (wraps the crate error)
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
struct ReconcileError {
    #[from]
    source: crate::Error,
}

async fn reconcile(
    cluster: Arc<PulsarCluster>,
    ctx: Arc<ControllerContext>,
) -> std::result::Result<Action, ReconcileError> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() {
        info!(%namespace, cluster = %name, "cluster is being deleted, dropping its autoscalers");
        ctx.daemon.forget_cluster(&namespace, &name).await;
        return Ok(Action::await_change());
    }

    let specs = cluster.autoscaler_specs();
    debug!(%namespace, cluster = %name, sets = specs.len(), "observed autoscaler specs");
    ctx.daemon.observe(&namespace, &name, specs).await;

    let keys: Vec<ComponentSetKey> = ctx
        .daemon
        .scheduled_keys()
        .await
        .into_iter()
        .filter(|k| k.namespace == namespace && k.cluster == name)
        .collect();

    // A status write is itself a watch event; only write on change.
    if let Some(patch) = status_patch(cluster.status.as_ref(), &keys, Utc::now()) {
        let clusters: Api<PulsarCluster> = Api::namespaced(ctx.client.clone(), &namespace);
        clusters
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(crate::Error::from)?;
        debug!(%namespace, cluster = %name, "status updated");
    }

    Ok(Action::requeue(REQUEUE_AFTER))
}

/// Error handler for reconcile failures
fn reconcile_error(
    cluster: Arc<PulsarCluster>,
    error: &ReconcileError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "reconcile failed");
    Action::requeue(ERROR_REQUEUE_AFTER)
}

/// Status merge patch listing the autoscaled sets as `component/set`.
///
/// `None` when `current` already lists exactly these sets.
fn status_patch(
    current: Option<&PulsarClusterStatus>,
    keys: &[ComponentSetKey],
    now: DateTime<Utc>,
) -> Option<serde_json::Value> {
    let sets: Vec<String> = keys
        .iter()
        .map(|k| format!("{}/{}", k.component, k.set))
        .collect();
    if current.is_some_and(|status| status.autoscaled_sets == sets) {
        return None;
    }
    Some(serde_json::json!({
        "status": {
            "autoscaledSets": sets,
            "lastTransitionTime": now.to_rfc3339(),
        }
    }))
}

/// Run the controller until SIGINT or SIGTERM.
///
/// `namespace` limits the watch; `None` watches every namespace.
pub async fn run_controller(
    client: Client,
    daemon: Arc<SchedulingDaemon>,
    namespace: Option<&str>,
) -> Result<()> {
    let clusters: Api<PulsarCluster> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let context = Arc::new(ControllerContext {
        client,
        daemon: daemon.clone(),
    });

    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, reconcile_error, context)
        .for_each(|result| {
            let daemon = daemon.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(cluster = %obj.name, "reconciled");
                    }
                    // Deleted clusters surface here once they leave the cache
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        let namespace = obj.namespace.unwrap_or_else(|| "default".to_string());
                        info!(%namespace, cluster = %obj.name, "cluster deleted, dropping its autoscalers");
                        daemon.forget_cluster(&namespace, &obj.name).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "controller error");
                    }
                }
            }
        })
        .await;

    Ok(())
}
