//! Readiness gate run before every scaling evaluation.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::info;

use super::ClusterResources;
use crate::autoscaler::ComponentSetKey;
use crate::error::Result;

/// Whether a component set is settled enough to be evaluated for scaling.
///
/// False when the StatefulSet is missing or not fully ready, when the pod
/// count differs from `expected_replicas`, when a pod's primary container is
/// not ready, or when a pod started less than `stabilization_window` ago.
pub async fn is_ready_to_scale(
    resources: &dyn ClusterResources,
    key: &ComponentSetKey,
    container: &str,
    expected_replicas: i32,
    stabilization_window: Duration,
) -> Result<bool> {
    is_ready_at(
        resources,
        key,
        container,
        expected_replicas,
        stabilization_window,
        Utc::now(),
    )
    .await
}

pub(crate) async fn is_ready_at(
    resources: &dyn ClusterResources,
    key: &ComponentSetKey,
    container: &str,
    expected_replicas: i32,
    stabilization_window: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let statefulset = key.statefulset_name();
    let ready = resources
        .statefulset_ready_replicas(&key.namespace, &statefulset)
        .await?;
    match ready {
        None => {
            info!(set = %key, %statefulset, "statefulset not found, not ready to scale");
            return Ok(false);
        }
        Some(ready) if ready != expected_replicas => {
            info!(set = %key, ready, expected = expected_replicas, "statefulset not fully ready");
            return Ok(false);
        }
        Some(_) => {}
    }

    let pods = resources
        .list_pods(&key.namespace, &key.pod_selector())
        .await?;
    if pods.len() != expected_replicas.max(0) as usize {
        info!(set = %key, pods = pods.len(), expected = expected_replicas, "pod count mismatch");
        return Ok(false);
    }

    let window = chrono::Duration::from_std(stabilization_window).unwrap_or(chrono::Duration::MAX);
    for pod in &pods {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        if !primary_container_ready(pod, container) {
            info!(set = %key, pod = %name, "pod not ready");
            return Ok(false);
        }
        let Some(started) = pod_start_time(pod) else {
            info!(set = %key, pod = %name, "pod has no start time");
            return Ok(false);
        };
        if now.signed_duration_since(started) < window {
            info!(
                set = %key,
                pod = %name,
                started = %started,
                "pod started within the stabilization window"
            );
            return Ok(false);
        }
    }

    Ok(true)
}

/// Readiness of the named container, or of the first one when it is absent.
fn primary_container_ready(pod: &Pod, container: &str) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    let Some(statuses) = statuses else {
        return false;
    };
    statuses
        .iter()
        .find(|s| s.name == container)
        .or_else(|| statuses.first())
        .map(|s| s.ready)
        .unwrap_or(false)
}

fn pod_start_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status.as_ref()?.start_time.as_ref().map(|t| t.0)
}
