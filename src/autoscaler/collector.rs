//! Per-node facts gathered at the start of each run.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ComponentSetKey;
use super::bookkeeper::{BookieAdmin, BookieNodeInfo};
use super::broker::BrokerNodeInfo;
use crate::error::{Error, Result};
use crate::kubernetes::resources::pod_cpu_request;
use crate::kubernetes::{ClusterResources, sort_by_ordinal};

/// Names of the pods of a set, ordinal-sorted
pub async fn pod_names(
    resources: &dyn ClusterResources,
    key: &ComponentSetKey,
) -> Result<Vec<String>> {
    let pods = resources
        .list_pods(&key.namespace, &key.pod_selector())
        .await?;
    let mut names: Vec<String> = pods.into_iter().filter_map(|p| p.metadata.name).collect();
    sort_by_ordinal(&mut names, |n| n.as_str());
    Ok(names)
}

/// CPU usage and request of every broker pod of a set.
///
/// Pods without a metrics sample or without a CPU request are skipped.
pub async fn collect_broker_nodes(
    resources: &dyn ClusterResources,
    key: &ComponentSetKey,
) -> Result<Vec<BrokerNodeInfo>> {
    let selector = key.pod_selector();
    let pods = resources.list_pods(&key.namespace, &selector).await?;
    let usage = resources.pod_cpu_usage(&key.namespace, &selector).await?;

    let mut nodes = Vec::with_capacity(pods.len());
    for pod in &pods {
        let Some(name) = pod.metadata.name.clone() else {
            continue;
        };
        let Some(used_cpu) = usage.get(&name).copied() else {
            debug!(set = %key, pod = %name, "no cpu metrics for pod, skipping");
            continue;
        };
        let Some(requested_cpu) = pod_cpu_request(pod) else {
            debug!(set = %key, pod = %name, "pod has no cpu request, skipping");
            continue;
        };
        nodes.push(BrokerNodeInfo {
            pod: name,
            used_cpu,
            requested_cpu,
        });
    }
    sort_by_ordinal(&mut nodes, |n| n.pod.as_str());
    Ok(nodes)
}

/// Writability and disk usage of every bookie pod of a set.
///
/// Pods are queried concurrently. A pod whose queries fail is reported as
/// non-writable with no disks. Cancellation aborts the whole collection.
pub async fn collect_bookie_nodes(
    resources: &dyn ClusterResources,
    admin: &BookieAdmin,
    key: &ComponentSetKey,
    bookie_id: impl Fn(&str) -> String,
    cancel: &CancellationToken,
) -> Result<Vec<BookieNodeInfo>> {
    let names = pod_names(resources, key).await?;

    let queries = names.iter().map(|pod| async move {
        let state = admin.state(pod, cancel).await;
        let info = admin.info(pod, cancel).await;
        (pod, state, info)
    });

    let mut nodes = Vec::with_capacity(names.len());
    for (pod, state, info) in join_all(queries).await {
        let node = match (state, info) {
            (Err(Error::Cancelled), _) | (_, Err(Error::Cancelled)) => {
                return Err(Error::Cancelled);
            }
            (Ok(state), Ok(info)) => BookieNodeInfo {
                pod: pod.clone(),
                bookie_id: bookie_id(pod),
                is_writable: state.is_writable(),
                disks: vec![info.disk_usage()],
            },
            (state, info) => {
                if let Err(e) = &state {
                    warn!(set = %key, %pod, error = %e, "bookie state query failed");
                }
                if let Err(e) = &info {
                    warn!(set = %key, %pod, error = %e, "bookie info query failed");
                }
                BookieNodeInfo {
                    pod: pod.clone(),
                    bookie_id: bookie_id(pod),
                    is_writable: false,
                    disks: Vec::new(),
                }
            }
        };
        nodes.push(node);
    }

    sort_by_ordinal(&mut nodes, |n| n.pod.as_str());
    Ok(nodes)
}
