//! Resource lookups and the replica patch used by the autoscaler.
//!
//! Missing objects are reported as `Ok(None)` so callers can treat them as a
//! transient condition instead of an error path.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::Client;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use std::collections::BTreeMap;
use tracing::debug;

use crate::autoscaler::ComponentSetKey;
use crate::crd::PulsarCluster;
use crate::error::Result;

/// The cluster state the autoscaler reads and the one field it writes.
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Ready replica count of a StatefulSet, `None` if it does not exist
    async fn statefulset_ready_replicas(&self, namespace: &str, name: &str)
    -> Result<Option<i32>>;

    /// Pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// CPU usage in cores per pod name, from the metrics API
    async fn pod_cpu_usage(&self, namespace: &str, selector: &str)
    -> Result<BTreeMap<String, f64>>;

    /// PersistentVolumeClaims matching a label selector
    async fn list_pvcs(&self, namespace: &str, selector: &str)
    -> Result<Vec<PersistentVolumeClaim>>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Desired replicas recorded on the cluster resource, `None` if the
    /// cluster or the component is absent
    async fn current_replicas(&self, key: &ComponentSetKey) -> Result<Option<i32>>;

    /// Set the desired replicas of one component set
    async fn patch_replicas(&self, key: &ComponentSetKey, replicas: i32) -> Result<()>;
}

/// [`ClusterResources`] backed by the API server
#[derive(Clone)]
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pod_metrics_resource() -> ApiResource {
        ApiResource {
            group: "metrics.k8s.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "metrics.k8s.io/v1beta1".to_string(),
            kind: "PodMetrics".to_string(),
            plural: "pods".to_string(),
        }
    }
}

#[async_trait]
impl ClusterResources for KubeResources {
    async fn statefulset_ready_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<i32>> {
        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(sts
            .get_opt(name)
            .await?
            .map(|s| s.status.and_then(|st| st.ready_replicas).unwrap_or(0)))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(pods.list(&lp).await?.items)
    }

    async fn pod_cpu_usage(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<BTreeMap<String, f64>> {
        let resource = Self::pod_metrics_resource();
        let metrics: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let lp = ListParams::default().labels(selector);

        let mut usage = BTreeMap::new();
        for item in metrics.list(&lp).await?.items {
            let Some(name) = item.metadata.name.clone() else {
                continue;
            };
            if let Some(cores) = containers_cpu_usage(&item.data) {
                usage.insert(name, cores);
            } else {
                debug!(pod = %name, "pod metrics carry no cpu usage");
            }
        }
        Ok(usage)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(pvcs.list(&lp).await?.items)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvcs.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn current_replicas(&self, key: &ComponentSetKey) -> Result<Option<i32>> {
        let clusters: Api<PulsarCluster> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(clusters
            .get_opt(&key.cluster)
            .await?
            .and_then(|c| c.replicas_for(key.component, &key.set)))
    }

    async fn patch_replicas(&self, key: &ComponentSetKey, replicas: i32) -> Result<()> {
        let clusters: Api<PulsarCluster> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = key.replicas_patch(replicas);
        clusters
            .patch(&key.cluster, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Sum of `containers[].usage.cpu` of a PodMetrics object, in cores.
fn containers_cpu_usage(data: &serde_json::Value) -> Option<f64> {
    let containers = data.get("containers")?.as_array()?;
    let mut total = None;
    for container in containers {
        let cpu = container
            .get("usage")
            .and_then(|u| u.get("cpu"))
            .and_then(|c| c.as_str())
            .and_then(parse_cpu_quantity);
        if let Some(cpu) = cpu {
            *total.get_or_insert(0.0) += cpu;
        }
    }
    total
}

/// Parse a Kubernetes CPU quantity (`"2"`, `"250m"`, `"1500u"`, `"12345n"`) into cores.
pub fn parse_cpu_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let (number, scale) = match quantity.char_indices().last()? {
        (i, 'n') => (&quantity[..i], 1e-9),
        (i, 'u') => (&quantity[..i], 1e-6),
        (i, 'm') => (&quantity[..i], 1e-3),
        (i, 'k') => (&quantity[..i], 1e3),
        _ => (quantity, 1.0),
    };
    number.parse::<f64>().ok().map(|n| n * scale)
}

/// Total CPU requested by a pod's containers, in cores.
///
/// `None` when no container declares a CPU request.
pub fn pod_cpu_request(pod: &Pod) -> Option<f64> {
    let spec = pod.spec.as_ref()?;
    let mut total = None;
    for container in &spec.containers {
        let request = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("cpu"))
            .and_then(|q| parse_cpu_quantity(&q.0));
        if let Some(request) = request {
            *total.get_or_insert(0.0) += request;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_cpu_quantity() {
        assert_eq!(parse_cpu_quantity("2"), Some(2.0));
        assert_eq!(parse_cpu_quantity("250m"), Some(0.25));
        assert!((parse_cpu_quantity("1500u").unwrap() - 0.0015).abs() < 1e-12);
        assert!((parse_cpu_quantity("5000000n").unwrap() - 0.005).abs() < 1e-12);
        assert_eq!(parse_cpu_quantity("0.5"), Some(0.5));
        assert_eq!(parse_cpu_quantity("lots"), None);
        assert_eq!(parse_cpu_quantity(""), None);
    }

    #[test]
    fn test_containers_cpu_usage_sums_containers() {
        let data = json!({
            "containers": [
                {"name": "broker", "usage": {"cpu": "400m", "memory": "1Gi"}},
                {"name": "sidecar", "usage": {"cpu": "100m"}}
            ]
        });
        assert_eq!(containers_cpu_usage(&data), Some(0.5));
        assert_eq!(containers_cpu_usage(&json!({"containers": []})), None);
        assert_eq!(containers_cpu_usage(&json!({})), None);
    }

    #[test]
    fn test_pod_cpu_request() {
        let pod = crate::testing::pod_with_cpu_request("broker-0", Some("500m"));
        assert_eq!(pod_cpu_request(&pod), Some(0.5));
        let pod = crate::testing::pod_with_cpu_request("broker-1", None);
        assert_eq!(pod_cpu_request(&pod), None);
    }
}
