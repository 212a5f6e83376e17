//! Kubernetes collaborators of the autoscaler.
//!
//! The control loop only talks to the cluster through two seams:
//! - [`ClusterResources`]: StatefulSet/Pod/PVC lookups and the replica patch
//! - [`PodExecutor`]: running a command inside a pod's container
//!
//! Both have kube-rs backed implementations here and in-memory fakes in tests.

pub mod exec;
pub mod readiness;
pub mod resources;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig};

pub use exec::{KubePodExecutor, PodExecutor};
pub use readiness::is_ready_to_scale;
pub use resources::{ClusterResources, KubeResources};

use crate::config::KubernetesConfig;

/// Build the Kubernetes API client
pub async fn build_client(config: &KubernetesConfig) -> Result<Client> {
    // Try in-cluster config first (when running inside K8s)
    if let Ok(config) = KubeConfig::incluster() {
        return Client::try_from(config).context("Failed to create in-cluster K8s client");
    }

    // Fall back to kubeconfig
    let kubeconfig = if let Some(ref path) = config.kubeconfig {
        let expanded = tilde_expand(path);
        Kubeconfig::read_from(expanded).context("Failed to read kubeconfig")?
    } else {
        Kubeconfig::read().context("Failed to read default kubeconfig")?
    };

    let mut options = KubeConfigOptions::default();
    if let Some(ref ctx) = config.context {
        options.context = Some(ctx.clone());
    }

    let kube_config = KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .context("Failed to build K8s config from kubeconfig")?;

    Client::try_from(kube_config).context("Failed to create K8s client")
}

/// Expand tilde (~) to home directory in paths
fn tilde_expand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), rest);
        }
    }
    path.to_string()
}

/// Ordinal of a StatefulSet pod or PVC name (`bk-3` → 3).
pub fn ordinal_of(name: &str) -> Option<u32> {
    name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

/// Sort StatefulSet member names by prefix, then numeric ordinal.
///
/// Plain string order would put `bk-10` before `bk-9`.
pub fn sort_by_ordinal<T>(items: &mut [T], name: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| {
        let (a, b) = (name(a), name(b));
        let prefix = |s: &str| s.rsplit_once('-').map(|(p, _)| p.to_string());
        prefix(a)
            .cmp(&prefix(b))
            .then(ordinal_of(a).cmp(&ordinal_of(b)))
            .then(a.cmp(b))
    });
}
