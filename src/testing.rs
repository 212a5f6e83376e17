//! In-memory stand-ins for the cluster used by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, PodStatus, ResourceRequirements, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::autoscaler::bookkeeper::{BookieNodeInfo, DiskUsage};
use crate::autoscaler::{AutoscalerContext, ComponentSetKey};
use crate::config::AutoscalerConfig;
use crate::error::{Error, Result};
use crate::kubernetes::{ClusterResources, PodExecutor};

#[derive(Default)]
struct ResourceState {
    ready: HashMap<(String, String), i32>,
    pods: Vec<Pod>,
    cpu: BTreeMap<String, f64>,
    pvcs: Vec<PersistentVolumeClaim>,
    replicas: HashMap<ComponentSetKey, i32>,
    patches: Vec<(ComponentSetKey, i32)>,
    deleted_pvcs: Vec<String>,
}

/// Cluster whose objects are set directly by the test. Label selectors are ignored.
#[derive(Default)]
pub struct FakeResources {
    state: Mutex<ResourceState>,
}

impl FakeResources {
    fn state(&self) -> std::sync::MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap()
    }

    pub fn set_statefulset_ready(&self, namespace: &str, name: &str, ready: i32) {
        self.state()
            .ready
            .insert((namespace.to_string(), name.to_string()), ready);
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        self.state().pods = pods;
    }

    pub fn set_cpu_usage(&self, pod: &str, cores: f64) {
        self.state().cpu.insert(pod.to_string(), cores);
    }

    pub fn set_pvcs(&self, names: &[&str]) {
        self.state().pvcs = names.iter().map(|n| pvc(n)).collect();
    }

    pub fn set_replicas(&self, key: &ComponentSetKey, replicas: i32) {
        self.state().replicas.insert(key.clone(), replicas);
    }

    /// Every replica patch issued, in order
    pub fn patches(&self) -> Vec<(ComponentSetKey, i32)> {
        self.state().patches.clone()
    }

    pub fn deleted_pvcs(&self) -> Vec<String> {
        self.state().deleted_pvcs.clone()
    }
}

#[async_trait]
impl ClusterResources for FakeResources {
    async fn statefulset_ready_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<i32>> {
        Ok(self
            .state()
            .ready
            .get(&(namespace.to_string(), name.to_string()))
            .copied())
    }

    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(self.state().pods.clone())
    }

    async fn pod_cpu_usage(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<BTreeMap<String, f64>> {
        Ok(self.state().cpu.clone())
    }

    async fn list_pvcs(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.state().pvcs.clone())
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state
            .pvcs
            .retain(|p| p.metadata.name.as_deref() != Some(name));
        state.deleted_pvcs.push(name.to_string());
        Ok(())
    }

    async fn current_replicas(&self, key: &ComponentSetKey) -> Result<Option<i32>> {
        Ok(self.state().replicas.get(key).copied())
    }

    async fn patch_replicas(&self, key: &ComponentSetKey, replicas: i32) -> Result<()> {
        let mut state = self.state();
        state.replicas.insert(key.clone(), replicas);
        state.patches.push((key.clone(), replicas));
        Ok(())
    }
}

struct Rule {
    pod: Option<String>,
    pattern: String,
    /// `None` makes the exec fail
    responses: Vec<Option<String>>,
    served: usize,
}

#[derive(Default)]
struct ExecState {
    rules: Vec<Rule>,
    delays: Vec<(String, Duration)>,
    calls: Vec<(String, String)>,
}

/// Executor answering commands by substring rules.
///
/// The most recently added matching rule wins. A rule with several responses
/// serves them in order and then repeats the last one.
#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<ExecState>,
}

impl FakeExecutor {
    fn add_rule(&self, pod: Option<&str>, pattern: &str, responses: Vec<Option<String>>) {
        let mut state = self.state.lock().unwrap();
        let pod = pod.map(str::to_string);
        state
            .rules
            .retain(|r| !(r.pod == pod && r.pattern == pattern));
        state.rules.push(Rule {
            pod,
            pattern: pattern.to_string(),
            responses,
            served: 0,
        });
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.add_rule(None, pattern, vec![Some(output.to_string())]);
    }

    pub fn respond_for_pod(&self, pod: &str, pattern: &str, output: &str) {
        self.add_rule(Some(pod), pattern, vec![Some(output.to_string())]);
    }

    pub fn respond_sequence(&self, pattern: &str, outputs: &[&str]) {
        let responses = outputs.iter().map(|o| Some(o.to_string())).collect();
        self.add_rule(None, pattern, responses);
    }

    pub fn fail(&self, pattern: &str) {
        self.add_rule(None, pattern, vec![None]);
    }

    pub fn fail_for_pod(&self, pod: &str, pattern: &str) {
        self.add_rule(Some(pod), pattern, vec![None]);
    }

    /// Make commands containing `pattern` take `delay` before answering
    pub fn delay(&self, pattern: &str, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        state.delays.push((pattern.to_string(), delay));
    }

    /// Number of commands run containing `pattern`
    pub fn calls_matching(&self, pattern: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|(_, c)| c.contains(pattern)).count()
    }

    pub fn pod_calls_matching(&self, pod: &str, pattern: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(p, c)| p == pod && c.contains(pattern))
            .count()
    }
}

#[async_trait]
impl PodExecutor for FakeExecutor {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
    ) -> Result<String> {
        let command = command.join(" ");
        let (response, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((pod.to_string(), command.clone()));
            let delay = state
                .delays
                .iter()
                .find(|(pattern, _)| command.contains(pattern))
                .map(|(_, d)| *d);

            let rule = state.rules.iter_mut().rev().find(|r| {
                r.pod.as_deref().is_none_or(|p| p == pod) && command.contains(&r.pattern)
            });
            let response = rule.map(|rule| {
                let index = rule.served.min(rule.responses.len().saturating_sub(1));
                rule.served += 1;
                rule.responses.get(index).cloned().flatten()
            });
            (response, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match response {
            None => Err(Error::exec(pod, format!("no fake response for `{}`", command))),
            Some(Some(output)) => Ok(output),
            Some(None) => Err(Error::exec(pod, "connection refused")),
        }
    }
}

/// Context wired to the fakes with default settings.
pub fn context(
    resources: Arc<FakeResources>,
    executor: Arc<FakeExecutor>,
) -> Arc<AutoscalerContext> {
    Arc::new(AutoscalerContext::new(
        resources,
        executor,
        AutoscalerConfig::default(),
    ))
}

fn cpu_requests(request: Option<&str>) -> Option<ResourceRequirements> {
    request.map(|cpu| ResourceRequirements {
        requests: Some(BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string()))])),
        ..Default::default()
    })
}

/// Pod spec only, no status
pub fn pod_with_cpu_request(name: &str, request: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: cpu_requests(request),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// Running pod whose `container` is ready, started `started_secs_ago` before `now`
pub fn ready_pod(name: &str, container: &str, now: DateTime<Utc>, started_secs_ago: i64) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: container.to_string(),
                resources: cpu_requests(Some("1")),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            start_time: Some(Time(now - chrono::Duration::seconds(started_secs_ago))),
            container_statuses: Some(vec![ContainerStatus {
                name: container.to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Add a volume backed by `claim` to a pod
pub fn with_claim(mut pod: Pod, claim: &str) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        });
    }
    pod
}

pub fn pvc(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Bookie snapshot with one 1000-byte disk used at `usage_ratio`
pub fn bookie(pod: &str, writable: bool, usage_ratio: f64) -> BookieNodeInfo {
    BookieNodeInfo {
        pod: pod.to_string(),
        bookie_id: format!("{}:3181", pod),
        is_writable: writable,
        disks: vec![DiskUsage {
            max_bytes: 1000,
            used_bytes: (usage_ratio * 1000.0).round() as u64,
        }],
    }
}
