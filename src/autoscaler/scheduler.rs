//! Keeps one periodic autoscaler task alive per enabled component set.
//!
//! Replaced tasks are cancelled but never aborted: a run in the middle of a
//! bookie removal has to reach its rollback. The replacement waits for its
//! predecessor to finish before its first run, so runs of one set never
//! overlap.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AutoscalerContext, AutoscalerSpec, AutoscalerTask, ComponentSetKey, build_task};
use crate::error::Error;

/// Builds the task run for a set
pub type TaskFactory =
    Arc<dyn Fn(ComponentSetKey, AutoscalerSpec) -> Arc<dyn AutoscalerTask> + Send + Sync>;

struct ScheduledTask {
    /// Snapshot the task was created with
    spec: AutoscalerSpec,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct Registry {
    live: HashMap<ComponentSetKey, ScheduledTask>,
    /// Cancelled tasks that may still be finishing a run
    retiring: HashMap<ComponentSetKey, JoinHandle<()>>,
    closed: bool,
}

impl Registry {
    fn retire(&mut self, key: ComponentSetKey, task: ScheduledTask) {
        task.cancel.cancel();
        // A task only finishes after its own predecessor, so the newest
        // handle covers any older one for the same key.
        self.retiring.insert(key, task.handle);
    }
}

/// Registry of the live autoscaler tasks of every observed cluster.
pub struct SchedulingDaemon {
    registry: Mutex<Registry>,
    factory: TaskFactory,
    cancel_grace: Duration,
    next_generation: AtomicU64,
}

impl SchedulingDaemon {
    pub fn new(ctx: Arc<AutoscalerContext>) -> Self {
        let cancel_grace = ctx.config.cancel_grace();
        let factory: TaskFactory = Arc::new(move |key, spec| build_task(key, spec, ctx.clone()));
        Self::with_factory(factory, cancel_grace)
    }

    pub fn with_factory(factory: TaskFactory, cancel_grace: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            factory,
            cancel_grace,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Bring the tasks of one cluster in line with its latest spec.
    ///
    /// Sets whose spec is unchanged keep their task. Changed sets are
    /// cancelled and, when still enabled, rescheduled. Sets of this cluster
    /// absent from `specs` are cancelled. Never waits for a run to finish.
    pub async fn observe(
        &self,
        namespace: &str,
        cluster: &str,
        specs: Vec<(ComponentSetKey, AutoscalerSpec)>,
    ) {
        let mut registry = self.registry.lock().await;
        if registry.closed {
            debug!(%namespace, %cluster, "scheduler shut down, ignoring observation");
            return;
        }
        registry.retiring.retain(|_, handle| !handle.is_finished());

        let gone: Vec<ComponentSetKey> = registry
            .live
            .keys()
            .filter(|k| k.namespace == namespace && k.cluster == cluster)
            .filter(|k| !specs.iter().any(|(key, _)| key == *k))
            .cloned()
            .collect();
        for key in gone {
            if let Some(task) = registry.live.remove(&key) {
                info!(set = %key, "component set removed, cancelling autoscaler");
                registry.retire(key, task);
            }
        }

        for (key, spec) in specs {
            if registry.live.get(&key).is_some_and(|t| t.spec == spec) {
                continue;
            }
            if let Some(task) = registry.live.remove(&key) {
                info!(set = %key, "autoscaler spec changed, cancelling current task");
                registry.retire(key.clone(), task);
            }
            if spec.enabled() {
                let predecessor = registry.retiring.remove(&key);
                let task = self.spawn(key.clone(), spec, predecessor);
                info!(set = %key, generation = task.generation, "scheduled autoscaler");
                registry.live.insert(key, task);
            } else {
                debug!(set = %key, "autoscaler disabled");
            }
        }
    }

    /// Cancel every task of a deleted cluster.
    pub async fn forget_cluster(&self, namespace: &str, cluster: &str) {
        self.observe(namespace, cluster, Vec::new()).await;
    }

    /// Cancel every task, refuse further scheduling and wait for in-flight
    /// runs to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<(ComponentSetKey, JoinHandle<()>)> = {
            let mut registry = self.registry.lock().await;
            registry.closed = true;
            let live: Vec<_> = registry.live.drain().collect();
            for (key, task) in live {
                registry.retire(key, task);
            }
            registry.retiring.drain().collect()
        };
        for (key, handle) in handles {
            wait_for_run(&key, handle, self.cancel_grace).await;
        }
        info!("autoscaler scheduler stopped");
    }

    /// Keys with a live task, sorted
    pub async fn scheduled_keys(&self) -> Vec<ComponentSetKey> {
        let mut keys: Vec<_> = self.registry.lock().await.live.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Generation of the live task of `key`; changes every time it is rescheduled
    pub async fn task_generation(&self, key: &ComponentSetKey) -> Option<u64> {
        self.registry.lock().await.live.get(key).map(|t| t.generation)
    }

    fn spawn(
        &self,
        key: ComponentSetKey,
        spec: AutoscalerSpec,
        predecessor: Option<JoinHandle<()>>,
    ) -> ScheduledTask {
        let cancel = CancellationToken::new();
        let task = (self.factory)(key, spec.clone());
        let handle = tokio::spawn(run_periodic(
            task,
            spec.period(),
            cancel.clone(),
            predecessor,
            self.cancel_grace,
        ));
        ScheduledTask {
            spec,
            cancel,
            handle,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Wait for a cancelled task to return, warning once it outlives `grace`.
async fn wait_for_run(key: &ComponentSetKey, mut handle: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        warn!(set = %key, ?grace, "autoscaler run still in progress after cancellation, waiting");
        let _ = handle.await;
    }
    debug!(set = %key, "autoscaler task stopped");
}

/// Fixed-delay loop: each run starts one period after the previous one returned.
async fn run_periodic(
    task: Arc<dyn AutoscalerTask>,
    period: Duration,
    cancel: CancellationToken,
    predecessor: Option<JoinHandle<()>>,
    grace: Duration,
) {
    // Waited out even when cancelled, so a successor of this task can rely
    // on this one's completion.
    if let Some(previous) = predecessor {
        wait_for_run(task.key(), previous, grace).await;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(period) => {}
        }

        let key = task.key();
        let result = AssertUnwindSafe(task.run_once(&cancel)).catch_unwind().await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(Error::Cancelled)) => debug!(set = %key, "autoscaler run cancelled"),
            Ok(Err(e @ Error::InvalidConfig(_))) => {
                error!(set = %key, error = %e, "autoscaler run rejected its configuration")
            }
            Ok(Err(e)) => warn!(set = %key, error = %e, "autoscaler run failed"),
            Err(_) => error!(set = %key, "autoscaler run panicked"),
        }
    }
}
