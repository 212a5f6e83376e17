//! Bookie administration through commands run inside bookie pods.
//!
//! Bookies expose no control API to the operator other than what can be
//! reached from inside their own container: the HTTP admin endpoint on
//! localhost and the `bookkeeper shell`. Every success or failure here is
//! decided by matching the command output against the markers below.

use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DiskUsage;
use crate::config::AutoscalerConfig;
use crate::error::{Error, Result};
use crate::kubernetes::PodExecutor;
use crate::kubernetes::exec::shell;

/// Only output accepted as "replication is healthy"
pub const NO_UNDER_REPLICATED_MARKER: &str = "No under replicated ledgers found";
/// Printed by `recover` when every ledger of the bookie was re-replicated
pub const RECOVERY_COMPLETED_MARKER: &str = "Recover bookie operation completed with rc : OK";
/// Prefix of each line printed by `listledgers`
pub const LEDGER_ID_MARKER: &str = "ledgerID";
/// Printed by `deletecookie` on success
pub const COOKIE_DELETED_MARKER: &str = "Deleted cookie";
/// Outputs meaning the cookie was already gone
pub const COOKIE_ABSENT_MARKERS: &[&str] = &["NoNodeException", "cookie not found"];

const BOOKKEEPER_SHELL: &str = "bin/bookkeeper shell";

/// Runtime state reported by `/api/v1/bookie/state`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookieState {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub shutting_down: bool,
}

impl BookieState {
    pub fn is_writable(&self) -> bool {
        self.running && !self.read_only && !self.shutting_down
    }
}

/// Disk space reported by `/api/v1/bookie/info`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookieInfo {
    pub free_space: u64,
    pub total_space: u64,
}

impl BookieInfo {
    pub fn disk_usage(&self) -> DiskUsage {
        DiskUsage {
            max_bytes: self.total_space,
            used_bytes: self.total_space.saturating_sub(self.free_space),
        }
    }
}

/// Issues admin commands against the bookies of one namespace
#[derive(Clone)]
pub struct BookieAdmin {
    executor: Arc<dyn PodExecutor>,
    namespace: String,
    container: String,
    admin_port: u16,
    data_dirs: Vec<String>,
}

impl BookieAdmin {
    pub fn new(executor: Arc<dyn PodExecutor>, namespace: &str, config: &AutoscalerConfig) -> Self {
        Self {
            executor,
            namespace: namespace.to_string(),
            container: config.bookie_container.clone(),
            admin_port: config.bookie_admin_port,
            data_dirs: config.bookie_data_dirs.clone(),
        }
    }

    async fn run(&self, pod: &str, script: String) -> Result<String> {
        self.executor
            .exec(&self.namespace, pod, &self.container, &shell(script))
            .await
    }

    async fn run_until_cancelled(
        &self,
        pod: &str,
        script: String,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.executor
            .exec_until_cancelled(&self.namespace, pod, &self.container, &shell(script), cancel)
            .await
    }

    fn admin_url(&self, path: &str) -> String {
        format!("localhost:{}/api/v1/bookie/{}", self.admin_port, path)
    }

    /// Query the bookie's runtime state.
    pub async fn state(&self, pod: &str, cancel: &CancellationToken) -> Result<BookieState> {
        let output = self
            .run_until_cancelled(pod, format!("curl -s {}", self.admin_url("state")), cancel)
            .await?;
        serde_json::from_str(output.trim()).map_err(|e| Error::parse("bookie state", e))
    }

    /// Query the bookie's disk space.
    pub async fn info(&self, pod: &str, cancel: &CancellationToken) -> Result<BookieInfo> {
        let output = self
            .run_until_cancelled(pod, format!("curl -s {}", self.admin_url("info")), cancel)
            .await?;
        serde_json::from_str(output.trim()).map_err(|e| Error::parse("bookie info", e))
    }

    /// Toggle the bookie's read-only mode.
    pub async fn set_read_only(&self, pod: &str, read_only: bool) -> Result<()> {
        let body = serde_json::json!({ "readOnly": read_only });
        let script = format!(
            "curl -s -X PUT -H 'Content-Type: application/json' -d '{}' {}",
            body,
            self.admin_url("state/readonly")
        );
        let output = self.run(pod, script).await?;
        let state: BookieState =
            serde_json::from_str(output.trim()).map_err(|e| Error::parse("bookie state", e))?;
        if state.read_only != read_only {
            return Err(Error::exec(
                pod,
                format!("bookie did not switch read-only to {}", read_only),
            ));
        }
        Ok(())
    }

    /// True only when the cluster reports no under-replicated ledgers.
    ///
    /// Any other output, including exec failures, counts as "not clear".
    pub async fn no_under_replicated_ledgers(&self, pod: &str) -> bool {
        let script = format!("{} listunderreplicated 2>&1", BOOKKEEPER_SHELL);
        match self.run(pod, script).await {
            Ok(output) if output.contains(NO_UNDER_REPLICATED_MARKER) => true,
            Ok(output) => {
                debug!(%pod, output = %output.trim(), "under-replicated ledgers reported");
                false
            }
            Err(e) => {
                warn!(%pod, error = %e, "under-replicated ledger check failed");
                false
            }
        }
    }

    /// Re-replicate every ledger held by `bookie_id`. True only on the completion marker.
    pub async fn recover(&self, pod: &str, bookie_id: &str) -> bool {
        let script = format!("{} recover -f {} 2>&1", BOOKKEEPER_SHELL, bookie_id);
        match self.run(pod, script).await {
            Ok(output) if output.contains(RECOVERY_COMPLETED_MARKER) => true,
            Ok(output) => {
                warn!(%pod, %bookie_id, output = %output.trim(), "bookie recovery did not complete");
                false
            }
            Err(e) => {
                warn!(%pod, %bookie_id, error = %e, "bookie recovery failed");
                false
            }
        }
    }

    /// Whether ledgers may still be assigned to `bookie_id`.
    ///
    /// Ledger IDs in the listing, error text, or a failed exec all answer yes.
    pub async fn may_hold_ledgers(&self, pod: &str, bookie_id: &str) -> bool {
        let script = format!(
            "{} listledgers -bookieid {} 2>&1",
            BOOKKEEPER_SHELL, bookie_id
        );
        match self.run(pod, script).await {
            Ok(output) => {
                let has_data = output.contains(LEDGER_ID_MARKER)
                    || output.contains("Exception")
                    || output.contains("ERROR");
                if has_data {
                    debug!(%pod, %bookie_id, "ledger listing reports residual data");
                }
                has_data
            }
            Err(e) => {
                warn!(%pod, %bookie_id, error = %e, "ledger listing failed");
                true
            }
        }
    }

    /// Delete the bookie's cookie, retrying up to `attempts` times.
    pub async fn delete_cookie(&self, pod: &str, bookie_id: &str, attempts: u32) -> bool {
        let script = format!(
            "{} deletecookie -bookieid {} 2>&1",
            BOOKKEEPER_SHELL, bookie_id
        );
        for attempt in 1..=attempts.max(1) {
            match self.run(pod, script.clone()).await {
                Ok(output) if cookie_gone(&output) => return true,
                Ok(output) => {
                    warn!(%pod, %bookie_id, attempt, output = %output.trim(), "cookie deletion not confirmed");
                }
                Err(e) => {
                    warn!(%pod, %bookie_id, attempt, error = %e, "cookie deletion failed");
                }
            }
        }
        false
    }

    /// Move each data directory's VERSION marker aside so a restarted pod
    /// cannot boot on the stale directories.
    pub async fn retire_version_markers(&self, pod: &str) -> Result<()> {
        let moves: Vec<String> = self
            .data_dirs
            .iter()
            .map(|dir| {
                format!(
                    "if [ -f {dir}/current/VERSION ]; then mv {dir}/current/VERSION {dir}/current/VERSION.removed; fi",
                    dir = dir
                )
            })
            .collect();
        let script = format!("{} && echo retired", moves.join(" && "));
        let output = self.run(pod, script).await?;
        if output.contains("retired") {
            Ok(())
        } else {
            Err(Error::exec(pod, format!("unexpected output: {}", output.trim())))
        }
    }

    /// Ask the auditor to re-check ledger placement.
    pub async fn trigger_audit(&self, pod: &str) -> Result<()> {
        let script = format!("{} triggeraudit 2>&1", BOOKKEEPER_SHELL);
        self.run(pod, script).await.map(|_| ())
    }
}

fn cookie_gone(output: &str) -> bool {
    output.contains(COOKIE_DELETED_MARKER)
        || COOKIE_ABSENT_MARKERS.iter().any(|m| output.contains(m))
}
