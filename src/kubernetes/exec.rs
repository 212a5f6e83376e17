//! Remote command execution inside pods.
//!
//! Commands run through the K8s exec API (WebSocket). The channel status is
//! the transport's, not the shell command's exit code, so callers decide
//! success by inspecting stdout. Commands that need stderr merge it with
//! `2>&1` themselves.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

/// Runs a command in a pod's container and returns its stdout.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command` in `container` of `pod`.
    ///
    /// Resolves once the exec channel closes. Fails if the channel cannot be
    /// opened or the transport breaks.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<String>;

    /// Like [`exec`](Self::exec) but gives up as soon as `cancel` fires.
    ///
    /// Dropping the in-flight exec closes its channel and buffers.
    async fn exec_until_cancelled(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.exec(namespace, pod, container, command) => result,
        }
    }
}

/// Wrap a shell snippet as an exec command.
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// [`PodExecutor`] backed by the kube-rs exec API
#[derive(Clone)]
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        trace!(%namespace, %pod, %container, ?command, "exec");

        let mut attached = pods
            .exec(
                pod,
                command.to_vec(),
                &AttachParams::default()
                    .container(container)
                    .stdout(true)
                    .stderr(true),
            )
            .await
            .map_err(|e| Error::exec(pod, format!("failed to open exec channel: {}", e)))?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::exec(pod, "no stdout"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| Error::exec(pod, "no stderr"))?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        // Read stdout and stderr concurrently so neither pipe stalls the other
        let (stdout_result, stderr_result) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout_buf),
            stderr_reader.read_to_end(&mut stderr_buf),
        );

        stdout_result.map_err(|e| Error::exec(pod, format!("failed to read stdout: {}", e)))?;
        stderr_result.map_err(|e| Error::exec(pod, format!("failed to read stderr: {}", e)))?;

        attached
            .join()
            .await
            .map_err(|e| Error::exec(pod, format!("exec channel failed: {}", e)))?;

        if !stderr_buf.is_empty() {
            trace!(%pod, stderr = %String::from_utf8_lossy(&stderr_buf), "exec stderr");
        }

        Ok(String::from_utf8_lossy(&stdout_buf).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SlowExecutor;

    #[async_trait]
    impl PodExecutor for SlowExecutor {
        async fn exec(&self, _: &str, _: &str, _: &str, _: &[String]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".to_string())
        }
    }

    #[test]
    fn test_shell_wraps_script() {
        assert_eq!(shell("echo hi"), vec!["sh", "-c", "echo hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_until_cancelled_stops_pending_exec() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = SlowExecutor
            .exec_until_cancelled("ns", "pod-0", "main", &shell("sleep 1h"), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
