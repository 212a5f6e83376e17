//! Configuration parsing for the operator's TOML config file.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure matching pulsar-operator.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How to reach the API server and which namespace to watch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Namespace to watch (empty = all namespaces)
    #[serde(default)]
    pub namespace: Option<String>,
    /// Path to kubeconfig (ignored when running in-cluster)
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Kubeconfig context to use
    #[serde(default)]
    pub context: Option<String>,
}

/// Knobs of the scaling loop that are not part of the cluster spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Wait after marking bookies read-only, before recovery starts
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// How long a cancelled task may take to finish its run before a warning is logged
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_cookie_delete_attempts")]
    pub cookie_delete_attempts: u32,
    #[serde(default = "default_broker_container")]
    pub broker_container: String,
    #[serde(default = "default_bookie_container")]
    pub bookie_container: String,
    /// Bookie HTTP admin port, queried from inside the bookie pod
    #[serde(default = "default_bookie_admin_port")]
    pub bookie_admin_port: u16,
    /// Bookie client port, part of the bookie identity
    #[serde(default = "default_bookie_port")]
    pub bookie_port: u16,
    /// Journal and ledger directories whose VERSION marker is moved aside on removal
    #[serde(default = "default_bookie_data_dirs")]
    pub bookie_data_dirs: Vec<String>,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            cookie_delete_attempts: default_cookie_delete_attempts(),
            broker_container: default_broker_container(),
            bookie_container: default_bookie_container(),
            bookie_admin_port: default_bookie_admin_port(),
            bookie_port: default_bookie_port(),
            bookie_data_dirs: default_bookie_data_dirs(),
        }
    }
}

impl AutoscalerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn default_settle_delay_ms() -> u64 {
    10_000
}

fn default_cancel_grace_ms() -> u64 {
    120_000
}

fn default_cookie_delete_attempts() -> u32 {
    3
}

fn default_broker_container() -> String {
    "broker".to_string()
}

fn default_bookie_container() -> String {
    "bookkeeper".to_string()
}

fn default_bookie_admin_port() -> u16 {
    8000
}

fn default_bookie_port() -> u16 {
    3181
}

fn default_bookie_data_dirs() -> Vec<String> {
    vec![
        "/pulsar/data/bookkeeper/journal".to_string(),
        "/pulsar/data/bookkeeper/ledgers".to_string(),
    ]
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl OperatorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the control loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.autoscaler.cookie_delete_attempts == 0 {
            bail!("autoscaler.cookie_delete_attempts must be at least 1");
        }
        if self.autoscaler.bookie_container.is_empty() || self.autoscaler.broker_container.is_empty()
        {
            bail!("autoscaler container names must not be empty");
        }
        Ok(())
    }
}
