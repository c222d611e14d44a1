//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP healthchecks & metrics.
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The delay in seconds before a failed reconciliation is retried.
    #[serde(default = "Config::default_reconcile_retry_seconds")]
    pub reconcile_retry_seconds: u64,
    /// The delay in seconds between checks on an in-flight decommission.
    #[serde(default = "Config::default_decommission_poll_seconds")]
    pub decommission_poll_seconds: u64,
    /// The timeout in seconds applied to each statement issued to the cluster's frontends.
    #[serde(default = "Config::default_mysql_timeout_seconds")]
    pub mysql_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The delay before a failed reconciliation is retried.
    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_secs(self.reconcile_retry_seconds)
    }

    /// The delay between checks on an in-flight decommission.
    pub fn decommission_poll(&self) -> Duration {
        Duration::from_secs(self.decommission_poll_seconds)
    }

    /// The timeout applied to statements issued to the cluster's frontends.
    pub fn mysql_timeout(&self) -> Duration {
        Duration::from_secs(self.mysql_timeout_seconds)
    }

    fn default_reconcile_retry_seconds() -> u64 {
        5
    }

    fn default_decommission_poll_seconds() -> u64 {
        10
    }

    fn default_mysql_timeout_seconds() -> u64 {
        10
    }
}

#[cfg(test)]
impl Config {
    /// Create a config suitable for tests.
    pub fn new_test() -> Self {
        Self {
            rust_log: "error".into(),
            http_port: 8080,
            namespace: "doris".into(),
            pod_name: "ddc-operator-0".into(),
            reconcile_retry_seconds: Self::default_reconcile_retry_seconds(),
            decommission_poll_seconds: Self::default_decommission_poll_seconds(),
            mysql_timeout_seconds: Self::default_mysql_timeout_seconds(),
        }
    }
}
