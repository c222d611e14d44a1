//! Resolution of the SQL endpoint & credentials of a cluster.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::client::Client;
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::scheduler::API_TIMEOUT;
use crate::mysql::{Connector, Credentials, MasterConnection, Membership};
use ddc_core::crd::{DorisDisaggregatedCluster, RequiredMetadata};

/// The key of the frontend config within its config map.
const FE_CONF_KEY: &str = "fe.conf";
/// The frontend config entry holding the MySQL protocol port.
const FE_QUERY_PORT_KEY: &str = "query_port";
/// The MySQL protocol port used by frontends when none is configured.
pub(super) const DEFAULT_QUERY_PORT: u16 = 9030;
/// The admin user used when a cluster declares no auth secret.
const DEFAULT_ADMIN_USER: &str = "root";

/// A connector which opens membership channels to the master frontend of a cluster.
///
/// The endpoint & credentials are resolved anew on every connect, so that changes to the
/// cluster's secret or frontend config are picked up by the next scale-down pass.
pub struct ClusterConnector<'a> {
    client: Client,
    config: &'a Config,
    cluster: &'a DorisDisaggregatedCluster,
}

impl<'a> ClusterConnector<'a> {
    /// Create a new instance.
    pub fn new(client: Client, config: &'a Config, cluster: &'a DorisDisaggregatedCluster) -> Self {
        Self { client, config, cluster }
    }

    /// Resolve the admin credentials of the cluster.
    async fn credentials(&self) -> Result<Credentials> {
        let name = match self.cluster.spec.auth_secret.as_deref() {
            Some(name) => name,
            None => return Ok(default_credentials()),
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), self.cluster.namespace());
        let secret = timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching cluster auth secret")?
            .context("error fetching cluster auth secret")?;
        Ok(credentials_from_secret(&secret))
    }

    /// Resolve the MySQL protocol port of the cluster's frontends.
    async fn query_port(&self) -> Result<u16> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), self.cluster.namespace());
        let mut config_maps = Vec::with_capacity(self.cluster.spec.fe_spec.config_maps.len());
        for cm_ref in self.cluster.spec.fe_spec.config_maps.iter() {
            let res = timeout(API_TIMEOUT, api.get(&cm_ref.name))
                .await
                .context("timeout while fetching frontend config map")?;
            match res {
                Ok(cm) => config_maps.push(cm),
                Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => {
                    tracing::warn!(name = %cm_ref.name, "frontend config map not found");
                }
                Err(err) => return Err(err).context("error fetching frontend config map"),
            }
        }
        Ok(query_port_from_config_maps(&config_maps))
    }
}

#[async_trait]
impl<'a> Connector for ClusterConnector<'a> {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self) -> Result<Box<dyn Membership>> {
        let credentials = self.credentials().await?;
        let port = self.query_port().await?;
        let host = self.cluster.fe_service_address();
        let conn = MasterConnection::open_master(&credentials, &host, port, self.config.mysql_timeout()).await?;
        Ok(Box::new(conn))
    }
}

/// The credentials used when a cluster declares no auth secret.
pub(super) fn default_credentials() -> Credentials {
    Credentials {
        username: DEFAULT_ADMIN_USER.into(),
        password: String::new(),
    }
}

/// Extract the admin credentials from an auth secret.
///
/// Missing keys fall back to the default admin user & an empty password.
pub(super) fn credentials_from_secret(secret: &Secret) -> Credentials {
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|val| String::from_utf8_lossy(&val.0).trim_end().to_string())
    };
    let defaults = default_credentials();
    Credentials {
        username: field("username").filter(|val| !val.is_empty()).unwrap_or(defaults.username),
        password: field("password").unwrap_or(defaults.password),
    }
}

/// Find the query port among the given frontend config maps.
///
/// The first config map carrying a valid `query_port` in its `fe.conf` wins.
pub(super) fn query_port_from_config_maps(config_maps: &[ConfigMap]) -> u16 {
    config_maps
        .iter()
        .filter_map(|cm| cm.data.as_ref().and_then(|data| data.get(FE_CONF_KEY)))
        .find_map(|conf| query_port_from_conf(conf))
        .unwrap_or(DEFAULT_QUERY_PORT)
}

/// Parse `query_port` out of the contents of an `fe.conf` file.
pub(super) fn query_port_from_conf(conf: &str) -> Option<u16> {
    conf.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| key.trim() == FE_QUERY_PORT_KEY)
        .find_map(|(_, val)| val.trim().parse().ok())
}
