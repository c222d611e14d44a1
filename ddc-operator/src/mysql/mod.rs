//! Backend membership of a Doris cluster, queried & mutated over the MySQL protocol.
//!
//! All statements are issued against the master frontend. `SHOW BACKENDS` is served by any
//! frontend, but the `ALTER SYSTEM` statements used to retire backends must be run on the
//! master, so a connection is always routed there before being handed out.


use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Connection, Executor, Row};
use tokio::time::timeout;

/// The database used for the admin connection.
const ADMIN_DATABASE: &str = "mysql";

/// A single backend node as reported by `SHOW BACKENDS`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Backend {
    /// The backend's id within the cluster.
    pub backend_id: String,
    /// The backend's host, the FQDN of its pod.
    pub host: String,
    /// The backend's heartbeat port, which together with the host identifies it in commands.
    pub heartbeat_port: u16,
    /// Whether the master currently considers the backend alive.
    pub alive: bool,
    /// Whether the backend has been asked to decommission.
    pub system_decommissioned: bool,
    /// The number of tablets still hosted by the backend.
    pub tablet_num: u64,
    /// The name of the compute group the backend belongs to, taken from its tag.
    pub compute_group: Option<String>,
}

impl Backend {
    /// The `host:heartbeat_port` identity used to address this backend in statements.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.heartbeat_port)
    }
}

/// Credentials of the cluster admin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A live membership channel to a cluster's master frontend.
#[async_trait]
pub trait Membership: Send {
    /// List all backends belonging to the given compute group.
    async fn list_backends(&mut self, compute_group: &str) -> Result<Vec<Backend>>;

    /// Remove the given backends from membership immediately.
    async fn drop_backends(&mut self, backends: &[Backend]) -> Result<()>;

    /// Ask the given backends to drain their data and leave the cluster.
    async fn decommission_backends(&mut self, backends: &[Backend]) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&mut self) -> Result<()>;
}

/// A factory of membership channels, invoked once per scale-down pass.
#[async_trait]
pub trait Connector: Sync {
    /// Open a new channel to the master frontend.
    async fn connect(&self) -> Result<Box<dyn Membership>>;
}

/// A MySQL protocol connection to the master frontend of a cluster.
pub struct MasterConnection {
    conn: Option<MySqlConnection>,
    timeout: Duration,
}

impl MasterConnection {
    /// Open a connection to the master frontend, starting from the given frontend endpoint.
    ///
    /// The given endpoint is usually the frontend Service, which may route to a follower. If so,
    /// the master is looked up and a new connection is opened against it.
    #[tracing::instrument(level = "debug", skip(credentials, api_timeout))]
    pub async fn open_master(credentials: &Credentials, host: &str, port: u16, api_timeout: Duration) -> Result<Self> {
        let mut conn = Self::connect_to(credentials, host, port, api_timeout).await?;
        let frontends = timeout(api_timeout, conn.fetch_all(sqlx::raw_sql("SHOW FRONTENDS")))
            .await
            .context("timeout while listing frontends")?
            .context("error listing frontends")?;
        let mut master = None;
        for row in frontends.iter() {
            let frontend = Frontend::from_row(row)?;
            if frontend.is_master {
                master = Some(frontend);
                break;
            }
        }
        let master = master.context("no master frontend found in SHOW FRONTENDS output")?;
        if master.current_connected {
            return Ok(Self { conn: Some(conn), timeout: api_timeout });
        }

        tracing::debug!(master = %master.host, port = master.query_port, "reconnecting to master frontend");
        if let Err(err) = conn.close().await {
            tracing::warn!(error = ?err, "error closing connection to non-master frontend");
        }
        let conn = Self::connect_to(credentials, &master.host, master.query_port, api_timeout).await?;
        Ok(Self { conn: Some(conn), timeout: api_timeout })
    }

    async fn connect_to(credentials: &Credentials, host: &str, port: u16, api_timeout: Duration) -> Result<MySqlConnection> {
        let options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&credentials.username)
            .password(&credentials.password)
            .database(ADMIN_DATABASE);
        timeout(api_timeout, options.connect())
            .await
            .with_context(|| format!("timeout while connecting to frontend {}:{}", host, port))?
            .with_context(|| format!("error connecting to frontend {}:{}", host, port))
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.conn.as_mut().context("connection to master frontend already closed")
    }

    async fn execute(&mut self, stmt: String) -> Result<()> {
        let api_timeout = self.timeout;
        let conn = self.conn()?;
        timeout(api_timeout, conn.execute(sqlx::raw_sql(&stmt)))
            .await
            .with_context(|| format!("timeout while executing `{}`", stmt))?
            .with_context(|| format!("error executing `{}`", stmt))?;
        Ok(())
    }
}

#[async_trait]
impl Membership for MasterConnection {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_backends(&mut self, compute_group: &str) -> Result<Vec<Backend>> {
        let api_timeout = self.timeout;
        let conn = self.conn()?;
        let rows = timeout(api_timeout, conn.fetch_all(sqlx::raw_sql("SHOW BACKENDS")))
            .await
            .context("timeout while listing backends")?
            .context("error listing backends")?;
        let mut backends = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let backend = backend_from_row(row)?;
            if backend.compute_group.as_deref() == Some(compute_group) {
                backends.push(backend);
            }
        }
        Ok(backends)
    }

    #[tracing::instrument(level = "debug", skip(self, backends))]
    async fn drop_backends(&mut self, backends: &[Backend]) -> Result<()> {
        match drop_statement(backends) {
            Some(stmt) => {
                tracing::info!(count = backends.len(), "dropping backends");
                self.execute(stmt).await
            }
            None => Ok(()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, backends))]
    async fn decommission_backends(&mut self, backends: &[Backend]) -> Result<()> {
        match decommission_statement(backends) {
            Some(stmt) => {
                tracing::info!(count = backends.len(), "decommissioning backends");
                self.execute(stmt).await
            }
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await.context("error closing connection to master frontend"),
            None => Ok(()),
        }
    }
}

/// A frontend as reported by `SHOW FRONTENDS`.
struct Frontend {
    host: String,
    query_port: u16,
    is_master: bool,
    current_connected: bool,
}

impl Frontend {
    fn from_row(row: &MySqlRow) -> Result<Self> {
        Ok(Self {
            host: column(row, "Host")?,
            query_port: column(row, "QueryPort")?.parse().context("invalid frontend QueryPort")?,
            is_master: parse_bool(&column(row, "IsMaster")?),
            current_connected: parse_bool(&column_or_default(row, "CurrentConnected")),
        })
    }
}

/// Build a backend from a `SHOW BACKENDS` row.
fn backend_from_row(row: &MySqlRow) -> Result<Backend> {
    Ok(Backend {
        backend_id: column(row, "BackendId")?,
        host: column(row, "Host")?,
        heartbeat_port: column(row, "HeartbeatPort")?.parse().context("invalid backend HeartbeatPort")?,
        alive: parse_bool(&column_or_default(row, "Alive")),
        system_decommissioned: parse_bool(&column_or_default(row, "SystemDecommissioned")),
        tablet_num: column(row, "TabletNum")?.trim().parse().context("invalid backend TabletNum")?,
        compute_group: compute_group_from_tag(&column_or_default(row, "Tag")),
    })
}

/// Read a text column of a `SHOW` statement row.
fn column(row: &MySqlRow, name: &str) -> Result<String> {
    row.try_get::<Option<String>, _>(name)
        .with_context(|| format!("error reading column {}", name))?
        .with_context(|| format!("column {} is null", name))
}

/// Read a text column which may be absent on older versions.
fn column_or_default(row: &MySqlRow, name: &str) -> String {
    row.try_get::<Option<String>, _>(name).ok().flatten().unwrap_or_default()
}

fn parse_bool(val: &str) -> bool {
    val.trim().eq_ignore_ascii_case("true")
}

/// Extract the compute group name from a backend's `Tag` column.
///
/// The tag is a JSON object; older versions name the key `cloud_cluster_name`.
pub(crate) fn compute_group_from_tag(tag: &str) -> Option<String> {
    let tag: serde_json::Value = serde_json::from_str(tag).ok()?;
    tag.get("compute_group_name")
        .or_else(|| tag.get("cloud_cluster_name"))
        .and_then(|name| name.as_str())
        .map(String::from)
}

/// Build the statement which drops the given backends, if there are any.
pub(crate) fn drop_statement(backends: &[Backend]) -> Option<String> {
    backend_list(backends).map(|list| format!("ALTER SYSTEM DROPP BACKEND {}", list))
}

/// Build the statement which decommissions the given backends, if there are any.
pub(crate) fn decommission_statement(backends: &[Backend]) -> Option<String> {
    backend_list(backends).map(|list| format!("ALTER SYSTEM DECOMMISSION BACKEND {}", list))
}

fn backend_list(backends: &[Backend]) -> Option<String> {
    if backends.is_empty() {
        return None;
    }
    let list = backends
        .iter()
        .map(|backend| format!("\"{}\"", backend.endpoint()))
        .collect::<Vec<_>>()
        .join(",");
    Some(list)
}
