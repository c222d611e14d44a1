//! Test fixtures.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};

use crate::mysql::{Backend, Connector, Membership};
use ddc_core::crd::{ComputeGroup, DorisDisaggregatedCluster, DorisDisaggregatedClusterSpec, DorisDisaggregatedClusterStatus, Phase};

/// A retirement command recorded by the in-memory membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Drop(Vec<String>),
    Decommission(Vec<String>),
}

/// The shared state behind `MemoryConnector` & its connections.
#[derive(Debug, Default)]
pub struct MemoryState {
    /// The backends of the compute group, as `SHOW BACKENDS` would report them.
    pub backends: Vec<Backend>,
    /// Fail every connection attempt.
    pub fail_connect: bool,
    /// Fail listing backends.
    pub fail_list: bool,
    /// Fail every retirement command.
    pub fail_commands: bool,
    /// All retirement commands issued, in order.
    pub commands: Vec<Command>,
    /// The compute group names backends were listed for.
    pub listed: Vec<String>,
    /// The number of connections opened.
    pub opened: usize,
    /// The number of connections closed.
    pub closed: usize,
}

/// An in-memory stand-in for a cluster's master frontend.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    pub state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new(backends: Vec<Backend>) -> Self {
        let connector = Self::default();
        connector.state.lock().unwrap().backends = backends;
        connector
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Mark the given ordinals as decommissioned with the given number of tablets left.
    pub fn set_decommissioned(&self, ordinals: &[u32], tablet_num: u64) {
        let mut state = self.state.lock().unwrap();
        for backend in state.backends.iter_mut() {
            if ordinals.iter().any(|ordinal| backend.host.starts_with(&format!("demo-cg1-{}.", ordinal))) {
                backend.system_decommissioned = true;
                backend.tablet_num = tablet_num;
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Membership>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            bail!("connection refused");
        }
        state.opened += 1;
        Ok(Box::new(MemoryConnection { state: self.state.clone() }))
    }
}

/// A connection handed out by `MemoryConnector`.
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Membership for MemoryConnection {
    async fn list_backends(&mut self, compute_group: &str) -> Result<Vec<Backend>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_list {
            bail!("SHOW BACKENDS failed");
        }
        state.listed.push(compute_group.into());
        Ok(state.backends.clone())
    }

    async fn drop_backends(&mut self, backends: &[Backend]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commands {
            bail!("errCode = 2, detailMessage = backend does not exist");
        }
        state.commands.push(Command::Drop(backends.iter().map(|b| b.host.clone()).collect()));
        state.backends.retain(|b| !backends.contains(b));
        Ok(())
    }

    async fn decommission_backends(&mut self, backends: &[Backend]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commands {
            bail!("errCode = 2, detailMessage = decommission rejected");
        }
        state.commands.push(Command::Decommission(backends.iter().map(|b| b.host.clone()).collect()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// A backend of compute group `cg1` of cluster `demo` running in the pod with the given ordinal.
pub fn backend(ordinal: u32) -> Backend {
    Backend {
        backend_id: format!("{}", 10_000 + ordinal),
        host: format!("demo-cg1-{}.demo-cg1.doris.svc.cluster.local", ordinal),
        heartbeat_port: 9050,
        alive: true,
        system_decommissioned: false,
        tablet_num: 128,
        compute_group: Some("cg1".into()),
    }
}

/// Backends running in pods `0..count`.
pub fn backends(count: u32) -> Vec<Backend> {
    (0..count).map(backend).collect()
}

/// The host names of the given backends.
pub fn hosts(backends: &[Backend]) -> Vec<String> {
    backends.iter().map(|b| b.host.clone()).collect()
}

/// Compute group `cg1` with the given replicas.
pub fn compute_group(replicas: i32) -> ComputeGroup {
    ComputeGroup {
        unique_id: "cg1".into(),
        replicas: Some(replicas),
        image: "apache/doris:be-3.0.2".into(),
        enable_decommission: None,
    }
}

/// Cluster `demo` holding the given compute group, with `cg1` in the given phase.
pub fn cluster(cg: &ComputeGroup, enable_decommission: bool, phase: Option<Phase>) -> DorisDisaggregatedCluster {
    let mut cluster = DorisDisaggregatedCluster::new(
        "demo",
        DorisDisaggregatedClusterSpec {
            fe_spec: Default::default(),
            compute_groups: vec![cg.clone()],
            auth_secret: Some("demo-admin".into()),
            enable_decommission,
        },
    );
    cluster.metadata.namespace = Some("doris".into());
    cluster.status = phase.map(|phase| DorisDisaggregatedClusterStatus::default().with_phase(&cg.unique_id, phase));
    cluster
}

/// A bare StatefulSet with the given replicas.
pub fn statefulset(replicas: i32) -> StatefulSet {
    StatefulSet {
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}
