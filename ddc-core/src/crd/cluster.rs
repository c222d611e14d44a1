//! DorisDisaggregatedCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::RequiredMetadata;

pub type DorisDisaggregatedCluster = DorisDisaggregatedClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for a Doris cluster running in compute/storage disaggregated mode.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "DorisDisaggregatedClusterCRD",
    status = "DorisDisaggregatedClusterStatus",
    group = "disaggregated.cluster.doris.com",
    version = "v1",
    kind = "DorisDisaggregatedCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "ddc",
    printcolumn = r#"{"name":"Decommission","type":"boolean","jsonPath":".spec.enableDecommission"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DorisDisaggregatedClusterSpec {
    /// The frontend spec, used to locate the SQL endpoint of the cluster.
    #[serde(default)]
    pub fe_spec: FeSpec,
    /// The compute groups of this cluster.
    #[serde(default)]
    pub compute_groups: Vec<ComputeGroup>,
    /// The name of the secret holding the `username` & `password` of the cluster admin.
    #[serde(default)]
    pub auth_secret: Option<String>,
    /// Retire backends gracefully through decommissioning instead of dropping them.
    ///
    /// Individual compute groups may override this value.
    #[serde(default)]
    pub enable_decommission: bool,
}

/// The frontend spec of a cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeSpec {
    /// Config maps mounted into the frontend pods, one of which may carry `fe.conf`.
    #[serde(default)]
    pub config_maps: Vec<ConfigMapRef>,
}

/// A reference to a config map mounted into a pod.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapRef {
    /// The name of the config map.
    pub name: String,
    /// The path at which the config map is mounted.
    #[serde(default)]
    pub mount_path: Option<String>,
}

/// A named set of interchangeable backend nodes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeGroup {
    /// The identity of this compute group, unique within its cluster.
    pub unique_id: String,
    /// The desired number of backends.
    ///
    /// This is also the keep-amount used when retiring backends: pods with an ordinal at or above
    /// this value are the ones which leave the cluster.
    #[serde(default)]
    pub replicas: Option<i32>,
    /// The backend image.
    pub image: String,
    /// Overrides the cluster's `enableDecommission` for this compute group.
    #[serde(default)]
    pub enable_decommission: Option<bool>,
}

/// The way backends are removed from a compute group when it scales down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetirementPolicy {
    /// Backends drain their data before leaving the cluster.
    Decommission,
    /// Backends are removed from membership immediately.
    Drop,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DorisDisaggregatedClusterStatus {
    /// One entry per compute group of the cluster.
    #[serde(default)]
    pub compute_group_statuses: Vec<ComputeGroupStatus>,
}

/// The status of a single compute group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeGroupStatus {
    /// The unique id of the compute group this status belongs to.
    pub unique_id: String,
    /// The name of the StatefulSet backing the compute group.
    #[serde(default)]
    pub stateful_set_name: String,
    /// The phase of the compute group.
    #[serde(default)]
    pub phase: Phase,
    /// The replica count last applied to the backing StatefulSet.
    #[serde(default)]
    pub replicas: i32,
}

/// The phase of a compute group.
///
/// This is the only durable record of an in-flight scale-down.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// The compute group is fully reconciled.
    Ready,
    /// The compute group is being reconciled, with no retirement activity.
    Reconciling,
    /// Retirement finished, the backing StatefulSet may shrink.
    Scaling,
    /// Backends are draining, the backing StatefulSet must not shrink yet.
    Decommissioning,
    /// The last retirement attempt failed and will be retried.
    ScaleDownFailed,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Reconciling
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Ready => "Ready",
                Self::Reconciling => "Reconciling",
                Self::Scaling => "Scaling",
                Self::Decommissioning => "Decommissioning",
                Self::ScaleDownFailed => "ScaleDownFailed",
            }
        )
    }
}

impl DorisDisaggregatedCluster {
    /// The name under which the database knows the given compute group.
    ///
    /// Compute group names may not contain `-`, so it is replaced with `_`.
    pub fn compute_group_name(&self, cg: &ComputeGroup) -> String {
        cg.unique_id.replace('-', "_")
    }

    /// The name of the StatefulSet backing the given compute group.
    pub fn statefulset_name(&self, cg: &ComputeGroup) -> String {
        format!("{}-{}", self.name(), cg.unique_id)
    }

    /// The name of the Service fronting the cluster's frontends.
    pub fn fe_service_name(&self) -> String {
        format!("{}-fe", self.name())
    }

    /// The in-cluster address of the frontend Service.
    pub fn fe_service_address(&self) -> String {
        format!("{}.{}", self.fe_service_name(), self.namespace())
    }

    /// The retirement policy of the given compute group.
    pub fn retirement_policy(&self, cg: &ComputeGroup) -> RetirementPolicy {
        if cg.enable_decommission.unwrap_or(self.spec.enable_decommission) {
            RetirementPolicy::Decommission
        } else {
            RetirementPolicy::Drop
        }
    }

    /// Find the compute group bearing the given unique id.
    pub fn compute_group(&self, unique_id: &str) -> Option<&ComputeGroup> {
        self.spec.compute_groups.iter().find(|cg| cg.unique_id == unique_id)
    }

    /// The current status of the given compute group, if one has been recorded.
    pub fn compute_group_status(&self, unique_id: &str) -> Option<&ComputeGroupStatus> {
        self.status.as_ref().and_then(|status| status.compute_group_status(unique_id))
    }
}

impl ComputeGroup {
    /// The number of backends this compute group keeps.
    pub fn keep_amount(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

impl DorisDisaggregatedClusterStatus {
    /// Get the status entry of the given compute group.
    pub fn compute_group_status(&self, unique_id: &str) -> Option<&ComputeGroupStatus> {
        self.compute_group_statuses.iter().find(|status| status.unique_id == unique_id)
    }

    /// The persisted phase of the given compute group.
    ///
    /// A compute group which has no status entry yet is `Reconciling`.
    pub fn phase_of(&self, unique_id: &str) -> Phase {
        self.compute_group_status(unique_id).map(|status| status.phase).unwrap_or_default()
    }

    /// Build a copy of this status with the given compute group's entry updated.
    ///
    /// The entry is created if the compute group does not yet have one.
    pub fn with_compute_group(&self, update: ComputeGroupStatus) -> Self {
        let mut status = self.clone();
        match status
            .compute_group_statuses
            .iter_mut()
            .find(|entry| entry.unique_id == update.unique_id)
        {
            Some(entry) => *entry = update,
            None => status.compute_group_statuses.push(update),
        }
        status
    }

    /// Build a copy of this status with the given compute group's phase set.
    pub fn with_phase(&self, unique_id: &str, phase: Phase) -> Self {
        let mut entry = self.compute_group_status(unique_id).cloned().unwrap_or_else(|| ComputeGroupStatus {
            unique_id: unique_id.into(),
            ..Default::default()
        });
        entry.phase = phase;
        self.with_compute_group(entry)
    }

    /// Build a copy of this status retaining only the entries of the given compute groups.
    pub fn retain_compute_groups(&self, groups: &[ComputeGroup]) -> Self {
        let mut status = self.clone();
        status
            .compute_group_statuses
            .retain(|entry| groups.iter().any(|cg| cg.unique_id == entry.unique_id));
        status
    }
}
