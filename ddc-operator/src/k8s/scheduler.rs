//! Scheduler logic for reconciling the compute groups of Doris disaggregated clusters.
//!
//! ## Overview
//! Every compute group of a cluster is backed by a StatefulSet. Each pass over a cluster builds
//! the target StatefulSet of every compute group and, before applying it, runs the scale-down
//! logic against the cluster's master frontend. A target which would remove pods is only applied
//! once the backends hosted by those pods have left the cluster.
//!
//! - We leverage K8s [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/) (SSA)
//! for the StatefulSets & for the status subresource of the cluster.
//! - The phase of each compute group is persisted to the cluster status at the end of every pass.
//! It is the only durable record of an in-flight scale-down, and the next pass resumes from it.
//! - A compute group whose backends are still draining is held at its current size, and its
//! cluster is re-queued after the decommission poll interval. Errors are re-queued after the
//! reconcile retry interval.
//!
//! ## Object Updates
//! All scheduler tasks are broken up into "updated" & "deleted" tasks. In order to ensure that we
//! do not have stale data which needs to be deleted (for cases where the corresponding deleted
//! event has been missed), we check for the possibility of deletion being needed in all
//! "updated" handlers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, TCPSocketAction};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Resource;
use tokio::time::timeout;

use crate::k8s::connector::ClusterConnector;
use crate::k8s::{Controller, APP_NAME, METRIC_SCALE_DOWN_PASSES};
use crate::scaledown::{self, replicas_of, Gate, PreApply};
use ddc_core::crd::{ComputeGroup, ComputeGroupStatus, DorisDisaggregatedCluster, DorisDisaggregatedClusterStatus, Phase, RequiredMetadata};
use ddc_core::{DDC_OPERATOR_LABEL_SELECTORS, LABEL_DDC_CLUSTER, LABEL_DDC_COMPUTE_GROUP};

/// The default timeout to use for API calls.
pub(super) const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The pod container name of a compute group backend.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
pub(super) const CONTAINER_NAME_BE: &str = "compute";

/// The port on which backends receive heartbeats from the frontends.
pub(super) const BE_PORT_HEARTBEAT: i32 = 9050;
/// The thrift port of backends.
const BE_PORT_BE: i32 = 9060;
/// The HTTP port of backends.
const BE_PORT_WEBSERVER: i32 = 8040;
/// The bRPC port of backends.
const BE_PORT_BRPC: i32 = 8060;

/// A scheduling task to be performed.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum SchedulerTask {
    ClusterUpdated(Arc<String>),
    /// A delayed pass over a cluster, scheduled by a previous pass.
    ClusterRetry(Arc<String>),
    ClusterDeleted(Arc<String>, DorisDisaggregatedCluster),
    StatefulSetUpdated(Arc<String>),
    StatefulSetDeleted(Arc<String>, StatefulSet),
}

impl Controller {
    /// Handle scheduler tasks.
    pub(super) async fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        match task {
            SchedulerTask::ClusterUpdated(name) => self.scheduler_cluster_updated(name).await,
            SchedulerTask::ClusterRetry(name) => {
                self.retrying.remove(&name);
                self.scheduler_cluster_updated(name).await
            }
            SchedulerTask::ClusterDeleted(name, cluster) => self.scheduler_cluster_deleted(name, cluster).await,
            SchedulerTask::StatefulSetUpdated(name) => self.scheduler_statefulset_updated(name).await,
            SchedulerTask::StatefulSetDeleted(name, sts) => self.scheduler_statefulset_deleted(name, sts).await,
        }
    }

    /// Schedule a delayed pass over the given cluster, unless one is already pending.
    fn spawn_cluster_retry(&mut self, name: Arc<String>, delay: Duration) {
        if self.retrying.insert(name.clone()) {
            self.spawn_scheduler_task(SchedulerTask::ClusterRetry(name), Some(delay));
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Cluster Reconciliation ////////////////////////////////////////////////////
impl Controller {
    #[tracing::instrument(level = "debug", skip(self, name), fields(cluster = %name))]
    async fn scheduler_cluster_updated(&mut self, name: Arc<String>) {
        tracing::debug!("handling scheduler cluster updated");
        let cluster = match self.clusters.get(name.as_ref()) {
            Some(cluster) => cluster.clone(),
            None => return,
        };

        // Reconcile each compute group, collecting the next status as we go.
        let mut status = cluster.status.clone().unwrap_or_default();
        let mut retry_after = None;
        for cg in cluster.spec.compute_groups.iter() {
            let (entry, res) = self.reconcile_compute_group(&cluster, cg, &status).await;
            status = status.with_compute_group(entry);
            match res {
                Ok(Gate::Apply) => (),
                Ok(Gate::Hold) => retry_after = shortest_delay(retry_after, self.config.decommission_poll()),
                Err(err) => {
                    tracing::error!(error = ?err, compute_group = %cg.unique_id, "error reconciling compute group");
                    retry_after = shortest_delay(retry_after, self.config.reconcile_retry());
                }
            }
        }

        // Persist the phase of every compute group before the next pass begins.
        let status = status.retain_compute_groups(&cluster.spec.compute_groups);
        if cluster.status.as_ref() != Some(&status) {
            match self.patch_cluster_status(&cluster, status).await {
                Ok(updated) => {
                    if self.clusters.contains_key(name.as_ref()) {
                        self.clusters.insert(name.clone(), updated);
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error patching cluster status");
                    retry_after = shortest_delay(retry_after, self.config.reconcile_retry());
                }
            }
        }

        // Emit update events for StatefulSets of removed compute groups, so that they are cleaned up.
        let statefulsets: Vec<_> = self
            .statefulsets
            .iter()
            .filter(|(_, sts)| label_of(sts, LABEL_DDC_CLUSTER) == Some(name.as_str()))
            .filter(|(sts_name, _)| owning_compute_group(&cluster, sts_name).is_none())
            .map(|(sts_name, _)| sts_name.clone())
            .collect();
        for sts_name in statefulsets {
            self.spawn_scheduler_task(SchedulerTask::StatefulSetUpdated(sts_name), None);
        }

        if let Some(delay) = retry_after {
            self.spawn_cluster_retry(name, delay);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, name, cluster), fields(cluster = %name))]
    async fn scheduler_cluster_deleted(&mut self, name: Arc<String>, cluster: DorisDisaggregatedCluster) {
        tracing::debug!("handling scheduler cluster deleted");
        // A cluster re-created under the same name takes its StatefulSets over.
        if self.clusters.contains_key(name.as_ref()) {
            return;
        }
        if let Err(err) = self.delete_cluster_statefulsets(name.as_str()).await {
            tracing::error!(error = ?err, "error deleting StatefulSets of deleted cluster");
            let delay = self.config.reconcile_retry();
            self.spawn_scheduler_task(SchedulerTask::ClusterDeleted(name, cluster), Some(delay));
        }
    }

    /// Reconcile the StatefulSet of a single compute group.
    ///
    /// Returns the next status entry of the compute group along with the outcome of the pass. The
    /// entry is returned on every path so that phase changes made by a failed pass still persist.
    #[tracing::instrument(level = "debug", skip_all, fields(compute_group = %cg.unique_id))]
    async fn reconcile_compute_group(
        &mut self, cluster: &DorisDisaggregatedCluster, cg: &ComputeGroup, status: &DorisDisaggregatedClusterStatus,
    ) -> (ComputeGroupStatus, Result<Gate>) {
        let sts_name = cluster.statefulset_name(cg);
        let target = build_compute_group_statefulset(cluster, cg, &self.config.namespace);
        let mut entry = status.compute_group_status(&cg.unique_id).cloned().unwrap_or_else(|| ComputeGroupStatus {
            unique_id: cg.unique_id.clone(),
            ..Default::default()
        });
        entry.stateful_set_name = sts_name.clone();

        // A compute group without a StatefulSet has no backends to retire.
        let current = match self.statefulsets.get(&sts_name) {
            Some(current) => current.clone(),
            None => {
                return match self.create_statefulset(target).await {
                    Ok(sts) => {
                        entry.phase = Phase::Reconciling;
                        entry.replicas = replicas_of(&sts);
                        self.statefulsets.insert(Arc::new(sts_name), sts);
                        (entry, Ok(Gate::Apply))
                    }
                    Err(err) => (entry, Err(err)),
                };
            }
        };

        let connector = ClusterConnector::new(self.client.clone(), &self.config, cluster);
        let PreApply { phase, gate } = scaledown::pre_apply(&connector, &current, &target, cluster, cg).await;
        let gate = match gate {
            Ok(gate) => gate,
            Err(err) => {
                metrics::increment_counter!(METRIC_SCALE_DOWN_PASSES, "outcome" => "error");
                entry.phase = settle_phase(phase, entry.phase, None);
                entry.replicas = replicas_of(&current);
                return (entry, Err(err).context("error scaling down compute group"));
            }
        };

        match gate {
            Gate::Hold => {
                metrics::increment_counter!(METRIC_SCALE_DOWN_PASSES, "outcome" => "hold");
                tracing::info!(statefulset = %sts_name, replicas = replicas_of(&current), "holding StatefulSet while backends decommission");
                entry.phase = settle_phase(phase, entry.phase, None);
                entry.replicas = replicas_of(&current);
                (entry, Ok(Gate::Hold))
            }
            Gate::Apply => {
                metrics::increment_counter!(METRIC_SCALE_DOWN_PASSES, "outcome" => "apply");
                let applied = if needs_update(&current, &target) {
                    self.patch_statefulset(target).await
                } else {
                    Ok(current)
                };
                match applied {
                    Ok(sts) => {
                        entry.phase = settle_phase(phase, entry.phase, Some(&sts));
                        entry.replicas = replicas_of(&sts);
                        self.statefulsets.insert(Arc::new(sts_name), sts);
                        (entry, Ok(Gate::Apply))
                    }
                    Err(err) => {
                        entry.phase = settle_phase(phase, entry.phase, None);
                        (entry, Err(err))
                    }
                }
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// StatefulSet Reconciliation ////////////////////////////////////////////////
impl Controller {
    #[tracing::instrument(level = "debug", skip(self, name), fields(statefulset = %name))]
    async fn scheduler_statefulset_updated(&mut self, name: Arc<String>) {
        tracing::debug!("handling scheduler statefulset updated");
        // Ownership can not be judged before the clusters have been listed.
        if !self.clusters_synced {
            return;
        }
        let sts = match self.statefulsets.get(name.as_ref()) {
            Some(sts) => sts,
            None => return,
        };

        // If this object's compute group still exists, then its cluster picks up the change.
        if let Some(cluster_name) = self.owning_cluster(&name, sts) {
            self.spawn_scheduler_task(SchedulerTask::ClusterUpdated(cluster_name), None);
            return;
        }

        // Else this object's parent cluster or compute group is gone, so delete this object.
        if let Err(err) = self.delete_statefulset(name.as_str()).await {
            tracing::error!(error = ?err, "error deleting StatefulSet of removed compute group");
            let delay = self.config.reconcile_retry();
            self.spawn_scheduler_task(SchedulerTask::StatefulSetUpdated(name), Some(delay));
            return;
        }
        self.statefulsets.remove(&name);
    }

    #[tracing::instrument(level = "debug", skip(self, name, sts), fields(statefulset = %name))]
    async fn scheduler_statefulset_deleted(&mut self, name: Arc<String>, sts: StatefulSet) {
        tracing::debug!("handling scheduler statefulset deleted");
        // If the compute group still exists for this object, its cluster re-creates it.
        if let Some(cluster_name) = self.owning_cluster(&name, &sts) {
            self.spawn_scheduler_task(SchedulerTask::ClusterUpdated(cluster_name), None);
        }
    }

    /// Find the cached cluster which has a compute group backed by the given StatefulSet.
    fn owning_cluster(&self, name: &str, sts: &StatefulSet) -> Option<Arc<String>> {
        let cluster_name = label_of(sts, LABEL_DDC_CLUSTER)?.to_string();
        let (key, cluster) = self.clusters.get_key_value(&cluster_name)?;
        owning_compute_group(cluster, name).map(|_| key.clone())
    }
}

//////////////////////////////////////////////////////////////////////////////
// K8s API Methods ///////////////////////////////////////////////////////////
impl Controller {
    /// Create the given StatefulSet in K8s.
    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn create_statefulset(&self, sts: StatefulSet) -> Result<StatefulSet> {
        if let Some(name) = sts.metadata.name.as_ref() {
            tracing::info!(%name, "creating StatefulSet");
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = kube::api::PostParams::default();
        timeout(API_TIMEOUT, api.create(&params, &sts))
            .await
            .context("timeout while creating StatefulSet for compute group")?
            .context("error creating StatefulSet for compute group")
    }

    /// Delete the target StatefulSet.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting StatefulSet")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting StatefulSet"),
            },
        }
    }

    /// Delete all StatefulSets belonging to the given cluster.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_cluster_statefulsets(&mut self, name: &str) -> Result<()> {
        tracing::info!(name, "deleting StatefulSets for cluster");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let lp = ListParams {
            label_selector: Some(format!("{},{}={}", DDC_OPERATOR_LABEL_SELECTORS, LABEL_DDC_CLUSTER, name)),
            ..Default::default()
        };
        let statefulsets = timeout(API_TIMEOUT, api.list(&lp))
            .await
            .context("timeout while listing StatefulSets for cluster")?
            .context("error listing StatefulSets for cluster")?;
        let mut error = None;
        for sts in statefulsets {
            let name = match sts.metadata.name.as_ref() {
                Some(name) => name,
                None => continue,
            };
            if let Err(err) = self.delete_statefulset(name.as_str()).await {
                tracing::error!(%name, "error deleting StatefulSet for cluster");
                error = Some(err);
                continue;
            }
            self.statefulsets.remove(name);
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Patch the status of the given cluster in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, cluster, status))]
    async fn patch_cluster_status(&self, cluster: &DorisDisaggregatedCluster, status: DorisDisaggregatedClusterStatus) -> Result<DorisDisaggregatedCluster> {
        tracing::info!(name = cluster.name(), "patching cluster status");
        let api: Api<DorisDisaggregatedCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        let patch = serde_json::json!({
            "apiVersion": DorisDisaggregatedCluster::api_version(&()),
            "kind": DorisDisaggregatedCluster::kind(&()),
            "status": status,
        });
        timeout(API_TIMEOUT, api.patch_status(cluster.name(), &params, &Patch::Apply(&patch)))
            .await
            .context("timeout while updating cluster status")?
            .context("error updating cluster status")
    }

    /// Patch the given StatefulSet in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn patch_statefulset(&self, mut sts: StatefulSet) -> Result<StatefulSet> {
        let name = sts.metadata.name.clone().unwrap_or_default();
        tracing::info!(%name, replicas = replicas_of(&sts), "patching StatefulSet");
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        sts.metadata.managed_fields = None;
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&sts)))
            .await
            .context("timeout while updating StatefulSet for compute group")?
            .context("error updating StatefulSet for compute group")
    }
}

/// Build the target StatefulSet of the given compute group.
pub(super) fn build_compute_group_statefulset(cluster: &DorisDisaggregatedCluster, cg: &ComputeGroup, namespace: &str) -> StatefulSet {
    let name = cluster.statefulset_name(cg);

    // Build metadata.
    let mut sts = StatefulSet::default();
    let labels = sts.meta_mut().labels.get_or_insert_with(Default::default);
    set_cannonical_labels(labels);
    labels.insert(LABEL_DDC_CLUSTER.into(), cluster.name().into());
    labels.insert(LABEL_DDC_COMPUTE_GROUP.into(), cg.unique_id.clone());
    let labels = labels.clone(); // Used below.
    sts.meta_mut().namespace = Some(namespace.into());
    sts.meta_mut().name = Some(name.clone());
    sts.meta_mut().owner_references = cluster.controller_owner_ref(&()).map(|oref| vec![oref]);

    // Build spec.
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.service_name = name;
    spec.replicas = Some(cg.keep_amount());
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    let port = |name: &str, container_port: i32| ContainerPort {
        name: Some(name.into()),
        container_port,
        protocol: Some("TCP".into()),
        ..Default::default()
    };
    let field_ref = |name: &str, field_path: &str| EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let tcp_probe = |initial_delay_seconds: i32, period_seconds: i32| Probe {
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(BE_PORT_HEARTBEAT),
            host: None,
        }),
        ..Default::default()
    };
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![Container {
                // NOTE WELL: do not change the name of this container. It will cause breaking changes.
                name: CONTAINER_NAME_BE.into(),
                image: Some(cg.image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                ports: Some(vec![
                    port("heartbeat-port", BE_PORT_HEARTBEAT),
                    port("be-port", BE_PORT_BE),
                    port("webserver-port", BE_PORT_WEBSERVER),
                    port("brpc-port", BE_PORT_BRPC),
                ]),
                env: Some(vec![
                    EnvVar {
                        name: "FE_ADDR".into(),
                        value: Some(cluster.fe_service_address()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "COMPUTE_GROUP_NAME".into(),
                        value: Some(cluster.compute_group_name(cg)),
                        ..Default::default()
                    },
                    field_ref("POD_NAME", "metadata.name"),
                    field_ref("POD_NAMESPACE", "metadata.namespace"),
                    field_ref("POD_IP", "status.podIP"),
                ]),
                readiness_probe: Some(tcp_probe(5, 10)),
                liveness_probe: Some(tcp_probe(15, 20)),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    sts
}

/// Check if the fields of `current` owned by this operator differ from `target`.
pub(super) fn needs_update(current: &StatefulSet, target: &StatefulSet) -> bool {
    replicas_of(current) != replicas_of(target) || container_images(current) != container_images(target)
}

fn container_images(sts: &StatefulSet) -> Vec<(&str, Option<&str>)> {
    sts.spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.iter().map(|c| (c.name.as_str(), c.image.as_deref())).collect())
        .unwrap_or_default()
}

/// Check if all pods of the given StatefulSet are ready.
pub(super) fn is_ready(sts: &StatefulSet) -> bool {
    sts.status
        .as_ref()
        .map(|status| status.replicas == replicas_of(sts) && status.ready_replicas.unwrap_or(0) == replicas_of(sts))
        .unwrap_or(false)
}

/// Settle the phase to persist for a compute group at the end of a pass.
///
/// A phase produced by the scale-down logic always wins. Otherwise an applied StatefulSet moves
/// the compute group to `Ready` or `Reconciling` by its readiness, and an unapplied one keeps its
/// persisted phase.
pub(super) fn settle_phase(scale_down_phase: Option<Phase>, persisted: Phase, applied: Option<&StatefulSet>) -> Phase {
    match (scale_down_phase, applied) {
        (Some(phase), _) => phase,
        (None, Some(sts)) if is_ready(sts) => Phase::Ready,
        (None, Some(_)) => Phase::Reconciling,
        (None, None) => persisted,
    }
}

/// Find the compute group of the given cluster backed by the named StatefulSet.
pub(super) fn owning_compute_group<'a>(cluster: &'a DorisDisaggregatedCluster, sts_name: &str) -> Option<&'a ComputeGroup> {
    cluster
        .spec
        .compute_groups
        .iter()
        .find(|cg| cluster.statefulset_name(cg) == sts_name)
}

/// The shorter of an already scheduled delay & a new one.
pub(super) fn shortest_delay(current: Option<Duration>, delay: Duration) -> Option<Duration> {
    Some(current.map_or(delay, |current| current.min(delay)))
}

fn label_of<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.metadata.labels.as_ref().and_then(|labels| labels.get(key)).map(String::as_str)
}

/// Set the cannonical labels on an object controlled by this operator.
fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app.kubernetes.io/managed-by".into(), APP_NAME.into());
}
