use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::k8s::scheduler::SchedulerTask;
use crate::k8s::{Controller, EventResult, METRIC_WATCHER_ERRORS};
use ddc_core::crd::DorisDisaggregatedCluster;

//////////////////////////////////////////////////////////////////////////////
// Cluster Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `DorisDisaggregatedCluster` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_cluster_event(&mut self, res: EventResult<DorisDisaggregatedCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from DorisDisaggregatedCluster k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => "DorisDisaggregatedCluster");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.cluster_applied(obj).await,
            Event::Deleted(obj) => self.cluster_deleted(obj).await,
            Event::Restarted(objs) => self.cluster_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_applied(&mut self, cluster: DorisDisaggregatedCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.clusters.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &cluster {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.clusters.insert(name.clone(), cluster);
        self.spawn_scheduler_task(SchedulerTask::ClusterUpdated(name), None);
    }

    #[tracing::instrument(level = "debug", skip(self, cluster))]
    async fn cluster_deleted(&mut self, cluster: DorisDisaggregatedCluster) {
        let name_str = match cluster.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, cluster) = match self.clusters.remove_entry(name_str) {
            Some((name, cluster)) => (name, cluster),
            None => return,
        };
        self.spawn_scheduler_task(SchedulerTask::ClusterDeleted(name, cluster), None);
    }

    #[tracing::instrument(level = "debug", skip(self, clusters))]
    async fn cluster_restarted(&mut self, clusters: Vec<DorisDisaggregatedCluster>) {
        // Clusters deleted while the watcher was down are treated as deleted now.
        let stale: Vec<_> = self
            .clusters
            .iter()
            .filter(|(name, _)| !clusters.iter().any(|cluster| cluster.meta().name.as_deref() == Some(name.as_str())))
            .map(|(_, cluster)| cluster.clone())
            .collect();
        for cluster in stale {
            self.cluster_deleted(cluster).await;
        }
        for cluster in clusters {
            self.cluster_applied(cluster).await;
        }

        // Now that clusters are known, check every StatefulSet for a missing owner.
        self.clusters_synced = true;
        let statefulsets: Vec<_> = self.statefulsets.keys().cloned().collect();
        for name in statefulsets {
            self.spawn_scheduler_task(SchedulerTask::StatefulSetUpdated(name), None);
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// StatefulSet Events ////////////////////////////////////////////////////////
impl Controller {
    /// Handle `StatefulSet` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from StatefulSet k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => "StatefulSet");
                let _ = tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.sts_applied(obj).await,
            Event::Deleted(obj) => self.sts_deleted(obj).await,
            Event::Restarted(objs) => self.sts_restarted(objs).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn sts_applied(&mut self, sts: StatefulSet) {
        let name_str = match sts.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.statefulsets.get_key_value(name_str) {
            Some((key, old)) => {
                if old == &sts {
                    return;
                }
                Arc::clone(key) // No additional alloc.
            }
            None => Arc::new(name_str.clone()),
        };
        self.statefulsets.insert(name.clone(), sts);
        self.spawn_scheduler_task(SchedulerTask::StatefulSetUpdated(name), None);
    }

    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn sts_deleted(&mut self, sts: StatefulSet) {
        let name_str = match sts.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let (name, sts) = match self.statefulsets.remove_entry(name_str) {
            Some((name, sts)) => (name, sts),
            None => return,
        };
        self.spawn_scheduler_task(SchedulerTask::StatefulSetDeleted(name, sts), None);
    }

    #[tracing::instrument(level = "debug", skip(self, statefulsets))]
    async fn sts_restarted(&mut self, statefulsets: Vec<StatefulSet>) {
        for sts in statefulsets {
            self.sts_applied(sts).await;
        }
    }
}
