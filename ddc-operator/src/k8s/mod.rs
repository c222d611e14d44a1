//! Kubernetes controller.
//!
//! This controller observes `DorisDisaggregatedCluster` objects and the StatefulSets backing
//! their compute groups, caches them, and reconciles each compute group's StatefulSet against
//! its spec.
//!
//! All reconciliation is driven through a single queue of scheduler tasks which is drained by
//! this controller's task alone. Passes for a cluster therefore never overlap, and each pass
//! persists the phase of its compute groups before the next one begins.

mod connector;
#[cfg(test)]
mod connector_test;
mod data;
mod scheduler;
#[cfg(test)]
mod scheduler_test;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::k8s::scheduler::SchedulerTask;
use ddc_core::crd::DorisDisaggregatedCluster;
use ddc_core::DDC_OPERATOR_LABEL_SELECTORS;

/// The app name used by the operator.
const APP_NAME: &str = "ddc-operator";

const METRIC_WATCHER_ERRORS: &str = "ddc_operator_watcher_errors";
const METRIC_SCALE_DOWN_PASSES: &str = "ddc_operator_scale_down_passes";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// Kubernetes controller for watching Doris disaggregated cluster CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,

    /// All known cluster objects.
    clusters: HashMap<Arc<String>, DorisDisaggregatedCluster>,
    /// All known statefulsets managed by this operator.
    statefulsets: HashMap<Arc<String>, StatefulSet>,
    /// Clusters with a delayed pass pending.
    retrying: HashSet<Arc<String>>,
    /// Whether the cluster watcher has delivered its initial listing.
    clusters_synced: bool,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors");
        metrics::register_counter!(METRIC_SCALE_DOWN_PASSES, metrics::Unit::Count, "compute group scale-down gate outcomes");
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            clusters: Default::default(),
            statefulsets: Default::default(),
            retrying: Default::default(),
            clusters_synced: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> anyhow::Result<()> {
        // Build watcher streams.
        let clusters: Api<DorisDisaggregatedCluster> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let clusters_watcher = watcher(clusters, ListParams::default());
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, Self::list_params_cluster_selector_labels());
        tokio::pin!(clusters_watcher, statefulsets_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = clusters_watcher.next() => self.handle_cluster_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn a task which emits a new scheduler task, optionally after a delay.
    ///
    /// This indirection is used to ensure that we don't use an unlimited amount of memory with an
    /// unbounded queue, and also so that we do not block the controller from making progress and
    /// dead-locking when we hit the scheduler task queue cap.
    fn spawn_scheduler_task(&self, task: SchedulerTask, delay: Option<Duration>) {
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects matching the operator's labels.
    fn list_params_cluster_selector_labels() -> ListParams {
        ListParams {
            label_selector: Some(DDC_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}
