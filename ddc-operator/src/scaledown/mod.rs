//! Compute group scale-down.
//!
//! When a compute group's StatefulSet is about to shrink, the backends running in the pods which
//! are going away must first leave the cluster's membership. This module drives that retirement
//! and decides whether the shrunk StatefulSet may be applied.
//!
//! ## Re-entrancy
//! Every reconcile pass calls `pre_apply` anew. The only memory carried from one pass to the next
//! is the compute group's persisted `Phase`, everything else is re-read from live membership. A
//! pass which returns a phase is expected to have it persisted by the caller before the next pass
//! for the same compute group begins.
//!
//! ## Phases
//! - `Decommissioning` & `ScaleDownFailed` re-enter scale-down even when the replica counts of the
//! current & target StatefulSets already match, so an interrupted retirement is always finished.
//! - A successful retirement moves the compute group to `Scaling`, which lets the StatefulSet shrink.

pub mod progress;
#[cfg(test)]
mod progress_test;
pub mod selector;
#[cfg(test)]
mod selector_test;
pub mod strategy;

use k8s_openapi::api::apps::v1::StatefulSet;

use crate::mysql::Connector;
use crate::scaledown::strategy::Step;
use ddc_core::crd::{ComputeGroup, DorisDisaggregatedCluster, Phase, RetirementPolicy};
use ddc_core::ScaleDownError;

/// The successful outcome of a scale-down pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retirement {
    /// The compute group is not scaling down, nothing was done.
    NotNeeded,
    /// All over-quota backends have left the cluster.
    Retired,
    /// Over-quota backends are still draining; the StatefulSet must not shrink yet.
    InProgress,
}

/// Whether the target StatefulSet may be applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// Apply the target StatefulSet.
    Apply,
    /// Skip applying the target StatefulSet this pass and check back later. Not a failure.
    Hold,
}

/// The result of a scale-down pass.
#[derive(Debug)]
pub struct ScaleDownPass {
    /// The phase to persist for the compute group, if it changed.
    pub phase: Option<Phase>,
    /// The outcome of the pass.
    pub outcome: Result<Retirement, ScaleDownError>,
}

/// The result of `pre_apply`.
#[derive(Debug)]
pub struct PreApply {
    /// The phase to persist for the compute group, if it changed.
    pub phase: Option<Phase>,
    /// Whether the target StatefulSet may be applied.
    pub gate: Result<Gate, ScaleDownError>,
}

/// The replica count of a StatefulSet, defaulting to 1 as K8s does.
pub fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1)
}

/// Check if applying `target` over `current` is a scale-down, or if a previous scale-down is
/// still unfinished.
pub fn is_scale_down(current: &StatefulSet, target: &StatefulSet, phase: Phase) -> bool {
    replicas_of(target) < replicas_of(current) || matches!(phase, Phase::Decommissioning | Phase::ScaleDownFailed)
}

/// Retire the over-quota backends of a compute group.
///
/// The membership channel is opened for the duration of this call only and is closed on every
/// path out of it.
#[tracing::instrument(level = "debug", skip(connector))]
pub async fn scale_down(connector: &dyn Connector, compute_group: &str, keep_amount: i32, policy: RetirementPolicy) -> ScaleDownPass {
    let mut conn = match connector.connect().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(error = ?err, compute_group, "error connecting to master frontend");
            return ScaleDownPass {
                phase: None,
                outcome: Err(ScaleDownError::Connection(err)),
            };
        }
    };

    let step = match policy {
        RetirementPolicy::Drop => strategy::retire_by_drop(conn.as_mut(), compute_group, keep_amount).await,
        RetirementPolicy::Decommission => strategy::retire_by_decommission(conn.as_mut(), compute_group, keep_amount).await,
    };
    if let Err(err) = conn.close().await {
        tracing::warn!(error = ?err, compute_group, "error closing connection to master frontend");
    }

    let Step { phase, outcome } = step;
    match outcome {
        Ok(Retirement::Retired) => ScaleDownPass {
            phase: Some(Phase::Scaling),
            outcome: Ok(Retirement::Retired),
        },
        outcome => ScaleDownPass { phase, outcome },
    }
}

/// Decide whether the target StatefulSet may be applied given the outcome of a scale-down pass.
///
/// Applying is permitted when no scale-down was needed or retirement finished. An in-progress
/// retirement holds the StatefulSet at its current size without failing the pass. Any error
/// blocks the apply and is returned.
pub fn apply_gate(outcome: Result<Retirement, ScaleDownError>) -> Result<Gate, ScaleDownError> {
    match outcome? {
        Retirement::NotNeeded | Retirement::Retired => Ok(Gate::Apply),
        Retirement::InProgress => Ok(Gate::Hold),
    }
}

/// Run the scale-down logic which must precede applying `target` over `current` for a compute group.
///
/// The returned phase is not written anywhere; the caller persists it to the cluster status.
#[tracing::instrument(level = "debug", skip_all, fields(compute_group = %cg.unique_id))]
pub async fn pre_apply(
    connector: &dyn Connector, current: &StatefulSet, target: &StatefulSet, cluster: &DorisDisaggregatedCluster, cg: &ComputeGroup,
) -> PreApply {
    let phase = cluster
        .status
        .as_ref()
        .map(|status| status.phase_of(&cg.unique_id))
        .unwrap_or_default();
    if !is_scale_down(current, target, phase) {
        return PreApply {
            phase: None,
            gate: apply_gate(Ok(Retirement::NotNeeded)),
        };
    }

    // The target replica count is the keep-amount for both selection & classification.
    let keep_amount = replicas_of(target);
    tracing::info!(
        current = replicas_of(current),
        keep_amount,
        %phase,
        "compute group is scaling down",
    );
    let pass = scale_down(connector, &cluster.compute_group_name(cg), keep_amount, cluster.retirement_policy(cg)).await;
    PreApply {
        phase: pass.phase,
        gate: apply_gate(pass.outcome),
    }
}
