//! Retirement strategies.
//!
//! - Drop: over-quota backends are removed from membership in a single command.
//! - Decommission: over-quota backends are first asked to drain. The pass reports
//! `Retirement::InProgress` until every one of them has drained, after which they are dropped.

use ddc_core::crd::Phase;
use ddc_core::ScaleDownError;

use crate::mysql::{Backend, Membership};
use crate::scaledown::progress::{DecommissionPhase, DecommissionTaskStatus};
use crate::scaledown::selector::select_over_quota;
use crate::scaledown::Retirement;

/// The outcome of one retirement step along with the phase it moves the compute group to.
#[derive(Debug)]
pub struct Step {
    /// The phase the compute group moves to, if this step decides one.
    pub phase: Option<Phase>,
    /// The outcome of the step.
    pub outcome: Result<Retirement, ScaleDownError>,
}

impl Step {
    fn in_progress() -> Self {
        Self {
            phase: Some(Phase::Decommissioning),
            outcome: Ok(Retirement::InProgress),
        }
    }

    fn failed(err: ScaleDownError) -> Self {
        Self {
            phase: if err.is_command() { Some(Phase::ScaleDownFailed) } else { None },
            outcome: Err(err),
        }
    }
}

/// Drop every over-quota backend of the compute group.
#[tracing::instrument(level = "debug", skip(conn))]
pub async fn retire_by_drop(conn: &mut dyn Membership, compute_group: &str, keep_amount: i32) -> Step {
    let backends = match list_backends(conn, compute_group).await {
        Ok(backends) => backends,
        Err(err) => return Step::failed(err),
    };
    match drop_over_quota(conn, &backends, keep_amount).await {
        Ok(()) => Step {
            phase: None,
            outcome: Ok(Retirement::Retired),
        },
        Err(err) => {
            tracing::error!(error = %err, compute_group, "error dropping over-quota backends");
            Step::failed(err)
        }
    }
}

/// Drive the graceful retirement of the compute group's over-quota backends by one step.
#[tracing::instrument(level = "debug", skip(conn))]
pub async fn retire_by_decommission(conn: &mut dyn Membership, compute_group: &str, keep_amount: i32) -> Step {
    let backends = match list_backends(conn, compute_group).await {
        Ok(backends) => backends,
        Err(err) => return Step::failed(err),
    };
    let status = match DecommissionTaskStatus::construct(&backends, keep_amount) {
        Ok(status) => status,
        Err(err) => return Step::failed(err),
    };
    let phase = status.phase();
    tracing::debug!(?phase, ?status, "decommission progress classified");

    match phase {
        DecommissionPhase::Acceptable => {
            let selected = match select_over_quota(&backends, keep_amount) {
                Ok(selected) => selected,
                Err(err) => return Step::failed(err),
            };
            if let Err(err) = conn.decommission_backends(&selected).await.map_err(ScaleDownError::Command) {
                tracing::error!(error = %err, compute_group, "error decommissioning over-quota backends");
                return Step::failed(err);
            }
            tracing::info!(compute_group, count = selected.len(), "decommission of over-quota backends started");
            Step::in_progress()
        }
        DecommissionPhase::Decommissioning | DecommissionPhase::Unknown => {
            tracing::info!(compute_group, ?phase, "decommission of over-quota backends in progress");
            Step::in_progress()
        }
        DecommissionPhase::Decommissioned => match drop_over_quota(conn, &backends, keep_amount).await {
            Ok(()) => Step {
                phase: None,
                outcome: Ok(Retirement::Retired),
            },
            Err(err) => {
                tracing::error!(error = %err, compute_group, "error dropping decommissioned backends");
                Step::failed(err)
            }
        },
    }
}

async fn list_backends(conn: &mut dyn Membership, compute_group: &str) -> Result<Vec<Backend>, ScaleDownError> {
    conn.list_backends(compute_group).await.map_err(ScaleDownError::Membership)
}

async fn drop_over_quota(conn: &mut dyn Membership, backends: &[Backend], keep_amount: i32) -> Result<(), ScaleDownError> {
    let selected = select_over_quota(backends, keep_amount)?;
    if selected.is_empty() {
        return Ok(());
    }
    conn.drop_backends(&selected).await.map_err(ScaleDownError::Command)
}
