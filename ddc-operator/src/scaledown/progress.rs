//! Classification of decommission progress.
//!
//! Progress is recomputed from live membership on every pass and never cached, so whatever
//! happens to the backends between passes is picked up by the next one.

use ddc_core::ScaleDownError;

use crate::mysql::Backend;
use crate::scaledown::selector::{is_over_quota, ordinal_of};

/// The stage of a compute group's graceful retirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecommissionPhase {
    /// No over-quota backend has been asked to decommission yet.
    Acceptable,
    /// Over-quota backends are still draining.
    Decommissioning,
    /// Every over-quota backend has drained and may be dropped.
    Decommissioned,
    /// Membership is in a mixed state which can not be classified with confidence.
    Unknown,
}

/// Counts of the over-quota backends of a compute group, by retirement stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecommissionTaskStatus {
    /// All backends of the compute group.
    pub all_backends: usize,
    /// Over-quota backends which have not been asked to decommission.
    pub undecommissioned: usize,
    /// Over-quota backends which are decommissioned but still host tablets.
    pub decommissioning: usize,
    /// Over-quota backends which are decommissioned and host no tablets.
    pub decommissioned: usize,
    /// The keep-amount the counts were computed against.
    pub keep_amount: i32,
}

impl DecommissionTaskStatus {
    /// Count the over-quota backends of the given membership.
    pub fn construct(backends: &[Backend], keep_amount: i32) -> Result<Self, ScaleDownError> {
        let mut status = Self {
            all_backends: backends.len(),
            keep_amount,
            ..Default::default()
        };
        for backend in backends {
            if !is_over_quota(ordinal_of(&backend.host)?, keep_amount) {
                continue;
            }
            match (backend.system_decommissioned, backend.tablet_num) {
                (false, _) => status.undecommissioned += 1,
                (true, 0) => status.decommissioned += 1,
                (true, _) => status.decommissioning += 1,
            }
        }
        Ok(status)
    }

    /// The number of over-quota backends.
    pub fn over_quota(&self) -> usize {
        self.undecommissioned + self.decommissioning + self.decommissioned
    }

    /// Classify the retirement stage these counts represent.
    pub fn phase(&self) -> DecommissionPhase {
        // Nothing left to retire, e.g. drained backends already removed from membership.
        if self.over_quota() == 0 {
            return DecommissionPhase::Decommissioned;
        }
        match (self.undecommissioned, self.decommissioning, self.decommissioned) {
            (_, 0, 0) => DecommissionPhase::Acceptable,
            (0, d, _) if d > 0 => DecommissionPhase::Decommissioning,
            (0, 0, _) => DecommissionPhase::Decommissioned,
            _ => DecommissionPhase::Unknown,
        }
    }
}
