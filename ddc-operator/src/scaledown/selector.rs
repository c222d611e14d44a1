//! Selection of the backends which must leave a compute group.
//!
//! A compute group is backed by a StatefulSet, and a StatefulSet always removes its
//! highest-indexed pods first. Backends are therefore selected by the ordinal of the pod they run
//! in: every backend whose ordinal is at or above the keep-amount is over quota.

use ddc_core::ScaleDownError;

use crate::mysql::Backend;

/// Extract the pod ordinal from a backend host.
///
/// Hosts are pod FQDNs such as `demo-cg1-3.demo-cg1.doris.svc.cluster.local`. The ordinal is the
/// last `-` separated segment of the first label.
pub fn ordinal_of(host: &str) -> Result<u32, ScaleDownError> {
    host.split('.')
        .next()
        .and_then(|pod_name| pod_name.rsplit('-').next())
        .and_then(|ordinal| ordinal.parse::<u32>().ok())
        .ok_or_else(|| ScaleDownError::MalformedHostIdentifier { host: host.into() })
}

/// Check if the given ordinal must be retired for the given keep-amount.
pub fn is_over_quota(ordinal: u32, keep_amount: i32) -> bool {
    i64::from(ordinal) >= i64::from(keep_amount)
}

/// Select every backend whose ordinal is at or above the keep-amount.
///
/// A single malformed host aborts the selection, no partial set is ever returned.
pub fn select_over_quota(backends: &[Backend], keep_amount: i32) -> Result<Vec<Backend>, ScaleDownError> {
    let mut selected = Vec::new();
    for backend in backends {
        let ordinal = ordinal_of(&backend.host)?;
        if is_over_quota(ordinal, keep_amount) {
            selected.push(backend.clone());
        }
    }
    Ok(selected)
}
