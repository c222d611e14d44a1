use anyhow::Result;

use super::progress::{DecommissionPhase, DecommissionTaskStatus};
use crate::fixtures::{backend, backends};
use crate::mysql::Backend;
use ddc_core::ScaleDownError;

fn decommissioned(ordinal: u32, tablet_num: u64) -> Backend {
    Backend {
        system_decommissioned: true,
        tablet_num,
        ..backend(ordinal)
    }
}

#[test]
fn untouched_over_quota_backends_are_acceptable() -> Result<()> {
    let status = DecommissionTaskStatus::construct(&backends(4), 2)?;

    assert_eq!(status.undecommissioned, 2);
    assert_eq!(status.all_backends, 4);
    assert_eq!(status.phase(), DecommissionPhase::Acceptable);
    Ok(())
}

#[test]
fn draining_backends_are_decommissioning() -> Result<()> {
    let members = vec![backend(0), backend(1), decommissioned(2, 64), decommissioned(3, 12)];

    let status = DecommissionTaskStatus::construct(&members, 2)?;

    assert_eq!(status.decommissioning, 2);
    assert_eq!(status.phase(), DecommissionPhase::Decommissioning);
    Ok(())
}

#[test]
fn partially_drained_backends_are_decommissioning() -> Result<()> {
    let members = vec![backend(0), backend(1), decommissioned(2, 0), decommissioned(3, 12)];

    let status = DecommissionTaskStatus::construct(&members, 2)?;

    assert_eq!(status.phase(), DecommissionPhase::Decommissioning);
    Ok(())
}

#[test]
fn drained_backends_are_decommissioned() -> Result<()> {
    let members = vec![backend(0), backend(1), decommissioned(2, 0), decommissioned(3, 0)];

    let status = DecommissionTaskStatus::construct(&members, 2)?;

    assert_eq!(status.decommissioned, 2);
    assert_eq!(status.phase(), DecommissionPhase::Decommissioned);
    Ok(())
}

#[test]
fn no_over_quota_backends_is_decommissioned() -> Result<()> {
    let status = DecommissionTaskStatus::construct(&backends(2), 2)?;

    assert_eq!(status.over_quota(), 0);
    assert_eq!(status.phase(), DecommissionPhase::Decommissioned);
    Ok(())
}

#[test]
fn mixed_backends_are_unknown() -> Result<()> {
    let members = vec![backend(0), backend(1), backend(2), decommissioned(3, 12)];

    let status = DecommissionTaskStatus::construct(&members, 2)?;

    assert_eq!(status.phase(), DecommissionPhase::Unknown);
    Ok(())
}

#[test]
fn backends_within_quota_are_not_counted() -> Result<()> {
    let members = vec![decommissioned(0, 12), decommissioned(1, 0), backend(2), backend(3)];

    let status = DecommissionTaskStatus::construct(&members, 2)?;

    assert_eq!(status.decommissioning, 0);
    assert_eq!(status.decommissioned, 0);
    assert_eq!(status.phase(), DecommissionPhase::Acceptable);
    Ok(())
}

#[test]
fn classification_is_recomputed_from_membership() -> Result<()> {
    let mut members = backends(4);
    assert_eq!(DecommissionTaskStatus::construct(&members, 2)?.phase(), DecommissionPhase::Acceptable);

    members[2] = decommissioned(2, 30);
    members[3] = decommissioned(3, 30);
    assert_eq!(DecommissionTaskStatus::construct(&members, 2)?.phase(), DecommissionPhase::Decommissioning);

    members[2].tablet_num = 0;
    members[3].tablet_num = 0;
    assert_eq!(DecommissionTaskStatus::construct(&members, 2)?.phase(), DecommissionPhase::Decommissioned);
    Ok(())
}

#[test]
fn malformed_host_fails_classification() {
    let mut members = backends(3);
    members.push(Backend {
        host: "foo".into(),
        ..backend(3)
    });

    let res = DecommissionTaskStatus::construct(&members, 2);

    assert!(
        matches!(res, Err(ScaleDownError::MalformedHostIdentifier { .. })),
        "expected MalformedHostIdentifier, got {:?}",
        res
    );
}
