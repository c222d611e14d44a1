use anyhow::Result;

use super::selector::{ordinal_of, select_over_quota};
use crate::fixtures::{backend, backends, hosts};
use crate::mysql::Backend;
use ddc_core::ScaleDownError;

#[test]
fn ordinal_of_pod_fqdn() -> Result<()> {
    assert_eq!(ordinal_of("demo-cg1-0.demo-cg1.doris.svc.cluster.local")?, 0);
    assert_eq!(ordinal_of("demo-cg1-17.demo-cg1.doris.svc.cluster.local")?, 17);
    assert_eq!(ordinal_of("demo-cg-with-dashes-3.svc")?, 3);
    assert_eq!(ordinal_of("demo-cg1-4")?, 4);
    Ok(())
}

#[test]
fn ordinal_of_rejects_hosts_without_ordinal() {
    for host in ["foo", "", "demo-cg1-x.svc", "demo-cg1-.svc"] {
        let res = ordinal_of(host);
        assert!(
            matches!(&res, Err(ScaleDownError::MalformedHostIdentifier { host: h }) if h == host),
            "expected MalformedHostIdentifier for {:?}, got {:?}",
            host,
            res
        );
    }
}

#[test]
fn select_over_quota_picks_ordinals_at_or_above_keep_amount() -> Result<()> {
    let selected = select_over_quota(&backends(5), 3)?;

    assert_eq!(hosts(&selected), hosts(&[backend(3), backend(4)]));
    Ok(())
}

#[test]
fn select_over_quota_is_independent_of_membership_order() -> Result<()> {
    let shuffled = vec![backend(4), backend(1), backend(3), backend(0), backend(2)];

    let mut selected = hosts(&select_over_quota(&shuffled, 3)?);
    selected.sort();

    assert_eq!(selected, hosts(&[backend(3), backend(4)]));
    Ok(())
}

#[test]
fn select_over_quota_returns_empty_set_when_within_quota() -> Result<()> {
    assert!(select_over_quota(&backends(3), 3)?.is_empty(), "expected nothing to be selected at quota");
    assert!(select_over_quota(&backends(2), 3)?.is_empty(), "expected nothing to be selected below quota");
    assert!(select_over_quota(&[], 0)?.is_empty(), "expected nothing to be selected without backends");
    Ok(())
}

#[test]
fn select_over_quota_never_selects_below_keep_amount() -> Result<()> {
    let members = backends(8);
    for keep_amount in 0..10 {
        let selected = select_over_quota(&members, keep_amount)?;
        for member in selected.iter() {
            let ordinal = ordinal_of(&member.host)?;
            assert!(ordinal as i32 >= keep_amount, "selected ordinal {} below keep-amount {}", ordinal, keep_amount);
        }
        assert_eq!(selected.len(), 8usize.saturating_sub(keep_amount as usize));
    }
    Ok(())
}

#[test]
fn select_over_quota_aborts_on_malformed_host() {
    let mut members = backends(5);
    members.push(Backend {
        host: "foo".into(),
        ..backend(0)
    });

    let res = select_over_quota(&members, 3);

    assert!(
        matches!(&res, Err(ScaleDownError::MalformedHostIdentifier { host }) if host == "foo"),
        "expected MalformedHostIdentifier without a partial selection, got {:?}",
        res
    );
}
