use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};

use super::scheduler::*;
use crate::config::Config;
use crate::fixtures::{cluster, compute_group, statefulset};
use ddc_core::crd::{ComputeGroup, Phase};
use ddc_core::{LABEL_DDC_CLUSTER, LABEL_DDC_COMPUTE_GROUP};

fn ready_statefulset(replicas: i32, ready: i32) -> StatefulSet {
    let mut sts = statefulset(replicas);
    sts.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(ready),
        ..Default::default()
    });
    sts
}

#[test]
fn build_statefulset_follows_compute_group() -> Result<()> {
    let config = Config::new_test();
    let cg = compute_group(3);
    let cluster = cluster(&cg, true, None);

    let sts = build_compute_group_statefulset(&cluster, &cg, &config.namespace);

    assert_eq!(sts.metadata.name.as_deref(), Some("demo-cg1"));
    assert_eq!(sts.metadata.namespace.as_deref(), Some("doris"));
    let labels = sts.metadata.labels.as_ref().context("expected labels")?;
    assert_eq!(labels.get(LABEL_DDC_CLUSTER).map(String::as_str), Some("demo"));
    assert_eq!(labels.get(LABEL_DDC_COMPUTE_GROUP).map(String::as_str), Some("cg1"));
    assert_eq!(labels.get("app.kubernetes.io/managed-by").map(String::as_str), Some("ddc-operator"));

    let spec = sts.spec.as_ref().context("expected spec")?;
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.service_name, "demo-cg1");
    assert_eq!(spec.selector.match_labels.as_ref(), Some(labels));
    let pod = spec.template.spec.as_ref().context("expected pod spec")?;
    assert_eq!(pod.containers.len(), 1);
    let container = &pod.containers[0];
    assert_eq!(container.name, CONTAINER_NAME_BE);
    assert_eq!(container.image.as_deref(), Some("apache/doris:be-3.0.2"));
    let ports: Vec<_> = container.ports.iter().flatten().map(|port| port.container_port).collect();
    assert!(ports.contains(&BE_PORT_HEARTBEAT), "expected heartbeat port to be exposed");
    let fe_addr = container
        .env
        .iter()
        .flatten()
        .find(|env| env.name == "FE_ADDR")
        .and_then(|env| env.value.as_deref());
    assert_eq!(fe_addr, Some("demo-fe.doris"));
    Ok(())
}

#[test]
fn build_statefulset_defaults_to_one_replica() -> Result<()> {
    let cg = ComputeGroup {
        replicas: None,
        ..compute_group(3)
    };
    let cluster = cluster(&cg, false, None);
    let sts = build_compute_group_statefulset(&cluster, &cg, "doris");
    assert_eq!(sts.spec.as_ref().and_then(|spec| spec.replicas), Some(1));
    Ok(())
}

#[test]
fn needs_update_on_replicas_or_image() -> Result<()> {
    let cg = compute_group(3);
    let cluster = cluster(&cg, false, None);
    let target = build_compute_group_statefulset(&cluster, &cg, "doris");

    assert!(!needs_update(&target.clone(), &target), "expected identical StatefulSets to need no update");

    let mut current = target.clone();
    if let Some(spec) = current.spec.as_mut() {
        spec.replicas = Some(4);
    }
    assert!(needs_update(&current, &target), "expected replica change to need an update");

    let mut current = target.clone();
    if let Some(container) = current
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
    {
        container.image = Some("apache/doris:be-2.1.0".into());
    }
    assert!(needs_update(&current, &target), "expected image change to need an update");

    let mut current = target.clone();
    current.status = Some(StatefulSetStatus { replicas: 3, ..Default::default() });
    assert!(!needs_update(&current, &target), "expected status to be ignored");
    Ok(())
}

#[test]
fn readiness_requires_all_replicas_ready() -> Result<()> {
    assert!(is_ready(&ready_statefulset(3, 3)));
    assert!(!is_ready(&ready_statefulset(3, 2)));
    assert!(!is_ready(&statefulset(3)), "expected a StatefulSet without status to be unready");
    Ok(())
}

#[test]
fn settle_phase_prefers_scale_down_phase() -> Result<()> {
    let ready = ready_statefulset(2, 2);
    assert_eq!(settle_phase(Some(Phase::Scaling), Phase::Reconciling, Some(&ready)), Phase::Scaling);
    assert_eq!(settle_phase(Some(Phase::Decommissioning), Phase::Reconciling, None), Phase::Decommissioning);
    assert_eq!(settle_phase(Some(Phase::ScaleDownFailed), Phase::Decommissioning, None), Phase::ScaleDownFailed);
    Ok(())
}

#[test]
fn settle_phase_follows_readiness_once_applied() -> Result<()> {
    assert_eq!(settle_phase(None, Phase::Scaling, Some(&ready_statefulset(2, 2))), Phase::Ready);
    assert_eq!(settle_phase(None, Phase::Ready, Some(&ready_statefulset(4, 2))), Phase::Reconciling);
    Ok(())
}

#[test]
fn settle_phase_keeps_persisted_phase_when_unapplied() -> Result<()> {
    assert_eq!(settle_phase(None, Phase::Decommissioning, None), Phase::Decommissioning);
    assert_eq!(settle_phase(None, Phase::ScaleDownFailed, None), Phase::ScaleDownFailed);
    Ok(())
}

#[test]
fn owning_compute_group_matches_statefulset_name() -> Result<()> {
    let cg = compute_group(3);
    let cluster = cluster(&cg, false, None);
    let owner = owning_compute_group(&cluster, "demo-cg1").context("expected an owning compute group")?;
    assert_eq!(owner.unique_id, "cg1");
    assert!(owning_compute_group(&cluster, "demo-cg2").is_none());
    assert!(owning_compute_group(&cluster, "other-cg1").is_none());
    Ok(())
}

#[test]
fn shortest_delay_keeps_the_minimum() -> Result<()> {
    let short = Duration::from_secs(5);
    let long = Duration::from_secs(10);
    assert_eq!(shortest_delay(None, long), Some(long));
    assert_eq!(shortest_delay(Some(long), short), Some(short));
    assert_eq!(shortest_delay(Some(short), long), Some(short));
    Ok(())
}
