//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use ddc_core::crd::DorisDisaggregatedCluster;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating {:?}", &crds_path))?;

    let cluster = DorisDisaggregatedCluster::crd();
    let cluster_yaml = serde_yaml::to_string(&cluster).context("error serializing DorisDisaggregatedCluster CRD to yaml")?;
    std::fs::write(crds_path.join("doris-disaggregated-cluster.yaml"), &cluster_yaml)
        .with_context(|| format!("error writing DorisDisaggregatedCluster CRD to {:?}", &crds_path))?;
    println!("DorisDisaggregatedCluster CRD written to {:?}", &crds_path);

    Ok(())
}
