pub mod crd;
pub mod error;

pub use error::ScaleDownError;

/// Comma-separated list of canonical label selectors which match the
/// operator's labelling scheme.
pub const DDC_OPERATOR_LABEL_SELECTORS: &str = "app.kubernetes.io/managed-by=ddc-operator";

/// The label carrying the name of the cluster which owns an object.
pub const LABEL_DDC_CLUSTER: &str = "disaggregated.cluster.doris.com/cluster";
/// The label carrying the unique id of the compute group which owns an object.
pub const LABEL_DDC_COMPUTE_GROUP: &str = "disaggregated.cluster.doris.com/computegroup";
