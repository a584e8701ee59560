//! Deterministic naming and ownership of generated firewall objects
//!
//! Every name is a pure function of the enforcement point role, the cluster
//! ID and (for fabric tables) the originating policy name.

use crate::core::firewall::ClusterId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Gateway table, shared by every cluster's gateway object
pub const GATEWAY_TABLE: &str = "cluster-security";
/// Filter chain inside gateway and fabric tables
pub const SECURITY_CHAIN: &str = "cluster-security-filter";
/// Prefix of per-policy fabric tables
pub const FABRIC_TABLE_PREFIX: &str = "cluster-security";
pub const ISOLATION_TABLE: &str = "cluster-isolation";
pub const ISOLATION_CHAIN: &str = "cluster-isolation-filter";
/// Name of the single cluster-wide isolation object
pub const ISOLATION_RESOURCE: &str = "security-isolation";

pub const DESTINATION_POD_IPS_SET: &str = "destination_pod_ips";
pub const SOURCE_POD_IPS_SET: &str = "source_pod_ips";

/// Label identifying the remote cluster a policy object refers to
pub const REMOTE_CLUSTER_ID_LABEL: &str = "meshwall.io/remote-cluster-id";
pub const CATEGORY_LABEL: &str = "meshwall.io/firewall-category";
pub const SUBCATEGORY_LABEL: &str = "meshwall.io/firewall-subcategory";
pub const UNIQUE_LABEL: &str = "meshwall.io/firewall-unique";

/// Enforcement point a spec is compiled for
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Inter-cluster tunnel boundary, one per remote cluster
    #[strum(serialize = "gateway")]
    Gateway,
    /// Per-node mesh boundary, one per remote cluster
    #[strum(serialize = "fabric")]
    Fabric,
    /// Cluster-wide isolation mesh, one in total
    #[strum(serialize = "isolation")]
    Isolation,
}

/// `<clusterID>-security-<role>`
pub fn resource_name(cluster: &ClusterId, role: Role) -> String {
    format!("{cluster}-security-{role}")
}

/// `<prefix>-<clusterID>`
pub fn namespace_name(prefix: &str, cluster: &ClusterId) -> String {
    format!("{prefix}-{cluster}")
}

/// `cluster-security-<policyName>`
pub fn fabric_table_name(policy_name: &str) -> String {
    format!("{FABRIC_TABLE_PREFIX}-{policy_name}")
}

/// `pod_ips_<clusterID>`
pub fn isolation_set_name(cluster: &ClusterId) -> String {
    format!("pod_ips_{cluster}")
}

/// Labels stamped on the upserted object so node agents can select it
pub fn labels(role: Role, cluster: Option<&ClusterId>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    match role {
        Role::Gateway => {
            labels.insert(CATEGORY_LABEL.to_string(), "gateway".to_string());
            labels.insert(SUBCATEGORY_LABEL.to_string(), "security".to_string());
            if let Some(cluster) = cluster {
                labels.insert(UNIQUE_LABEL.to_string(), cluster.to_string());
            }
        }
        Role::Fabric | Role::Isolation => {
            labels.insert(CATEGORY_LABEL.to_string(), "fabric".to_string());
            labels.insert(SUBCATEGORY_LABEL.to_string(), "all-nodes".to_string());
        }
    }
    labels
}

/// Explicit parent link carried on an upserted object. Garbage collection
/// of children is the store's business.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl OwnerRef {
    pub fn policy(name: &str, namespace: &str) -> Self {
        Self {
            kind: "Policy".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}
