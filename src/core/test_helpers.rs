//! Shared test utilities
//!
//! Builders for the inputs every assembler, converger and reconciler test
//! needs. Only compiled in test mode.

use crate::core::assemble::{self, DEFAULT_CHAIN_PRIORITY};
use crate::core::firewall::{
    ClusterId, FirewallSpec, IngressPolicyMode, InterfaceNames, Membership, Topology,
};
use crate::core::naming::REMOTE_CLUSTER_ID_LABEL;
use crate::store::{Endpoint, PolicyObject};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub fn cluster(id: &str) -> ClusterId {
    ClusterId::new(id).unwrap()
}

pub fn interfaces() -> InterfaceNames {
    InterfaceNames {
        tunnel: "liqo-tunnel".to_string(),
        external: "eth0".to_string(),
    }
}

fn ips(raw: &[&str]) -> Vec<Ipv4Addr> {
    raw.iter().map(|ip| ip.parse().unwrap()).collect()
}

/// Membership from destination (remote-origin) and source (offloaded) IPs.
pub fn membership(destination: &[&str], source: &[&str]) -> Membership {
    Membership {
        source_pod_ips: ips(source),
        destination_pod_ips: ips(destination),
    }
}

pub fn topology(policy_name: &str, cidrs: &[&str]) -> Topology {
    Topology {
        policy_name: policy_name.to_string(),
        remote_pod_cidrs: cidrs.iter().map(|c| c.parse().unwrap()).collect(),
    }
}

/// Gateway spec for cluster `remote` with the default interfaces.
pub fn gateway_spec(mode: IngressPolicyMode, membership: &Membership) -> FirewallSpec {
    assemble::gateway(
        mode,
        &interfaces(),
        &cluster("remote"),
        membership,
        DEFAULT_CHAIN_PRIORITY,
    )
    .unwrap()
}

/// Fabric spec for cluster `remote`, policy `remote`, CIDR 10.200.0.0/16.
pub fn fabric_spec(mode: IngressPolicyMode, membership: &Membership) -> FirewallSpec {
    assemble::fabric(
        mode,
        &cluster("remote"),
        &topology("remote", &["10.200.0.0/16"]),
        membership,
        DEFAULT_CHAIN_PRIORITY,
    )
    .unwrap()
}

pub fn isolation_spec(pods: &[(&str, &[&str])]) -> FirewallSpec {
    let clusters: Vec<ClusterId> = pods.iter().map(|(id, _)| cluster(id)).collect();
    let pod_ips: BTreeMap<ClusterId, Vec<Ipv4Addr>> =
        pods.iter().map(|(id, raw)| (cluster(id), ips(raw))).collect();
    assemble::isolation(&clusters, &pod_ips, DEFAULT_CHAIN_PRIORITY).unwrap()
}

/// Policy named after its cluster, in namespace `tenant-<cluster>`.
pub fn policy(cluster_id: &str, ingress: Option<&str>, cidrs: &[&str]) -> PolicyObject {
    PolicyObject {
        name: cluster_id.to_string(),
        namespace: format!("tenant-{cluster_id}"),
        labels: BTreeMap::from([(REMOTE_CLUSTER_ID_LABEL.to_string(), cluster_id.to_string())]),
        ingress: ingress.map(str::to_string),
        remote_pod_cidrs: cidrs.iter().map(|c| (*c).to_string()).collect(),
    }
}

pub fn snapshot_endpoint(
    name: &str,
    ip: &str,
    origin_cluster: Option<&str>,
    offloaded_to: Option<&str>,
) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        ip: ip.to_string(),
        origin_cluster: origin_cluster.map(str::to_string),
        offloaded_to: offloaded_to.map(str::to_string),
    }
}
