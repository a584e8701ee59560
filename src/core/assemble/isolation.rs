use super::{checked, filter_chain, table};
use crate::core::address_set;
use crate::core::error::Result;
use crate::core::firewall::{ChainPolicy, ClusterId, FirewallSpec};
use crate::core::naming::{self, ISOLATION_CHAIN, ISOLATION_TABLE};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::debug;

/// Compiles the cluster-wide isolation spec.
///
/// Every known cluster gets a `pod_ips_<id>` set, empty when no pod has been
/// observed for it yet, so nothing can reference an undefined set. Sets are
/// ordered by cluster ID. The chain accepts by default and carries no rules.
///
/// # Errors
///
/// Only fails if the resulting spec is structurally invalid.
pub fn isolation(
    clusters: &[ClusterId],
    pod_ips: &BTreeMap<ClusterId, Vec<Ipv4Addr>>,
    priority: i32,
) -> Result<FirewallSpec> {
    let known: BTreeSet<&ClusterId> = clusters.iter().collect();

    let sets = known
        .iter()
        .map(|cluster| {
            let ips = pod_ips.get(*cluster).map_or(&[][..], Vec::as_slice);
            address_set::build(&naming::isolation_set_name(cluster), ips)
        })
        .collect();

    let spec = checked(FirewallSpec {
        table: table(ISOLATION_TABLE),
        chains: vec![filter_chain(
            ISOLATION_CHAIN,
            ChainPolicy::Accept,
            priority,
            Vec::new(),
        )],
        sets,
    })?;

    debug!(clusters = known.len(), "compiled isolation spec");
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> ClusterId {
        ClusterId::new(s).unwrap()
    }

    #[test]
    fn test_every_cluster_gets_a_set() {
        let mut ips = BTreeMap::new();
        ips.insert(cid("b"), vec![Ipv4Addr::new(10, 0, 0, 2)]);

        let spec = isolation(&[cid("b"), cid("a"), cid("b")], &ips, 200).unwrap();
        let names: Vec<&str> = spec.sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["pod_ips_a", "pod_ips_b"]);
        assert!(spec.sets[0].elements.is_empty());
        assert_eq!(spec.sets[1].elements, vec![Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn test_pods_of_unknown_clusters_are_ignored() {
        let mut ips = BTreeMap::new();
        ips.insert(cid("gone"), vec![Ipv4Addr::new(10, 0, 0, 9)]);
        let spec = isolation(&[cid("a")], &ips, 200).unwrap();
        assert_eq!(spec.sets.len(), 1);
        assert_eq!(spec.sets[0].name, "pod_ips_a");
    }

    #[test]
    fn test_accept_policy_and_no_rules() {
        let spec = isolation(&[], &BTreeMap::new(), 200).unwrap();
        assert_eq!(spec.table.name, "cluster-isolation");
        assert_eq!(spec.chains[0].name, "cluster-isolation-filter");
        assert_eq!(spec.chains[0].policy, ChainPolicy::Accept);
        assert!(spec.chains[0].rules.is_empty());
        assert!(spec.sets.is_empty());
    }
}
