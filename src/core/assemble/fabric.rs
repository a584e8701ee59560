use super::{accept_established_related, accept_set_member, checked, filter_chain, table};
use crate::core::address_set;
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, AddressPosition, ChainPolicy, ClusterId, FirewallSpec, IngressPolicyMode, Match,
    MatchOp, Membership, Rule, Topology,
};
use crate::core::naming::{self, DESTINATION_POD_IPS_SET, SECURITY_CHAIN};
use tracing::debug;

/// Compiles the per-node fabric spec for one remote cluster.
///
/// With filtering enabled the first rule lets through everything whose
/// source is not one of the remote cluster's pods, so only traffic sourced
/// by those pods is filtered further. Such traffic is accepted when it
/// belongs to an established/related flow, is addressed to another remote
/// pod, or is addressed into the remote pod CIDR; the drop policy handles
/// the rest.
///
/// # Errors
///
/// - `MissingTopology` if the policy name or remote pod CIDR is absent
/// - `InvalidInput` if the policy name cannot be used in a table name
pub fn fabric(
    mode: IngressPolicyMode,
    cluster: &ClusterId,
    topology: &Topology,
    membership: &Membership,
    priority: i32,
) -> Result<FirewallSpec> {
    if topology.policy_name.is_empty() {
        return Err(Error::MissingTopology(format!(
            "policy name for cluster {cluster}"
        )));
    }
    crate::validators::validate_policy_name(&topology.policy_name)
        .map_err(|message| Error::invalid_input("policy name", message))?;
    if topology.remote_pod_cidrs.is_empty() {
        return Err(Error::MissingTopology(format!(
            "remote pod CIDR for cluster {cluster}"
        )));
    }

    let mut rules = Vec::new();
    let policy = if mode == IngressPolicyMode::Allow {
        ChainPolicy::Accept
    } else {
        rules.push(accept_set_member(
            AddressPosition::Src,
            DESTINATION_POD_IPS_SET,
            MatchOp::Neq,
        ));
        rules.push(accept_established_related());
        rules.push(accept_set_member(
            AddressPosition::Dst,
            DESTINATION_POD_IPS_SET,
            MatchOp::Eq,
        ));
        for cidr in &topology.remote_pod_cidrs {
            rules.push(Rule::new(
                vec![Match::address(
                    AddressPosition::Dst,
                    cidr.to_string(),
                    MatchOp::Eq,
                )],
                Action::Accept,
            ));
        }
        ChainPolicy::Drop
    };

    let spec = checked(FirewallSpec {
        table: table(naming::fabric_table_name(&topology.policy_name)),
        chains: vec![filter_chain(SECURITY_CHAIN, policy, priority, rules)],
        sets: vec![address_set::build(
            DESTINATION_POD_IPS_SET,
            &membership.destination_pod_ips,
        )],
    })?;

    debug!(
        cluster = %cluster,
        mode = %mode,
        table = %spec.table.name,
        "compiled fabric spec"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology {
            policy_name: "remote-a".into(),
            remote_pod_cidrs: vec!["10.71.0.0/16".parse().unwrap()],
        }
    }

    fn cluster() -> ClusterId {
        ClusterId::new("remote-a").unwrap()
    }

    #[test]
    fn test_allow_has_only_the_set() {
        let spec = fabric(
            IngressPolicyMode::Allow,
            &cluster(),
            &topology(),
            &Membership::default(),
            200,
        )
        .unwrap();
        assert_eq!(spec.table.name, "cluster-security-remote-a");
        assert_eq!(spec.chains[0].policy, ChainPolicy::Accept);
        assert!(spec.chains[0].rules.is_empty());
        assert_eq!(spec.sets.len(), 1);
        assert!(spec.set(DESTINATION_POD_IPS_SET).is_some());
    }

    #[test]
    fn test_isolate_rule_order() {
        let spec = fabric(
            IngressPolicyMode::Isolate,
            &cluster(),
            &topology(),
            &Membership::default(),
            200,
        )
        .unwrap();
        let chain = &spec.chains[0];
        assert_eq!(chain.policy, ChainPolicy::Drop);
        assert_eq!(chain.rules.len(), 4);
        assert_eq!(
            chain.rules[0].matches,
            vec![Match::address(
                AddressPosition::Src,
                "@destination_pod_ips",
                MatchOp::Neq
            )]
        );
        assert_eq!(chain.rules[1], accept_established_related());
        assert_eq!(
            chain.rules[3].matches,
            vec![Match::address(
                AddressPosition::Dst,
                "10.71.0.0/16",
                MatchOp::Eq
            )]
        );
        assert!(chain.rules.iter().all(|r| r.action == Action::Accept));
    }

    #[test]
    fn test_deny_matches_isolate_on_fabric() {
        let isolate = fabric(
            IngressPolicyMode::Isolate,
            &cluster(),
            &topology(),
            &Membership::default(),
            200,
        )
        .unwrap();
        let deny = fabric(
            IngressPolicyMode::Deny,
            &cluster(),
            &topology(),
            &Membership::default(),
            200,
        )
        .unwrap();
        assert_eq!(isolate, deny);
    }

    #[test]
    fn test_missing_cidr_is_missing_topology() {
        let topo = Topology {
            remote_pod_cidrs: vec![],
            ..topology()
        };
        for mode in [IngressPolicyMode::Allow, IngressPolicyMode::Isolate] {
            let result = fabric(mode, &cluster(), &topo, &Membership::default(), 200);
            assert!(matches!(result, Err(Error::MissingTopology(_))));
        }
    }

    #[test]
    fn test_policy_name_validation() {
        let empty = Topology {
            policy_name: String::new(),
            ..topology()
        };
        assert!(matches!(
            fabric(IngressPolicyMode::Deny, &cluster(), &empty, &Membership::default(), 200),
            Err(Error::MissingTopology(_))
        ));

        let bad = Topology {
            policy_name: "Bad Name".into(),
            ..topology()
        };
        assert!(matches!(
            fabric(IngressPolicyMode::Deny, &cluster(), &bad, &Membership::default(), 200),
            Err(Error::InvalidInput { .. })
        ));
    }
}
