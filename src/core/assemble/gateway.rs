use super::{accept_established_related, accept_set_member, checked, filter_chain, table};
use crate::core::address_set;
use crate::core::error::Result;
use crate::core::firewall::{
    Action, AddressPosition, ChainPolicy, ClusterId, DevPosition, FirewallSpec, IngressPolicyMode,
    InterfaceNames, Match, MatchOp, Membership, Rule,
};
use crate::core::naming::{
    DESTINATION_POD_IPS_SET, GATEWAY_TABLE, SECURITY_CHAIN, SOURCE_POD_IPS_SET,
};
use tracing::debug;

/// Compiles the gateway spec for one remote cluster.
///
/// The two bypass rules are always present: traffic that did not enter
/// through the tunnel, and traffic leaving through the external interface,
/// is never filtered here. With filtering enabled the chain drops by default
/// and accepts established/related flows; `Isolate` additionally accepts
/// traffic to the remote cluster's pods and from the local pods offloaded
/// to it.
///
/// # Errors
///
/// Returns `UnsupportedMatch` if an interface name cannot be encoded.
pub fn gateway(
    mode: IngressPolicyMode,
    interfaces: &InterfaceNames,
    cluster: &ClusterId,
    membership: &Membership,
    priority: i32,
) -> Result<FirewallSpec> {
    let mut rules = vec![
        Rule::new(
            vec![Match::interface(
                DevPosition::In,
                interfaces.tunnel.clone(),
                MatchOp::Neq,
            )],
            Action::Accept,
        ),
        Rule::new(
            vec![Match::interface(
                DevPosition::Out,
                interfaces.external.clone(),
                MatchOp::Eq,
            )],
            Action::Accept,
        ),
    ];

    let policy = match mode {
        IngressPolicyMode::Allow => ChainPolicy::Accept,
        IngressPolicyMode::Deny => {
            rules.push(accept_established_related());
            ChainPolicy::Drop
        }
        IngressPolicyMode::Isolate => {
            rules.push(accept_established_related());
            rules.push(accept_set_member(
                AddressPosition::Dst,
                DESTINATION_POD_IPS_SET,
                MatchOp::Eq,
            ));
            rules.push(accept_set_member(
                AddressPosition::Src,
                SOURCE_POD_IPS_SET,
                MatchOp::Eq,
            ));
            ChainPolicy::Drop
        }
    };

    let spec = FirewallSpec {
        table: table(GATEWAY_TABLE),
        chains: vec![filter_chain(SECURITY_CHAIN, policy, priority, rules)],
        sets: vec![
            address_set::build(DESTINATION_POD_IPS_SET, &membership.destination_pod_ips),
            address_set::build(SOURCE_POD_IPS_SET, &membership.source_pod_ips),
        ],
    };
    let spec = checked(spec)?;

    debug!(
        cluster = %cluster,
        mode = %mode,
        rules = spec.chains[0].rules.len(),
        "compiled gateway spec"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::firewall::{CtState, MatchOp};
    use std::net::Ipv4Addr;

    fn interfaces() -> InterfaceNames {
        InterfaceNames {
            tunnel: "liqo-tunnel".into(),
            external: "eth0".into(),
        }
    }

    fn membership() -> Membership {
        Membership {
            source_pod_ips: vec![Ipv4Addr::new(10, 0, 1, 2), Ipv4Addr::new(10, 0, 1, 1)],
            destination_pod_ips: vec![Ipv4Addr::new(10, 200, 0, 5)],
        }
    }

    fn compile(mode: IngressPolicyMode) -> FirewallSpec {
        gateway(
            mode,
            &interfaces(),
            &ClusterId::new("remote-a").unwrap(),
            &membership(),
            200,
        )
        .unwrap()
    }

    #[test]
    fn test_bypass_rules_come_first() {
        for mode in [
            IngressPolicyMode::Allow,
            IngressPolicyMode::Isolate,
            IngressPolicyMode::Deny,
        ] {
            let spec = compile(mode);
            let rules = &spec.chains[0].rules;
            assert_eq!(
                rules[0].matches,
                vec![Match::interface(DevPosition::In, "liqo-tunnel", MatchOp::Neq)]
            );
            assert_eq!(
                rules[1].matches,
                vec![Match::interface(DevPosition::Out, "eth0", MatchOp::Eq)]
            );
        }
    }

    #[test]
    fn test_sets_always_present_and_sorted() {
        let spec = compile(IngressPolicyMode::Allow);
        assert_eq!(spec.table.name, "cluster-security");
        assert_eq!(spec.chains[0].name, "cluster-security-filter");
        let source = spec.set(SOURCE_POD_IPS_SET).unwrap();
        assert_eq!(
            source.elements,
            vec![Ipv4Addr::new(10, 0, 1, 1), Ipv4Addr::new(10, 0, 1, 2)]
        );
        assert!(spec.set(DESTINATION_POD_IPS_SET).is_some());
    }

    #[test]
    fn test_deny_has_no_set_exceptions() {
        let spec = compile(IngressPolicyMode::Deny);
        let rules = &spec.chains[0].rules;
        assert_eq!(rules.len(), 3);
        assert_eq!(
            rules[2].matches,
            vec![Match::ct_state(
                &[CtState::Established, CtState::Related],
                MatchOp::Eq
            )]
        );
    }

    #[test]
    fn test_bad_interface_is_unsupported() {
        let result = gateway(
            IngressPolicyMode::Isolate,
            &InterfaceNames {
                tunnel: "a-tunnel-name-too-long".into(),
                external: "eth0".into(),
            },
            &ClusterId::new("remote-a").unwrap(),
            &Membership::default(),
            200,
        );
        assert!(matches!(result, Err(Error::UnsupportedMatch(_))));
    }
}
