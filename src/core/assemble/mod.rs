//! Policy rule assemblers
//!
//! One pure function per enforcement point. Each maps an ingress policy mode
//! and a membership snapshot to a complete [`FirewallSpec`]; none of them
//! touches shared state, so they can run concurrently.
//!
//! Rule order is significant everywhere: evaluation stops at the first match.

mod fabric;
mod gateway;
mod isolation;

pub use fabric::fabric;
pub use gateway::gateway;
pub use isolation::isolation;

use crate::core::codec;
use crate::core::error::Result;
use crate::core::firewall::{
    Action, AddressPosition, Chain, ChainHook, ChainPolicy, ChainType, CtState, FirewallSpec,
    Match, MatchOp, Rule, Table, TableFamily,
};

/// Default priority of generated chains (after NAT in postrouting)
pub const DEFAULT_CHAIN_PRIORITY: i32 = 200;

pub(crate) fn table(name: impl Into<String>) -> Table {
    Table {
        name: name.into(),
        family: TableFamily::Ip,
    }
}

pub(crate) fn filter_chain(
    name: &str,
    policy: ChainPolicy,
    priority: i32,
    rules: Vec<Rule>,
) -> Chain {
    Chain {
        name: name.to_string(),
        hook: ChainHook::Postrouting,
        priority,
        policy,
        chain_type: ChainType::Filter,
        rules,
    }
}

/// `ct state established,related accept`
pub(crate) fn accept_established_related() -> Rule {
    Rule::new(
        vec![Match::ct_state(
            &[CtState::Established, CtState::Related],
            MatchOp::Eq,
        )],
        Action::Accept,
    )
}

/// `ip <position> [!=] @<set> accept`
pub(crate) fn accept_set_member(position: AddressPosition, set: &str, op: MatchOp) -> Rule {
    Rule::new(
        vec![Match::address(position, format!("@{set}"), op)],
        Action::Accept,
    )
}

/// Rejects a spec whose set references dangle or whose predicates cannot be
/// encoded, so no partial spec ever leaves an assembler.
pub(crate) fn checked(spec: FirewallSpec) -> Result<FirewallSpec> {
    spec.validate()?;
    for chain in &spec.chains {
        for rule in &chain.rules {
            codec::canonicalize_rule(rule)?;
        }
    }
    Ok(spec)
}
