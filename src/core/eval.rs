//! First-match packet evaluation against a compiled spec
//!
//! Mirrors what the kernel does with the generated ruleset closely enough to
//! reason about where an assembler draws its accept/drop boundary: chains
//! run in spec order, rules within a chain run top to bottom, the first
//! matching rule decides, and the chain policy applies when nothing matches.
//! An accept only ends the current chain; a drop is final.

use crate::core::codec::{self, AddressValue, Predicate};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, AddressPosition, ChainPolicy, CtState, DevPosition, FirewallSpec, L4Proto, MatchOp,
};
use std::net::Ipv4Addr;

/// The parts of a packet the generated rules can look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub iifname: String,
    pub oifname: String,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: L4Proto,
    pub ct_state: CtState,
}

impl Packet {
    /// A new TCP flow from `src` to `dst`, entering on `iif` and leaving on `oif`.
    pub fn new(iif: &str, oif: &str, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self {
            iifname: iif.to_string(),
            oifname: oif.to_string(),
            src,
            dst,
            proto: L4Proto::Tcp,
            ct_state: CtState::New,
        }
    }

    pub fn with_state(mut self, state: CtState) -> Self {
        self.ct_state = state;
        self
    }
}

/// Outcome of an evaluation, with the deciding rule if there was one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    /// `(chain index, rule index)`; `None` when the chain policy decided
    pub rule: Option<(usize, usize)>,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        self.action == Action::Accept
    }
}

fn apply_op(op: MatchOp, hit: bool) -> bool {
    match op {
        MatchOp::Eq => hit,
        MatchOp::Neq => !hit,
    }
}

fn address_hit(spec: &FirewallSpec, value: &AddressValue, ip: Ipv4Addr) -> Result<bool> {
    Ok(match value {
        AddressValue::Single(addr) => *addr == ip,
        AddressValue::Cidr(net) => net.contains(ip),
        AddressValue::List(ips) => ips.contains(&ip),
        AddressValue::Range(start, end) => (*start..=*end).contains(&ip),
        AddressValue::SetRef(name) => spec
            .set(name)
            .ok_or_else(|| Error::UnsupportedMatch(format!("undefined set @{name}")))?
            .elements
            .contains(&ip),
    })
}

fn predicate_matches(spec: &FirewallSpec, predicate: &Predicate, packet: &Packet) -> Result<bool> {
    Ok(match predicate {
        Predicate::Interface { position, name, op } => {
            let dev = match position {
                DevPosition::In => &packet.iifname,
                DevPosition::Out => &packet.oifname,
            };
            apply_op(*op, dev == name)
        }
        Predicate::Address {
            position,
            value,
            op,
        } => {
            let ip = match position {
                AddressPosition::Src => packet.src,
                AddressPosition::Dst => packet.dst,
            };
            apply_op(*op, address_hit(spec, value, ip)?)
        }
        Predicate::Protocol { proto, op } => apply_op(*op, *proto == packet.proto),
        Predicate::CtState { states, op } => apply_op(*op, states.contains(packet.ct_state)),
    })
}

/// Runs `packet` through every chain of `spec`.
///
/// # Errors
///
/// Returns `UnsupportedMatch` if a predicate is malformed or references a
/// set the spec does not define.
pub fn evaluate(spec: &FirewallSpec, packet: &Packet) -> Result<Verdict> {
    let mut last = Verdict {
        action: Action::Accept,
        rule: None,
    };

    'chains: for (chain_idx, chain) in spec.chains.iter().enumerate() {
        for (rule_idx, rule) in chain.rules.iter().enumerate() {
            let canonical = codec::canonicalize_rule(rule)?;
            let mut all = true;
            for predicate in &canonical.predicates {
                if !predicate_matches(spec, predicate, packet)? {
                    all = false;
                    break;
                }
            }
            if all {
                last = Verdict {
                    action: rule.action,
                    rule: Some((chain_idx, rule_idx)),
                };
                if rule.action == Action::Drop {
                    return Ok(last);
                }
                continue 'chains;
            }
        }

        last = Verdict {
            action: match chain.policy {
                ChainPolicy::Accept => Action::Accept,
                ChainPolicy::Drop => Action::Drop,
            },
            rule: None,
        };
        if last.action == Action::Drop {
            return Ok(last);
        }
    }

    Ok(last)
}
