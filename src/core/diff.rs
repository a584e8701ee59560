//! Spec differ
//!
//! Compares a desired [`FirewallSpec`] with the observed table and produces
//! the smallest [`Plan`] that converges one onto the other. An empty plan
//! means the target is already converged.
//!
//! Set membership is updated in place (flush + add elements) instead of
//! recreating sets, and chain policies are updated in place, so a filter
//! stays installed throughout. Rules of a chain are replaced as a whole
//! (flush + add) whenever the canonical rule lists differ.
//!
//! Operations come out in dependency order:
//!
//! 1. table
//! 2. new sets, then set membership updates
//! 3. new chains and policy updates
//! 4. flushes of chains whose rules are rewritten, recreated or stale
//! 5. deletion of recreated and stale chains, then of recreated and stale sets
//! 6. re-creation of recreated sets and chains
//! 7. rule additions

use crate::core::address_set;
use crate::core::codec::{self, CanonicalRule};
use crate::core::error::Result;
use crate::core::firewall::{
    AddressSet, Chain, ChainHook, ChainPolicy, ChainType, FirewallSpec, Rule, TableFamily,
};
use crate::core::observed::{ObservedChain, ObservedTable};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Base chain definition without its rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHeader {
    pub name: String,
    pub hook: ChainHook,
    pub priority: i32,
    pub policy: ChainPolicy,
    pub chain_type: ChainType,
}

impl From<&Chain> for ChainHeader {
    fn from(chain: &Chain) -> Self {
        Self {
            name: chain.name.clone(),
            hook: chain.hook,
            priority: chain.priority,
            policy: chain.policy,
            chain_type: chain.chain_type,
        }
    }
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTable,
    AddSet(AddressSet),
    ReplaceElements { set: String, elements: Vec<Ipv4Addr> },
    AddChain(ChainHeader),
    UpdatePolicy(ChainHeader),
    FlushChain(String),
    DeleteChain(String),
    DeleteSet(String),
    AddRule { chain: String, rule: Rule },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::AddTable => write!(f, "add table"),
            Op::AddSet(set) => write!(f, "add set {} ({} elements)", set.name, set.elements.len()),
            Op::ReplaceElements { set, elements } => {
                write!(f, "replace elements of {set} ({} elements)", elements.len())
            }
            Op::AddChain(chain) => write!(
                f,
                "add chain {} (hook {} priority {} policy {})",
                chain.name, chain.hook, chain.priority, chain.policy
            ),
            Op::UpdatePolicy(chain) => write!(f, "set policy of {} to {}", chain.name, chain.policy),
            Op::FlushChain(name) => write!(f, "flush chain {name}"),
            Op::DeleteChain(name) => write!(f, "delete chain {name}"),
            Op::DeleteSet(name) => write!(f, "delete set {name}"),
            Op::AddRule { chain, rule } => {
                write!(f, "add rule to {chain}: {} ({} matches)", rule.action, rule.matches.len())
            }
        }
    }
}

/// Ordered operations converging one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub family: TableFamily,
    pub table: String,
    pub ops: Vec<Op>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Renders the plan as one `nft --json` batch, applied atomically.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedMatch` if a rule cannot be encoded.
    pub fn to_nftables_json(&self) -> Result<Value> {
        let family = self.family.as_ref();
        let table = self.table.as_str();
        let mut commands = vec![json!({ "metainfo": { "json_schema_version": 1 } })];

        for op in &self.ops {
            match op {
                Op::AddTable => {
                    commands.push(json!({ "add": { "table": { "family": family, "name": table } } }));
                }
                Op::AddSet(set) => {
                    let mut obj = json!({
                        "family": family,
                        "table": table,
                        "name": set.name,
                        "type": set.element_type.as_ref(),
                    });
                    if !set.elements.is_empty() {
                        obj["elem"] = json!(elements_json(&set.elements));
                    }
                    commands.push(json!({ "add": { "set": obj } }));
                }
                Op::ReplaceElements { set, elements } => {
                    commands.push(json!({
                        "flush": { "set": { "family": family, "table": table, "name": set } }
                    }));
                    if !elements.is_empty() {
                        commands.push(json!({
                            "add": { "element": {
                                "family": family,
                                "table": table,
                                "name": set,
                                "elem": elements_json(elements),
                            } }
                        }));
                    }
                }
                Op::AddChain(chain) | Op::UpdatePolicy(chain) => {
                    commands.push(json!({
                        "add": { "chain": {
                            "family": family,
                            "table": table,
                            "name": chain.name,
                            "type": chain.chain_type.as_ref(),
                            "hook": chain.hook.as_ref(),
                            "prio": chain.priority,
                            "policy": chain.policy.as_ref(),
                        } }
                    }));
                }
                Op::FlushChain(name) => {
                    commands.push(json!({
                        "flush": { "chain": { "family": family, "table": table, "name": name } }
                    }));
                }
                Op::DeleteChain(name) => {
                    commands.push(json!({
                        "delete": { "chain": { "family": family, "table": table, "name": name } }
                    }));
                }
                Op::DeleteSet(name) => {
                    commands.push(json!({
                        "delete": { "set": { "family": family, "table": table, "name": name } }
                    }));
                }
                Op::AddRule { chain, rule } => {
                    let mut obj = json!({
                        "family": family,
                        "table": table,
                        "chain": chain,
                        "expr": codec::encode_rule(rule)?,
                    });
                    if let Some(comment) = &rule.comment {
                        obj["comment"] = json!(crate::validators::sanitize_label(comment));
                    }
                    commands.push(json!({ "add": { "rule": obj } }));
                }
            }
        }

        Ok(json!({ "nftables": commands }))
    }
}

fn elements_json(elements: &[Ipv4Addr]) -> Vec<String> {
    elements.iter().map(ToString::to_string).collect()
}

fn header_matches(desired: &Chain, observed: &ObservedChain) -> bool {
    observed.hook.as_deref() == Some(desired.hook.as_ref())
        && observed.prio == Some(i64::from(desired.priority))
        && observed.chain_type.as_deref() == Some(desired.chain_type.as_ref())
}

fn rules_match(desired: &[CanonicalRule], observed: &ObservedChain) -> bool {
    desired.len() == observed.rules.len()
        && desired.iter().zip(&observed.rules).all(|(want, have)| {
            codec::decode_rule(&have.expr, have.comment.as_deref()).as_ref() == Some(want)
        })
}

/// Computes the plan moving `observed` to `desired`.
///
/// `desired` is normalized first, so literal address lists are compared as
/// the sets they materialize into.
///
/// # Errors
///
/// Returns `UnsupportedMatch` if the desired spec is invalid or contains a
/// predicate the codec cannot encode.
pub fn diff(desired: &FirewallSpec, observed: Option<&ObservedTable>) -> Result<Plan> {
    let desired = desired.normalize()?;
    desired.validate()?;

    let canonical: Vec<Vec<CanonicalRule>> = desired
        .chains
        .iter()
        .map(|c| {
            c.rules
                .iter()
                .map(codec::canonicalize_rule)
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<_>>()?;

    let mut plan = Plan {
        family: desired.table.family,
        table: desired.table.name.clone(),
        ops: Vec::new(),
    };

    let Some(observed) = observed else {
        plan.ops.push(Op::AddTable);
        plan.ops
            .extend(desired.sets.iter().cloned().map(Op::AddSet));
        plan.ops
            .extend(desired.chains.iter().map(|c| Op::AddChain(c.into())));
        for chain in &desired.chains {
            plan.ops.extend(chain.rules.iter().map(|rule| Op::AddRule {
                chain: chain.name.clone(),
                rule: rule.clone(),
            }));
        }
        return Ok(plan);
    };

    let mut new_sets = Vec::new();
    let mut element_updates = Vec::new();
    let mut recreated_sets = Vec::new();
    for set in &desired.sets {
        match observed.set(&set.name) {
            None => new_sets.push(Op::AddSet(set.clone())),
            Some(have) if have.set_type.as_deref() != Some(set.element_type.as_ref()) => {
                recreated_sets.push(set);
            }
            Some(have) if !address_set::equal(&set.elements, &have.elements) => {
                element_updates.push(Op::ReplaceElements {
                    set: set.name.clone(),
                    elements: set.elements.clone(),
                });
            }
            Some(_) => {}
        }
    }

    let wanted_sets: BTreeSet<&str> = desired.sets.iter().map(|s| s.name.as_str()).collect();
    let stale_sets: Vec<&str> = observed
        .sets
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| !wanted_sets.contains(name))
        .collect();

    let wanted_chains: BTreeSet<&str> = desired.chains.iter().map(|c| c.name.as_str()).collect();
    let stale_chains: Vec<&str> = observed
        .chains
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| !wanted_chains.contains(name))
        .collect();

    // A set can only be deleted once no rule references it, so recreating
    // one rewrites the rules of every surviving chain.
    let force_rules = !recreated_sets.is_empty();

    let mut chain_ops = Vec::new();
    let mut flushes = Vec::new();
    let mut recreated_chains = Vec::new();
    let mut rule_adds = Vec::new();
    for (chain, rules) in desired.chains.iter().zip(&canonical) {
        let rewrite = match observed.chain(&chain.name) {
            None => {
                chain_ops.push(Op::AddChain(chain.into()));
                true
            }
            Some(have) if !header_matches(chain, have) => {
                flushes.push(Op::FlushChain(chain.name.clone()));
                recreated_chains.push(chain);
                true
            }
            Some(have) => {
                if have.policy.as_deref() != Some(chain.policy.as_ref()) {
                    chain_ops.push(Op::UpdatePolicy(chain.into()));
                }
                let rewrite = force_rules || !rules_match(rules, have);
                if rewrite {
                    flushes.push(Op::FlushChain(chain.name.clone()));
                }
                rewrite
            }
        };
        if rewrite {
            rule_adds.extend(chain.rules.iter().map(|rule| Op::AddRule {
                chain: chain.name.clone(),
                rule: rule.clone(),
            }));
        }
    }

    plan.ops.extend(new_sets);
    plan.ops.extend(element_updates);
    plan.ops.extend(chain_ops);
    plan.ops.extend(flushes);
    for name in &stale_chains {
        plan.ops.push(Op::FlushChain((*name).to_string()));
    }
    for chain in &recreated_chains {
        plan.ops.push(Op::DeleteChain(chain.name.clone()));
    }
    for name in &stale_chains {
        plan.ops.push(Op::DeleteChain((*name).to_string()));
    }
    for set in &recreated_sets {
        plan.ops.push(Op::DeleteSet(set.name.clone()));
    }
    for name in &stale_sets {
        plan.ops.push(Op::DeleteSet((*name).to_string()));
    }
    plan.ops
        .extend(recreated_sets.into_iter().cloned().map(Op::AddSet));
    plan.ops
        .extend(recreated_chains.into_iter().map(|c| Op::AddChain(c.into())));
    plan.ops.extend(rule_adds);

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{
        Action, AddressPosition, CtState, Match, MatchOp, SetElementType, Table,
    };
    use crate::core::observed::{ObservedRule, ObservedSet};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn desired() -> FirewallSpec {
        FirewallSpec {
            table: Table {
                name: "t".into(),
                family: TableFamily::Ip,
            },
            chains: vec![Chain {
                name: "c".into(),
                hook: ChainHook::Postrouting,
                priority: 200,
                policy: ChainPolicy::Drop,
                chain_type: ChainType::Filter,
                rules: vec![
                    Rule::new(
                        vec![Match::ct_state(
                            &[CtState::Established, CtState::Related],
                            MatchOp::Eq,
                        )],
                        Action::Accept,
                    ),
                    Rule::new(
                        vec![Match::address(AddressPosition::Dst, "@pods", MatchOp::Eq)],
                        Action::Accept,
                    ),
                ],
            }],
            sets: vec![address_set::build("pods", &[ip("10.0.0.2"), ip("10.0.0.1")])],
        }
    }

    /// What the kernel would list after applying `spec` from scratch
    fn observed_from(spec: &FirewallSpec) -> ObservedTable {
        ObservedTable {
            family: "ip".into(),
            name: spec.table.name.clone(),
            chains: spec
                .chains
                .iter()
                .map(|c| ObservedChain {
                    name: c.name.clone(),
                    chain_type: Some(c.chain_type.to_string()),
                    hook: Some(c.hook.to_string()),
                    prio: Some(i64::from(c.priority)),
                    policy: Some(c.policy.to_string()),
                    rules: c
                        .rules
                        .iter()
                        .enumerate()
                        .map(|(i, r)| ObservedRule {
                            handle: i as u64 + 1,
                            expr: codec::encode_rule(r).unwrap(),
                            comment: r.comment.clone(),
                        })
                        .collect(),
                })
                .collect(),
            sets: spec
                .sets
                .iter()
                .map(|s| ObservedSet {
                    name: s.name.clone(),
                    set_type: Some(SetElementType::Ipv4Addr.to_string()),
                    // kernel order differs from ours
                    elements: s.elements.iter().rev().map(|e| json!(e.to_string())).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_missing_table_builds_everything() {
        let plan = diff(&desired(), None).unwrap();
        assert_eq!(plan.ops[0], Op::AddTable);
        assert!(matches!(plan.ops[1], Op::AddSet(_)));
        assert!(matches!(plan.ops[2], Op::AddChain(_)));
        assert_eq!(
            plan.ops
                .iter()
                .filter(|op| matches!(op, Op::AddRule { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_converged_state_is_a_noop() {
        let spec = desired();
        let observed = observed_from(&spec);
        assert!(diff(&spec, Some(&observed)).unwrap().is_empty());
    }

    #[test]
    fn test_membership_change_updates_set_in_place() {
        let spec = desired();
        let observed = observed_from(&spec);

        let mut changed = spec.clone();
        changed.sets[0] = address_set::build("pods", &[ip("10.0.0.3")]);

        let plan = diff(&changed, Some(&observed)).unwrap();
        assert_eq!(
            plan.ops,
            vec![Op::ReplaceElements {
                set: "pods".into(),
                elements: vec![ip("10.0.0.3")],
            }]
        );
    }

    #[test]
    fn test_policy_change_keeps_rules() {
        let spec = desired();
        let observed = observed_from(&spec);

        let mut changed = spec.clone();
        changed.chains[0].policy = ChainPolicy::Accept;
        let plan = diff(&changed, Some(&observed)).unwrap();
        assert_eq!(plan.ops.len(), 1);
        assert!(matches!(&plan.ops[0], Op::UpdatePolicy(h) if h.policy == ChainPolicy::Accept));
    }

    #[test]
    fn test_rule_change_flushes_then_adds() {
        let spec = desired();
        let observed = observed_from(&spec);

        let mut changed = spec.clone();
        changed.chains[0].rules.pop();
        let plan = diff(&changed, Some(&observed)).unwrap();
        assert_eq!(plan.ops[0], Op::FlushChain("c".into()));
        assert!(matches!(&plan.ops[1], Op::AddRule { chain, .. } if chain == "c"));
        assert_eq!(plan.ops.len(), 2);
    }

    #[test]
    fn test_anonymous_ctstate_set_is_rewritten() {
        let spec = desired();
        let mut observed = observed_from(&spec);
        observed.chains[0].rules[0].expr[0] = json!({
            "match": {
                "op": "==",
                "left": { "ct": { "key": "state" } },
                "right": { "set": ["established", "related"] }
            }
        });
        let plan = diff(&spec, Some(&observed)).unwrap();
        assert!(plan.ops.contains(&Op::FlushChain("c".into())));
    }

    #[test]
    fn test_stale_objects_are_removed_last() {
        let spec = desired();
        let mut observed = observed_from(&spec);
        observed.chains.push(ObservedChain {
            name: "old".into(),
            ..Default::default()
        });
        observed.sets.push(ObservedSet {
            name: "old_ips".into(),
            set_type: Some("ipv4_addr".into()),
            elements: vec![],
        });

        let plan = diff(&spec, Some(&observed)).unwrap();
        assert_eq!(
            plan.ops,
            vec![
                Op::FlushChain("old".into()),
                Op::DeleteChain("old".into()),
                Op::DeleteSet("old_ips".into()),
            ]
        );
    }

    #[test]
    fn test_hook_change_recreates_chain() {
        let spec = desired();
        let mut observed = observed_from(&spec);
        observed.chains[0].prio = Some(0);

        let plan = diff(&spec, Some(&observed)).unwrap();
        let flush = plan.ops.iter().position(|o| *o == Op::FlushChain("c".into()));
        let delete = plan.ops.iter().position(|o| *o == Op::DeleteChain("c".into()));
        let add = plan.ops.iter().position(|o| matches!(o, Op::AddChain(_)));
        assert!(flush < delete && delete < add);
    }

    #[test]
    fn test_literal_list_materializes_as_set() {
        let mut spec = desired();
        spec.chains[0].rules.push(Rule::new(
            vec![Match::address(
                AddressPosition::Src,
                "10.1.0.1,10.1.0.2",
                MatchOp::Eq,
            )],
            Action::Accept,
        ));
        let plan = diff(&spec, None).unwrap();
        assert!(plan.ops.iter().any(|op| matches!(op, Op::AddSet(s) if s.name == "c_r2_m0")));

        let observed = observed_from(&spec.normalize().unwrap());
        assert!(diff(&spec, Some(&observed)).unwrap().is_empty());
    }

    #[test]
    fn test_batch_json_shape() {
        let plan = diff(&desired(), None).unwrap();
        let batch = plan.to_nftables_json().unwrap();
        let commands = batch["nftables"].as_array().unwrap();
        assert!(commands[0].get("metainfo").is_some());
        assert_eq!(commands[1]["add"]["table"]["name"], "t");
        assert_eq!(commands[2]["add"]["set"]["elem"], json!(["10.0.0.1", "10.0.0.2"]));
        assert_eq!(commands[3]["add"]["chain"]["policy"], "drop");
        assert_eq!(commands[3]["add"]["chain"]["prio"], 200);
        assert_eq!(commands[4]["add"]["rule"]["expr"][0]["match"]["op"], "in");
    }
}
