//! Match predicate codec
//!
//! Converts abstract [`Match`] predicates into nftables JSON expressions and
//! decodes expressions read back from the kernel into the same canonical
//! [`Predicate`] form, so desired and observed rules compare structurally.
//!
//! # Connection-tracking state
//!
//! A ctstate predicate always encodes to exactly one expression regardless of
//! how many states it lists. The states are OR-ed into a single bitmask:
//!
//! - `eq`  → `ct state in <mask>`: the packet state intersects the mask
//! - `neq` → `ct state != <mask>`: the packet state intersects none of it
//!
//! # Address values
//!
//! Set references are recognized only by their `@` prefix. A comma-joined
//! list without `@` is a literal list, never a set reference.

use crate::core::error::{Error, Result};
use crate::core::firewall::{
    Action, AddressPosition, CtState, DevPosition, L4Proto, Match, MatchOp, Rule,
};
use ipnetwork::Ipv4Network;
use serde_json::{Value, json};
use std::net::Ipv4Addr;
use strum::IntoEnumIterator;

/// Maximum interface name length (IFNAMSIZ minus the NUL)
const MAX_IFNAME_LEN: usize = 15;

/// Parsed right-hand side of an address predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressValue {
    Single(Ipv4Addr),
    Cidr(Ipv4Network),
    /// Literal comma-joined list, kept in input order
    List(Vec<Ipv4Addr>),
    Range(Ipv4Addr, Ipv4Addr),
    SetRef(String),
}

impl AddressValue {
    /// Canonical string form, the inverse of [`parse_address_value`]
    pub fn to_value_string(&self) -> String {
        match self {
            AddressValue::Single(ip) => ip.to_string(),
            AddressValue::Cidr(net) => net.to_string(),
            AddressValue::List(ips) => ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            AddressValue::Range(start, end) => format!("{start}-{end}"),
            AddressValue::SetRef(name) => format!("@{name}"),
        }
    }
}

pub fn is_set_reference(value: &str) -> bool {
    value.trim_start().starts_with('@')
}

pub fn is_literal_list(value: &str) -> bool {
    !is_set_reference(value) && value.contains(',')
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::UnsupportedMatch(format!("{raw:?} is not an IPv4 address")))
}

/// Parses an address predicate value.
///
/// CIDRs are canonicalized to their network address, and a `/32` prefix
/// collapses to a single address, matching how the kernel lists them.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] for malformed, empty or IPv6 values.
pub fn parse_address_value(value: &str) -> Result<AddressValue> {
    let value = value.trim();

    if let Some(name) = value.strip_prefix('@') {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(Error::UnsupportedMatch(format!(
                "invalid set reference {value:?}"
            )));
        }
        return Ok(AddressValue::SetRef(name.to_string()));
    }

    if value.contains(',') {
        let ips = value
            .split(',')
            .map(parse_ipv4)
            .collect::<Result<Vec<_>>>()?;
        return Ok(AddressValue::List(ips));
    }

    if value.contains('/') {
        let net: Ipv4Network = value
            .parse()
            .map_err(|_| Error::UnsupportedMatch(format!("{value:?} is not an IPv4 CIDR")))?;
        if net.prefix() == 32 {
            return Ok(AddressValue::Single(net.ip()));
        }
        let canonical = Ipv4Network::new(net.network(), net.prefix())
            .map_err(|e| Error::UnsupportedMatch(format!("{value:?}: {e}")))?;
        return Ok(AddressValue::Cidr(canonical));
    }

    if let Some((start, end)) = value.split_once('-') {
        let start = parse_ipv4(start)?;
        let end = parse_ipv4(end)?;
        if start > end {
            return Err(Error::UnsupportedMatch(format!(
                "range {value:?} has start after end"
            )));
        }
        return Ok(AddressValue::Range(start, end));
    }

    Ok(AddressValue::Single(parse_ipv4(value)?))
}

/// Set of conntrack states folded into the kernel bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CtStateSet(u32);

impl CtStateSet {
    pub fn from_states(states: &[CtState]) -> Self {
        Self(states.iter().fold(0, |mask, s| mask | s.bit()))
    }

    pub const fn mask(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, state: CtState) -> bool {
        self.0 & state.bit() != 0
    }

    /// States in canonical (declaration) order
    pub fn states(self) -> Vec<CtState> {
        CtState::iter().filter(|s| self.contains(*s)).collect()
    }
}

/// Canonical, comparable form of a [`Match`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Interface {
        position: DevPosition,
        name: String,
        op: MatchOp,
    },
    Address {
        position: AddressPosition,
        value: AddressValue,
        op: MatchOp,
    },
    Protocol {
        proto: L4Proto,
        op: MatchOp,
    },
    CtState {
        states: CtStateSet,
        op: MatchOp,
    },
}

impl Predicate {
    pub fn to_match(&self) -> Match {
        match self {
            Predicate::Interface { position, name, op } => {
                Match::interface(*position, name.clone(), *op)
            }
            Predicate::Address {
                position,
                value,
                op,
            } => Match::address(*position, value.to_value_string(), *op),
            Predicate::Protocol { proto, op } => Match::Protocol {
                value: *proto,
                op: *op,
            },
            Predicate::CtState { states, op } => Match::ct_state(&states.states(), *op),
        }
    }
}

/// Validates a predicate and converts it to canonical form.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] for empty/oversized interface names,
/// unparseable addresses and empty ctstate lists.
pub fn canonicalize(m: &Match) -> Result<Predicate> {
    match m {
        Match::Interface {
            position,
            value,
            op,
        } => {
            if value.is_empty() || value.len() > MAX_IFNAME_LEN {
                return Err(Error::UnsupportedMatch(format!(
                    "interface name {value:?} must be 1-{MAX_IFNAME_LEN} characters"
                )));
            }
            Ok(Predicate::Interface {
                position: *position,
                name: value.clone(),
                op: *op,
            })
        }
        Match::Address {
            position,
            value,
            op,
        } => Ok(Predicate::Address {
            position: *position,
            value: parse_address_value(value)?,
            op: *op,
        }),
        Match::Protocol { value, op } => Ok(Predicate::Protocol {
            proto: *value,
            op: *op,
        }),
        Match::CtState { value, op } => {
            if value.is_empty() {
                return Err(Error::UnsupportedMatch(
                    "ct state match needs at least one state".to_string(),
                ));
            }
            Ok(Predicate::CtState {
                states: CtStateSet::from_states(value),
                op: *op,
            })
        }
    }
}

fn op_symbol(op: MatchOp) -> &'static str {
    match op {
        MatchOp::Eq => "==",
        MatchOp::Neq => "!=",
    }
}

fn address_field(position: AddressPosition) -> &'static str {
    match position {
        AddressPosition::Src => "saddr",
        AddressPosition::Dst => "daddr",
    }
}

fn interface_key(position: DevPosition) -> &'static str {
    match position {
        DevPosition::In => "iifname",
        DevPosition::Out => "oifname",
    }
}

/// Encodes one predicate as a single nftables JSON `match` expression.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] if the predicate fails [`canonicalize`].
pub fn encode(m: &Match) -> Result<Value> {
    Ok(encode_predicate(&canonicalize(m)?))
}

pub fn encode_predicate(p: &Predicate) -> Value {
    match p {
        Predicate::Interface { position, name, op } => json!({
            "match": {
                "op": op_symbol(*op),
                "left": { "meta": { "key": interface_key(*position) } },
                "right": name
            }
        }),
        Predicate::Address {
            position,
            value,
            op,
        } => {
            let right = match value {
                AddressValue::Single(ip) => json!(ip.to_string()),
                AddressValue::Cidr(net) => json!({
                    "prefix": { "addr": net.network().to_string(), "len": net.prefix() }
                }),
                AddressValue::List(ips) => json!({
                    "set": ips.iter().map(ToString::to_string).collect::<Vec<_>>()
                }),
                AddressValue::Range(start, end) => json!({
                    "range": [start.to_string(), end.to_string()]
                }),
                AddressValue::SetRef(name) => json!(format!("@{name}")),
            };
            json!({
                "match": {
                    "op": op_symbol(*op),
                    "left": { "payload": { "protocol": "ip", "field": address_field(*position) } },
                    "right": right
                }
            })
        }
        Predicate::Protocol { proto, op } => json!({
            "match": {
                "op": op_symbol(*op),
                "left": { "meta": { "key": "l4proto" } },
                "right": proto.as_ref()
            }
        }),
        Predicate::CtState { states, op } => {
            let names: Vec<String> = states.states().iter().map(ToString::to_string).collect();
            let right = if names.len() == 1 {
                json!(names[0])
            } else {
                json!(names)
            };
            json!({
                "match": {
                    "op": match op { MatchOp::Eq => "in", MatchOp::Neq => "!=" },
                    "left": { "ct": { "key": "state" } },
                    "right": right
                }
            })
        }
    }
}

/// Outcome of decoding one observed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Predicate(Predicate),
    Unrecognized(Value),
}

fn decode_op(op: Option<&str>) -> Option<MatchOp> {
    match op {
        Some("==" | "in") | None => Some(MatchOp::Eq),
        Some("!=") => Some(MatchOp::Neq),
        _ => None,
    }
}

fn decode_address_right(right: &Value) -> Option<AddressValue> {
    if let Some(s) = right.as_str() {
        return parse_address_value(s).ok();
    }
    if let Some(prefix) = right.get("prefix") {
        let addr = prefix.get("addr")?.as_str()?;
        let len = prefix.get("len")?.as_u64()?;
        return parse_address_value(&format!("{addr}/{len}")).ok();
    }
    if let Some(range) = right.get("range").and_then(Value::as_array) {
        let [start, end] = range.as_slice() else {
            return None;
        };
        return parse_address_value(&format!("{}-{}", start.as_str()?, end.as_str()?)).ok();
    }
    if let Some(items) = right.get("set").and_then(Value::as_array) {
        let ips = items
            .iter()
            .map(|v| v.as_str().and_then(|s| s.parse::<Ipv4Addr>().ok()))
            .collect::<Option<Vec<_>>>()?;
        return Some(AddressValue::List(ips));
    }
    None
}

fn decode_ct_states(right: &Value) -> Option<CtStateSet> {
    let names: Vec<&str> = match right {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().map(Value::as_str).collect::<Option<_>>()?,
        _ => return None,
    };
    let states = names
        .iter()
        .map(|n| n.parse::<CtState>().ok())
        .collect::<Option<Vec<_>>>()?;
    let set = CtStateSet::from_states(&states);
    (!set.is_empty()).then_some(set)
}

/// Decodes an observed nftables JSON expression back into a predicate.
///
/// Anything this codec would never emit (counters, anonymous ctstate sets,
/// IPv6 payloads, ...) comes back as [`Decoded::Unrecognized`].
pub fn decode(expr: &Value) -> Decoded {
    decode_inner(expr).map_or_else(|| Decoded::Unrecognized(expr.clone()), Decoded::Predicate)
}

fn decode_inner(expr: &Value) -> Option<Predicate> {
    let m = expr.get("match")?;
    let op_str = m.get("op").and_then(Value::as_str);
    let left = m.get("left")?;
    let right = m.get("right")?;

    if let Some(key) = left.get("meta").and_then(|meta| meta.get("key")) {
        let op = decode_op(op_str).filter(|_| op_str != Some("in"))?;
        return match key.as_str()? {
            key @ ("iifname" | "oifname") => Some(Predicate::Interface {
                position: if key == "iifname" {
                    DevPosition::In
                } else {
                    DevPosition::Out
                },
                name: right.as_str()?.to_string(),
                op,
            }),
            "l4proto" => Some(Predicate::Protocol {
                proto: right.as_str()?.parse().ok()?,
                op,
            }),
            _ => None,
        };
    }

    if let Some(payload) = left.get("payload") {
        if payload.get("protocol")?.as_str()? != "ip" {
            return None;
        }
        let position = match payload.get("field")?.as_str()? {
            "saddr" => AddressPosition::Src,
            "daddr" => AddressPosition::Dst,
            _ => return None,
        };
        let op = decode_op(op_str).filter(|_| op_str != Some("in"))?;
        return Some(Predicate::Address {
            position,
            value: decode_address_right(right)?,
            op,
        });
    }

    if left.get("ct")?.get("key")?.as_str()? == "state" {
        let op = decode_op(op_str)?;
        return Some(Predicate::CtState {
            states: decode_ct_states(right)?,
            op,
        });
    }

    None
}

pub fn encode_action(action: Action) -> Value {
    match action {
        Action::Accept => json!({ "accept": null }),
        Action::Drop => json!({ "drop": null }),
    }
}

fn decode_action(expr: &Value) -> Option<Action> {
    let obj = expr.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    if obj.contains_key("accept") {
        Some(Action::Accept)
    } else if obj.contains_key("drop") {
        Some(Action::Drop)
    } else {
        None
    }
}

/// Encodes a rule as its `expr` array: one expression per predicate, then the verdict.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] if any predicate is unsupported.
pub fn encode_rule(rule: &Rule) -> Result<Vec<Value>> {
    let mut exprs = Vec::with_capacity(rule.matches.len() + 1);
    for m in &rule.matches {
        exprs.push(encode(m)?);
    }
    exprs.push(encode_action(rule.action));
    Ok(exprs)
}

/// Canonical, comparable form of a [`Rule`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRule {
    pub predicates: Vec<Predicate>,
    pub action: Action,
    pub comment: Option<String>,
}

/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] if any predicate is unsupported.
pub fn canonicalize_rule(rule: &Rule) -> Result<CanonicalRule> {
    Ok(CanonicalRule {
        predicates: rule
            .matches
            .iter()
            .map(canonicalize)
            .collect::<Result<Vec<_>>>()?,
        action: rule.action,
        comment: rule.comment.as_deref().map(crate::validators::sanitize_label),
    })
}

/// Decodes an observed rule. Returns `None` if any expression is
/// unrecognized or the rule does not end in a plain verdict.
pub fn decode_rule(exprs: &[Value], comment: Option<&str>) -> Option<CanonicalRule> {
    let (verdict, matches) = exprs.split_last()?;
    let action = decode_action(verdict)?;
    let predicates = matches
        .iter()
        .map(|e| match decode(e) {
            Decoded::Predicate(p) => Some(p),
            Decoded::Unrecognized(_) => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(CanonicalRule {
        predicates,
        action,
        comment: comment.map(str::to_string),
    })
}

/// Renders one predicate in `nft` text syntax.
///
/// # Errors
///
/// Returns [`Error::UnsupportedMatch`] if the predicate fails [`canonicalize`].
pub fn to_nft_text(m: &Match) -> Result<String> {
    let neq = |op: MatchOp| if op == MatchOp::Neq { "!= " } else { "" };
    Ok(match canonicalize(m)? {
        Predicate::Interface { position, name, op } => {
            format!("{} {}\"{name}\"", interface_key(position), neq(op))
        }
        Predicate::Address {
            position,
            value,
            op,
        } => {
            let rendered = match value {
                AddressValue::List(ips) => format!(
                    "{{ {} }}",
                    ips.iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                other => other.to_value_string(),
            };
            format!("ip {} {}{rendered}", address_field(position), neq(op))
        }
        Predicate::Protocol { proto, op } => format!("meta l4proto {}{proto}", neq(op)),
        Predicate::CtState { states, op } => {
            let names: Vec<String> = states.states().iter().map(ToString::to_string).collect();
            format!("ct state {}{}", neq(op), names.join(","))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reference_needs_at_prefix() {
        assert!(is_set_reference("@pods"));
        assert!(!is_set_reference("10.0.0.1,10.0.0.2"));
        assert!(is_literal_list("10.0.0.1,10.0.0.2"));
        assert!(!is_literal_list("@a,b"));
        assert!(!is_literal_list("10.0.0.0/24"));
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address_value("10.0.0.1").unwrap(),
            AddressValue::Single(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(
            parse_address_value("10.0.0.9/24").unwrap(),
            AddressValue::Cidr("10.0.0.0/24".parse().unwrap())
        );
        assert_eq!(
            parse_address_value("10.0.0.9/32").unwrap(),
            AddressValue::Single(Ipv4Addr::new(10, 0, 0, 9))
        );
        assert_eq!(
            parse_address_value("10.0.0.1-10.0.0.10").unwrap(),
            AddressValue::Range(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 10))
        );
        assert_eq!(
            parse_address_value("10.0.0.2, 10.0.0.1").unwrap(),
            AddressValue::List(vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)])
        );
        assert_eq!(
            parse_address_value("@source_pod_ips").unwrap(),
            AddressValue::SetRef("source_pod_ips".into())
        );
    }

    #[test]
    fn test_parse_address_rejects_bad_values() {
        for bad in ["", "@", "fd00::1", "10.0.0.1,", "10.0.0.10-10.0.0.1", "10.0.0.0/33", "@a b"] {
            assert!(
                matches!(parse_address_value(bad), Err(Error::UnsupportedMatch(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_ct_state_single_value_is_one_expression() {
        let m = Match::ct_state(&[CtState::Established], MatchOp::Eq);
        let expr = encode(&m).unwrap();
        assert_eq!(expr["match"]["op"], "in");
        assert_eq!(expr["match"]["right"], "established");
    }

    #[test]
    fn test_ct_state_all_values_merge_into_one_mask() {
        let all = [
            CtState::New,
            CtState::Established,
            CtState::Related,
            CtState::Untracked,
            CtState::Invalid,
        ];
        let rule = Rule::new(vec![Match::ct_state(&all, MatchOp::Eq)], Action::Accept);
        let exprs = encode_rule(&rule).unwrap();

        // one state match + verdict
        assert_eq!(exprs.len(), 2);
        let right = exprs[0]["match"]["right"].as_array().unwrap();
        assert_eq!(right.len(), 5);

        let Decoded::Predicate(Predicate::CtState { states, op }) = decode(&exprs[0]) else {
            panic!("ct state did not decode");
        };
        assert_eq!(op, MatchOp::Eq);
        assert_eq!(states.mask(), 0b100_1111);
    }

    #[test]
    fn test_ct_state_neq_uses_complement_op() {
        let m = Match::ct_state(&[CtState::Related, CtState::New], MatchOp::Neq);
        let expr = encode(&m).unwrap();
        assert_eq!(expr["match"]["op"], "!=");
        assert_eq!(
            expr["match"]["right"],
            json!(["new", "related"]),
            "states are emitted in canonical order"
        );
    }

    #[test]
    fn test_ct_state_empty_is_unsupported() {
        let m = Match::ct_state(&[], MatchOp::Eq);
        assert!(matches!(encode(&m), Err(Error::UnsupportedMatch(_))));
    }

    #[test]
    fn test_ct_state_anonymous_set_is_not_canonical() {
        let expr = json!({
            "match": {
                "op": "==",
                "left": { "ct": { "key": "state" } },
                "right": { "set": ["established", "related"] }
            }
        });
        assert!(matches!(decode(&expr), Decoded::Unrecognized(_)));
    }

    #[test]
    fn test_interface_name_limits() {
        let long = Match::interface(DevPosition::In, "a-very-long-ifname", MatchOp::Eq);
        assert!(matches!(encode(&long), Err(Error::UnsupportedMatch(_))));
        let empty = Match::interface(DevPosition::Out, "", MatchOp::Eq);
        assert!(matches!(encode(&empty), Err(Error::UnsupportedMatch(_))));
    }

    #[test]
    fn test_interface_roundtrip() {
        let m = Match::interface(DevPosition::In, "liqo-tunnel", MatchOp::Neq);
        let expr = encode(&m).unwrap();
        assert_eq!(expr["match"]["left"]["meta"]["key"], "iifname");
        let Decoded::Predicate(p) = decode(&expr) else {
            panic!("interface did not decode");
        };
        assert_eq!(p.to_match(), m);
    }

    #[test]
    fn test_address_forms_decode_from_kernel_listing() {
        let prefix = json!({
            "match": {
                "op": "==",
                "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                "right": { "prefix": { "addr": "10.200.0.0", "len": 16 } }
            }
        });
        assert_eq!(
            decode(&prefix),
            Decoded::Predicate(Predicate::Address {
                position: AddressPosition::Dst,
                value: AddressValue::Cidr("10.200.0.0/16".parse().unwrap()),
                op: MatchOp::Eq,
            })
        );

        let ip6 = json!({
            "match": {
                "op": "==",
                "left": { "payload": { "protocol": "ip6", "field": "daddr" } },
                "right": "fd00::1"
            }
        });
        assert!(matches!(decode(&ip6), Decoded::Unrecognized(_)));
    }

    #[test]
    fn test_decode_rule_rejects_counters() {
        let exprs = vec![
            json!({ "match": { "op": "==", "left": { "meta": { "key": "l4proto" } }, "right": "tcp" } }),
            json!({ "counter": { "packets": 0, "bytes": 0 } }),
            json!({ "accept": null }),
        ];
        assert!(decode_rule(&exprs, None).is_none());

        let exprs = vec![
            json!({ "match": { "op": "==", "left": { "meta": { "key": "l4proto" } }, "right": "tcp" } }),
            json!({ "accept": null }),
        ];
        let rule = decode_rule(&exprs, Some("tcp only")).unwrap();
        assert_eq!(rule.action, Action::Accept);
        assert_eq!(rule.comment.as_deref(), Some("tcp only"));
    }

    #[test]
    fn test_nft_text_rendering() {
        let cases = [
            (
                Match::interface(DevPosition::In, "liqo-tunnel", MatchOp::Neq),
                "iifname != \"liqo-tunnel\"",
            ),
            (
                Match::address(AddressPosition::Dst, "@destination_pod_ips", MatchOp::Eq),
                "ip daddr @destination_pod_ips",
            ),
            (
                Match::address(AddressPosition::Src, "10.0.0.1,10.0.0.2", MatchOp::Eq),
                "ip saddr { 10.0.0.1, 10.0.0.2 }",
            ),
            (
                Match::ct_state(&[CtState::Related, CtState::Established], MatchOp::Eq),
                "ct state established,related",
            ),
            (
                Match::Protocol {
                    value: L4Proto::Udp,
                    op: MatchOp::Eq,
                },
                "meta l4proto udp",
            ),
        ];
        for (m, expected) in cases {
            assert_eq!(to_nft_text(&m).unwrap(), expected);
        }
    }
}
