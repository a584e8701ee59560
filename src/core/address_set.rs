//! Address set construction and comparison
//!
//! Desired sets are built deduplicated and sorted so compilation is
//! deterministic. Comparison against the kernel treats both sides as
//! unordered multisets of 4-byte addresses.

use crate::core::codec::{self, AddressValue};
use crate::core::error::Result;
use crate::core::firewall::{AddressSet, Match, SetElementType};
use serde_json::Value;
use std::net::Ipv4Addr;

/// Builds a named IPv4 set, dropping duplicates and sorting numerically.
pub fn build(name: &str, addresses: &[Ipv4Addr]) -> AddressSet {
    let mut elements = addresses.to_vec();
    elements.sort_unstable();
    elements.dedup();
    AddressSet {
        name: name.to_string(),
        element_type: SetElementType::Ipv4Addr,
        elements,
    }
}

/// Normalizes one element of an observed set to its 4-byte form.
///
/// The kernel lists plain keys as strings and annotated keys as
/// `{"elem": {"val": ...}}`; a `/32` prefix is a plain address too.
pub fn element_octets(element: &Value) -> Option<[u8; 4]> {
    match element {
        Value::String(s) => s.parse::<Ipv4Addr>().ok().map(|ip| ip.octets()),
        Value::Object(obj) => {
            if let Some(inner) = obj.get("elem").and_then(|e| e.get("val")) {
                return element_octets(inner);
            }
            let prefix = obj.get("prefix")?;
            (prefix.get("len")?.as_u64()? == 32)
                .then(|| prefix.get("addr").and_then(element_octets))
                .flatten()
        }
        _ => None,
    }
}

/// Order-independent multiset equality between desired addresses and
/// observed kernel elements. Any unparseable observed element makes the
/// sets unequal.
pub fn equal(desired: &[Ipv4Addr], observed: &[Value]) -> bool {
    if desired.len() != observed.len() {
        return false;
    }

    let Some(mut actual) = observed
        .iter()
        .map(element_octets)
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };
    let mut expected: Vec<[u8; 4]> = desired.iter().map(Ipv4Addr::octets).collect();

    expected.sort_unstable();
    actual.sort_unstable();
    expected == actual
}

/// Reports whether any address predicate resolves through a set: either an
/// explicit `@name` reference or a literal comma-joined list that has to be
/// materialized as one. CIDRs, ranges and single addresses do not.
pub fn has_set_reference(matches: &[Match]) -> bool {
    matches.iter().any(|m| {
        matches!(m, Match::Address { value, .. }
            if codec::is_set_reference(value) || codec::is_literal_list(value))
    })
}

/// Extracts the parsed address list of every literal-list predicate, in
/// predicate order. Set references are skipped.
///
/// # Errors
///
/// Returns `UnsupportedMatch` if a literal list does not parse.
pub fn expected_sets(matches: &[Match]) -> Result<Vec<Vec<Ipv4Addr>>> {
    let mut sets = Vec::new();
    for m in matches {
        if let Match::Address { value, .. } = m
            && codec::is_literal_list(value)
            && let AddressValue::List(ips) = codec::parse_address_value(value)?
        {
            sets.push(ips);
        }
    }
    Ok(sets)
}
