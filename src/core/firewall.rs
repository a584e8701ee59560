//! Firewall specification data structures
//!
//! This module defines the normalized packet-filter specification produced by
//! the rule assemblers and consumed by the differ:
//!
//! - A [`FirewallSpec`] is one [`Table`], its [`Chain`]s and its [`AddressSet`]s
//! - A [`Rule`] is an ordered list of ANDed [`Match`] predicates plus an [`Action`]
//! - Rules reference sets with `@name` in an address predicate
//!
//! Specs are immutable once produced. Every reconciliation compiles a fresh
//! spec from the current inputs; nothing mutates a previously produced spec in
//! place (normalization returns a new value).
//!
//! # Example
//!
//! ```
//! use meshwall::core::firewall::{Action, AddressPosition, Match, MatchOp, Rule};
//!
//! let rule = Rule::new(
//!     vec![Match::address(AddressPosition::Dst, "@destination_pod_ips", MatchOp::Eq)],
//!     Action::Accept,
//! );
//! assert_eq!(rule.matches.len(), 1);
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Address family of a table. Only IPv4 is compiled.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum TableFamily {
    #[default]
    #[strum(serialize = "ip")]
    Ip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub family: TableFamily,
}

/// Netfilter hook a base chain is attached to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainHook {
    #[strum(serialize = "prerouting")]
    Prerouting,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
    #[strum(serialize = "postrouting")]
    Postrouting,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "route")]
    Route,
}

/// Fallback verdict when no rule in a chain matches
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// Rule verdict
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum MatchOp {
    #[default]
    #[strum(serialize = "eq")]
    Eq,
    #[strum(serialize = "neq")]
    Neq,
}

/// Which address of the packet an address predicate looks at
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressPosition {
    #[strum(serialize = "src")]
    Src,
    #[strum(serialize = "dst")]
    Dst,
}

/// Which interface of the packet an interface predicate looks at
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum DevPosition {
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "out")]
    Out,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
}

/// Connection-tracking state of a packet
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
pub enum CtState {
    #[strum(serialize = "new")]
    New,
    #[strum(serialize = "established")]
    Established,
    #[strum(serialize = "related")]
    Related,
    #[strum(serialize = "untracked")]
    Untracked,
    #[strum(serialize = "invalid")]
    Invalid,
}

impl CtState {
    /// Kernel conntrack state bit (`NF_CT_STATE_*_BIT`)
    pub const fn bit(self) -> u32 {
        match self {
            CtState::Invalid => 1,
            CtState::Established => 1 << 1,
            CtState::Related => 1 << 2,
            CtState::New => 1 << 3,
            CtState::Untracked => 1 << 6,
        }
    }
}

/// One ANDed predicate of a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Match {
    /// Ingress/egress interface name comparison
    Interface {
        position: DevPosition,
        value: String,
        op: MatchOp,
    },
    /// Address, CIDR, dashed range, comma-joined literal list or `@set` reference
    Address {
        position: AddressPosition,
        value: String,
        op: MatchOp,
    },
    Protocol { value: L4Proto, op: MatchOp },
    /// Any-of (eq) / none-of (neq) over the listed conntrack states
    CtState { value: Vec<CtState>, op: MatchOp },
}

impl Match {
    pub fn interface(position: DevPosition, value: impl Into<String>, op: MatchOp) -> Self {
        Match::Interface {
            position,
            value: value.into(),
            op,
        }
    }

    pub fn address(position: AddressPosition, value: impl Into<String>, op: MatchOp) -> Self {
        Match::Address {
            position,
            value: value.into(),
            op,
        }
    }

    pub fn ct_state(value: &[CtState], op: MatchOp) -> Self {
        Match::CtState {
            value: value.to_vec(),
            op,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    #[serde(rename = "match")]
    pub matches: Vec<Match>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(matches: Vec<Match>, action: Action) -> Self {
        Self {
            matches,
            action,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub hook: ChainHook,
    pub priority: i32,
    pub policy: ChainPolicy,
    #[serde(rename = "type", default)]
    pub chain_type: ChainType,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Element key type of an address set
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum SetElementType {
    #[default]
    #[serde(rename = "ipv4_addr")]
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
}

/// Named set of IPv4 addresses, deduplicated and sorted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressSet {
    pub name: String,
    #[serde(rename = "type", default)]
    pub element_type: SetElementType,
    #[serde(default)]
    pub elements: Vec<Ipv4Addr>,
}

/// Ingress policy requested for a remote cluster
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum IngressPolicyMode {
    /// No filtering: accept default, no rules
    #[default]
    Allow,
    /// Only known remote pod traffic plus established/related flows
    Isolate,
    /// Established/related flows only
    Deny,
}

impl IngressPolicyMode {
    /// Parses a mode coming from a policy object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPolicyMode`] for anything outside Allow/Isolate/Deny.
    pub fn parse(value: &str) -> Result<Self> {
        value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidPolicyMode(value.to_string()))
    }
}

/// Validated remote cluster identifier, used verbatim in resource and set names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the identifier is not a DNS label.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        crate::validators::validate_cluster_id(&value)
            .map_err(|message| Error::invalid_input("cluster ID", message))?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClusterId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ClusterId> for String {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node interfaces the gateway bypass rules refer to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceNames {
    /// Inter-cluster tunnel interface
    pub tunnel: String,
    /// Node's external (uplink) interface
    pub external: String,
}

/// Pod addresses on each side of the interconnection with one remote cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    /// Local pods offloaded to the remote cluster
    #[serde(default)]
    pub source_pod_ips: Vec<Ipv4Addr>,
    /// Pods that originate from the remote cluster
    #[serde(default)]
    pub destination_pod_ips: Vec<Ipv4Addr>,
}

/// Topology facts the fabric assembler needs about a remote cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Name of the originating policy object (fabric table suffix)
    pub policy_name: String,
    /// Remote cluster pod CIDRs as seen from this cluster
    #[serde(default)]
    pub remote_pod_cidrs: Vec<Ipv4Network>,
}

/// Complete desired state for one enforcement point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallSpec {
    pub table: Table,
    #[serde(default)]
    pub chains: Vec<Chain>,
    #[serde(default)]
    pub sets: Vec<AddressSet>,
}

impl FirewallSpec {
    pub fn set(&self, name: &str) -> Option<&AddressSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// Checks the structural invariants: unique set and chain names, and
    /// every `@set` reference resolving to a set of this spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedMatch`] naming the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for set in &self.sets {
            if !names.insert(set.name.as_str()) {
                return Err(Error::UnsupportedMatch(format!(
                    "duplicate set {:?} in table {:?}",
                    set.name, self.table.name
                )));
            }
        }

        let mut chains = BTreeSet::new();
        for chain in &self.chains {
            if !chains.insert(chain.name.as_str()) {
                return Err(Error::UnsupportedMatch(format!(
                    "duplicate chain {:?} in table {:?}",
                    chain.name, self.table.name
                )));
            }
            for rule in &chain.rules {
                for m in &rule.matches {
                    if let Match::Address { value, .. } = m
                        && let Some(name) = value.strip_prefix('@')
                        && !names.contains(name)
                    {
                        return Err(Error::UnsupportedMatch(format!(
                            "rule in chain {:?} references undefined set @{name}",
                            chain.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a copy where every literal comma-joined address list has been
    /// materialized as a named set and replaced by a `@set` reference.
    ///
    /// Materialized sets are named `<chain>_r<rule>_m<match>` so repeated
    /// normalization of the same spec is stable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedMatch`] if a literal list does not parse.
    pub fn normalize(&self) -> Result<Self> {
        let mut out = self.clone();
        let mut extra_sets = Vec::new();

        for chain in &mut out.chains {
            for (rule_idx, rule) in chain.rules.iter_mut().enumerate() {
                let lists = crate::core::address_set::expected_sets(&rule.matches)?;
                if lists.is_empty() {
                    continue;
                }
                let mut lists = lists.into_iter();
                for (match_idx, m) in rule.matches.iter_mut().enumerate() {
                    if let Match::Address { value, .. } = m
                        && crate::core::codec::is_literal_list(value)
                        && let Some(addresses) = lists.next()
                    {
                        let name = format!("{}_r{rule_idx}_m{match_idx}", chain.name);
                        extra_sets.push(crate::core::address_set::build(&name, &addresses));
                        *value = format!("@{name}");
                    }
                }
            }
        }

        out.sets.extend(extra_sets);
        Ok(out)
    }

    /// SHA-256 over the canonical JSON form of the spec.
    pub fn fingerprint(&self) -> String {
        // Serialization of plain data with string keys cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("{:x}", hasher.finalize())
    }

    /// Renders a human-readable `nft` script for preview and export.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedMatch`] if a predicate cannot be rendered.
    pub fn to_nft_text(&self) -> Result<String> {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "table {} {} {{", self.table.family, self.table.name);

        for set in &self.sets {
            let _ = writeln!(out, "    set {} {{", set.name);
            let _ = writeln!(out, "        type {}", set.element_type);
            if !set.elements.is_empty() {
                let elems: Vec<String> = set.elements.iter().map(ToString::to_string).collect();
                let _ = writeln!(out, "        elements = {{ {} }}", elems.join(", "));
            }
            let _ = writeln!(out, "    }}\n");
        }

        for chain in &self.chains {
            let _ = writeln!(out, "    chain {} {{", chain.name);
            let _ = writeln!(
                out,
                "        type {} hook {} priority {}; policy {};",
                chain.chain_type, chain.hook, chain.priority, chain.policy
            );
            for rule in &chain.rules {
                let mut parts = Vec::with_capacity(rule.matches.len() + 2);
                for m in &rule.matches {
                    parts.push(crate::core::codec::to_nft_text(m)?);
                }
                parts.push(rule.action.to_string());
                if let Some(comment) = &rule.comment {
                    parts.push(format!("comment \"{comment}\""));
                }
                let _ = writeln!(out, "        {}", parts.join(" "));
            }
            let _ = writeln!(out, "    }}");
        }

        let _ = writeln!(out, "}}");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_mode_parse() {
        assert_eq!(
            IngressPolicyMode::parse("Allow").unwrap(),
            IngressPolicyMode::Allow
        );
        assert_eq!(
            IngressPolicyMode::parse("isolate").unwrap(),
            IngressPolicyMode::Isolate
        );
        assert_eq!(
            IngressPolicyMode::parse(" DENY ").unwrap(),
            IngressPolicyMode::Deny
        );
        assert!(matches!(
            IngressPolicyMode::parse("Open"),
            Err(Error::InvalidPolicyMode(v)) if v == "Open"
        ));
    }

    #[test]
    fn test_cluster_id_validation() {
        assert!(ClusterId::new("cluster-a1").is_ok());
        assert!(ClusterId::new("").is_err());
        assert!(ClusterId::new("Cluster_A").is_err());
        assert!(ClusterId::new("-edge").is_err());
    }

    #[test]
    fn test_cluster_id_deserialize_rejects_invalid() {
        let ok: std::result::Result<ClusterId, _> = serde_json::from_str("\"remote-1\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<ClusterId, _> = serde_json::from_str("\"remote 1\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_ct_state_bits_are_distinct() {
        use strum::IntoEnumIterator;
        let mut seen = 0u32;
        for state in CtState::iter() {
            assert_eq!(seen & state.bit(), 0);
            seen |= state.bit();
        }
        assert_eq!(seen, 0b100_1111);
    }

    fn spec_with_rule(value: &str) -> FirewallSpec {
        FirewallSpec {
            table: Table {
                name: "t".into(),
                family: TableFamily::Ip,
            },
            chains: vec![Chain {
                name: "c".into(),
                hook: ChainHook::Forward,
                priority: 0,
                policy: ChainPolicy::Drop,
                chain_type: ChainType::Filter,
                rules: vec![Rule::new(
                    vec![Match::address(AddressPosition::Src, value, MatchOp::Eq)],
                    Action::Accept,
                )],
            }],
            sets: vec![AddressSet {
                name: "known".into(),
                element_type: SetElementType::Ipv4Addr,
                elements: vec![],
            }],
        }
    }

    #[test]
    fn test_validate_detects_undefined_set() {
        assert!(spec_with_rule("@known").validate().is_ok());
        assert!(matches!(
            spec_with_rule("@missing").validate(),
            Err(Error::UnsupportedMatch(_))
        ));
    }

    #[test]
    fn test_normalize_materializes_literal_list() {
        let spec = spec_with_rule("10.0.0.2,10.0.0.1,10.0.0.2");
        let normalized = spec.normalize().unwrap();

        let rule = &normalized.chains[0].rules[0];
        assert_eq!(
            rule.matches[0],
            Match::address(AddressPosition::Src, "@c_r0_m0", MatchOp::Eq)
        );
        let set = normalized.set("c_r0_m0").unwrap();
        assert_eq!(
            set.elements,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert!(normalized.validate().is_ok());

        // Normalizing again is a no-op
        assert_eq!(normalized.normalize().unwrap(), normalized);
    }

    #[test]
    fn test_normalize_leaves_cidr_alone() {
        let spec = spec_with_rule("10.0.0.0/24");
        assert_eq!(spec.normalize().unwrap(), spec);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = spec_with_rule("10.0.0.1");
        let b = spec_with_rule("10.0.0.2");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_nft_text_output() {
        let text = spec_with_rule("@known").to_nft_text().unwrap();
        assert!(text.contains("table ip t {"));
        assert!(text.contains("type filter hook forward priority 0; policy drop;"));
        assert!(text.contains("ip saddr @known accept"));
        assert!(text.contains("set known {"));
    }
}
