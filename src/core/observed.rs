//! Observed packet-filter state
//!
//! The shape of one table as the kernel reports it through
//! `nft --json list table`. Fields the differ does not look at (handles of
//! tables and sets, set flags, counters) are not kept.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedRule {
    #[serde(default)]
    pub handle: u64,
    #[serde(default)]
    pub expr: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Base or regular chain. Regular chains carry no hook/prio/policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedChain {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prio: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default)]
    pub rules: Vec<ObservedRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedSet {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub set_type: Option<String>,
    /// Raw elements; compared with [`crate::core::address_set::equal`]
    #[serde(default, rename = "elem")]
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObservedTable {
    pub family: String,
    pub name: String,
    #[serde(default)]
    pub chains: Vec<ObservedChain>,
    #[serde(default)]
    pub sets: Vec<ObservedSet>,
}

impl ObservedTable {
    pub fn chain(&self, name: &str) -> Option<&ObservedChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut ObservedChain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    pub fn set(&self, name: &str) -> Option<&ObservedSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn set_mut(&mut self, name: &str) -> Option<&mut ObservedSet> {
        self.sets.iter_mut().find(|s| s.name == name)
    }

    /// Parses the output of `nft --json list table <family> <name>`.
    ///
    /// Returns `Ok(None)` if the listing contains no such table.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if an object of the table is malformed and
    /// `Transport` if the listing is not an `nftables` array at all or holds
    /// a rule for a chain it does not list.
    pub fn from_listing(listing: &Value, family: &str, name: &str) -> Result<Option<Self>> {
        let items = listing
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::transport("listing is missing the nftables array"))?;

        let belongs = |obj: &Value, key: &str| {
            obj.get("family").and_then(Value::as_str) == Some(family)
                && obj.get(key).and_then(Value::as_str) == Some(name)
        };

        if !items
            .iter()
            .filter_map(|item| item.get("table"))
            .any(|t| belongs(t, "name"))
        {
            return Ok(None);
        }

        let mut table = ObservedTable {
            family: family.to_string(),
            name: name.to_string(),
            ..Default::default()
        };

        for item in items {
            if let Some(chain) = item.get("chain").filter(|c| belongs(c, "table")) {
                table
                    .chains
                    .push(serde_json::from_value(chain.clone())?);
            } else if let Some(set) = item.get("set").filter(|s| belongs(s, "table")) {
                table.sets.push(serde_json::from_value(set.clone())?);
            }
        }

        // rules may be listed ahead of their chain
        for rule in items
            .iter()
            .filter_map(|item| item.get("rule"))
            .filter(|r| belongs(r, "table"))
        {
            let chain_name = rule.get("chain").and_then(Value::as_str).unwrap_or_default();
            let parsed: ObservedRule = serde_json::from_value(rule.clone())?;
            let chain = table.chain_mut(chain_name).ok_or_else(|| {
                Error::transport(format!(
                    "listing has rule {} in unknown chain {chain_name:?}",
                    parsed.handle
                ))
            })?;
            chain.rules.push(parsed);
        }

        Ok(Some(table))
    }

    /// Renders the table back into listing form.
    pub fn to_listing(&self) -> Value {
        let mut items = vec![json!({ "table": { "family": self.family, "name": self.name } })];

        for set in &self.sets {
            let mut obj = json!({
                "family": self.family,
                "table": self.name,
                "name": set.name,
            });
            if let Some(set_type) = &set.set_type {
                obj["type"] = json!(set_type);
            }
            if !set.elements.is_empty() {
                obj["elem"] = json!(set.elements);
            }
            items.push(json!({ "set": obj }));
        }

        for chain in &self.chains {
            let mut obj = json!({
                "family": self.family,
                "table": self.name,
                "name": chain.name,
            });
            if let Some(t) = &chain.chain_type {
                obj["type"] = json!(t);
            }
            if let Some(hook) = &chain.hook {
                obj["hook"] = json!(hook);
            }
            if let Some(prio) = chain.prio {
                obj["prio"] = json!(prio);
            }
            if let Some(policy) = &chain.policy {
                obj["policy"] = json!(policy);
            }
            items.push(json!({ "chain": obj }));
        }

        for chain in &self.chains {
            for rule in &chain.rules {
                let mut obj = json!({
                    "family": self.family,
                    "table": self.name,
                    "chain": chain.name,
                    "handle": rule.handle,
                    "expr": rule.expr,
                });
                if let Some(comment) = &rule.comment {
                    obj["comment"] = json!(comment);
                }
                items.push(json!({ "rule": obj }));
            }
        }

        json!({ "nftables": items })
    }
}
