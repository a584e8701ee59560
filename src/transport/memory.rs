use super::{PacketFilter, VerifyResult};
use crate::core::error::{Error, Result};
use crate::core::firewall::TableFamily;
use crate::core::observed::{ObservedChain, ObservedRule, ObservedSet, ObservedTable};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

type TableKey = (String, String);

#[derive(Debug, Default, Clone)]
struct Ruleset {
    tables: BTreeMap<TableKey, ObservedTable>,
    next_handle: u64,
}

/// In-process packet filter interpreting `nft --json` batches
///
/// Supports the commands the differ emits (add/flush/delete of tables,
/// chains and sets, element and rule additions) with kernel-like checks:
/// objects must exist before they are used, a chain must be empty to be
/// deleted and a referenced set cannot be deleted. A failing command
/// discards the whole batch.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    state: Mutex<Ruleset>,
    applied: Mutex<Vec<Value>>,
    fail_next: AtomicUsize,
    delay: Option<Duration>,
}

fn busy(what: &str) -> Error {
    Error::Transport {
        message: format!("{what}: Device or resource busy"),
        stderr: None,
        exit_code: Some(1),
    }
}

fn missing(what: &str) -> Error {
    Error::Transport {
        message: format!("{what}: No such file or directory"),
        stderr: None,
        exit_code: Some(1),
    }
}

fn field<'a>(obj: &'a Value, key: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::transport(format!("batch object is missing {key:?}")))
}

fn key_of(obj: &Value, table_key: &str) -> Result<TableKey> {
    Ok((field(obj, "family")?.to_string(), field(obj, table_key)?.to_string()))
}

/// Names of the sets a rule expression references via `@name`
fn referenced_sets(expr: &[Value]) -> Vec<String> {
    expr.iter()
        .filter_map(|e| e.get("match")?.get("right")?.as_str())
        .filter_map(|s| s.strip_prefix('@'))
        .map(str::to_string)
        .collect()
}

impl Ruleset {
    fn table_mut(&mut self, key: &TableKey) -> Result<&mut ObservedTable> {
        self.tables
            .get_mut(key)
            .ok_or_else(|| missing(&format!("table {} {}", key.0, key.1)))
    }

    fn execute(&mut self, command: &Value) -> Result<()> {
        let Some((verb, body)) = command.as_object().and_then(|o| o.iter().next()) else {
            return Err(Error::transport("empty batch command"));
        };
        if verb == "metainfo" {
            return Ok(());
        }
        let Some((kind, obj)) = body.as_object().and_then(|o| o.iter().next()) else {
            return Err(Error::transport(format!("malformed {verb} command")));
        };

        match (verb.as_str(), kind.as_str()) {
            ("add", "table") => {
                let key = key_of(obj, "name")?;
                self.tables.entry(key.clone()).or_insert_with(|| ObservedTable {
                    family: key.0,
                    name: key.1,
                    ..Default::default()
                });
            }
            ("delete", "table") => {
                let key = key_of(obj, "name")?;
                self.tables
                    .remove(&key)
                    .ok_or_else(|| missing(&format!("table {}", key.1)))?;
            }
            ("flush", "table") => {
                let table = self.table_mut(&key_of(obj, "name")?)?;
                for chain in &mut table.chains {
                    chain.rules.clear();
                }
                for set in &mut table.sets {
                    set.elements.clear();
                }
            }
            ("add", "set") => {
                let name = field(obj, "name")?;
                let set_type = field(obj, "type")?;
                let elements = obj
                    .get("elem")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let table = self.table_mut(&key_of(obj, "table")?)?;
                match table.set_mut(name) {
                    Some(set) if set.set_type.as_deref() != Some(set_type) => {
                        return Err(Error::transport(format!(
                            "set {name} exists with a different type"
                        )));
                    }
                    Some(set) => add_elements(set, elements),
                    None => table.sets.push(ObservedSet {
                        name: name.to_string(),
                        set_type: Some(set_type.to_string()),
                        elements: dedup(elements),
                    }),
                }
            }
            ("flush", "set") => {
                let name = field(obj, "name")?;
                let table = self.table_mut(&key_of(obj, "table")?)?;
                table
                    .set_mut(name)
                    .ok_or_else(|| missing(&format!("set {name}")))?
                    .elements
                    .clear();
            }
            ("delete", "set") => {
                let name = field(obj, "name")?;
                let table = self.table_mut(&key_of(obj, "table")?)?;
                let in_use = table.chains.iter().any(|c| {
                    c.rules
                        .iter()
                        .any(|r| referenced_sets(&r.expr).iter().any(|s| s == name))
                });
                if in_use {
                    return Err(busy(&format!("set {name}")));
                }
                let before = table.sets.len();
                table.sets.retain(|s| s.name != name);
                if table.sets.len() == before {
                    return Err(missing(&format!("set {name}")));
                }
            }
            ("add", "element") => {
                let name = field(obj, "name")?;
                let elements = obj
                    .get("elem")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let table = self.table_mut(&key_of(obj, "table")?)?;
                let set = table
                    .set_mut(name)
                    .ok_or_else(|| missing(&format!("set {name}")))?;
                add_elements(set, elements);
            }
            ("add", "chain") => {
                let name = field(obj, "name")?;
                let header = ObservedChain {
                    name: name.to_string(),
                    chain_type: obj.get("type").and_then(Value::as_str).map(str::to_string),
                    hook: obj.get("hook").and_then(Value::as_str).map(str::to_string),
                    prio: obj.get("prio").and_then(Value::as_i64),
                    policy: obj.get("policy").and_then(Value::as_str).map(str::to_string),
                    rules: Vec::new(),
                };
                let table = self.table_mut(&key_of(obj, "table")?)?;
                match table.chain_mut(name) {
                    Some(chain)
                        if chain.hook != header.hook
                            || chain.prio != header.prio
                            || chain.chain_type != header.chain_type =>
                    {
                        return Err(busy(&format!("chain {name}")));
                    }
                    Some(chain) => {
                        if header.policy.is_some() {
                            chain.policy = header.policy;
                        }
                    }
                    None => table.chains.push(header),
                }
            }
            ("flush", "chain") => {
                let name = field(obj, "name")?;
                let table = self.table_mut(&key_of(obj, "table")?)?;
                table
                    .chain_mut(name)
                    .ok_or_else(|| missing(&format!("chain {name}")))?
                    .rules
                    .clear();
            }
            ("delete", "chain") => {
                let name = field(obj, "name")?;
                let table = self.table_mut(&key_of(obj, "table")?)?;
                match table.chain(name).map(|c| c.rules.len()) {
                    None => return Err(missing(&format!("chain {name}"))),
                    Some(0) => table.chains.retain(|c| c.name != name),
                    Some(_) => return Err(busy(&format!("chain {name}"))),
                }
            }
            ("add", "rule") => {
                let chain_name = field(obj, "chain")?;
                let expr = obj
                    .get("expr")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::transport("rule without expr"))?;
                let comment = obj.get("comment").and_then(Value::as_str).map(str::to_string);

                self.next_handle += 1;
                let handle = self.next_handle;
                let table = self.table_mut(&key_of(obj, "table")?)?;
                for set in referenced_sets(&expr) {
                    if table.set(&set).is_none() {
                        return Err(missing(&format!("set {set}")));
                    }
                }
                table
                    .chain_mut(chain_name)
                    .ok_or_else(|| missing(&format!("chain {chain_name}")))?
                    .rules
                    .push(ObservedRule {
                        handle,
                        expr,
                        comment,
                    });
            }
            (verb, kind) => {
                return Err(Error::transport(format!("unsupported command {verb} {kind}")));
            }
        }
        Ok(())
    }

    fn run_batch(&mut self, batch: &Value) -> Result<()> {
        let commands = batch
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::transport("batch is missing the nftables array"))?;
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }
}

fn dedup(elements: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(elements.len());
    for element in elements {
        if !out.contains(&element) {
            out.push(element);
        }
    }
    out
}

fn add_elements(set: &mut ObservedSet, elements: Vec<Value>) {
    for element in elements {
        if !set.elements.contains(&element) {
            set.elements.push(element);
        }
    }
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every apply sleeps for `delay` first (for timeout and ordering tests).
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes the next `count` applies fail with a transport error.
    pub fn fail_next_applies(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Batches committed so far, oldest first
    pub async fn applied(&self) -> Vec<Value> {
        self.applied.lock().await.clone()
    }

    /// Seeds a table as if something else had created it.
    pub async fn insert_table(&self, table: ObservedTable) {
        let mut state = self.state.lock().await;
        state
            .tables
            .insert((table.family.clone(), table.name.clone()), table);
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .tables
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    async fn fetch(&self, family: TableFamily, table: &str) -> Result<Option<ObservedTable>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(&(family.to_string(), table.to_string()))
            .cloned())
    }

    async fn apply(&self, batch: &Value) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transport("injected apply failure"));
        }

        let mut state = self.state.lock().await;
        let mut scratch = state.clone();
        scratch.run_batch(batch)?;
        *state = scratch;
        drop(state);

        self.applied.lock().await.push(batch.clone());
        Ok(())
    }

    async fn check(&self, batch: &Value) -> Result<VerifyResult> {
        let mut scratch = self.state.lock().await.clone();
        Ok(match scratch.run_batch(batch) {
            Ok(()) => VerifyResult::success(),
            Err(e) => VerifyResult::failure(vec![e.to_string()]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(commands: Vec<Value>) -> Value {
        json!({ "nftables": commands })
    }

    fn add_table() -> Value {
        json!({ "add": { "table": { "family": "ip", "name": "t" } } })
    }

    fn add_set(elements: &[&str]) -> Value {
        json!({ "add": { "set": {
            "family": "ip", "table": "t", "name": "pods", "type": "ipv4_addr", "elem": elements
        } } })
    }

    fn add_chain(policy: &str) -> Value {
        json!({ "add": { "chain": {
            "family": "ip", "table": "t", "name": "c",
            "type": "filter", "hook": "postrouting", "prio": 200, "policy": policy
        } } })
    }

    fn add_rule(set: &str) -> Value {
        json!({ "add": { "rule": {
            "family": "ip", "table": "t", "chain": "c",
            "expr": [
                { "match": { "op": "==",
                             "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                             "right": format!("@{set}") } },
                { "accept": null }
            ]
        } } })
    }

    #[tokio::test]
    async fn test_builds_table() {
        let filter = MemoryFilter::new();
        filter
            .apply(&batch(vec![
                add_table(),
                add_set(&["10.0.0.1", "10.0.0.1"]),
                add_chain("drop"),
                add_rule("pods"),
            ]))
            .await
            .unwrap();

        let table = filter.fetch(TableFamily::Ip, "t").await.unwrap().unwrap();
        assert_eq!(table.set("pods").unwrap().elements, vec![json!("10.0.0.1")]);
        let chain = table.chain("c").unwrap();
        assert_eq!(chain.policy.as_deref(), Some("drop"));
        assert_eq!(chain.rules.len(), 1);
        assert_eq!(filter.applied().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_state_untouched() {
        let filter = MemoryFilter::new();
        let err = filter
            .apply(&batch(vec![add_table(), add_chain("drop"), add_rule("missing")]))
            .await;
        assert!(err.is_err());
        assert!(filter.fetch(TableFamily::Ip, "t").await.unwrap().is_none());
        assert!(filter.applied().await.is_empty());
    }

    #[tokio::test]
    async fn test_referenced_set_cannot_be_deleted() {
        let filter = MemoryFilter::new();
        filter
            .apply(&batch(vec![add_table(), add_set(&[]), add_chain("drop"), add_rule("pods")]))
            .await
            .unwrap();

        let delete = json!({ "delete": { "set": { "family": "ip", "table": "t", "name": "pods" } } });
        assert!(filter.apply(&batch(vec![delete.clone()])).await.is_err());

        let flush = json!({ "flush": { "chain": { "family": "ip", "table": "t", "name": "c" } } });
        filter.apply(&batch(vec![flush, delete])).await.unwrap();
        let table = filter.fetch(TableFamily::Ip, "t").await.unwrap().unwrap();
        assert!(table.set("pods").is_none());
    }

    #[tokio::test]
    async fn test_non_empty_chain_cannot_be_deleted() {
        let filter = MemoryFilter::new();
        filter
            .apply(&batch(vec![add_table(), add_set(&[]), add_chain("drop"), add_rule("pods")]))
            .await
            .unwrap();
        let delete = json!({ "delete": { "chain": { "family": "ip", "table": "t", "name": "c" } } });
        assert!(filter.apply(&batch(vec![delete])).await.is_err());
    }

    #[tokio::test]
    async fn test_add_chain_updates_policy_only() {
        let filter = MemoryFilter::new();
        filter
            .apply(&batch(vec![add_table(), add_chain("drop")]))
            .await
            .unwrap();
        filter.apply(&batch(vec![add_chain("accept")])).await.unwrap();
        let table = filter.fetch(TableFamily::Ip, "t").await.unwrap().unwrap();
        assert_eq!(table.chain("c").unwrap().policy.as_deref(), Some("accept"));
    }

    #[tokio::test]
    async fn test_injected_failures_and_check() {
        let filter = MemoryFilter::new();
        filter.fail_next_applies(1);
        assert!(filter.apply(&batch(vec![add_table()])).await.is_err());
        assert!(filter.apply(&batch(vec![add_table()])).await.is_ok());

        let ok = filter.check(&batch(vec![add_set(&["10.0.0.1"])])).await.unwrap();
        assert!(ok.success);
        let bad = filter.check(&batch(vec![add_rule("pods")])).await.unwrap();
        assert!(!bad.success);
        // check never commits
        let table = filter.fetch(TableFamily::Ip, "t").await.unwrap().unwrap();
        assert!(table.sets.is_empty());
    }
}
