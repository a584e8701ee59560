//! Desired-state store
//!
//! The boundary to whatever holds policies, pod endpoints and compiled
//! firewall configurations. The reconciler only lists policies and
//! endpoints, upserts [`FirewallConfiguration`] objects and reports
//! conditions back on policies. Deletion and garbage collection through the
//! owner reference are left to the store.
//!
//! Two implementations: [`MemoryStore`] for tests and embedding, and
//! [`FileStore`], which reads a JSON snapshot and writes one JSON file per
//! upserted object.

use crate::core::error::{Error, Result};
use crate::core::firewall::{ClusterId, FirewallSpec, IngressPolicyMode};
use crate::core::naming::{OwnerRef, REMOTE_CLUSTER_ID_LABEL};
use crate::utils::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Per-remote-cluster ingress policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyObject {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// `Allow`, `Isolate` or `Deny`; unset means `Allow`
    #[serde(default)]
    pub ingress: Option<String>,
    /// Remote pod CIDRs as seen from this cluster
    #[serde(default)]
    pub remote_pod_cidrs: Vec<String>,
}

impl PolicyObject {
    /// Remote cluster this policy is about, from its labels.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the label is absent or not a valid cluster ID.
    pub fn cluster_id(&self) -> Result<ClusterId> {
        let raw = self.labels.get(REMOTE_CLUSTER_ID_LABEL).ok_or_else(|| {
            Error::invalid_input(
                format!("labels[{REMOTE_CLUSTER_ID_LABEL}]"),
                format!("policy {}/{} has no remote cluster label", self.namespace, self.name),
            )
        })?;
        ClusterId::new(raw.as_str())
    }

    /// # Errors
    ///
    /// `InvalidPolicyMode` for anything but `Allow`, `Isolate` or `Deny`.
    pub fn mode(&self) -> Result<IngressPolicyMode> {
        self.ingress
            .as_deref()
            .map_or(Ok(IngressPolicyMode::Allow), IngressPolicyMode::parse)
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod address as reported by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Empty while the pod has no address yet
    #[serde(default)]
    pub ip: String,
    /// Set on shadow pods that run here on behalf of a remote cluster
    #[serde(default)]
    pub origin_cluster: Option<String>,
    /// Set on local pods scheduled onto a remote cluster
    #[serde(default)]
    pub offloaded_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointFilter {
    /// Pods that came from the remote cluster (destination pod IPs)
    OriginCluster(ClusterId),
    /// Local pods offloaded to the remote cluster (source pod IPs)
    OffloadedTo(ClusterId),
    /// Every pod that came from any remote cluster, tagged with its origin
    AnyOrigin,
}

impl EndpointFilter {
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        match self {
            EndpointFilter::OriginCluster(id) => {
                endpoint.origin_cluster.as_deref() == Some(id.as_str())
            }
            EndpointFilter::OffloadedTo(id) => endpoint.offloaded_to.as_deref() == Some(id.as_str()),
            EndpointFilter::AnyOrigin => endpoint.origin_cluster.is_some(),
        }
    }
}

/// Compiled spec plus the metadata the store needs to identify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfiguration {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    pub spec: FirewallSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// `InvalidInput`, `CompilationFailed`, `TransportFailed` or `Ready`
    #[serde(rename = "type")]
    pub kind: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: chrono::DateTime<chrono::Utc>,
}

impl Condition {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: "InvalidInput".to_string(),
            status: true,
            reason: "PolicyRejected".to_string(),
            message: message.into(),
            last_transition: chrono::Utc::now(),
        }
    }

    /// Compilation aborted by a contract violation (bad mode, bad match)
    pub fn compilation_failed(message: impl Into<String>) -> Self {
        Self {
            kind: "CompilationFailed".to_string(),
            status: true,
            reason: "ContractViolation".to_string(),
            message: message.into(),
            last_transition: chrono::Utc::now(),
        }
    }

    /// Packet filter or store kept failing after every retry
    pub fn transport_failed(message: impl Into<String>) -> Self {
        Self {
            kind: "TransportFailed".to_string(),
            status: true,
            reason: "RetryBudgetExhausted".to_string(),
            message: message.into(),
            last_transition: chrono::Utc::now(),
        }
    }

    pub fn ready() -> Self {
        Self {
            kind: "Ready".to_string(),
            status: true,
            reason: "Compiled".to_string(),
            message: String::new(),
            last_transition: chrono::Utc::now(),
        }
    }

    /// Keeps the transition time of `previous` when neither type nor status
    /// changed.
    pub fn carry_transition(mut self, previous: Option<&Condition>) -> Self {
        if let Some(previous) = previous
            && previous.kind == self.kind
            && previous.status == self.status
        {
            self.last_transition = previous.last_transition;
        }
        self
    }
}

#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<PolicyObject>>;

    /// Raw endpoint addresses matching `filter`, as `(origin cluster, ip)`.
    ///
    /// The origin is only filled in for [`EndpointFilter::AnyOrigin`].
    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<(Option<String>, String)>>;

    async fn upsert(&self, config: FirewallConfiguration) -> Result<()>;

    async fn report_condition(&self, policy: &PolicyKey, condition: Condition) -> Result<()>;
}

/// Input document of [`FileStore`] and seed of [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub policies: Vec<PolicyObject>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Snapshot {
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Serialization` if it is not a snapshot.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    fn endpoints(&self, filter: &EndpointFilter) -> Vec<(Option<String>, String)> {
        self.endpoints
            .iter()
            .filter(|e| filter.matches(e))
            .map(|e| {
                let origin = match filter {
                    EndpointFilter::AnyOrigin => e.origin_cluster.clone(),
                    _ => None,
                };
                (origin, e.ip.clone())
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshot: Snapshot,
    configurations: BTreeMap<(String, String), FirewallConfiguration>,
    conditions: BTreeMap<PolicyKey, Condition>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                snapshot,
                ..Default::default()
            }),
        }
    }

    /// Replaces policies and endpoints, as a watch event would.
    pub async fn replace_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().await.snapshot = snapshot;
    }

    pub async fn configuration(&self, namespace: &str, name: &str) -> Option<FirewallConfiguration> {
        self.state
            .lock()
            .await
            .configurations
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn configurations(&self) -> Vec<FirewallConfiguration> {
        self.state.lock().await.configurations.values().cloned().collect()
    }

    pub async fn condition(&self, policy: &PolicyKey) -> Option<Condition> {
        self.state.lock().await.conditions.get(policy).cloned()
    }
}

#[async_trait]
impl DesiredStateStore for MemoryStore {
    async fn list_policies(&self) -> Result<Vec<PolicyObject>> {
        Ok(self.state.lock().await.snapshot.policies.clone())
    }

    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<(Option<String>, String)>> {
        Ok(self.state.lock().await.snapshot.endpoints(filter))
    }

    async fn upsert(&self, config: FirewallConfiguration) -> Result<()> {
        let key = (config.namespace.clone(), config.name.clone());
        self.state.lock().await.configurations.insert(key, config);
        Ok(())
    }

    async fn report_condition(&self, policy: &PolicyKey, condition: Condition) -> Result<()> {
        let mut state = self.state.lock().await;
        let condition = condition.carry_transition(state.conditions.get(policy));
        state.conditions.insert(policy.clone(), condition);
        Ok(())
    }
}

/// Reads policies and endpoints from a JSON snapshot file; writes every
/// upserted configuration to `<out>/<namespace>/<name>.json` and conditions
/// to `<out>/conditions.json`.
///
/// The snapshot is re-read on every listing, so edits take effect on the
/// next reconciliation.
#[derive(Debug)]
pub struct FileStore {
    snapshot_path: PathBuf,
    out_dir: PathBuf,
    conditions: Mutex<BTreeMap<String, Condition>>,
}

impl FileStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            out_dir: out_dir.into(),
            conditions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn configuration_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.out_dir.join(namespace).join(format!("{name}.json"))
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        Snapshot::load(&self.snapshot_path).await.map_err(|e| match e {
            Error::Io(io) => Error::transport(format!(
                "cannot read snapshot {}: {io}",
                self.snapshot_path.display()
            )),
            other => other,
        })
    }

    async fn write(&self, path: PathBuf, contents: Vec<u8>) -> Result<()> {
        tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
            .await
            .map_err(|e| Error::transport(format!("write task failed: {e}")))?
            .map_err(|e| Error::transport(format!("cannot write store object: {e}")))
    }
}

#[async_trait]
impl DesiredStateStore for FileStore {
    async fn list_policies(&self) -> Result<Vec<PolicyObject>> {
        Ok(self.snapshot().await?.policies)
    }

    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<(Option<String>, String)>> {
        Ok(self.snapshot().await?.endpoints(filter))
    }

    async fn upsert(&self, config: FirewallConfiguration) -> Result<()> {
        let path = self.configuration_path(&config.namespace, &config.name);
        let json = serde_json::to_vec_pretty(&config)?;

        if let Ok(existing) = tokio::fs::read(&path).await
            && existing == json
        {
            debug!(path = %path.display(), "Configuration unchanged");
            return Ok(());
        }

        debug!(path = %path.display(), "Writing configuration");
        self.write(path, json).await
    }

    async fn report_condition(&self, policy: &PolicyKey, condition: Condition) -> Result<()> {
        let mut conditions = self.conditions.lock().await;
        let key = policy.to_string();
        let condition = condition.carry_transition(conditions.get(&key));
        conditions.insert(key, condition);
        let json = serde_json::to_vec_pretty(&*conditions)?;
        self.write(self.out_dir.join("conditions.json"), json).await
    }
}
