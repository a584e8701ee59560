//! Reconciler
//!
//! Turns store contents into compiled [`FirewallConfiguration`] objects and,
//! when a [`Converger`] is attached, into live packet-filter state.
//!
//! Every trigger is handled by recomputing the affected targets from
//! scratch: list policies, list endpoints, compile, upsert, converge. Each
//! target runs as its own task, so one failing target never holds back or
//! breaks the others. Transport failures are retried with backoff; input and
//! contract errors are not retried and end up as a condition on the policy.

use crate::config::AppConfig;
use crate::converger::{Converger, Outcome};
use crate::core::assemble;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::firewall::{ClusterId, InterfaceNames, Membership, Topology};
use crate::core::naming::{self, ISOLATION_RESOURCE, OwnerRef, Role};
use crate::retry::{RetryConfig, retry_if};
use crate::store::{
    Condition, DesiredStateStore, EndpointFilter, FirewallConfiguration, PolicyKey, PolicyObject,
};
use crate::validators::parse_pod_ip;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What changed upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A policy object was created, changed or deleted
    Policy(PolicyKey),
    /// Endpoints related to a remote cluster changed
    Cluster(ClusterId),
    /// The isolation object itself changed
    Isolation,
    All,
}

/// One unit of reconciliation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Policy { policy: PolicyKey, role: Role },
    Isolation,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Policy { policy, role } => write!(f, "{role} for {policy}"),
            Target::Isolation => write!(f, "isolation"),
        }
    }
}

#[derive(Debug)]
pub struct TargetReport {
    pub target: Target,
    /// `Ok(None)` when the configuration was upserted but not converged here
    pub result: Result<Option<Outcome>>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub targets: Vec<TargetReport>,
}

impl ReconcileReport {
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub interfaces: InterfaceNames,
    pub tenant_namespace_prefix: String,
    pub isolation_namespace: String,
    pub chain_priority: i32,
    pub retry: RetryConfig,
    /// Gateway specs are only converged on the gateway of their cluster;
    /// elsewhere they are compiled and upserted only.
    pub local_gateway: Option<ClusterId>,
}

impl From<&AppConfig> for ReconcilerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            interfaces: InterfaceNames {
                tunnel: config.tunnel_interface.clone(),
                external: config.external_interface.clone(),
            },
            tenant_namespace_prefix: config.tenant_namespace_prefix.clone(),
            isolation_namespace: config.isolation_namespace.clone(),
            chain_priority: config.chain_priority,
            retry: config.retry.clone(),
            local_gateway: None,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DesiredStateStore>,
    converger: Option<Arc<Converger>>,
    options: Arc<ReconcilerOptions>,
    cancel: CancellationToken,
}

fn parse_ips(raw: Vec<(Option<String>, String)>, cluster: &str) -> Vec<Ipv4Addr> {
    raw.into_iter()
        .filter_map(|(_, ip)| {
            let parsed = parse_pod_ip(&ip);
            if parsed.is_none() && !ip.trim().is_empty() {
                warn!(cluster, ip = %ip, "Skipping malformed pod IP");
            }
            parsed
        })
        .collect()
}

fn parse_cidrs(policy: &PolicyObject) -> Result<Vec<Ipv4Network>> {
    policy
        .remote_pod_cidrs
        .iter()
        .map(|raw| {
            raw.trim().parse::<Ipv4Network>().map_err(|e| {
                Error::invalid_input("remote_pod_cidrs", format!("{raw:?} is not an IPv4 CIDR: {e}"))
            })
        })
        .collect()
}

impl Reconciler {
    pub fn new(store: Arc<dyn DesiredStateStore>, options: ReconcilerOptions) -> Self {
        Self {
            store,
            converger: None,
            options: Arc::new(options),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_converger(mut self, converger: Arc<Converger>) -> Self {
        self.converger = Some(converger);
        self
    }

    /// Token cancelling in-flight fetches and applies.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn converger(&self) -> Option<&Arc<Converger>> {
        self.converger.as_ref()
    }

    async fn membership(&self, cluster: &ClusterId) -> Result<Membership> {
        let destination = self
            .store
            .list_endpoints(&EndpointFilter::OriginCluster(cluster.clone()))
            .await?;
        let source = self
            .store
            .list_endpoints(&EndpointFilter::OffloadedTo(cluster.clone()))
            .await?;
        Ok(Membership {
            source_pod_ips: parse_ips(source, cluster.as_str()),
            destination_pod_ips: parse_ips(destination, cluster.as_str()),
        })
    }

    async fn isolation_pod_ips(&self) -> Result<BTreeMap<ClusterId, Vec<Ipv4Addr>>> {
        let mut by_cluster: BTreeMap<ClusterId, Vec<Ipv4Addr>> = BTreeMap::new();
        for (origin, ip) in self.store.list_endpoints(&EndpointFilter::AnyOrigin).await? {
            let Some(cluster) = origin.and_then(|o| ClusterId::new(o).ok()) else {
                continue;
            };
            if let Some(addr) = parse_pod_ip(&ip) {
                by_cluster.entry(cluster).or_default().push(addr);
            } else if !ip.trim().is_empty() {
                warn!(%cluster, ip = %ip, "Skipping malformed pod IP");
            }
        }
        Ok(by_cluster)
    }

    /// Compiles one target from the current store contents.
    ///
    /// # Errors
    ///
    /// Input and contract errors for the policy, `Transport` if the store
    /// cannot be read.
    pub async fn compile(
        &self,
        target: &Target,
        policies: &[PolicyObject],
    ) -> Result<FirewallConfiguration> {
        let opts = &self.options;
        match target {
            Target::Isolation => {
                let clusters: Vec<ClusterId> = policies
                    .iter()
                    .filter_map(|p| p.cluster_id().ok())
                    .collect();
                let pod_ips = self.isolation_pod_ips().await?;
                Ok(FirewallConfiguration {
                    name: ISOLATION_RESOURCE.to_string(),
                    namespace: opts.isolation_namespace.clone(),
                    labels: naming::labels(Role::Isolation, None),
                    owner: None,
                    spec: assemble::isolation(&clusters, &pod_ips, opts.chain_priority)?,
                })
            }
            Target::Policy { policy, role } => {
                let object = policies
                    .iter()
                    .find(|p| p.key() == *policy)
                    .ok_or_else(|| Error::invalid_input("policy", format!("{policy} not found")))?;
                let cluster = object.cluster_id()?;
                let mode = object.mode()?;
                let membership = self.membership(&cluster).await?;

                let spec = match role {
                    Role::Gateway => assemble::gateway(
                        mode,
                        &opts.interfaces,
                        &cluster,
                        &membership,
                        opts.chain_priority,
                    )?,
                    Role::Fabric => {
                        let topology = Topology {
                            policy_name: object.name.clone(),
                            remote_pod_cidrs: parse_cidrs(object)?,
                        };
                        assemble::fabric(mode, &cluster, &topology, &membership, opts.chain_priority)?
                    }
                    Role::Isolation => {
                        return Err(Error::UnsupportedMatch(
                            "isolation is not a per-policy target".to_string(),
                        ));
                    }
                };

                Ok(FirewallConfiguration {
                    name: naming::resource_name(&cluster, *role),
                    namespace: naming::namespace_name(&opts.tenant_namespace_prefix, &cluster),
                    labels: naming::labels(*role, Some(&cluster)),
                    owner: Some(OwnerRef::policy(&object.name, &object.namespace)),
                    spec,
                })
            }
        }
    }

    /// Whether `config` is enforced by this process. Gateway objects are only
    /// converged on the gateway of their own cluster.
    pub fn converges_here(&self, config: &FirewallConfiguration) -> bool {
        if config.labels.get(naming::CATEGORY_LABEL).map(String::as_str) != Some("gateway") {
            return true;
        }
        self.options.local_gateway.as_ref().is_some_and(|local| {
            config.labels.get(naming::UNIQUE_LABEL).map(String::as_str) == Some(local.as_str())
        })
    }

    /// One full compile, upsert, converge cycle for a target.
    async fn run_once(&self, target: &Target, policies: &[PolicyObject]) -> Result<Option<Outcome>> {
        let config = self.compile(target, policies).await?;
        let converge = self.converges_here(&config);
        let spec = config.spec.clone();
        self.store.upsert(config).await?;

        match &self.converger {
            Some(converger) if converge => Ok(Some(converger.converge(&spec, &self.cancel).await?)),
            _ => Ok(None),
        }
    }

    /// Runs a target, retrying transport failures within the retry budget.
    pub async fn run_target(&self, target: &Target, policies: &[PolicyObject]) -> Result<Option<Outcome>> {
        let name = target.to_string();
        retry_if(
            &self.options.retry,
            &name,
            || self.run_once(target, policies),
            |e: &Error| e.is_retriable() && !self.cancel.is_cancelled(),
        )
        .await
    }

    async fn list_policies(&self) -> Result<Vec<PolicyObject>> {
        retry_if(
            &self.options.retry,
            "list policies",
            || self.store.list_policies(),
            Error::is_retriable,
        )
        .await
    }

    /// Every target affected by `trigger`.
    fn targets(trigger: &Trigger, policies: &[PolicyObject]) -> Vec<Target> {
        let affected = |p: &PolicyObject| match trigger {
            Trigger::All => true,
            Trigger::Policy(key) => p.key() == *key,
            Trigger::Cluster(id) => p.cluster_id().is_ok_and(|c| c == *id),
            Trigger::Isolation => false,
        };

        let mut targets: Vec<Target> = policies
            .iter()
            .filter(|p| affected(p))
            .flat_map(|p| {
                [Role::Gateway, Role::Fabric].map(|role| Target::Policy {
                    policy: p.key(),
                    role,
                })
            })
            .collect();
        // membership of any cluster feeds the isolation sets
        targets.push(Target::Isolation);
        targets
    }

    /// Recomputes every target affected by `trigger`.
    ///
    /// # Errors
    ///
    /// Only if the policies cannot be listed at all; per-target failures are
    /// in the report.
    pub async fn reconcile(&self, trigger: Trigger) -> Result<ReconcileReport> {
        let policies = Arc::new(self.list_policies().await?);
        let targets = Self::targets(&trigger, &policies);
        info!(?trigger, targets = targets.len(), "Reconciling");

        let mut tasks = JoinSet::new();
        for target in targets {
            let this = self.clone();
            let policies = Arc::clone(&policies);
            tasks.spawn(async move {
                let result = this.run_target(&target, &policies).await;
                TargetReport { target, result }
            });
        }

        let mut report = ReconcileReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(target_report) => report.targets.push(target_report),
                Err(e) => error!("Reconciliation task panicked: {e}"),
            }
        }
        report.targets.sort_by(|a, b| a.target.cmp(&b.target));

        self.report_conditions(&report).await;
        Ok(report)
    }

    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        self.reconcile(Trigger::All).await
    }

    /// One condition per policy: the most severe failure among its targets,
    /// or `Ready` when every target went through.
    async fn report_conditions(&self, report: &ReconcileReport) {
        let mut per_policy: BTreeMap<&PolicyKey, Vec<&TargetReport>> = BTreeMap::new();
        for entry in &report.targets {
            if let Target::Policy { policy, .. } = &entry.target {
                per_policy.entry(policy).or_default().push(entry);
            }
        }

        for (policy, entries) in per_policy {
            let errors: Vec<&Error> = entries.iter().filter_map(|e| e.result.as_ref().err()).collect();
            let worst = |kind: ErrorKind| errors.iter().find(|e| e.kind() == kind);

            let condition = if let Some(e) = worst(ErrorKind::InvalidInput) {
                warn!(%policy, error = %e, "Policy rejected");
                Condition::invalid_input(e.to_string())
            } else if let Some(e) = worst(ErrorKind::Contract) {
                error!(%policy, error = %e, "Compilation aborted");
                Condition::compilation_failed(e.to_string())
            } else if let Some(e) = worst(ErrorKind::Transport) {
                error!(%policy, error = %e, "Retry budget exhausted");
                Condition::transport_failed(e.to_string())
            } else {
                Condition::ready()
            };

            if let Err(e) = self.store.report_condition(policy, condition).await {
                warn!(%policy, "Failed to report condition: {e}");
            }
        }
    }
}
