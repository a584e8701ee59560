//! Converger
//!
//! Drives one table at a time from its observed state to a desired
//! [`FirewallSpec`]: fetch, diff, optionally verify, apply one atomic batch.
//!
//! Applies to the same table are serialized behind a per-table lock, so a
//! newer spec always waits for an in-flight apply to finish. Every submitted
//! spec gets a generation number; a spec that was overtaken by a newer one
//! while it waited is dropped as [`Outcome::Superseded`] instead of being
//! applied on top of it. Distinct tables converge concurrently.
//!
//! Fetch and apply are bounded by timeouts and a caller cancellation token.
//! A failed, timed-out or cancelled apply leaves the target
//! [`TargetState::Unconverged`]; nothing is rolled back, the live ruleset
//! stays as it was.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::diff::{self, Plan};
use crate::core::error::{Error, Result};
use crate::core::firewall::FirewallSpec;
use crate::transport::PacketFilter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TargetState {
    #[default]
    Unconverged,
    Applying,
    Converged,
}

/// Bookkeeping for one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStatus {
    pub state: TargetState,
    /// Fingerprint of the last spec that was applied or found converged
    pub last_fingerprint: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Generation of the newest submitted spec
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Observed state already matched; nothing was sent
    AlreadyConverged,
    /// One batch with `ops` operations was committed
    Applied { ops: usize },
    /// A newer spec for the same table was submitted while this one waited
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ConvergerOptions {
    pub fetch_timeout: Duration,
    pub apply_timeout: Duration,
    /// Dry-run every batch with `check` before applying it
    pub verify: bool,
}

impl Default for ConvergerOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            apply_timeout: Duration::from_secs(30),
            verify: false,
        }
    }
}

pub struct Converger {
    filter: Arc<dyn PacketFilter>,
    options: ConvergerOptions,
    audit: Option<AuditLog>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status: Mutex<HashMap<String, TargetStatus>>,
}

/// Runs `fut` unless it outlives `limit` or `cancel` fires first.
async fn bounded<T>(
    what: &str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled(format!("{what} cancelled"))),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Cancelled(format!("{what} timed out after {limit:?}"))),
        },
    }
}

impl Converger {
    pub fn new(filter: Arc<dyn PacketFilter>, options: ConvergerOptions) -> Self {
        Self {
            filter,
            options,
            audit: None,
            locks: Mutex::new(HashMap::new()),
            status: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn filter(&self) -> &Arc<dyn PacketFilter> {
        &self.filter
    }

    pub async fn status(&self, table: &str) -> Option<TargetStatus> {
        self.status.lock().await.get(table).cloned()
    }

    async fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    async fn update(&self, table: &str, f: impl FnOnce(&mut TargetStatus)) {
        let mut status = self.status.lock().await;
        f(status.entry(table.to_string()).or_default());
    }

    /// Registers a new desired spec and returns its generation.
    async fn submit(&self, spec: &FirewallSpec, fingerprint: &str) -> u64 {
        let mut status = self.status.lock().await;
        let entry = status.entry(spec.table.name.clone()).or_default();
        entry.generation += 1;
        if entry.last_fingerprint.as_deref() != Some(fingerprint) {
            entry.state = TargetState::Unconverged;
        }
        entry.generation
    }

    /// Fetches the table and computes the plan without applying anything.
    pub async fn plan(&self, spec: &FirewallSpec, cancel: &CancellationToken) -> Result<Plan> {
        let observed = bounded(
            "fetch",
            self.options.fetch_timeout,
            cancel,
            self.filter.fetch(spec.table.family, &spec.table.name),
        )
        .await?;
        diff::diff(spec, observed.as_ref())
    }

    /// Converges the table of `spec`.
    ///
    /// # Errors
    ///
    /// Contract errors from diffing, `Transport` from the filter and
    /// `Cancelled` on timeout or cancellation. On error the target is left
    /// unconverged.
    pub async fn converge(&self, spec: &FirewallSpec, cancel: &CancellationToken) -> Result<Outcome> {
        let table = spec.table.name.as_str();
        let fingerprint = spec.fingerprint();
        let generation = self.submit(spec, &fingerprint).await;

        let lock = self.table_lock(table).await;
        let _guard = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("waiting for table {table} cancelled")));
            }
            guard = lock.lock() => guard,
        };

        let latest = self.status(table).await.map_or(generation, |s| s.generation);
        if latest != generation {
            debug!(table, generation, latest, "Spec superseded before apply");
            return Ok(Outcome::Superseded);
        }

        self.update(table, |s| s.state = TargetState::Applying).await;

        let apply_id = Uuid::new_v4();
        let result = self.apply_once(spec, apply_id, cancel).await;

        match &result {
            Ok(_) => {
                self.update(table, |s| {
                    s.state = TargetState::Converged;
                    s.last_fingerprint = Some(fingerprint);
                    s.last_error = None;
                    s.consecutive_failures = 0;
                })
                .await;
            }
            Err(e) => {
                warn!(table, %apply_id, error = %e, "Convergence failed");
                let message = e.to_string();
                self.update(table, |s| {
                    s.state = TargetState::Unconverged;
                    s.last_error = Some(message);
                    s.consecutive_failures += 1;
                })
                .await;
            }
        }
        result
    }

    async fn apply_once(
        &self,
        spec: &FirewallSpec,
        apply_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let table = spec.table.name.as_str();
        let plan = self.plan(spec, cancel).await?;

        if plan.is_empty() {
            debug!(table, "Already converged");
            self.audit(apply_id, EventType::AlreadyConverged, table, &plan, None)
                .await;
            return Ok(Outcome::AlreadyConverged);
        }

        for op in &plan.ops {
            debug!(table, "{op}");
        }
        let batch = plan.to_nftables_json()?;

        if self.options.verify {
            let verdict = bounded(
                "check",
                self.options.apply_timeout,
                cancel,
                self.filter.check(&batch),
            )
            .await?;
            if !verdict.success {
                let message = verdict.errors.join("; ");
                self.audit(apply_id, EventType::VerifyPlan, table, &plan, Some(message.clone()))
                    .await;
                return Err(Error::transport(format!("verification failed: {message}")));
            }
            self.audit(apply_id, EventType::VerifyPlan, table, &plan, None)
                .await;
        }

        let applied = bounded(
            "apply",
            self.options.apply_timeout,
            cancel,
            self.filter.apply(&batch),
        )
        .await;

        let error = applied.as_ref().err().map(ToString::to_string);
        self.audit(apply_id, EventType::ApplyPlan, table, &plan, error)
            .await;
        applied?;

        info!(table, %apply_id, ops = plan.ops.len(), "Applied plan");
        Ok(Outcome::Applied {
            ops: plan.ops.len(),
        })
    }

    async fn audit(
        &self,
        apply_id: Uuid,
        event_type: EventType,
        table: &str,
        plan: &Plan,
        error: Option<String>,
    ) {
        if let Some(audit) = &self.audit {
            let details = serde_json::json!({
                "ops": plan.ops.len(),
                "summary": plan.ops.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            audit
                .record(AuditEvent::new(
                    apply_id,
                    event_type,
                    table,
                    error.is_none(),
                    details,
                    error,
                ))
                .await;
        }
    }
}
