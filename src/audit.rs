/// Audit logging for packet-filter changes
///
/// Every apply attempt (successful or not), every verification and every
/// no-op convergence is appended as one JSON line, tagged with an apply id
/// so the log can be correlated with tracing output.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyPlan,
    VerifyPlan,
    AlreadyConverged,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub apply_id: Uuid,
    pub event_type: EventType,
    /// `<role>/<table>` of the target
    pub target: String,
    pub success: bool,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        apply_id: Uuid,
        event_type: EventType,
        target: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            apply_id,
            event_type,
            target: target.into(),
            success,
            details,
            error,
        }
    }
}

/// Append-only JSON-lines writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        if let Some(dir) = self.log_path.parent() {
            crate::utils::create_private_dir(dir)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Logs and swallows write failures; the audit trail never blocks an apply.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        Ok(content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            Uuid::new_v4(),
            EventType::ApplyPlan,
            "gateway/cluster-security",
            false,
            serde_json::json!({"ops": 2}),
            Some("nft failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("apply_plan"));
        assert!(json.contains("nft failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","apply_id":"67e55044-10b1-426f-9247-bb680e5fe0c8","event_type":"already_converged","target":"isolation/cluster-isolation","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::AlreadyConverged);
    }

    #[tokio::test]
    async fn test_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("state").join("audit.log"));
        let id = Uuid::new_v4();

        for (kind, ok) in [(EventType::VerifyPlan, true), (EventType::ApplyPlan, true)] {
            audit
                .record(AuditEvent::new(id, kind, "fabric/t", ok, serde_json::json!({}), None))
                .await;
        }

        let recent = audit.read_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::ApplyPlan);
        assert!(recent.iter().all(|e| e.apply_id == id));
    }
}
