//! Audit event emission for MFA lifecycle changes.
//!
//! Fire-and-forget: a failed audit write is logged and never blocks the
//! security operation that triggered it. The durable write path lives with
//! the collaborator behind [`AuditSink`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditAction {
    Create,
    Update,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
        }
    }
}

/// One MFA lifecycle event: enrollment, enablement, disablement, or
/// backup-code regeneration.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub user_id: i64,
    pub action: AuditAction,
    pub item_type: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(user_id: i64, action: AuditAction, item_type: &str) -> Self {
        Self {
            user_id,
            action,
            item_type: item_type.to_string(),
            before: None,
            after: None,
        }
    }

    #[must_use]
    pub fn with_change(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event.
    ///
    /// # Errors
    /// Implementations may fail; callers treat failures as non-fatal.
    async fn emit(&self, event: AuditEvent) -> Result<()>;
}

/// Default sink: structured log records under the `audit` target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "audit",
            user_id = event.user_id,
            action = event.action.as_str(),
            module = "MFA",
            item_type = %event.item_type,
            "audit event"
        );
        Ok(())
    }
}

/// Emit without letting a sink failure propagate.
pub(crate) async fn emit_best_effort(sink: &dyn AuditSink, event: AuditEvent) {
    let user_id = event.user_id;
    let item_type = event.item_type.clone();
    if let Err(err) = sink.emit(event).await {
        warn!(user_id, item_type = %item_type, "failed to record audit event: {err}");
    }
}
