//! Decision events for out-of-band usage logging.
//!
//! Sinks are best effort. A sink that fails never changes a decision; the
//! limiter logs the failure and moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;
use uuid::Uuid;

use super::rules::Algorithm;
use crate::error::{Result, TollgateError};

/// One admission decision, as recorded for usage analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub principal_id: String,
    pub resource: String,
    pub allowed: bool,
    pub remaining_tokens: i64,
    pub algorithm: Algorithm,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        principal_id: &str,
        resource: &str,
        allowed: bool,
        remaining_tokens: i64,
        algorithm: Algorithm,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id: principal_id.to_string(),
            resource: resource.to_string(),
            allowed,
            remaining_tokens,
            algorithm,
            latency_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of decision events. `record` must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Writes each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "tollgate::audit",
            id = %event.id,
            principal = %event.principal_id,
            resource = %event.resource,
            allowed = event.allowed,
            remaining_tokens = event.remaining_tokens,
            algorithm = %event.algorithm,
            latency_ms = event.latency_ms,
            "Rate limit decision"
        );
        Ok(())
    }
}

/// Hands events to a bounded channel for a separate persister task.
///
/// When the channel is full the event is dropped and reported as an error.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver its events are delivered to.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) -> Result<()> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => {
                TollgateError::AuditSink(format!("audit channel full, dropped event {}", event.id))
            }
            TrySendError::Closed(_) => TollgateError::AuditSink("audit channel closed".to_string()),
        })
    }
}
