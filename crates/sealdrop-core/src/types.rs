// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// The single tracked transfer operation.
///
/// Owned exclusively by the `SessionManager`; everything outside the manager
/// sees clones of it. All mutation goes through the reducer functions in
/// `session.rs` / `reconcile.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    /// Opaque id, stable for the lifetime of the operation
    pub id: String,
    /// Last phase token reported by any channel
    pub phase: String,
    /// Overall progress, 0..100, monotonically non-decreasing
    pub progress_percent: f64,
    /// Estimated seconds remaining; `None` when no calibration baseline exists
    pub eta_seconds: Option<u64>,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, by the first terminal signal applied
    pub terminal_at: Option<DateTime<Utc>>,
    /// Once true, no further status or error mutation is applied
    pub completion_latched: bool,
}

impl TransferSession {
    pub fn new(id: String, total_bytes: u64) -> Self {
        Self {
            id,
            phase: String::new(),
            progress_percent: 0.0,
            eta_seconds: None,
            transferred_bytes: 0,
            total_bytes,
            speed_bps: 0,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            terminal_at: None,
            completion_latched: false,
        }
    }

    /// True once any terminal status has been applied
    pub fn is_terminal(&self) -> bool {
        self.status != SessionStatus::Active
    }
}

/// Validated descriptor for starting a session.
///
/// Produced by the external validation module; this crate never reads file
/// bytes or persisted settings itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub filename: String,
    pub total_bytes: u64,
    /// Remote job id when the server assigns one up front
    #[serde(default)]
    pub job_id: Option<String>,
}

impl SessionConfig {
    /// Reject obviously unusable descriptors before a session exists.
    /// Failures here never reach the failure guard.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.filename.is_empty() {
            return Err(TrackerError::Validation("filename is empty".to_string()));
        }
        if self.total_bytes == 0 {
            return Err(TrackerError::Validation(
                "total size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which channel produced a normalized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    Push,
    Poll,
    ReceiptPoll,
}

/// Normalized, channel-agnostic progress update.
///
/// Ephemeral: consumed by one reduction pass and discarded.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub source: EventSource,
    pub phase: Option<String>,
    /// Progress within the current phase, 0..1
    pub raw_local_progress: Option<f64>,
    pub transferred_bytes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Which transport path is currently delivering status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChannel {
    Push,
    Poll,
}

/// Connection bookkeeping, owned and mutated only by the coordinator
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub channel: StatusChannel,
    pub connected: bool,
    pub last_activity_at: DateTime<Utc>,
    pub consecutive_idle_polls: u32,
    pub current_poll_interval: Duration,
}

/// Error taxonomy for the failure guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Application,
    Timeout,
}

/// One entry in the bounded diagnostic history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recovered: bool,
}

/// Structured user-facing failure, rendered by the external presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFacingError {
    pub user_message: String,
    pub suggestion: String,
    pub technical: String,
}

/// Error types for the tracker
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Ingestion channel closed")]
    ChannelClosed,
}

impl TrackerError {
    /// Category for guard dispatch. Validation errors are rejected before a
    /// session exists and have no category.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            TrackerError::Transport(_) => Some(ErrorCategory::Transport),
            TrackerError::Protocol(_) => Some(ErrorCategory::Protocol),
            TrackerError::Application(_) => Some(ErrorCategory::Application),
            TrackerError::Timeout(_) => Some(ErrorCategory::Timeout),
            TrackerError::Validation(_) | TrackerError::ChannelClosed => None,
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Protocol(err.to_string())
    }
}
