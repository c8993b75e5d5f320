// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Transfer session reconciliation for all frontends
//
// This crate provides:
// - TransferSession and the serialized SessionManager that owns it
// - TransportCoordinator for push / adaptive-poll / receipt-poll ingestion
// - PhaseTable weighted progress and ETA estimation
// - reconcile, the idempotent terminal-signal latch
// - FailureGuard rate-limited error funnel with circuit breaker
// - SessionLifecycleScheduler post-completion reset timers
//
// Rendering, theming, and file selection live in the frontend crates.

pub mod config;
pub mod failure;
pub mod phase;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

// Re-export commonly used items
pub use config::TrackerConfig;
pub use failure::{FailureGuard, GuardConfig, GuardOutcome, RecoveryAction};
pub use phase::{PhaseDefinition, PhaseOutcome, PhaseTable};
pub use reconcile::{Reduction, TerminalSignal};
pub use scheduler::SessionLifecycleScheduler;
pub use session::{IngestEvent, SessionManager, SessionUpdate};
pub use transport::{
    AdaptiveInterval, CoordinatorCommand, CoordinatorHandle, PollTransport, PushEvent,
    TransportCoordinator,
};
pub use types::{
    ConnectionState, ErrorCategory, ErrorRecord, EventSource, ProgressEvent, SessionConfig,
    SessionStatus, StatusChannel, TrackerError, TransferSession, UserFacingError,
};
pub use wire::{PollStatus, PushMessage, ReceiptCheck, WireSignal};
