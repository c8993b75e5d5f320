// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Completion reconciler
//
// Idempotent reducer over terminal signals. Status messages for a short-lived
// operation arrive out of order across channels, so the first authoritative
// completion latches and everything after it is dropped. The receipt channel
// reflects the remote side's own verification and may overturn a client-side
// failure report exactly once.

use crate::types::{SessionStatus, TransferSession};
use chrono::Utc;

/// Terminal signals, already normalized from the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// Client-side inference: the final phase reported completion
    PhaseTerminal,
    /// Remote-verified receipt (size/hash match), the authoritative signal
    ReceiptConfirmed,
    /// Remote explicitly reported the operation failed
    ApplicationFailed,
}

/// Whether a reduction changed the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Applied,
    Ignored,
}

/// Apply one terminal signal to the session.
///
/// Latch rules:
/// - once `completion_latched` is set, every signal is a no-op;
/// - `ReceiptConfirmed` completes and latches from Active or Failed — the
///   overwrite of an earlier failure happens at most once;
/// - `PhaseTerminal` completes and latches only from Active; it never
///   overrides an explicit remote failure;
/// - `ApplicationFailed` marks the session Failed without latching, leaving
///   the receipt channel the final word; a duplicate failure is ignored and
///   `terminal_at` keeps its first value.
pub fn reduce(session: &mut TransferSession, signal: TerminalSignal) -> Reduction {
    if session.completion_latched {
        tracing::debug!(session_id = %session.id, ?signal, "terminal signal after latch, ignored");
        return Reduction::Ignored;
    }

    match signal {
        TerminalSignal::ReceiptConfirmed => {
            if session.status == SessionStatus::Failed {
                tracing::warn!(
                    session_id = %session.id,
                    "receipt confirmed after reported failure; overriding to Completed"
                );
            }
            complete(session);
            Reduction::Applied
        }
        TerminalSignal::PhaseTerminal => {
            if session.status == SessionStatus::Failed {
                tracing::debug!(
                    session_id = %session.id,
                    "phase-terminal inference ignored for failed session"
                );
                return Reduction::Ignored;
            }
            complete(session);
            Reduction::Applied
        }
        TerminalSignal::ApplicationFailed => {
            if session.status == SessionStatus::Failed {
                return Reduction::Ignored;
            }
            session.status = SessionStatus::Failed;
            if session.terminal_at.is_none() {
                session.terminal_at = Some(Utc::now());
            }
            tracing::info!(session_id = %session.id, "session marked Failed");
            Reduction::Applied
        }
    }
}

fn complete(session: &mut TransferSession) {
    session.status = SessionStatus::Completed;
    session.completion_latched = true;
    session.progress_percent = 100.0;
    session.eta_seconds = Some(0);
    if session.terminal_at.is_none() {
        session.terminal_at = Some(Utc::now());
    }
    tracing::info!(session_id = %session.id, "session completed and latched");
}
