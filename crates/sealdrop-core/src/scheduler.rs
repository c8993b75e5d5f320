// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Session lifecycle scheduler
//
// Owns the post-completion countdown timers, keyed by session id. A timer is
// a pair of tasks (per-second countdown ticks plus the terminal fire) that
// are always cancelled together; a half-cancelled pair would permit a
// double-fire or a dangling interval. The terminal fire re-enters the
// ingestion queue and is rejected there if the active session id has moved
// on (stale timer guard).

use crate::session::IngestEvent;
use async_channel::Sender;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Countdown timer bound to one session id.
/// Both handles live and die together.
struct ResetTimer {
    tick_handle: JoinHandle<()>,
    terminal_handle: JoinHandle<()>,
}

impl ResetTimer {
    fn abort(self) {
        self.tick_handle.abort();
        self.terminal_handle.abort();
    }
}

/// Registry of post-completion reset timers
pub struct SessionLifecycleScheduler {
    ingest_tx: Sender<IngestEvent>,
    timers: HashMap<String, ResetTimer>,
}

impl SessionLifecycleScheduler {
    pub fn new(ingest_tx: Sender<IngestEvent>) -> Self {
        Self {
            ingest_tx,
            timers: HashMap::new(),
        }
    }

    /// Start a countdown for `session_id`. An existing timer for the same
    /// session is replaced, never doubled.
    pub fn schedule_reset(&mut self, session_id: &str, delay: Duration) {
        self.cancel(session_id);

        let delay_secs = delay.as_secs();
        tracing::info!(session_id, delay_secs, "scheduling post-completion reset");

        let tick_tx = self.ingest_tx.clone();
        let tick_session = session_id.to_string();
        let tick_handle = tokio::spawn(async move {
            let mut remaining = delay_secs;
            while remaining > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining -= 1;
                let event = IngestEvent::CountdownTick {
                    session_id: tick_session.clone(),
                    remaining_seconds: remaining,
                };
                if tick_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let terminal_tx = self.ingest_tx.clone();
        let terminal_session = session_id.to_string();
        let terminal_handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = terminal_tx
                .send(IngestEvent::ResetFired {
                    session_id: terminal_session,
                })
                .await;
        });

        self.timers.insert(
            session_id.to_string(),
            ResetTimer {
                tick_handle,
                terminal_handle,
            },
        );
    }

    /// Cancel the timer for `session_id`. Returns whether one existed.
    /// Tick and terminal handles are cleared in one step.
    pub fn cancel(&mut self, session_id: &str) -> bool {
        match self.timers.remove(session_id) {
            Some(timer) => {
                timer.abort();
                tracing::debug!(session_id, "reset timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Sweep every outstanding timer (session replacement or teardown)
    pub fn clear_all(&mut self) {
        for (session_id, timer) in self.timers.drain() {
            tracing::debug!(session_id, "reset timer cleared in sweep");
            timer.abort();
        }
    }

    pub fn has_timer(&self, session_id: &str) -> bool {
        self.timers.contains_key(session_id)
    }
}

impl Drop for SessionLifecycleScheduler {
    fn drop(&mut self) {
        self.clear_all();
    }
}
