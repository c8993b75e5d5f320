// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Failure guard
//
// Rate-limited, re-entrancy-safe error funnel. Error-handling code can itself
// raise errors; the guard drops re-entrant calls outright and opens a circuit
// breaker when errors flood in, so one bad channel cannot turn into an error
// storm that drowns the session loop.

use crate::types::{ErrorCategory, ErrorRecord};
use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum number of error records kept for diagnostics
const MAX_ERROR_RECORDS: usize = 100;

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Sliding window over which errors are counted
    pub window: Duration,
    /// Errors within the window that open the breaker
    pub threshold: usize,
    /// How long the breaker stays open
    pub cooldown: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            threshold: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// What the caller should do about an accepted error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Transport errors: ask the coordinator to renegotiate its channel
    RenegotiateChannel,
    /// Application errors: mark the session Failed (latch rules apply)
    MarkFailed,
    /// Protocol/Timeout errors: log only, no state mutation
    LogOnly,
}

/// Result of funnelling one error through the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Error accepted; caller performs the action, then calls
    /// [`FailureGuard::recovery_done`]
    Recover(RecoveryAction),
    /// A prior error is still being recovered from; dropped immediately
    DroppedReentrant,
    /// The window threshold was just exceeded; breaker is now open
    BreakerTripped,
    /// Breaker already open; counted in the diagnostic tally only
    DroppedBreakerOpen,
}

/// Re-entrancy-safe, rate-limited error funnel with a circuit breaker
pub struct FailureGuard {
    config: GuardConfig,
    /// Set while a recovery action is outstanding; re-entrant calls drop
    in_flight: bool,
    /// Timestamps of recent errors inside the sliding window
    window: VecDeque<Instant>,
    /// When the breaker opened, if it is open
    opened_at: Option<Instant>,
    /// Errors swallowed while the breaker was open
    suppressed: u64,
    /// Bounded recent history for diagnostics
    records: VecDeque<ErrorRecord>,
}

impl FailureGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            in_flight: false,
            window: VecDeque::new(),
            opened_at: None,
            suppressed: 0,
            records: VecDeque::new(),
        }
    }

    /// Funnel one error through the guard.
    pub fn handle(&mut self, category: ErrorCategory, message: &str) -> GuardOutcome {
        self.handle_at(Instant::now(), category, message)
    }

    /// Clock-explicit variant of [`handle`](Self::handle)
    pub fn handle_at(&mut self, now: Instant, category: ErrorCategory, message: &str) -> GuardOutcome {
        if self.in_flight {
            tracing::debug!(?category, "re-entrant error dropped: {message}");
            return GuardOutcome::DroppedReentrant;
        }

        // Breaker auto-closes on the first error evaluated after cooldown
        if let Some(opened) = self.opened_at {
            if now.duration_since(opened) < self.config.cooldown {
                self.suppressed += 1;
                self.record(category, message);
                tracing::debug!(
                    ?category,
                    suppressed = self.suppressed,
                    "breaker open, error suppressed: {message}"
                );
                return GuardOutcome::DroppedBreakerOpen;
            }
            tracing::info!(
                suppressed = self.suppressed,
                "breaker cooldown elapsed, resuming normal recovery"
            );
            self.opened_at = None;
            self.window.clear();
        }

        // Prune timestamps older than the window
        let cutoff = now.checked_sub(self.config.window);
        while let Some(front) = self.window.front() {
            match cutoff {
                Some(cutoff) if *front < cutoff => {
                    self.window.pop_front();
                }
                _ => break,
            }
        }

        if self.window.len() >= self.config.threshold {
            self.opened_at = Some(now);
            self.suppressed = 1;
            self.record(category, message);
            tracing::error!(
                ?category,
                threshold = self.config.threshold,
                "error rate exceeded threshold, breaker open for {:?}",
                self.config.cooldown
            );
            return GuardOutcome::BreakerTripped;
        }

        self.window.push_back(now);
        self.record(category, message);

        let action = match category {
            ErrorCategory::Transport => RecoveryAction::RenegotiateChannel,
            ErrorCategory::Application => RecoveryAction::MarkFailed,
            ErrorCategory::Protocol | ErrorCategory::Timeout => RecoveryAction::LogOnly,
        };
        tracing::warn!(?category, ?action, "error accepted: {message}");
        self.in_flight = true;
        GuardOutcome::Recover(action)
    }

    /// Signal that the recovery action returned by the last accepted error
    /// has finished. Clears the re-entrancy flag and, on success, marks the
    /// matching record as recovered.
    pub fn recovery_done(&mut self, recovered: bool) {
        self.in_flight = false;
        if recovered {
            if let Some(last) = self.records.front_mut() {
                last.recovered = true;
            }
        }
    }

    /// True while the breaker is open (cooldown check happens on the next
    /// `handle` call, not here)
    pub fn breaker_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Errors swallowed during the current/most recent open period
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Recent error history, most recent first
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }

    fn record(&mut self, category: ErrorCategory, message: &str) {
        self.records.push_front(ErrorRecord {
            category,
            message: message.to_string(),
            timestamp: Utc::now(),
            recovered: false,
        });
        if self.records.len() > MAX_ERROR_RECORDS {
            self.records.truncate(MAX_ERROR_RECORDS);
        }
    }
}

impl Default for FailureGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> FailureGuard {
        FailureGuard::new(GuardConfig::default())
    }

    #[test]
    fn test_categories_map_to_actions() {
        let mut g = guard();
        let base = Instant::now();
        assert_eq!(
            g.handle_at(base, ErrorCategory::Transport, "push dropped"),
            GuardOutcome::Recover(RecoveryAction::RenegotiateChannel)
        );
        g.recovery_done(true);
        assert_eq!(
            g.handle_at(base, ErrorCategory::Application, "remote failed"),
            GuardOutcome::Recover(RecoveryAction::MarkFailed)
        );
        g.recovery_done(false);
        assert_eq!(
            g.handle_at(base, ErrorCategory::Protocol, "bad shape"),
            GuardOutcome::Recover(RecoveryAction::LogOnly)
        );
        g.recovery_done(false);
        assert_eq!(
            g.handle_at(base, ErrorCategory::Timeout, "phase stalled"),
            GuardOutcome::Recover(RecoveryAction::LogOnly)
        );
    }

    #[test]
    fn test_reentrant_call_is_dropped() {
        let mut g = guard();
        let base = Instant::now();
        assert!(matches!(
            g.handle_at(base, ErrorCategory::Transport, "first"),
            GuardOutcome::Recover(_)
        ));
        // Recovery still outstanding: nested error must drop
        assert_eq!(
            g.handle_at(base, ErrorCategory::Transport, "nested"),
            GuardOutcome::DroppedReentrant
        );
        g.recovery_done(true);
        assert!(matches!(
            g.handle_at(base, ErrorCategory::Transport, "after"),
            GuardOutcome::Recover(_)
        ));
    }

    #[test]
    fn test_eleventh_error_in_window_trips_breaker() {
        let mut g = guard();
        let base = Instant::now();
        for i in 0..10 {
            let t = base + Duration::from_millis(i * 100);
            assert!(matches!(
                g.handle_at(t, ErrorCategory::Timeout, "spam"),
                GuardOutcome::Recover(_)
            ));
            g.recovery_done(false);
        }
        // 11th within the 5s window: trip
        assert_eq!(
            g.handle_at(base + Duration::from_secs(2), ErrorCategory::Timeout, "spam"),
            GuardOutcome::BreakerTripped
        );
        assert!(g.breaker_open());

        // 12th during cooldown: counted, not dispatched
        assert_eq!(
            g.handle_at(base + Duration::from_secs(3), ErrorCategory::Timeout, "spam"),
            GuardOutcome::DroppedBreakerOpen
        );
        assert_eq!(g.suppressed_count(), 2);

        // After cooldown elapses the next error is processed normally
        let later = base + Duration::from_secs(2) + Duration::from_secs(31);
        assert!(matches!(
            g.handle_at(later, ErrorCategory::Timeout, "fresh"),
            GuardOutcome::Recover(RecoveryAction::LogOnly)
        ));
        assert!(!g.breaker_open());
    }

    #[test]
    fn test_old_errors_pruned_from_window() {
        let mut g = guard();
        let base = Instant::now();
        // 10 errors, but spread over more than the 5s window
        for i in 0..10 {
            let t = base + Duration::from_secs(i);
            assert!(matches!(
                g.handle_at(t, ErrorCategory::Timeout, "slow drip"),
                GuardOutcome::Recover(_)
            ));
            g.recovery_done(false);
        }
        // Only the last ~5 are still inside the window: no trip
        assert!(matches!(
            g.handle_at(base + Duration::from_secs(10), ErrorCategory::Timeout, "more"),
            GuardOutcome::Recover(_)
        ));
        assert!(!g.breaker_open());
    }

    #[test]
    fn test_record_ring_is_bounded() {
        let mut g = guard();
        let base = Instant::now();
        for i in 0..250u64 {
            // Spread out so the breaker never trips
            let t = base + Duration::from_secs(i * 10);
            g.handle_at(t, ErrorCategory::Protocol, "noise");
            g.recovery_done(false);
        }
        assert_eq!(g.recent_errors().len(), MAX_ERROR_RECORDS);
    }

    #[test]
    fn test_recovery_done_marks_record() {
        let mut g = guard();
        g.handle_at(Instant::now(), ErrorCategory::Transport, "drop");
        g.recovery_done(true);
        let records = g.recent_errors();
        assert!(records[0].recovered);
    }
}
