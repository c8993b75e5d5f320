// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Phase progress model
//
// Converts (phase, local progress) into an overall percent and ETA using a
// calibrated weight table. Pure functions over immutable configuration; the
// monotonic-percent invariant itself is enforced by the session reducer.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Calibrated expected duration of a full transfer, in seconds.
/// Used as the ETA baseline when no external calibration is configured.
pub const DEFAULT_TOTAL_DURATION_SECS: u64 = 90;

/// One configured phase of the transfer pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDefinition {
    pub name: String,
    /// Fraction of total expected duration, all weights sum to 1.0
    pub weight: f64,
    /// Inclusive [start, end] sanity bound on the overall percent, 0..100
    pub progress_range: (f64, f64),
    pub description: String,
}

/// Result of one overall-progress computation
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    /// `None` when the phase is unknown: the caller keeps its last percent
    pub percent: Option<f64>,
    /// `None` when no calibration baseline exists; never a stale number
    pub eta_seconds: Option<u64>,
    pub description: String,
}

/// Immutable phase weight table, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTable {
    pub phases: Vec<PhaseDefinition>,
    /// Calibrated total duration in seconds for ETA estimation
    pub total_duration_secs: u64,
}

impl Default for PhaseTable {
    fn default() -> Self {
        let phase = |name: &str, weight: f64, range: (f64, f64), desc: &str| PhaseDefinition {
            name: name.to_string(),
            weight,
            progress_range: range,
            description: desc.to_string(),
        };

        Self {
            phases: vec![
                phase("CONNECTING", 0.10, (0.0, 10.0), "Connecting to server"),
                phase("HANDSHAKE", 0.10, (10.0, 20.0), "Negotiating secure channel"),
                phase("ENCRYPTING", 0.35, (20.0, 55.0), "Encrypting file"),
                phase("TRANSFERRING", 0.35, (55.0, 90.0), "Uploading encrypted data"),
                phase("VERIFYING", 0.08, (90.0, 98.0), "Verifying receipt"),
                phase("FINALIZING", 0.02, (98.0, 100.0), "Finalizing"),
            ],
            total_duration_secs: DEFAULT_TOTAL_DURATION_SECS,
        }
    }
}

impl PhaseTable {
    /// Check table consistency: weights sum to 1.0, ranges inside 0..100.
    pub fn validate(&self) -> Result<(), String> {
        if self.phases.is_empty() {
            return Err("phase table is empty".to_string());
        }
        let sum: f64 = self.phases.iter().map(|p| p.weight).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("phase weights sum to {sum}, expected 1.0"));
        }
        for p in &self.phases {
            let (start, end) = p.progress_range;
            if !(0.0..=100.0).contains(&start) || !(0.0..=100.0).contains(&end) || start > end {
                return Err(format!("phase {} has invalid range [{start},{end}]", p.name));
            }
        }
        Ok(())
    }

    /// Index of a phase by its wire token
    pub fn index_of(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == phase)
    }

    /// Is this the last configured phase (its completion implies the
    /// operation is done)?
    pub fn is_final_phase(&self, phase: &str) -> bool {
        self.index_of(phase)
            .is_some_and(|i| i == self.phases.len() - 1)
    }

    /// Compute overall percent and ETA for a phase at a local progress
    /// fraction (0..1).
    ///
    /// percent = sum of weights strictly before the phase, plus the phase
    /// weight scaled by local progress, clamped to the phase's configured
    /// range as a sanity bound. ETA is the calibrated total duration scaled
    /// by the weight fraction still remaining.
    ///
    /// Unknown phase: percent is `None` (caller keeps its last value), ETA
    /// is unknown, and the description falls back to the raw token.
    pub fn compute_overall(&self, phase: &str, local_progress: f64) -> PhaseOutcome {
        let Some(index) = self.index_of(phase) else {
            return PhaseOutcome {
                percent: None,
                eta_seconds: None,
                description: phase.to_string(),
            };
        };

        let local = local_progress.clamp(0.0, 1.0);
        let def = &self.phases[index];
        let preceding: f64 = self.phases[..index].iter().map(|p| p.weight).sum();

        let raw_percent = preceding * 100.0 + def.weight * local * 100.0;
        let (range_start, range_end) = def.progress_range;
        let percent = raw_percent.clamp(range_start, range_end);

        let completed_fraction = preceding + def.weight * local;
        let eta = (self.total_duration_secs as f64 * (1.0 - completed_fraction))
            .round()
            .max(0.0) as u64;

        PhaseOutcome {
            percent: Some(percent),
            eta_seconds: Some(eta),
            description: def.description.clone(),
        }
    }
}

/// Tracks the last-seen phase to detect regressions (a retry reporting an
/// earlier phase). Regression resets the ETA baseline timestamp but never
/// lowers the reported percent.
#[derive(Debug)]
pub struct PhaseCursor {
    last_index: Option<usize>,
    phase_started_at: Instant,
}

impl PhaseCursor {
    pub fn new() -> Self {
        Self {
            last_index: None,
            phase_started_at: Instant::now(),
        }
    }

    /// Record an observed phase. Returns true when the phase regressed
    /// relative to the last observation.
    pub fn observe(&mut self, table: &PhaseTable, phase: &str) -> bool {
        let Some(index) = table.index_of(phase) else {
            return false;
        };

        let regressed = self.last_index.is_some_and(|last| index < last);
        if regressed {
            tracing::warn!(
                phase,
                "phase regressed (retry?); resetting ETA baseline, percent held"
            );
            self.phase_started_at = Instant::now();
        } else if self.last_index != Some(index) {
            self.phase_started_at = Instant::now();
        }
        self.last_index = Some(index);
        regressed
    }

    pub fn phase_started_at(&self) -> Instant {
        self.phase_started_at
    }
}

impl Default for PhaseCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = PhaseTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.phases.len(), 6);
    }

    #[test]
    fn test_worked_example_transferring_at_half() {
        // CONNECTING fully elapsed, then TRANSFERRING at local 0.5:
        // preceding weights 0.55, plus 0.35 * 0.5 => 72.5 overall.
        let table = PhaseTable::default();
        let outcome = table.compute_overall("TRANSFERRING", 0.5);
        let percent = outcome.percent.unwrap();
        assert!((percent - 72.5).abs() < 1e-9, "got {percent}");
    }

    #[test]
    fn test_percent_clamped_to_phase_range() {
        let mut table = PhaseTable::default();
        // Force a mismatched range so the clamp engages
        table.phases[3].progress_range = (55.0, 60.0);
        let outcome = table.compute_overall("TRANSFERRING", 1.0);
        assert_eq!(outcome.percent, Some(60.0));
    }

    #[test]
    fn test_unknown_phase_keeps_percent_and_eta_unknown() {
        let table = PhaseTable::default();
        let outcome = table.compute_overall("DEFRAGMENTING", 0.3);
        assert_eq!(outcome.percent, None);
        assert_eq!(outcome.eta_seconds, None);
        assert_eq!(outcome.description, "DEFRAGMENTING");
    }

    #[test]
    fn test_eta_scales_with_remaining_weight() {
        let table = PhaseTable::default();
        let start = table.compute_overall("CONNECTING", 0.0);
        assert_eq!(start.eta_seconds, Some(90));

        let mid = table.compute_overall("TRANSFERRING", 0.5);
        // remaining weight fraction = 1 - 0.725 = 0.275 => ~25s of 90s
        assert_eq!(mid.eta_seconds, Some(25));

        let done = table.compute_overall("FINALIZING", 1.0);
        assert_eq!(done.eta_seconds, Some(0));
    }

    #[test]
    fn test_local_progress_clamped() {
        let table = PhaseTable::default();
        let over = table.compute_overall("CONNECTING", 1.7);
        assert_eq!(over.percent, Some(10.0));
        let under = table.compute_overall("CONNECTING", -0.2);
        assert_eq!(under.percent, Some(0.0));
    }

    #[test]
    fn test_cursor_detects_regression() {
        let table = PhaseTable::default();
        let mut cursor = PhaseCursor::new();
        assert!(!cursor.observe(&table, "CONNECTING"));
        assert!(!cursor.observe(&table, "TRANSFERRING"));
        assert!(cursor.observe(&table, "HANDSHAKE"));
        // Unknown phases are ignored by the cursor
        assert!(!cursor.observe(&table, "???"));
    }

    #[test]
    fn test_final_phase_detection() {
        let table = PhaseTable::default();
        assert!(table.is_final_phase("FINALIZING"));
        assert!(!table.is_final_phase("VERIFYING"));
        assert!(!table.is_final_phase("nope"));
    }
}
