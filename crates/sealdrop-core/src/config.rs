// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Tracker configuration
//
// Tuning knobs and the phase weight table are loaded once from a local JSON
// file. On any failure the built-in defaults apply; the tracker never refuses
// to start over configuration.

use crate::phase::PhaseTable;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Tracker tuning, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    /// Fastest poll cadence (default: 2000)
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_interval_ms: u64,
    /// Slowest poll cadence after backoff (default: 10000)
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_interval_ms: u64,
    /// Idle polls before the interval starts growing (default: 3)
    #[serde(default = "default_idle_polls")]
    pub idle_polls_before_backoff: u32,
    /// Fixed cadence of the receipt-confirmation poll (default: 1000)
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_interval_ms: u64,
    /// Cadence of background push-reconnect attempts (default: 5000)
    #[serde(default = "default_reconnect_ms")]
    pub push_reconnect_interval_ms: u64,
    /// Overall percent at which the receipt poll engages (default: 90)
    #[serde(default = "default_receipt_threshold")]
    pub receipt_poll_threshold_percent: f64,
    /// Seconds between a terminal state and the automatic reset (default: 10)
    #[serde(default = "default_reset_delay")]
    pub reset_delay_secs: u64,
    /// Breaker: sliding window in seconds (default: 5)
    #[serde(default = "default_breaker_window")]
    pub breaker_window_secs: u64,
    /// Breaker: errors within the window that open it (default: 10)
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: usize,
    /// Breaker: cooldown in seconds while open (default: 30)
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
    /// Phase weight table; the built-in table when absent
    #[serde(default)]
    pub phase_table: PhaseTable,
}

fn default_min_poll_ms() -> u64 {
    2000
}

fn default_max_poll_ms() -> u64 {
    10000
}

fn default_idle_polls() -> u32 {
    3
}

fn default_receipt_poll_ms() -> u64 {
    1000
}

fn default_reconnect_ms() -> u64 {
    5000
}

fn default_receipt_threshold() -> f64 {
    90.0
}

fn default_reset_delay() -> u64 {
    10
}

fn default_breaker_window() -> u64 {
    5
}

fn default_breaker_threshold() -> usize {
    10
}

fn default_breaker_cooldown() -> u64 {
    30
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: default_min_poll_ms(),
            max_poll_interval_ms: default_max_poll_ms(),
            idle_polls_before_backoff: default_idle_polls(),
            receipt_poll_interval_ms: default_receipt_poll_ms(),
            push_reconnect_interval_ms: default_reconnect_ms(),
            receipt_poll_threshold_percent: default_receipt_threshold(),
            reset_delay_secs: default_reset_delay(),
            breaker_window_secs: default_breaker_window(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            phase_table: PhaseTable::default(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from the user config directory, falling back to
    /// defaults if the file is missing, unreadable, or invalid.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::config_path() else {
            tracing::info!("No config directory available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::info!("No tracker config file found, using defaults");
            return Self::default();
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Failed to read tracker config, using defaults: {}", e);
                return Self::default();
            }
        };

        let config: Self = match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse tracker config, using defaults: {}", e);
                return Self::default();
            }
        };

        if let Err(e) = config.phase_table.validate() {
            tracing::warn!("Invalid phase table in config, using built-in: {}", e);
            return Self {
                phase_table: PhaseTable::default(),
                ..config
            };
        }

        tracing::info!("Loaded tracker config from {:?}", path);
        config
    }

    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "sealdrop", "tracker")
            .map(|dirs| dirs.config_dir().join("tracker.json"))
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn push_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.push_reconnect_interval_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs(self.reset_delay_secs)
    }
}
