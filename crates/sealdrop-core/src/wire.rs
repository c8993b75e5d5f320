// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Wire payload shapes and normalization
//
// Inbound messages arrive as already-parsed JSON values from the transport
// glue. Each channel has its own shape; everything is normalized into the
// channel-agnostic ProgressEvent / TerminalSignal vocabulary before it
// reaches the session loop. Malformed payloads surface as protocol errors.

use crate::reconcile::TerminalSignal;
use crate::types::{EventSource, ProgressEvent, TrackerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inner payload of a push progress message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushProgressData {
    #[serde(default)]
    pub message: Option<String>,
    /// Progress within the current phase, 0..1
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Push progress: `{ job_id, phase, data: { message, progress }, timestamp }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushProgress {
    #[serde(default)]
    pub job_id: Option<String>,
    pub phase: String,
    pub data: PushProgressData,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Terminal event kinds the push channel emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushTerminalKind {
    #[serde(rename = "file_received")]
    FileReceived,
    #[serde(rename = "transfer_completed")]
    TransferCompleted,
}

/// Inner payload of a push terminal message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTerminalData {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Push terminal/receipt: `{ event_type, data: { filename, status, ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTerminal {
    pub event_type: PushTerminalKind,
    pub data: PushTerminalData,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Any message delivered over the push channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushMessage {
    // Terminal first: its `event_type` discriminates unambiguously
    Terminal(PushTerminal),
    Progress(PushProgress),
}

/// One event inside a poll status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollEvent {
    pub phase: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Progress within the phase, 0..1
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Poll status: `{ isConnected, backing_up, events: [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollStatus {
    #[serde(rename = "isConnected")]
    pub is_connected: bool,
    #[serde(default)]
    pub backing_up: bool,
    #[serde(default)]
    pub events: Vec<PollEvent>,
}

/// Receipt check: `{ success, received, filename, size, hash }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptCheck {
    pub success: bool,
    #[serde(default)]
    pub received: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Normalized output of one wire message
#[derive(Debug, Clone)]
pub enum WireSignal {
    Progress(ProgressEvent),
    Terminal(TerminalSignal),
}

/// Parse a raw push payload. Shape violations are protocol errors.
pub fn parse_push(value: serde_json::Value) -> Result<PushMessage, TrackerError> {
    serde_json::from_value(value)
        .map_err(|e| TrackerError::Protocol(format!("malformed push message: {e}")))
}

/// Normalize a push message into wire signals
pub fn normalize_push(msg: PushMessage) -> Vec<WireSignal> {
    match msg {
        PushMessage::Progress(p) => {
            vec![WireSignal::Progress(ProgressEvent {
                source: EventSource::Push,
                phase: Some(p.phase),
                raw_local_progress: p.data.progress,
                transferred_bytes: None,
                timestamp: p.timestamp.unwrap_or_else(Utc::now),
            })]
        }
        PushMessage::Terminal(t) => {
            let failed = t
                .data
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("error"));
            let signal = if failed {
                TerminalSignal::ApplicationFailed
            } else {
                // Both terminal kinds carry the remote's own verification
                // (size/hash), so they count as receipt-grade confirmations.
                TerminalSignal::ReceiptConfirmed
            };
            vec![WireSignal::Terminal(signal)]
        }
    }
}

/// Normalize a poll status response into wire signals.
/// Returns the signals plus whether the response carried any activity
/// (used by the adaptive interval).
pub fn normalize_poll(status: PollStatus) -> (Vec<WireSignal>, bool) {
    let had_activity = !status.events.is_empty();
    let signals = status
        .events
        .into_iter()
        .map(|e| {
            WireSignal::Progress(ProgressEvent {
                source: EventSource::Poll,
                phase: Some(e.phase),
                raw_local_progress: e.progress,
                transferred_bytes: None,
                timestamp: Utc::now(),
            })
        })
        .collect();
    (signals, had_activity)
}

/// Normalize a receipt check. Only a verified receipt produces a signal.
pub fn normalize_receipt(check: ReceiptCheck) -> Option<WireSignal> {
    if check.success && check.received {
        Some(WireSignal::Terminal(TerminalSignal::ReceiptConfirmed))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_push_progress() {
        let msg = parse_push(json!({
            "job_id": "j-42",
            "phase": "TRANSFERRING",
            "data": { "message": "uploading", "progress": 0.5 },
            "timestamp": "2026-08-29T12:00:00Z"
        }))
        .unwrap();

        let signals = normalize_push(msg);
        assert_eq!(signals.len(), 1);
        match &signals[0] {
            WireSignal::Progress(event) => {
                assert_eq!(event.source, EventSource::Push);
                assert_eq!(event.phase.as_deref(), Some("TRANSFERRING"));
                assert_eq!(event.raw_local_progress, Some(0.5));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn test_parse_push_terminal_completed() {
        let msg = parse_push(json!({
            "event_type": "transfer_completed",
            "data": { "filename": "a.bin", "status": "ok", "size": 9, "hash": "ab", "duration": 1.5 }
        }))
        .unwrap();

        let signals = normalize_push(msg);
        assert!(matches!(
            signals[0],
            WireSignal::Terminal(TerminalSignal::ReceiptConfirmed)
        ));
    }

    #[test]
    fn test_push_terminal_failed_status() {
        let msg = parse_push(json!({
            "event_type": "file_received",
            "data": { "status": "FAILED" }
        }))
        .unwrap();

        let signals = normalize_push(msg);
        assert!(matches!(
            signals[0],
            WireSignal::Terminal(TerminalSignal::ApplicationFailed)
        ));
    }

    #[test]
    fn test_malformed_push_is_protocol_error() {
        let err = parse_push(json!({ "data": 7 })).unwrap_err();
        assert!(matches!(err, TrackerError::Protocol(_)));
    }

    #[test]
    fn test_normalize_poll_activity() {
        let status = PollStatus {
            is_connected: true,
            backing_up: true,
            events: vec![PollEvent {
                phase: "ENCRYPTING".to_string(),
                data: None,
                progress: Some(0.25),
            }],
        };
        let (signals, active) = normalize_poll(status);
        assert!(active);
        assert_eq!(signals.len(), 1);

        let idle = PollStatus {
            is_connected: true,
            backing_up: false,
            events: vec![],
        };
        let (signals, active) = normalize_poll(idle);
        assert!(!active);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_receipt_requires_success_and_received() {
        let confirmed = ReceiptCheck {
            success: true,
            received: true,
            filename: Some("a.bin".to_string()),
            size: Some(9),
            hash: Some("ab".to_string()),
        };
        assert!(matches!(
            normalize_receipt(confirmed),
            Some(WireSignal::Terminal(TerminalSignal::ReceiptConfirmed))
        ));

        let pending = ReceiptCheck {
            success: true,
            received: false,
            filename: None,
            size: None,
            hash: None,
        };
        assert!(normalize_receipt(pending).is_none());
    }
}
