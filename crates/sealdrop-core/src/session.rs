// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Session manager
//
// Top-level orchestrator. Owns the single active TransferSession and drains
// one serialized ingestion queue: every inbound signal (transport events,
// timer fires, user control actions) is enqueued and processed one at a
// time, so no interleaved partial update can corrupt the session and bursts
// cannot recurse. External renderers only ever see clones, via the broadcast
// subscription or the snapshot watch.

use crate::config::TrackerConfig;
use crate::failure::{FailureGuard, GuardConfig, GuardOutcome, RecoveryAction};
use crate::phase::PhaseCursor;
use crate::reconcile::{self, Reduction, TerminalSignal};
use crate::scheduler::SessionLifecycleScheduler;
use crate::transport::CoordinatorCommand;
use crate::types::{
    ErrorCategory, ErrorRecord, ProgressEvent, SessionConfig, SessionStatus, TrackerError,
    TransferSession,
};
use async_channel::{Receiver, Sender};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything that enters the serialized ingestion queue
#[derive(Debug)]
pub enum IngestEvent {
    /// User control: start (and replace) the tracked session
    StartSession {
        config: SessionConfig,
        reply: Sender<Result<String, TrackerError>>,
    },
    /// Normalized progress from any transport channel
    Progress(ProgressEvent),
    /// Normalized terminal signal from any transport channel
    Terminal(TerminalSignal),
    /// Channel-level error, funnelled through the failure guard
    ChannelError {
        category: ErrorCategory,
        message: String,
    },
    /// Per-second reset countdown tick (delegated outward for display)
    CountdownTick {
        session_id: String,
        remaining_seconds: u64,
    },
    /// The reset countdown elapsed for `session_id`
    ResetFired { session_id: String },
    /// User control: abort the pending reset countdown
    CancelReset { reply: Sender<bool> },
    /// Wire the transport command channel in after coordinator spawn
    AttachTransport(Sender<CoordinatorCommand>),
    /// Read the bounded error history
    Diagnostics { reply: Sender<Vec<ErrorRecord>> },
    Shutdown,
}

/// Updates fanned out to subscribers (the external UI layer)
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Started(TransferSession),
    Progress(TransferSession),
    Completed(TransferSession),
    Failed(TransferSession),
    ResetCountdown {
        session_id: String,
        remaining_seconds: u64,
    },
    Reset { session_id: String },
}

/// Handle to the spawned session worker
pub struct SessionManager {
    ingest_tx: Sender<IngestEvent>,
    updates_tx: broadcast::Sender<SessionUpdate>,
    session_rx: watch::Receiver<Option<TransferSession>>,
    join: JoinHandle<()>,
}

impl SessionManager {
    /// Spawn the worker loop. Wire a coordinator afterwards with
    /// [`ingest_sender`](Self::ingest_sender) /
    /// [`session_watch`](Self::session_watch) /
    /// [`attach_transport`](Self::attach_transport).
    pub fn spawn(config: TrackerConfig) -> Self {
        let (ingest_tx, ingest_rx) = async_channel::bounded(64);
        let (updates_tx, _) = broadcast::channel(100);
        let (watch_tx, session_rx) = watch::channel(None);

        let worker = SessionWorker {
            guard: FailureGuard::new(GuardConfig {
                window: Duration::from_secs(config.breaker_window_secs),
                threshold: config.breaker_threshold,
                cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            }),
            scheduler: SessionLifecycleScheduler::new(ingest_tx.clone()),
            config,
            session: None,
            cursor: PhaseCursor::new(),
            updates_tx: updates_tx.clone(),
            watch_tx,
            transport_commands: None,
            last_sample: None,
        };
        let join = tokio::spawn(worker.run(ingest_rx));

        Self {
            ingest_tx,
            updates_tx,
            session_rx,
            join,
        }
    }

    /// Start a new session from a validated descriptor, replacing any
    /// previous one. Outstanding timers for the old session are swept first.
    pub async fn start_session(&self, config: SessionConfig) -> Result<String, TrackerError> {
        config.validate()?;
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        self.ingest_tx
            .send(IngestEvent::StartSession {
                config,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TrackerError::ChannelClosed)?;
        reply_rx.recv().await.map_err(|_| TrackerError::ChannelClosed)?
    }

    /// Ingest a raw push-format payload directly (transport glue entry
    /// point for hosts that bypass the coordinator).
    pub async fn on_event(&self, raw: serde_json::Value) -> Result<(), TrackerError> {
        let events = match crate::wire::parse_push(raw) {
            Ok(msg) => crate::wire::normalize_push(msg)
                .into_iter()
                .map(|signal| match signal {
                    crate::wire::WireSignal::Progress(p) => IngestEvent::Progress(p),
                    crate::wire::WireSignal::Terminal(t) => IngestEvent::Terminal(t),
                })
                .collect::<Vec<_>>(),
            Err(e) => vec![IngestEvent::ChannelError {
                category: ErrorCategory::Protocol,
                message: e.to_string(),
            }],
        };
        for event in events {
            self.ingest_tx
                .send(event)
                .await
                .map_err(|_| TrackerError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Immutable copy of the current session, if any
    pub fn snapshot(&self) -> Option<TransferSession> {
        self.session_rx.borrow().clone()
    }

    /// Subscribe to session updates; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates_tx.subscribe()
    }

    /// Abort the pending post-completion reset. Returns whether a countdown
    /// was actually cancelled.
    pub async fn cancel_reset(&self) -> bool {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        if self
            .ingest_tx
            .send(IngestEvent::CancelReset { reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.recv().await.unwrap_or(false)
    }

    /// Bounded recent error history for diagnostics
    pub async fn recent_errors(&self) -> Vec<ErrorRecord> {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        if self
            .ingest_tx
            .send(IngestEvent::Diagnostics { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.recv().await.unwrap_or_default()
    }

    /// Queue sender for the transport coordinator
    pub fn ingest_sender(&self) -> Sender<IngestEvent> {
        self.ingest_tx.clone()
    }

    /// Snapshot watch for the transport coordinator's receipt window
    pub fn session_watch(&self) -> watch::Receiver<Option<TransferSession>> {
        self.session_rx.clone()
    }

    /// Give the worker the coordinator's command channel so transport
    /// recovery can request channel renegotiation
    pub async fn attach_transport(&self, commands: Sender<CoordinatorCommand>) {
        let _ = self
            .ingest_tx
            .send(IngestEvent::AttachTransport(commands))
            .await;
    }

    /// Stop the worker, sweeping every outstanding timer
    pub async fn shutdown(self) {
        let _ = self.ingest_tx.send(IngestEvent::Shutdown).await;
        let _ = self.join.await;
    }
}

/// The loop that owns and mutates the session
struct SessionWorker {
    config: TrackerConfig,
    session: Option<TransferSession>,
    cursor: PhaseCursor,
    guard: FailureGuard,
    scheduler: SessionLifecycleScheduler,
    updates_tx: broadcast::Sender<SessionUpdate>,
    watch_tx: watch::Sender<Option<TransferSession>>,
    transport_commands: Option<Sender<CoordinatorCommand>>,
    /// (when, transferred bytes) of the last byte-bearing sample
    last_sample: Option<(Instant, u64)>,
}

impl SessionWorker {
    async fn run(mut self, ingest_rx: Receiver<IngestEvent>) {
        while let Ok(event) = ingest_rx.recv().await {
            if !self.process(event).await {
                break;
            }
        }
        self.scheduler.clear_all();
        tracing::debug!("session worker stopped");
    }

    async fn process(&mut self, event: IngestEvent) -> bool {
        match event {
            IngestEvent::StartSession { config, reply } => {
                let id = self.start_session(config);
                let _ = reply.send(Ok(id)).await;
            }
            IngestEvent::Progress(progress) => self.apply_progress(progress),
            IngestEvent::Terminal(signal) => self.apply_terminal(signal),
            IngestEvent::ChannelError { category, message } => {
                self.handle_error(category, &message).await;
            }
            IngestEvent::CountdownTick {
                session_id,
                remaining_seconds,
            } => {
                if self.active_id() == Some(session_id.as_str()) {
                    let _ = self.updates_tx.send(SessionUpdate::ResetCountdown {
                        session_id,
                        remaining_seconds,
                    });
                }
            }
            IngestEvent::ResetFired { session_id } => self.apply_reset(&session_id),
            IngestEvent::CancelReset { reply } => {
                let active = self.session.as_ref().map(|s| s.id.clone());
                let cancelled = match active {
                    Some(id) => self.scheduler.cancel(&id),
                    None => false,
                };
                let _ = reply.send(cancelled).await;
            }
            IngestEvent::AttachTransport(commands) => {
                self.transport_commands = Some(commands);
            }
            IngestEvent::Diagnostics { reply } => {
                let _ = reply.send(self.guard.recent_errors()).await;
            }
            IngestEvent::Shutdown => return false,
        }
        true
    }

    fn active_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    /// User control action: replaces the session, so every old timer is
    /// swept before the new one exists.
    fn start_session(&mut self, config: SessionConfig) -> String {
        self.scheduler.clear_all();
        let id = config
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!(session_id = %id, filename = %config.filename, "session started");

        let session = TransferSession::new(id.clone(), config.total_bytes);
        self.session = Some(session.clone());
        self.cursor = PhaseCursor::new();
        self.last_sample = None;
        self.publish(SessionUpdate::Started(session));
        id
    }

    fn apply_progress(&mut self, event: ProgressEvent) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("progress event with no active session, dropped");
            return;
        };
        if session.completion_latched {
            tracing::debug!(session_id = %session.id, "progress after latch, dropped");
            return;
        }

        let table = &self.config.phase_table;
        let mut final_phase_done = false;

        if let Some(phase) = event.phase.as_deref() {
            self.cursor.observe(table, phase);
            let local = event.raw_local_progress.unwrap_or(0.0);
            let outcome = table.compute_overall(phase, local);

            session.phase = phase.to_string();
            match outcome.percent {
                Some(percent) => {
                    // Monotonic invariant: only ever raise the percent
                    session.progress_percent = session.progress_percent.max(percent);
                    session.eta_seconds = outcome.eta_seconds;
                }
                None => {
                    tracing::debug!(phase, "unknown phase, percent held, ETA unknown");
                    session.eta_seconds = None;
                }
            }

            // During the byte-moving phase, estimate transferred bytes from
            // local progress when the wire does not carry a byte count
            if event.transferred_bytes.is_none() && phase == "TRANSFERRING" {
                let estimated = (session.total_bytes as f64 * local.clamp(0.0, 1.0)) as u64;
                session.transferred_bytes = session.transferred_bytes.max(estimated);
            }

            final_phase_done = table.is_final_phase(phase) && local >= 1.0;
        }

        if let Some(bytes) = event.transferred_bytes {
            session.transferred_bytes = session.transferred_bytes.max(bytes);
        }

        // Speed from byte deltas between samples
        let now = Instant::now();
        let bytes_now = session.transferred_bytes;
        if let Some((t0, b0)) = self.last_sample {
            let dt = now.duration_since(t0).as_secs_f64();
            if dt > 0.0 && bytes_now > b0 {
                session.speed_bps = ((bytes_now - b0) as f64 / dt) as u64;
            }
        }
        self.last_sample = Some((now, bytes_now));

        let snapshot = session.clone();
        self.publish(SessionUpdate::Progress(snapshot));

        if final_phase_done {
            self.apply_terminal(TerminalSignal::PhaseTerminal);
        }
    }

    fn apply_terminal(&mut self, signal: TerminalSignal) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(?signal, "terminal signal with no active session, dropped");
            return;
        };

        if reconcile::reduce(session, signal) == Reduction::Ignored {
            return;
        }

        let snapshot = session.clone();
        let id = snapshot.id.clone();
        let update = match snapshot.status {
            SessionStatus::Completed => SessionUpdate::Completed(snapshot),
            SessionStatus::Failed => SessionUpdate::Failed(snapshot),
            SessionStatus::Active => SessionUpdate::Progress(snapshot),
        };

        // Terminal state reached (or overwritten): (re)start the countdown
        self.scheduler.schedule_reset(&id, self.config.reset_delay());
        self.publish(update);
    }

    async fn handle_error(&mut self, category: ErrorCategory, message: &str) {
        match self.guard.handle(category, message) {
            GuardOutcome::Recover(action) => {
                let recovered = match action {
                    RecoveryAction::RenegotiateChannel => self.request_renegotiation(),
                    RecoveryAction::MarkFailed => {
                        let before = self.session.as_ref().map(|s| s.status);
                        self.apply_terminal(TerminalSignal::ApplicationFailed);
                        self.session.as_ref().map(|s| s.status) != before
                            || before == Some(SessionStatus::Failed)
                    }
                    RecoveryAction::LogOnly => false,
                };
                self.guard.recovery_done(recovered);
            }
            GuardOutcome::BreakerTripped => {
                tracing::error!("failure guard breaker tripped, recovery suspended");
            }
            GuardOutcome::DroppedReentrant | GuardOutcome::DroppedBreakerOpen => {}
        }
    }

    /// Ask the coordinator to renegotiate its push channel. Non-blocking:
    /// under pressure the request is dropped rather than wedging the loop.
    fn request_renegotiation(&mut self) -> bool {
        match &self.transport_commands {
            Some(commands) => match commands.try_send(CoordinatorCommand::Renegotiate) {
                Ok(()) => true,
                Err(_) => {
                    tracing::warn!("transport command queue full, renegotiation request dropped");
                    false
                }
            },
            None => {
                tracing::debug!("no transport attached, renegotiation request dropped");
                false
            }
        }
    }

    /// Terminal reset fire. Stale fires (id mismatch) are rejected: a timer
    /// bound to session S must never touch a different session.
    fn apply_reset(&mut self, session_id: &str) {
        match self.session.as_ref() {
            Some(session) if session.id == session_id => {
                tracing::info!(session_id, "reset countdown elapsed, clearing session");
                self.scheduler.cancel(session_id);
                self.session = None;
                self.last_sample = None;
                self.watch_tx.send_replace(None);
                let _ = self.updates_tx.send(SessionUpdate::Reset {
                    session_id: session_id.to_string(),
                });
            }
            _ => {
                tracing::warn!(session_id, "stale reset fire rejected (session moved on)");
                self.scheduler.cancel(session_id);
            }
        }
    }

    fn publish(&self, update: SessionUpdate) {
        self.watch_tx.send_replace(self.session.clone());
        let _ = self.updates_tx.send(update);
    }
}
