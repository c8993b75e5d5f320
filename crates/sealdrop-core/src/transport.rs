// SPDX-License-Identifier: AGPL-3.0
// Sealdrop Core - Transport coordinator
//
// Owns the push channel and the adaptive poll fallback, normalizing every
// raw message into the single ingestion queue. Push is preferred; on
// disconnect the coordinator polls on an adaptive interval while trying to
// renegotiate push in the background. A separate receipt poll runs on a
// fixed short cadence once the watched session enters its terminal-pending
// window, purely to catch a definitive completion the other channels missed.

use crate::config::TrackerConfig;
use crate::session::IngestEvent;
use crate::types::{
    ConnectionState, ErrorCategory, SessionStatus, StatusChannel, TrackerError, TransferSession,
};
use crate::wire::{self, PollStatus, ReceiptCheck, WireSignal};
use async_channel::{Receiver, Sender};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Raw events delivered by the external push-channel glue
#[derive(Debug, Clone)]
pub enum PushEvent {
    Connected,
    Disconnected,
    Message(serde_json::Value),
}

/// Commands accepted by a running coordinator
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Host visibility changed; hidden tabs poll at half rate
    SetVisibility { hidden: bool },
    /// Attempt push-channel renegotiation now (failure-guard recovery)
    Renegotiate,
    Shutdown,
}

/// Request/response transports backing the poll channels.
/// Implemented by the external HTTP glue; tests supply mocks.
pub trait PollTransport: Send + 'static {
    /// Fetch the current remote status (poll fallback channel)
    fn poll_status(&mut self) -> impl Future<Output = Result<PollStatus, TrackerError>> + Send;
    /// Ask the remote whether it has verified receipt of the file
    fn check_receipt(&mut self) -> impl Future<Output = Result<ReceiptCheck, TrackerError>> + Send;
    /// Attempt one push-channel renegotiation
    fn reconnect_push(&mut self) -> impl Future<Output = Result<(), TrackerError>> + Send;
}

/// Which transport currently delivers status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    PushActive,
    PollFallback,
}

/// Adaptive poll cadence: fast while status is moving, backed off toward the
/// cap after consecutive idle polls, halved-rate while the tab is hidden.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    idle_threshold: u32,
    current: Duration,
    consecutive_idle: u32,
    hidden: bool,
}

impl AdaptiveInterval {
    pub fn new(min: Duration, max: Duration, idle_threshold: u32) -> Self {
        Self {
            min,
            max,
            idle_threshold,
            current: min,
            consecutive_idle: 0,
            hidden: false,
        }
    }

    /// A phase/progress change arrived on any channel: collapse to the floor
    pub fn on_activity(&mut self) {
        self.consecutive_idle = 0;
        self.current = self.min;
    }

    /// A poll returned with no change
    pub fn on_idle_poll(&mut self) {
        self.consecutive_idle += 1;
        if self.consecutive_idle >= self.idle_threshold {
            self.current = self.current.mul_f64(1.5).min(self.max);
        }
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn consecutive_idle(&self) -> u32 {
        self.consecutive_idle
    }

    /// The interval to actually sleep for
    pub fn effective(&self) -> Duration {
        if self.hidden {
            (self.current * 2).min(self.max)
        } else {
            self.current
        }
    }
}

/// Handle to a spawned coordinator
pub struct CoordinatorHandle {
    command_tx: Sender<CoordinatorCommand>,
    connection_rx: watch::Receiver<ConnectionState>,
    join: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Command channel, for wiring into [`SessionManager::attach_transport`]
    ///
    /// [`SessionManager::attach_transport`]: crate::session::SessionManager::attach_transport
    pub fn command_sender(&self) -> Sender<CoordinatorCommand> {
        self.command_tx.clone()
    }

    pub async fn set_visibility(&self, hidden: bool) {
        let _ = self
            .command_tx
            .send(CoordinatorCommand::SetVisibility { hidden })
            .await;
    }

    /// Used by the failure guard's Transport recovery path
    pub async fn renegotiate(&self) {
        let _ = self.command_tx.send(CoordinatorCommand::Renegotiate).await;
    }

    pub async fn shutdown(self) {
        let _ = self.command_tx.send(CoordinatorCommand::Shutdown).await;
        let _ = self.join.await;
    }

    /// Current connection diagnostics
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_rx.borrow().clone()
    }
}

/// Push/poll coordinator. Construct with [`spawn`](Self::spawn).
pub struct TransportCoordinator;

impl TransportCoordinator {
    /// Spawn the coordinator task.
    ///
    /// `push_rx` carries raw events from the push-channel glue, `session_rx`
    /// watches the manager's session snapshots (for the receipt-poll
    /// window), `ingest_tx` is the manager's single ingestion queue.
    pub fn spawn<P: PollTransport>(
        config: &TrackerConfig,
        poll: P,
        push_rx: Receiver<PushEvent>,
        session_rx: watch::Receiver<Option<TransferSession>>,
        ingest_tx: Sender<IngestEvent>,
        push_available: bool,
    ) -> CoordinatorHandle {
        let (command_tx, command_rx) = async_channel::bounded(16);
        let initial = ConnectionState {
            channel: if push_available {
                StatusChannel::Push
            } else {
                StatusChannel::Poll
            },
            connected: push_available,
            last_activity_at: Utc::now(),
            consecutive_idle_polls: 0,
            current_poll_interval: config.min_poll_interval(),
        };
        let (connection_tx, connection_rx) = watch::channel(initial);

        let config = config.clone();
        let join = tokio::spawn(run_loop(
            config,
            poll,
            push_rx,
            command_rx,
            session_rx,
            ingest_tx,
            connection_tx,
            push_available,
        ));

        CoordinatorHandle {
            command_tx,
            connection_rx,
            join,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<P: PollTransport>(
    config: TrackerConfig,
    mut poll: P,
    push_rx: Receiver<PushEvent>,
    command_rx: Receiver<CoordinatorCommand>,
    mut session_rx: watch::Receiver<Option<TransferSession>>,
    ingest_tx: Sender<IngestEvent>,
    connection_tx: watch::Sender<ConnectionState>,
    push_available: bool,
) {
    let mut mode = if push_available {
        TransportMode::PushActive
    } else {
        TransportMode::PollFallback
    };
    let mut adaptive = AdaptiveInterval::new(
        config.min_poll_interval(),
        config.max_poll_interval(),
        config.idle_polls_before_backoff,
    );
    let mut push_open = true;
    let mut watch_open = true;
    let mut receipt_active = receipt_window(&session_rx, &config);

    let mut poll_period = adaptive.effective();
    let mut poll_timer = fresh_timer(poll_period);
    let mut reconnect_timer = fresh_timer(config.push_reconnect_interval());
    let mut receipt_timer = fresh_timer(config.receipt_poll_interval());

    if mode == TransportMode::PollFallback {
        // No push at startup: get a first status immediately
        do_poll(&mut poll, &ingest_tx, &mut adaptive).await;
    }

    loop {
        tokio::select! {
            event = push_rx.recv(), if push_open => {
                match event {
                    Ok(PushEvent::Message(value)) => {
                        let had_signal = forward_push(value, &ingest_tx).await;
                        if had_signal {
                            adaptive.on_activity();
                        }
                    }
                    Ok(PushEvent::Connected) => {
                        if mode != TransportMode::PushActive {
                            tracing::info!("push channel recovered, polling stopped");
                        }
                        mode = TransportMode::PushActive;
                    }
                    Ok(PushEvent::Disconnected) => {
                        if mode == TransportMode::PushActive {
                            tracing::warn!("push channel lost, falling back to polling");
                            mode = TransportMode::PollFallback;
                            send_error(
                                &ingest_tx,
                                ErrorCategory::Transport,
                                "push channel disconnected",
                            )
                            .await;
                            // First fallback poll runs immediately so there is
                            // no status gap longer than one poll interval
                            do_poll(&mut poll, &ingest_tx, &mut adaptive).await;
                            poll_timer = fresh_timer(adaptive.effective());
                        }
                    }
                    Err(_) => {
                        tracing::warn!("push glue dropped, staying on poll fallback");
                        push_open = false;
                        mode = TransportMode::PollFallback;
                    }
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Ok(CoordinatorCommand::SetVisibility { hidden }) => {
                        adaptive.set_hidden(hidden);
                        tracing::debug!(hidden, "visibility changed, poll interval now {:?}", adaptive.effective());
                    }
                    Ok(CoordinatorCommand::Renegotiate) => {
                        try_reconnect(&mut poll, &mut mode).await;
                    }
                    Ok(CoordinatorCommand::Shutdown) | Err(_) => break,
                }
            }

            _ = poll_timer.tick(), if mode == TransportMode::PollFallback => {
                do_poll(&mut poll, &ingest_tx, &mut adaptive).await;
            }

            _ = reconnect_timer.tick(), if mode == TransportMode::PollFallback && push_open => {
                try_reconnect(&mut poll, &mut mode).await;
            }

            _ = receipt_timer.tick(), if receipt_active => {
                do_receipt_check(&mut poll, &ingest_tx).await;
            }

            changed = session_rx.changed(), if watch_open => {
                if changed.is_err() {
                    watch_open = false;
                } else {
                    let was_active = receipt_active;
                    receipt_active = receipt_window(&session_rx, &config);
                    if receipt_active && !was_active {
                        tracing::info!("terminal-pending window entered, receipt poll started");
                        receipt_timer = fresh_timer(config.receipt_poll_interval());
                    } else if !receipt_active && was_active {
                        tracing::info!("receipt poll stopped");
                    }
                }
            }
        }

        // The adaptive interval changed: rebuild the poll timer
        if adaptive.effective() != poll_period {
            poll_period = adaptive.effective();
            poll_timer = fresh_timer(poll_period);
        }

        connection_tx.send_replace(ConnectionState {
            channel: match mode {
                TransportMode::PushActive => StatusChannel::Push,
                TransportMode::PollFallback => StatusChannel::Poll,
            },
            connected: mode == TransportMode::PushActive,
            last_activity_at: Utc::now(),
            consecutive_idle_polls: adaptive.consecutive_idle(),
            current_poll_interval: adaptive.effective(),
        });
    }

    tracing::debug!("transport coordinator stopped");
}

fn fresh_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Is the watched session inside its terminal-pending window?
fn receipt_window(
    session_rx: &watch::Receiver<Option<TransferSession>>,
    config: &TrackerConfig,
) -> bool {
    session_rx.borrow().as_ref().is_some_and(|s| {
        s.status == SessionStatus::Active
            && !s.completion_latched
            && s.progress_percent >= config.receipt_poll_threshold_percent
    })
}

/// Parse and forward one raw push payload. Returns whether it carried a
/// usable signal.
async fn forward_push(value: serde_json::Value, ingest_tx: &Sender<IngestEvent>) -> bool {
    match wire::parse_push(value) {
        Ok(msg) => {
            let signals = wire::normalize_push(msg);
            let had_signal = !signals.is_empty();
            send_signals(ingest_tx, signals).await;
            had_signal
        }
        Err(e) => {
            send_error(ingest_tx, ErrorCategory::Protocol, &e.to_string()).await;
            false
        }
    }
}

async fn do_poll<P: PollTransport>(
    poll: &mut P,
    ingest_tx: &Sender<IngestEvent>,
    adaptive: &mut AdaptiveInterval,
) {
    match poll.poll_status().await {
        Ok(status) => {
            let (signals, had_activity) = wire::normalize_poll(status);
            if had_activity {
                adaptive.on_activity();
            } else {
                adaptive.on_idle_poll();
            }
            send_signals(ingest_tx, signals).await;
        }
        Err(e) => {
            adaptive.on_idle_poll();
            send_error(ingest_tx, ErrorCategory::Transport, &e.to_string()).await;
        }
    }
}

async fn do_receipt_check<P: PollTransport>(poll: &mut P, ingest_tx: &Sender<IngestEvent>) {
    match poll.check_receipt().await {
        Ok(check) => {
            if let Some(signal) = wire::normalize_receipt(check) {
                tracing::info!("receipt poll caught a verified completion");
                send_signals(ingest_tx, vec![signal]).await;
            }
        }
        // Receipt polling is best-effort: a miss is not a channel failure
        Err(e) => tracing::debug!("receipt check failed: {}", e),
    }
}

async fn try_reconnect<P: PollTransport>(poll: &mut P, mode: &mut TransportMode) {
    if *mode == TransportMode::PushActive {
        return;
    }
    match poll.reconnect_push().await {
        Ok(()) => {
            tracing::info!("push channel renegotiated, leaving poll fallback");
            *mode = TransportMode::PushActive;
        }
        Err(e) => tracing::debug!("push reconnect attempt failed: {}", e),
    }
}

async fn send_signals(ingest_tx: &Sender<IngestEvent>, signals: Vec<WireSignal>) {
    for signal in signals {
        let event = match signal {
            WireSignal::Progress(progress) => IngestEvent::Progress(progress),
            WireSignal::Terminal(terminal) => IngestEvent::Terminal(terminal),
        };
        if ingest_tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn send_error(ingest_tx: &Sender<IngestEvent>, category: ErrorCategory, message: &str) {
    let _ = ingest_tx
        .send(IngestEvent::ChannelError {
            category,
            message: message.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::TerminalSignal;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_adaptive_interval_growth_and_collapse() {
        let mut adaptive = AdaptiveInterval::new(
            Duration::from_millis(2000),
            Duration::from_millis(10000),
            3,
        );
        assert_eq!(adaptive.effective(), Duration::from_millis(2000));

        adaptive.on_idle_poll();
        adaptive.on_idle_poll();
        assert_eq!(adaptive.effective(), Duration::from_millis(2000));

        // Third consecutive idle poll starts the backoff
        adaptive.on_idle_poll();
        assert_eq!(adaptive.effective(), Duration::from_millis(3000));
        adaptive.on_idle_poll();
        assert_eq!(adaptive.effective(), Duration::from_millis(4500));

        // Growth is capped
        for _ in 0..10 {
            adaptive.on_idle_poll();
        }
        assert_eq!(adaptive.effective(), Duration::from_millis(10000));

        // Any activity collapses straight back to the floor
        adaptive.on_activity();
        assert_eq!(adaptive.effective(), Duration::from_millis(2000));
    }

    #[test]
    fn test_hidden_tab_doubles_interval_capped() {
        let mut adaptive = AdaptiveInterval::new(
            Duration::from_millis(2000),
            Duration::from_millis(10000),
            3,
        );
        adaptive.set_hidden(true);
        assert_eq!(adaptive.effective(), Duration::from_millis(4000));

        for _ in 0..20 {
            adaptive.on_idle_poll();
        }
        assert_eq!(adaptive.effective(), Duration::from_millis(10000));

        adaptive.set_hidden(false);
        adaptive.on_activity();
        assert_eq!(adaptive.effective(), Duration::from_millis(2000));
    }

    /// Scripted transport: pops queued responses, errors when empty
    struct MockTransport {
        statuses: Arc<Mutex<VecDeque<PollStatus>>>,
        receipts: Arc<Mutex<VecDeque<ReceiptCheck>>>,
        reconnect_ok: bool,
        polls: Arc<Mutex<u32>>,
    }

    impl MockTransport {
        fn new(reconnect_ok: bool) -> Self {
            Self {
                statuses: Arc::new(Mutex::new(VecDeque::new())),
                receipts: Arc::new(Mutex::new(VecDeque::new())),
                reconnect_ok,
                polls: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl PollTransport for MockTransport {
        async fn poll_status(&mut self) -> Result<PollStatus, TrackerError> {
            *self.polls.lock().unwrap() += 1;
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TrackerError::Transport("poll endpoint unreachable".to_string()))
        }

        async fn check_receipt(&mut self) -> Result<ReceiptCheck, TrackerError> {
            self.receipts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TrackerError::Transport("receipt endpoint unreachable".to_string()))
        }

        async fn reconnect_push(&mut self) -> Result<(), TrackerError> {
            if self.reconnect_ok {
                Ok(())
            } else {
                Err(TrackerError::Transport("push still down".to_string()))
            }
        }
    }

    fn progress_status(phase: &str, progress: f64) -> PollStatus {
        PollStatus {
            is_connected: true,
            backing_up: true,
            events: vec![crate::wire::PollEvent {
                phase: phase.to_string(),
                data: None,
                progress: Some(progress),
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_disconnect_triggers_immediate_poll() {
        let transport = MockTransport::new(false);
        transport
            .statuses
            .lock()
            .unwrap()
            .push_back(progress_status("TRANSFERRING", 0.6));
        let polls = transport.polls.clone();

        let (push_tx, push_rx) = async_channel::bounded(8);
        let (ingest_tx, ingest_rx) = async_channel::bounded(32);
        let (_session_tx, session_rx) = watch::channel(None);

        let config = TrackerConfig::default();
        let handle = TransportCoordinator::spawn(
            &config, transport, push_rx, session_rx, ingest_tx, true,
        );

        push_tx.send(PushEvent::Disconnected).await.unwrap();

        // Disconnect produces a transport error plus the immediate fallback
        // poll's progress, in that order
        let first = ingest_rx.recv().await.unwrap();
        assert!(matches!(
            first,
            IngestEvent::ChannelError { category: ErrorCategory::Transport, .. }
        ));
        let second = ingest_rx.recv().await.unwrap();
        match second {
            IngestEvent::Progress(event) => {
                assert_eq!(event.phase.as_deref(), Some("TRANSFERRING"));
            }
            other => panic!("expected progress, got {other:?}"),
        }
        assert_eq!(*polls.lock().unwrap(), 1);

        drop(ingest_rx);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_message_is_normalized() {
        let transport = MockTransport::new(false);
        let (push_tx, push_rx) = async_channel::bounded(8);
        let (ingest_tx, ingest_rx) = async_channel::bounded(32);
        let (_session_tx, session_rx) = watch::channel(None);

        let config = TrackerConfig::default();
        let handle = TransportCoordinator::spawn(
            &config, transport, push_rx, session_rx, ingest_tx, true,
        );

        push_tx
            .send(PushEvent::Message(json!({
                "phase": "ENCRYPTING",
                "data": { "progress": 0.4 }
            })))
            .await
            .unwrap();

        match ingest_rx.recv().await.unwrap() {
            IngestEvent::Progress(event) => {
                assert_eq!(event.phase.as_deref(), Some("ENCRYPTING"));
                assert_eq!(event.raw_local_progress, Some(0.4));
            }
            other => panic!("expected progress, got {other:?}"),
        }

        // Malformed payload funnels a protocol error
        push_tx
            .send(PushEvent::Message(json!({ "nope": true })))
            .await
            .unwrap();
        assert!(matches!(
            ingest_rx.recv().await.unwrap(),
            IngestEvent::ChannelError { category: ErrorCategory::Protocol, .. }
        ));

        drop(ingest_rx);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_poll_activates_in_terminal_window() {
        let transport = MockTransport::new(false);
        transport.receipts.lock().unwrap().push_back(ReceiptCheck {
            success: true,
            received: true,
            filename: Some("a.bin".to_string()),
            size: Some(9),
            hash: Some("ab".to_string()),
        });

        let (_push_tx, push_rx) = async_channel::bounded::<PushEvent>(8);
        let (ingest_tx, ingest_rx) = async_channel::bounded(32);
        let (session_tx, session_rx) = watch::channel(None);

        let config = TrackerConfig::default();
        let handle = TransportCoordinator::spawn(
            &config, transport, push_rx, session_rx, ingest_tx, true,
        );

        // Session crosses the 90% window
        let mut session = TransferSession::new("s-1".to_string(), 100);
        session.progress_percent = 93.0;
        session_tx.send(Some(session)).unwrap();

        match ingest_rx.recv().await.unwrap() {
            IngestEvent::Terminal(TerminalSignal::ReceiptConfirmed) => {}
            other => panic!("expected receipt confirmation, got {other:?}"),
        }

        drop(ingest_rx);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_push_and_stops_polling() {
        let transport = MockTransport::new(true);
        let polls = transport.polls.clone();

        let (_push_tx, push_rx) = async_channel::bounded::<PushEvent>(8);
        let (ingest_tx, ingest_rx) = async_channel::bounded(64);
        let (_session_tx, session_rx) = watch::channel(None);

        let config = TrackerConfig::default();
        // Start without push: fallback polling plus background reconnects
        let handle = TransportCoordinator::spawn(
            &config, transport, push_rx, session_rx, ingest_tx, false,
        );

        // Drain until the reconnect lands (the mock has no statuses queued,
        // so polls surface transport errors until then)
        tokio::time::sleep(Duration::from_secs(12)).await;
        let state = handle.connection_state();
        assert_eq!(state.channel, StatusChannel::Push);
        assert!(state.connected);

        let polls_at_reconnect = *polls.lock().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*polls.lock().unwrap(), polls_at_reconnect, "polling kept running after push recovery");

        drop(ingest_rx);
        handle.shutdown().await;
    }
}
