// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ping-pong message endpoint.
//!
//! A reliable, FIFO, exactly-once message channel between two parties over a
//! [`Transport`] that may drop or duplicate packets.
//!
//! # Architecture
//!
//! ```text
//!  enqueue_message_for_send()          Transport::send
//!         │                                  ▲
//!         ▼                                  │
//!  ┌────────────────────────────── endpoint actor task ─────────────┐
//!  │  ProtocolState (tokens, queue, last batch, one timer)          │
//!  │                                                                │
//!  │  select! { shutdown | inbox packet | wake | timer due }        │
//!  │     inbox  → accept → deliver to EndpointListener (awaited)    │
//!  │     timer  → respond / resend / recover → send round           │
//!  └────────────────────────────────────────────────────────────────┘
//!         ▲
//!         └── partner's transport pushes packets into our inbox
//! ```
//!
//! Everything that touches the protocol runs on the one actor task, so the
//! listener is never called concurrently with itself or from inside a timer
//! send. Enqueueing only takes the state lock briefly.
//!
//! Timing follows [`EndpointConfig`]: a token is answered after
//! `delta_respond`, a failed send is retried after `delta_resend`, and a
//! round with no answer is resent after `delta_recover`. Every delay is
//! jittered by `random_variation`.

pub mod state;
pub mod transport;

pub use state::{EndpointPhase, TimerKind};
pub use transport::{BoxFuture, ChannelTransport, Inbox, Packet, Transport, TransportError};

use crate::config::EndpointConfig;
use crate::error::{MeshError, Result};
use crate::metrics;
use crate::resilience::jittered;
use state::{Acceptance, ProtocolState};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Bound for anything carried by an endpoint.
pub trait Message: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> Message for T {}

/// Receives what arrives at an endpoint.
pub trait EndpointListener<T>: Send + Sync + 'static {
    /// A new, deduplicated, non-empty batch arrived. Called once per batch,
    /// in token order, never concurrently for the same endpoint.
    fn messages_received(&self, token: i64, messages: Vec<T>) -> BoxFuture<'_, ()>;

    /// A send failed at the transport and will be retried.
    fn send_failed(&self, _token: i64) {}
}

struct Shared<T> {
    name: String,
    config: EndpointConfig,
    state: Mutex<ProtocolState<T>>,
    listener: Arc<dyn EndpointListener<T>>,
    transport: OnceLock<Arc<dyn Transport<T>>>,
    wake: Notify,
}

/// One side of a ping-pong conversation.
///
/// Dropping the endpoint stops its actor task.
pub struct PingPongEndpoint<T: Message> {
    shared: Arc<Shared<T>>,
    inbox_tx: Inbox<T>,
    inbox_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Packet<T>>>>,
    shutdown_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Message> PingPongEndpoint<T> {
    /// Create an endpoint. It does nothing until connected and started.
    pub fn new(
        name: impl Into<String>,
        config: EndpointConfig,
        listener: Arc<dyn EndpointListener<T>>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                state: Mutex::new(ProtocolState::new()),
                listener,
                transport: OnceLock::new(),
                wake: Notify::new(),
            }),
            inbox_tx,
            inbox_rx: std::sync::Mutex::new(Some(inbox_rx)),
            shutdown_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Where a partner's transport should push packets for us.
    pub fn inbox(&self) -> Inbox<T> {
        self.inbox_tx.clone()
    }

    /// Attach the transport toward the partner. Can only be done once.
    pub fn set_transport(&self, transport: Arc<dyn Transport<T>>) -> Result<()> {
        self.shared.transport.set(transport).map_err(|_| MeshError::InvalidState {
            expected: "no transport".to_string(),
            actual: "transport already attached".to_string(),
        })
    }

    /// Spawn the actor. The initiator sends the very first token at once.
    pub fn start(&self, initiate: bool) -> Result<()> {
        let inbox_rx = self
            .inbox_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| MeshError::InvalidState {
                expected: "not started".to_string(),
                actual: "started".to_string(),
            })?;

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let span = info_span!("endpoint", name = %self.shared.name);
        let handle = tokio::spawn(run_actor(shared, inbox_rx, shutdown_rx, initiate).instrument(span));

        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Queue a message for the next round.
    ///
    /// Fails with [`MeshError::EndpointDead`] once `graceful_die` was called.
    pub async fn enqueue_message_for_send(&self, message: T) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.graceful_death {
            return Err(MeshError::EndpointDead(self.shared.name.clone()));
        }
        trace!(endpoint = %self.shared.name, ?message, "Message enqueued");
        state.enqueue(message);
        metrics::set_endpoint_queue_depth(&self.shared.name, state.to_be_sent.len());
        Ok(())
    }

    /// Stop accepting the partner's rounds and drain what we still owe it.
    ///
    /// Cancels the pending (recover) timer. Queued messages and an
    /// unacknowledged last batch keep being sent, with incoming tokens used
    /// only as acknowledgments. Once nothing is outstanding the endpoint is
    /// dead.
    pub async fn graceful_die(&self) {
        let running = self.task.lock().map(|t| t.is_some()).unwrap_or(false);
        let mut state = self.shared.state.lock().await;
        if state.graceful_death {
            return;
        }
        state.graceful_death = true;
        state.cancel_timer();

        if !running || !state.has_outstanding() {
            state.terminated = true;
            info!(endpoint = %self.shared.name, "Endpoint dead");
        } else {
            info!(
                endpoint = %self.shared.name,
                queued = state.to_be_sent.len(),
                "Endpoint draining before death"
            );
            state.schedule(TimerKind::Respond, Instant::now());
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    pub async fn last_sent_token(&self) -> i64 {
        self.shared.state.lock().await.last_sent_token
    }

    pub async fn last_received_token(&self) -> i64 {
        self.shared.state.lock().await.last_received_token
    }

    /// Messages queued for the next new round.
    pub async fn messages_to_be_sent(&self) -> Vec<T> {
        self.shared.state.lock().await.to_be_sent.iter().cloned().collect()
    }

    /// The batch most recently transmitted (kept for retransmission).
    pub async fn messages_sent_last(&self) -> Vec<T> {
        self.shared.state.lock().await.sent_last.clone()
    }

    pub async fn phase(&self) -> EndpointPhase {
        self.shared.state.lock().await.phase()
    }

    pub async fn is_dead(&self) -> bool {
        self.shared.state.lock().await.terminated
    }

    /// Whether `graceful_die` has been called.
    pub async fn is_dying(&self) -> bool {
        self.shared.state.lock().await.graceful_death
    }
}

impl<T: Message> Drop for PingPongEndpoint<T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl<T: Message> fmt::Debug for PingPongEndpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingPongEndpoint")
            .field("name", &self.shared.name)
            .finish()
    }
}

/// Wire two endpoints together in-process and start them; `a` initiates.
pub fn connect_pair<T: Message>(a: &PingPongEndpoint<T>, b: &PingPongEndpoint<T>) -> Result<()> {
    if Arc::ptr_eq(&a.shared, &b.shared) {
        return Err(MeshError::Config(format!(
            "endpoint {} cannot be its own partner",
            a.name()
        )));
    }
    a.set_transport(Arc::new(ChannelTransport::new(b.name(), b.inbox())))?;
    b.set_transport(Arc::new(ChannelTransport::new(a.name(), a.inbox())))?;
    b.start(false)?;
    a.start(true)?;
    Ok(())
}

async fn run_actor<T: Message>(
    shared: Arc<Shared<T>>,
    mut inbox_rx: mpsc::UnboundedReceiver<Packet<T>>,
    mut shutdown_rx: watch::Receiver<bool>,
    initiate: bool,
) {
    debug!(initiate, "Endpoint actor started");
    if initiate {
        shared.send_round(TimerKind::Respond).await;
    }

    loop {
        let due = {
            let state = shared.state.lock().await;
            if state.terminated {
                break;
            }
            state.timer.map(|t| t.due)
        };

        let sleep = async {
            match due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            packet = inbox_rx.recv() => {
                match packet {
                    Some(packet) => shared.on_packet(packet).await,
                    None => break,
                }
            }

            _ = shared.wake.notified() => {}

            _ = sleep => {
                let kind = shared.state.lock().await.take_due_timer(Instant::now());
                if let Some(kind) = kind {
                    shared.send_round(kind).await;
                }
            }
        }
    }
    debug!("Endpoint actor stopped");
}

impl<T: Message> Shared<T> {
    fn delay(&self, kind: TimerKind) -> std::time::Duration {
        let base = match kind {
            TimerKind::Respond => self.config.delta_respond(),
            TimerKind::Resend => self.config.delta_resend(),
            TimerKind::Recover => self.config.delta_recover(),
        };
        jittered(base, self.config.random_variation)
    }

    fn schedule(&self, state: &mut ProtocolState<T>, kind: TimerKind) {
        state.schedule(kind, Instant::now() + self.delay(kind));
    }

    async fn on_packet(&self, packet: Packet<T>) {
        let acceptance = {
            let mut state = self.state.lock().await;
            let acceptance = state.accept(packet);
            if !matches!(acceptance, Acceptance::Rejected) {
                self.schedule(&mut state, TimerKind::Respond);
            }
            acceptance
        };

        match acceptance {
            Acceptance::Deliver { token, messages } => {
                trace!(endpoint = %self.name, token, count = messages.len(), "Token received");
                metrics::record_token_received(&self.name, messages.len());
                if !messages.is_empty() {
                    self.listener.messages_received(token, messages).await;
                }
            }
            Acceptance::AckOnly { token, discarded } => {
                if discarded > 0 {
                    warn!(
                        endpoint = %self.name,
                        token,
                        discarded,
                        "Dropping partner messages while draining"
                    );
                }
            }
            Acceptance::Duplicate { token } => {
                debug!(endpoint = %self.name, token, "Duplicate token ignored");
                metrics::record_duplicate_token(&self.name);
            }
            Acceptance::Rejected => {
                trace!(endpoint = %self.name, "Packet rejected, endpoint dead");
            }
        }
    }

    async fn send_round(&self, kind: TimerKind) {
        if kind == TimerKind::Recover {
            debug!(endpoint = %self.name, "No answer from partner, recovering");
            metrics::record_recover(&self.name);
        }

        let round = {
            let mut state = self.state.lock().await;
            if state.terminated {
                return;
            }
            if state.graceful_death && !state.has_outstanding() {
                state.terminated = true;
                state.cancel_timer();
                info!(endpoint = %self.name, "Endpoint drained, now dead");
                return;
            }
            match state.prepare_send() {
                Ok(round) => {
                    // Armed before sending: a slow send must not delay recovery.
                    self.schedule(&mut state, TimerKind::Recover);
                    metrics::set_endpoint_queue_depth(&self.name, state.to_be_sent.len());
                    round
                }
                Err(mismatch) => {
                    error!(
                        endpoint = %self.name,
                        last_sent = mismatch.last_sent,
                        last_received = mismatch.last_received,
                        "Token state out of step with partner"
                    );
                    self.schedule(&mut state, TimerKind::Recover);
                    return;
                }
            }
        };

        let token = round.packet.token;
        let batch_size = round.packet.messages.len();
        let result = match self.transport.get() {
            Some(transport) => transport.send(round.packet).await,
            None => Err(TransportError::NotConnected),
        };

        match result {
            Ok(()) => {
                trace!(endpoint = %self.name, token, batch_size, resend = round.resend, "Token sent");
                metrics::record_token_sent(&self.name, batch_size, round.resend);
            }
            Err(e) => {
                debug!(endpoint = %self.name, token, error = %e, "Send failed, will resend");
                metrics::record_send_failure(&self.name);
                {
                    let mut state = self.state.lock().await;
                    if !state.terminated {
                        self.schedule(&mut state, TimerKind::Resend);
                    }
                }
                self.listener.send_failed(token);
            }
        }
    }
}
