//! Ping-pong protocol state.
//!
//! Pure bookkeeping with no I/O: which token to send next, which batch goes
//! with it, whether an incoming token is new, and which single timer is
//! pending. The actor in [`super`] owns one of these behind a mutex and
//! performs the sends.
//!
//! # Token Discipline
//!
//! ```text
//!   A (initiator)                B
//!   ─────────────                ─
//!   send 1 [q_A] ─────────────►  accept 1, deliver q_A
//!                                after deltaRespond:
//!   accept 2, deliver q_B ◄───── send 2 [q_B]
//!   after deltaRespond:
//!   send 3 [q_A'] ────────────►  ...
//! ```
//!
//! An endpoint only opens a new round once the partner's token acknowledges
//! its previous one (`last_received == last_sent + 1`). Otherwise it resends
//! the same token with the same batch, which the partner drops as a
//! duplicate if it already has it.

use super::transport::Packet;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Kind of the single pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Send our next token after having received one.
    Respond,
    /// Retry a send that failed at the transport.
    Resend,
    /// No answer from the partner; assume our batch was lost.
    Recover,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Respond => write!(f, "respond"),
            TimerKind::Resend => write!(f, "resend"),
            TimerKind::Recover => write!(f, "recover"),
        }
    }
}

/// A timer waiting to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub due: Instant,
    pub kind: TimerKind,
}

/// Observable phase of an endpoint.
///
/// ```text
///              start / accept
///   Idle ──────────────────────► AwaitingRespond
///                                   │ send ok        │ send failed
///                                   ▼                ▼
///                             AwaitingRecover   AwaitingResend
///                                   │ accept          │ timer
///                                   └──► AwaitingRespond ◄──┘
///
///   graceful_die() ──► Draining ──(nothing outstanding)──► Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhase {
    Idle,
    AwaitingRespond,
    AwaitingResend,
    AwaitingRecover,
    Draining,
    Dead,
}

impl fmt::Display for EndpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointPhase::Idle => write!(f, "Idle"),
            EndpointPhase::AwaitingRespond => write!(f, "AwaitingRespond"),
            EndpointPhase::AwaitingResend => write!(f, "AwaitingResend"),
            EndpointPhase::AwaitingRecover => write!(f, "AwaitingRecover"),
            EndpointPhase::Draining => write!(f, "Draining"),
            EndpointPhase::Dead => write!(f, "Dead"),
        }
    }
}

/// Result of offering an incoming packet to the state.
#[derive(Debug, PartialEq)]
pub enum Acceptance<T> {
    /// New token; these messages must be delivered exactly once.
    Deliver { token: i64, messages: Vec<T> },
    /// New token while draining; counts as an acknowledgment only.
    AckOnly { token: i64, discarded: usize },
    /// Token already seen.
    Duplicate { token: i64 },
    /// Endpoint is dead; nothing was recorded.
    Rejected,
}

/// Token combination that the protocol cannot produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMismatch {
    pub last_sent: i64,
    pub last_received: i64,
}

/// Outgoing round chosen by [`ProtocolState::prepare_send`].
#[derive(Debug, PartialEq)]
pub struct Round<T> {
    pub packet: Packet<T>,
    pub resend: bool,
}

/// Per-endpoint protocol state.
#[derive(Debug)]
pub struct ProtocolState<T> {
    pub(crate) last_sent_token: i64,
    pub(crate) last_received_token: i64,
    pub(crate) to_be_sent: VecDeque<T>,
    pub(crate) sent_last: Vec<T>,
    pub(crate) graceful_death: bool,
    pub(crate) terminated: bool,
    pub(crate) timer: Option<ScheduledTimer>,
}

impl<T> Default for ProtocolState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ProtocolState<T> {
    pub fn new() -> Self {
        Self {
            last_sent_token: -1,
            last_received_token: -1,
            to_be_sent: VecDeque::new(),
            sent_last: Vec::new(),
            graceful_death: false,
            terminated: false,
            timer: None,
        }
    }

    pub fn phase(&self) -> EndpointPhase {
        if self.terminated {
            return EndpointPhase::Dead;
        }
        if self.graceful_death {
            return EndpointPhase::Draining;
        }
        match self.timer.map(|t| t.kind) {
            None => EndpointPhase::Idle,
            Some(TimerKind::Respond) => EndpointPhase::AwaitingRespond,
            Some(TimerKind::Resend) => EndpointPhase::AwaitingResend,
            Some(TimerKind::Recover) => EndpointPhase::AwaitingRecover,
        }
    }

    /// Replace the pending timer.
    pub fn schedule(&mut self, kind: TimerKind, due: Instant) {
        self.timer = Some(ScheduledTimer { due, kind });
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Take the pending timer if it is due.
    pub fn take_due_timer(&mut self, now: Instant) -> Option<TimerKind> {
        match self.timer {
            Some(t) if t.due <= now => {
                self.timer = None;
                Some(t.kind)
            }
            _ => None,
        }
    }

    /// Queue a message for the next new round.
    pub fn enqueue(&mut self, message: T) {
        self.to_be_sent.push_back(message);
    }

    /// Whether the partner has acknowledged our last token.
    pub fn last_round_acknowledged(&self) -> bool {
        self.last_sent_token < 0 || self.last_received_token == self.last_sent_token + 1
    }

    /// Whether anything still needs to reach the partner.
    pub fn has_outstanding(&self) -> bool {
        !self.to_be_sent.is_empty()
            || (!self.sent_last.is_empty() && !self.last_round_acknowledged())
    }

    /// Offer an incoming packet.
    pub fn accept(&mut self, packet: Packet<T>) -> Acceptance<T> {
        if self.terminated {
            return Acceptance::Rejected;
        }
        if packet.token <= self.last_received_token {
            return Acceptance::Duplicate {
                token: packet.token,
            };
        }
        self.last_received_token = packet.token;
        if self.graceful_death {
            Acceptance::AckOnly {
                token: packet.token,
                discarded: packet.messages.len(),
            }
        } else {
            Acceptance::Deliver {
                token: packet.token,
                messages: packet.messages,
            }
        }
    }
}

impl<T: Clone> ProtocolState<T> {
    /// Choose the next token and batch, and record them as sent.
    pub fn prepare_send(&mut self) -> Result<Round<T>, TokenMismatch> {
        let (token, resend) = if self.last_received_token < 0 {
            if self.last_sent_token < 0 {
                (1, false)
            } else {
                (self.last_sent_token, true)
            }
        } else if self.last_round_acknowledged() {
            (self.last_received_token + 1, false)
        } else if self.last_received_token + 1 == self.last_sent_token {
            (self.last_sent_token, true)
        } else {
            return Err(TokenMismatch {
                last_sent: self.last_sent_token,
                last_received: self.last_received_token,
            });
        };

        let messages = if resend {
            self.sent_last.clone()
        } else {
            let drained: Vec<T> = self.to_be_sent.drain(..).collect();
            self.sent_last = drained.clone();
            drained
        };
        self.last_sent_token = token;

        Ok(Round {
            packet: Packet { token, messages },
            resend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet(token: i64, messages: &[&'static str]) -> Packet<&'static str> {
        Packet {
            token,
            messages: messages.to_vec(),
        }
    }

    #[test]
    fn test_first_token_is_one() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        state.to_be_sent.push_back("a");
        let round = state.prepare_send().unwrap();
        assert_eq!(round.packet, packet(1, &["a"]));
        assert!(!round.resend);
        assert_eq!(state.last_sent_token, 1);
        assert!(state.to_be_sent.is_empty());
    }

    #[test]
    fn test_unanswered_first_token_is_resent() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        state.to_be_sent.push_back("a");
        state.prepare_send().unwrap();
        state.to_be_sent.push_back("b");

        let round = state.prepare_send().unwrap();
        assert_eq!(round.packet, packet(1, &["a"]));
        assert!(round.resend);
        assert_eq!(state.to_be_sent.len(), 1);
    }

    #[test]
    fn test_full_exchange() {
        let mut a: ProtocolState<&str> = ProtocolState::new();
        let mut b: ProtocolState<&str> = ProtocolState::new();

        a.to_be_sent.push_back("ping");
        let r1 = a.prepare_send().unwrap();
        assert_eq!(
            b.accept(r1.packet),
            Acceptance::Deliver {
                token: 1,
                messages: vec!["ping"]
            }
        );

        b.to_be_sent.push_back("pong");
        let r2 = b.prepare_send().unwrap();
        assert_eq!(r2.packet.token, 2);
        assert_eq!(
            a.accept(r2.packet),
            Acceptance::Deliver {
                token: 2,
                messages: vec!["pong"]
            }
        );

        let r3 = a.prepare_send().unwrap();
        assert_eq!(r3.packet, packet(3, &[]));
        assert!(!r3.resend);
    }

    #[test]
    fn test_lost_response_causes_resend_of_same_batch() {
        let mut a: ProtocolState<&str> = ProtocolState::new();
        let mut b: ProtocolState<&str> = ProtocolState::new();

        b.accept(a.prepare_send().unwrap().packet);
        b.to_be_sent.push_back("x");
        let lost = b.prepare_send().unwrap();
        assert_eq!(lost.packet.token, 2);

        // A never saw token 2, so its recover timer resends token 1.
        let again = a.prepare_send().unwrap();
        assert_eq!(again.packet.token, 1);
        assert!(again.resend);
        assert_eq!(b.accept(again.packet), Acceptance::Duplicate { token: 1 });

        // B answers the duplicate by resending its own last batch.
        let resent = b.prepare_send().unwrap();
        assert_eq!(resent.packet, packet(2, &["x"]));
        assert!(resent.resend);
    }

    #[test]
    fn test_duplicate_never_redelivers() {
        let mut b: ProtocolState<&str> = ProtocolState::new();
        assert!(matches!(b.accept(packet(1, &["m"])), Acceptance::Deliver { .. }));
        assert_eq!(b.accept(packet(1, &["m"])), Acceptance::Duplicate { token: 1 });
        assert_eq!(b.last_received_token, 1);
    }

    #[test]
    fn test_stale_token_is_duplicate() {
        let mut b: ProtocolState<&str> = ProtocolState::new();
        b.accept(packet(3, &[]));
        assert_eq!(b.accept(packet(1, &["old"])), Acceptance::Duplicate { token: 1 });
    }

    #[test]
    fn test_token_mismatch_detected() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        state.last_sent_token = 3;
        state.last_received_token = 8;
        assert_eq!(
            state.prepare_send().unwrap_err(),
            TokenMismatch {
                last_sent: 3,
                last_received: 8
            }
        );
    }

    #[test]
    fn test_draining_accepts_acks_only() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        state.graceful_death = true;
        assert_eq!(
            state.accept(packet(2, &["late"])),
            Acceptance::AckOnly {
                token: 2,
                discarded: 1
            }
        );
        state.terminated = true;
        assert_eq!(state.accept(packet(4, &[])), Acceptance::Rejected);
    }

    #[test]
    fn test_outstanding() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        assert!(!state.has_outstanding());

        state.to_be_sent.push_back("m");
        assert!(state.has_outstanding());

        state.prepare_send().unwrap();
        assert!(state.has_outstanding(), "sent but not acknowledged");

        state.accept(packet(2, &[]));
        assert!(!state.has_outstanding());
    }

    #[test]
    fn test_phase_follows_timer() {
        let mut state: ProtocolState<&str> = ProtocolState::new();
        assert_eq!(state.phase(), EndpointPhase::Idle);

        let now = Instant::now();
        state.schedule(TimerKind::Recover, now + Duration::from_secs(5));
        assert_eq!(state.phase(), EndpointPhase::AwaitingRecover);
        assert_eq!(state.take_due_timer(now), None);
        assert_eq!(
            state.take_due_timer(now + Duration::from_secs(5)),
            Some(TimerKind::Recover)
        );
        assert_eq!(state.phase(), EndpointPhase::Idle);

        state.graceful_death = true;
        assert_eq!(state.phase(), EndpointPhase::Draining);
        state.terminated = true;
        assert_eq!(state.phase(), EndpointPhase::Dead);
    }
}
