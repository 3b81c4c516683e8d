//! Transports carry packets between two endpoints.
//!
//! A [`Transport`] only has to make a best-effort attempt: it may drop or
//! duplicate packets, and the ping-pong protocol above it restores ordering
//! and exactly-once delivery. A send error just means "try again later".
//!
//! [`ChannelTransport`] is the in-process variant: it pushes packets straight
//! onto the partner endpoint's inbox.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One protocol round: a token plus the (possibly empty) batch it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet<T> {
    pub token: i64,
    pub messages: Vec<T>,
}

/// Sender half of an endpoint's inbox.
pub type Inbox<T> = mpsc::UnboundedSender<Packet<T>>;

/// Transport-level failure. Never surfaced above the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("partner unreachable: {0}")]
    Unreachable(String),
    #[error("no transport attached")]
    NotConnected,
}

/// Moves packets to the partner endpoint.
pub trait Transport<T>: Send + Sync + 'static {
    /// Attempt to hand one packet to the partner.
    fn send(&self, packet: Packet<T>) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// In-process transport writing into the partner's inbox.
pub struct ChannelTransport<T> {
    partner: String,
    inbox: Inbox<T>,
}

impl<T> ChannelTransport<T> {
    pub fn new(partner: impl Into<String>, inbox: Inbox<T>) -> Self {
        Self {
            partner: partner.into(),
            inbox,
        }
    }
}

impl<T: Send + 'static> Transport<T> for ChannelTransport<T> {
    fn send(&self, packet: Packet<T>) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self
            .inbox
            .send(packet)
            .map_err(|_| TransportError::Unreachable(self.partner.clone()));
        Box::pin(async move { result })
    }
}
