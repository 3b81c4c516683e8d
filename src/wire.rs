//! Wire encoding for object snapshots and proxy protocol messages.
//!
//! Everything a [`Proxy`](crate::proxy::Proxy) sends travels through its
//! endpoint as the JSON encoding of a [`ProxyMessage`]. Encoding is
//! byte-stable: struct fields serialize in declaration order, properties live
//! in a `BTreeMap`, and `false` flags are omitted, so the same logical
//! snapshot always produces the same bytes.
//!
//! # Snapshot Format
//!
//! ```json
//! {
//!   "identifier": "http://a.example/#doc",
//!   "time_created": 1000, "time_updated": 1200,
//!   "time_read": 1500, "time_expires": 301500,
//!   "give_up_lock": true,
//!   "proxies": [
//!     { "identifier": "http://b.example/", "towards_home": true, "towards_lock": true }
//!   ],
//!   "properties": { "title": "hello" },
//!   "neighbors": ["http://a.example/#other"]
//! }
//! ```

use crate::clock::{Timestamp, NEVER};
use crate::error::Result;
use crate::identifier::{NetworkIdentifier, ObjectIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_false(b: &bool) -> bool {
    !*b
}

fn never() -> Timestamp {
    NEVER
}

/// One entry of a snapshot's proxy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReference {
    /// The remote mesh the proxy talks to.
    pub identifier: NetworkIdentifier,

    /// This proxy leads toward the object's home mesh.
    #[serde(default, skip_serializing_if = "is_false")]
    pub towards_home: bool,

    /// This proxy leads toward the current lock holder.
    #[serde(default, skip_serializing_if = "is_false")]
    pub towards_lock: bool,
}

/// Serializable state of one object as seen by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub identifier: ObjectIdentifier,

    #[serde(default = "never")]
    pub time_created: Timestamp,

    #[serde(default = "never")]
    pub time_updated: Timestamp,

    #[serde(default = "never")]
    pub time_read: Timestamp,

    #[serde(default = "never")]
    pub time_expires: Timestamp,

    #[serde(default, skip_serializing_if = "is_false")]
    pub give_up_lock: bool,

    /// Proxy references in the sender's order.
    #[serde(default)]
    pub proxies: Vec<ProxyReference>,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub neighbors: Vec<ObjectIdentifier>,
}

impl ObjectSnapshot {
    /// The proxy flagged as leading home, if any.
    pub fn home_reference(&self) -> Option<&NetworkIdentifier> {
        self.proxies
            .iter()
            .find(|p| p.towards_home)
            .map(|p| &p.identifier)
    }

    /// The proxy flagged as leading to the lock holder, if any.
    pub fn lock_reference(&self) -> Option<&NetworkIdentifier> {
        self.proxies
            .iter()
            .find(|p| p.towards_lock)
            .map(|p| &p.identifier)
    }
}

/// Messages exchanged by two proxies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyMessage {
    /// Ask for the current content of objects.
    FetchRequest {
        request_id: u64,
        identifiers: Vec<ObjectIdentifier>,
        /// Include neighbours up to this depth.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<u32>,
    },

    /// Answer to a fetch. `missing` lists requested objects that do not exist.
    FetchResponse {
        request_id: u64,
        snapshots: Vec<ObjectSnapshot>,
        #[serde(default)]
        missing: Vec<ObjectIdentifier>,
    },

    /// Ask the partner to hand over the write lock.
    LockRequest {
        request_id: u64,
        identifier: ObjectIdentifier,
    },

    /// The lock now belongs to the requester; carries the latest content.
    LockGranted {
        request_id: u64,
        snapshot: ObjectSnapshot,
    },

    LockDenied {
        request_id: u64,
        identifier: ObjectIdentifier,
        reason: String,
    },

    /// The sender gives the lock back, with the content it wrote.
    LockReleased {
        request_id: u64,
        snapshot: ObjectSnapshot,
    },

    LockReleaseAck {
        request_id: u64,
        identifier: ObjectIdentifier,
    },

    /// Unsolicited update for a replica the receiver holds.
    PushChange {
        snapshot: ObjectSnapshot,
        /// The sender wants the lock back at the receiver's next opportunity.
        #[serde(default, skip_serializing_if = "is_false")]
        lock_reclaimed: bool,
    },

    /// The sender no longer holds (or no longer serves) these objects.
    CancelLease { identifiers: Vec<ObjectIdentifier> },
}

impl ProxyMessage {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyMessage::FetchRequest { .. } => "fetch_request",
            ProxyMessage::FetchResponse { .. } => "fetch_response",
            ProxyMessage::LockRequest { .. } => "lock_request",
            ProxyMessage::LockGranted { .. } => "lock_granted",
            ProxyMessage::LockDenied { .. } => "lock_denied",
            ProxyMessage::LockReleased { .. } => "lock_released",
            ProxyMessage::LockReleaseAck { .. } => "lock_release_ack",
            ProxyMessage::PushChange { .. } => "push_change",
            ProxyMessage::CancelLease { .. } => "cancel_lease",
        }
    }
}

pub fn encode_snapshot(snapshot: &ObjectSnapshot) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<ObjectSnapshot> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_message(message: &ProxyMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_message(bytes: &[u8]) -> Result<ProxyMessage> {
    Ok(serde_json::from_slice(bytes)?)
}
