// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mesh.
//!
//! Errors are categorized by how the caller should react. Transport failures
//! never appear here: they are retried inside the ping-pong endpoint and are
//! invisible above it.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `ObjectAccess` | Yes (except `NotFound`) | Remote mesh unreachable after protocol retries |
//! | `LockTimeout` | Yes | Lock holder did not release within the timeout |
//! | `LockDenied` | Yes | Lock holder refused the transfer |
//! | `ProbeRun` | Yes | External source failed during a probe run |
//! | `NoProbeFound` | No | No probe registered for the identifier |
//! | `NotLockOwner` | No | Local write attempted while the lock is remote |
//! | `InvariantViolation` | No | Object metadata is inconsistent |
//! | `EndpointDead` | No | Endpoint is shutting down |
//! | `WireFormat` | No | Malformed snapshot or message |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Mesh state machine violation |
//! | `Shutdown` | No | Mesh is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MeshError::is_retryable()`] to decide whether the application may
//! retry the operation later. Retryable errors mean the remote side was slow
//! or unavailable. Non-retryable errors mean bugs, configuration problems or
//! corrupt data.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::identifier::{NetworkIdentifier, ObjectIdentifier};

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Why an object could not be accessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessFailure {
    /// The owning mesh reported that the object does not exist.
    NotFound,
    /// No response arrived after all protocol-level retries.
    Unreachable { attempts: usize },
    /// No mesh or probe is known for the remote identifier.
    UnknownMesh,
    /// The partner answered with something we could not use.
    Rejected(String),
}

impl fmt::Display for AccessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessFailure::NotFound => write!(f, "not found"),
            AccessFailure::Unreachable { attempts } => {
                write!(f, "unreachable after {} attempts", attempts)
            }
            AccessFailure::UnknownMesh => write!(f, "unknown mesh"),
            AccessFailure::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Errors that can occur in the mesh.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// may be retried.
#[derive(Error, Debug)]
pub enum MeshError {
    /// An object could not be fetched or refreshed.
    ///
    /// The previously cached snapshot, if any, is left untouched.
    #[error("Object access error ({identifier}): {reason}")]
    ObjectAccess {
        identifier: String,
        reason: AccessFailure,
    },

    /// Waiting for a lock transfer took longer than the configured timeout.
    ///
    /// Retryable - the holder may release later.
    #[error("Lock timeout ({identifier}) after {waited:?}")]
    LockTimeout {
        identifier: ObjectIdentifier,
        waited: Duration,
    },

    /// The lock holder refused to hand over the lock.
    #[error("Lock denied ({identifier}): {reason}")]
    LockDenied {
        identifier: ObjectIdentifier,
        reason: String,
    },

    /// No probe is registered for an external identifier.
    ///
    /// Permanent until the probe directory is reconfigured.
    #[error("No probe found for {0}")]
    NoProbeFound(String),

    /// A probe run against an external source failed.
    ///
    /// Only surfaced from a forced `do_update_now`; scheduled runs log it.
    #[error("Probe run failed ({source_id}): {message}")]
    ProbeRun { source_id: String, message: String },

    /// A local write was attempted while another mesh holds the lock.
    ///
    /// Rejected before any message is sent. Call `request_lock` first.
    #[error("Not lock owner ({identifier}): lock held via {lock_proxy}")]
    NotLockOwner {
        identifier: ObjectIdentifier,
        lock_proxy: NetworkIdentifier,
    },

    /// Object metadata broke one of its invariants.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The endpoint has begun graceful shutdown.
    #[error("Endpoint dead: {0}")]
    EndpointDead(String),

    /// A snapshot or protocol message could not be decoded.
    #[error("Wire format error: {0}")]
    WireFormat(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mesh state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running mesh).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Create an object access error.
    pub fn access(identifier: impl ToString, reason: AccessFailure) -> Self {
        Self::ObjectAccess {
            identifier: identifier.to_string(),
            reason,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ObjectAccess { reason, .. } => !matches!(reason, AccessFailure::NotFound),
            Self::LockTimeout { .. } => true,
            Self::LockDenied { .. } => true,
            Self::ProbeRun { .. } => true,
            Self::NoProbeFound(_) => false, // Permanent for this identifier
            Self::NotLockOwner { .. } => false,
            Self::InvariantViolation(_) => false,
            Self::EndpointDead(_) => false,
            Self::WireFormat(_) => false, // Data corruption
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::WireFormat(e.to_string())
    }
}
