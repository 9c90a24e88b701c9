//! Transport abstraction for keyrelay.
//!
//! This module provides a pluggable per-endpoint transport that abstracts
//! the underlying connection mechanism (WebSocket relay, mock for testing).
//!
//! # Design
//!
//! One [`RelayTransport`] instance talks to exactly one relay:
//! - `connect()` establishes the connection (idempotent)
//! - `publish()` sends an event and waits for the relay's acknowledgement
//! - `query()` streams stored events matching a filter until end-of-stored-events
//! - `close()` gracefully terminates
//!
//! Failures carry the operation, the endpoint and a [`FailureReason`], and
//! classify themselves as permanent or transient so the retry layer knows
//! whether another attempt is worthwhile.
//!
//! # Example
//!
//! ```ignore
//! let relay = MockRelay::new("wss://relay.test");
//! relay.connect().await?;
//! relay.publish(&event).await?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! relay.query(&filter, tx).await?;
//! ```

mod mock;
mod websocket;

pub use mock::MockRelay;
pub use websocket::{WebSocketRelay, WebSocketRelayConfig};

use async_trait::async_trait;
use keyrelay_core::{Classify, ErrorClass, RejectCategory};
use keyrelay_types::{Event, Filter};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest single frame accepted from a relay.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Which transport operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    /// Establishing the connection
    Connect,
    /// Sending an event
    Publish,
    /// Fetching stored events
    Query,
    /// Keeping a subscription open
    Subscribe,
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportOp::Connect => write!(f, "connect"),
            TransportOp::Publish => write!(f, "publish"),
            TransportOp::Query => write!(f, "query"),
            TransportOp::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Why a transport operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Endpoint could not be reached (DNS, refused, reset).
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// No response in time.
    #[error("timed out")]
    Timeout,

    /// Not connected and reconnect was not attempted.
    #[error("not connected")]
    NotConnected,

    /// Connection closed mid-operation.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Relay refused the request with a machine-readable message.
    #[error("rejected ({category}): {message}")]
    Rejected {
        /// Parsed prefix
        category: RejectCategory,
        /// Full relay message
        message: String,
    },

    /// Endpoint requires credentials we do not have.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Endpoint forbids this client.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Endpoint path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint address is not usable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Relay is throttling us.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Relay spoke something we could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FailureReason {
    /// Build a rejection from a relay `OK`/`CLOSED` message.
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        FailureReason::Rejected {
            category: RejectCategory::from_message(&message),
            message,
        }
    }
}

impl Classify for FailureReason {
    fn class(&self) -> ErrorClass {
        match self {
            FailureReason::Rejected { category, .. } => category.class(),
            FailureReason::Unauthorized(_)
            | FailureReason::Forbidden(_)
            | FailureReason::NotFound(_)
            | FailureReason::InvalidEndpoint(_) => ErrorClass::Permanent,
            FailureReason::Unreachable(_)
            | FailureReason::Timeout
            | FailureReason::NotConnected
            | FailureReason::Closed(_)
            | FailureReason::RateLimited(_)
            | FailureReason::Protocol(_) => ErrorClass::Transient,
        }
    }
}

/// A failed operation against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} to {endpoint} failed: {reason}")]
pub struct TransportError {
    /// Operation that failed
    pub op: TransportOp,
    /// Endpoint URL
    pub endpoint: String,
    /// Cause
    pub reason: FailureReason,
}

impl TransportError {
    /// Create a transport error.
    pub fn new(op: TransportOp, endpoint: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            op,
            endpoint: endpoint.into(),
            reason,
        }
    }
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        self.reason.class()
    }
}

/// One connection to one relay.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Endpoint URL this transport talks to.
    fn url(&self) -> &str;

    /// Connect to the relay. A no-op when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send an event and wait for the relay to accept or reject it.
    ///
    /// A `duplicate:` rejection counts as success: the relay already holds it.
    async fn publish(&self, event: &Event) -> Result<(), TransportError>;

    /// Stream stored events matching `filter` into `sink`.
    ///
    /// Returns the number of events delivered once the relay signals
    /// end-of-stored-events. Stops early without error if the receiver is
    /// dropped.
    async fn query(&self, filter: &Filter, sink: mpsc::Sender<Event>)
        -> Result<usize, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
