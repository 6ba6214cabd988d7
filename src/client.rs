//! The contract between the connector core and the component owning the
//! broker connection.
//!
//! [`BrokerClient`] is the seam the connection manager and subscription
//! supervisor are written against. [`crate::connection::StompClient`] is the
//! network implementation; tests drive the core with scripted doubles.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::frame::Frame;

/// Failures of a connect attempt. All variants are recoverable and subject
/// to the retry policy.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The broker host actively refused the TCP connection.
    #[error("connection refused: {0}")]
    Refused(#[source] io::Error),
    /// No STOMP version acceptable to both sides.
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),
    /// Any other failure: unreachable host, TLS handshake, ERROR frame,
    /// timeout, connection closed during the handshake.
    #[error("connect failed: {0}")]
    Failed(String),
}

impl ConnectError {
    /// Classify an I/O error raised while opening the transport.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused(err),
            _ => ConnectError::Failed(err.to_string()),
        }
    }
}

/// Errors returned by operations on an established session.
#[derive(Error, Debug)]
pub enum ConnError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,
}

/// An inbound message as delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Headers in the order the broker sent them.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Self {
            headers: frame.headers,
            body: frame.body,
        }
    }
}

/// Token for an active subscription to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: String,
    destination: String,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
        }
    }

    /// The subscription id sent in the SUBSCRIBE frame.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.destination, self.id)
    }
}

/// Called once per inbound message, on the client's session task.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Called once per unexpected disconnect, on the client's session task.
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Operations the connector needs from a broker connection.
///
/// Implementations own the physical connection and any background tasks.
/// `connect` must be a no-op when already connected; `disconnect` may fail
/// with [`ConnError::NotConnected`] when there is nothing to close.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Open the connection and complete the STOMP handshake.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Close the session gracefully. Does not fire the closed callback.
    async fn disconnect(&self) -> Result<(), ConnError>;

    /// Subscribe to `destination`; `handler` receives every MESSAGE in
    /// delivery order until the connection drops.
    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, ConnError>;

    /// Register the callback fired when the connection is lost. Replaces any
    /// previously registered callback.
    fn on_connection_closed(&self, callback: ClosedCallback);
}
