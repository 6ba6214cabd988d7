//! STOMP input connector.
//!
//! Subscribes to one destination on a STOMP broker and forwards every
//! message, decoded into [`Event`]s, to a downstream channel. Lost
//! connections are re-established according to the configured retry
//! policy until [`StompInput::stop`] is called.
//!
//! ```no_run
//! use stomp_input::{StompInput, StompSettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = StompSettings::for_destination("/topic/logstash");
//! let mut input: StompInput = StompInput::new(settings)?;
//! input.register()?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<stomp_input::Event>();
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{}", event.to_json());
//!     }
//! });
//! input.start(tx).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod event;
pub mod frame;
pub mod headers;
pub mod input;
pub mod manager;
pub mod supervisor;
pub mod transport;

pub use client::{BrokerClient, ConnError, ConnectError, Message, SubscriptionHandle};
pub use codec::{StompCodec, StompItem};
pub use config::{ConfigError, Secret, StompSettings};
pub use connection::{StompClient, negotiate_heartbeats, parse_heartbeat_header};
pub use event::{Codec, CodecKind, DecodeError, Event, EventEmitter};
pub use frame::Frame;
pub use headers::HeaderMode;
pub use input::{ConnectorError, LifecycleState, StompInput, TerminalFailure};
pub use manager::{ConnectionManager, ConnectionState, RetryPolicy};
pub use supervisor::{RunExit, SubscriptionSupervisor};
pub use transport::{ConnectionDescriptor, Credentials, TlsSettings};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// None of the guarded values can be left half-updated, so a poisoned lock
/// is still safe to use.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
