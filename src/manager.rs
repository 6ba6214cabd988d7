//! Connection manager: owns the connection state and the retry loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::BrokerClient;
use crate::lock;

/// Whether and how often failed connects are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Pause between two attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Drives a [`BrokerClient`] to the connected state.
///
/// Connect failures never escape this type: they are logged and, when the
/// policy allows it, retried after `RetryPolicy::interval`. The stop token is
/// checked before every attempt and before every pause, and interrupts a
/// pause that is already running.
pub struct ConnectionManager<C: BrokerClient> {
    client: Arc<C>,
    policy: RetryPolicy,
    stop: CancellationToken,
    state: Mutex<ConnectionState>,
    retries: AtomicU64,
    url: String,
    debug: bool,
}

impl<C: BrokerClient> ConnectionManager<C> {
    /// `url` is only used in log lines; it must not carry credentials.
    pub fn new(client: Arc<C>, policy: RetryPolicy, stop: CancellationToken, url: impl Into<String>) -> Self {
        Self {
            client,
            policy,
            stop,
            state: Mutex::new(ConnectionState::Disconnected),
            retries: AtomicU64::new(0),
            url: url.into(),
            debug: false,
        }
    }

    /// Log the full error of every failed attempt at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Number of retry pauses started so far.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Connected according to both the manager and the client.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.client.is_connected()
    }

    /// Record a lost connection. Has no effect once stopping.
    pub fn mark_disconnected(&self) {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Stopping {
            *state = ConnectionState::Disconnected;
        }
    }

    pub fn mark_stopping(&self) {
        self.set_state(ConnectionState::Stopping);
    }

    /// Connect, retrying per policy until connected, stopped, or out of
    /// retries. Returns the resulting state.
    pub async fn connect(&self) -> ConnectionState {
        loop {
            if self.stop.is_cancelled() {
                self.mark_stopping();
                return ConnectionState::Stopping;
            }
            self.set_state(ConnectionState::Connecting);

            match self.client.connect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!(url = %self.url, "connected to stomp server");
                    return ConnectionState::Connected;
                }
                Err(e) => {
                    if self.debug {
                        debug!(error = ?e, url = %self.url, "connect attempt failed");
                    }
                    if !self.policy.enabled {
                        warn!(error = %e, url = %self.url, "failed to connect to stomp server, reconnect disabled");
                        self.set_state(ConnectionState::Disconnected);
                        return ConnectionState::Disconnected;
                    }
                    warn!(
                        error = %e,
                        url = %self.url,
                        interval = ?self.policy.interval,
                        "failed to connect to stomp server, will retry"
                    );
                    if !self.wait_before_retry().await {
                        self.mark_stopping();
                        return ConnectionState::Stopping;
                    }
                }
            }
        }
    }

    /// Pause for the retry interval.
    ///
    /// Returns `false` without waiting when stop was already requested, or
    /// as soon as it is requested during the pause.
    pub async fn wait_before_retry(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.retries.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.policy.interval) => !self.stop.is_cancelled(),
        }
    }
}
