//! The connector entry point: `StompInput` ties settings, broker client,
//! connection manager and subscription supervisor together.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::BrokerClient;
use crate::config::{ConfigError, StompSettings};
use crate::connection::StompClient;
use crate::event::{Event, EventEmitter};
use crate::lock;
use crate::manager::{ConnectionManager, ConnectionState};
use crate::supervisor::{RunExit, SubscriptionSupervisor};

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connector must be registered before it is started")]
    NotRegistered,

    #[error("connector already started")]
    AlreadyStarted,
}

/// Why a `start` with reconnect disabled gave up.
///
/// Logged and recorded, never returned: see [`StompInput::last_failure`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminalFailure {
    #[error("could not connect to {url}")]
    NeverConnected { url: String },

    #[error("lost connection to {url} and could not reconnect")]
    ConnectionLost { url: String },
}

/// `Created → Registered → Running → Stopping → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Registered,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Registered => "registered",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything built at registration.
struct Registered<C: BrokerClient> {
    client: Arc<C>,
    manager: Arc<ConnectionManager<C>>,
    supervisor: SubscriptionSupervisor<C>,
    url: String,
}

/// STOMP input connector.
///
/// Typical use: [`new`](Self::new), [`register`](Self::register), then
/// [`start`](Self::start) on a task while another task may call
/// [`stop`](Self::stop) at any time (share the input through an `Arc`).
/// `start` keeps the subscription alive across broker disconnects until
/// stop is requested.
pub struct StompInput<C: BrokerClient = StompClient> {
    settings: StompSettings,
    emitter: Arc<EventEmitter>,
    stop: CancellationToken,
    state: Mutex<LifecycleState>,
    started: AtomicBool,
    last_failure: Mutex<Option<TerminalFailure>>,
    registered: Option<Registered<C>>,
}

impl<C: BrokerClient> StompInput<C> {
    /// Validate `settings` and prepare the event emitter.
    pub fn new(settings: StompSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let emitter = Arc::new(EventEmitter::from_settings(&settings));
        Ok(Self {
            settings,
            emitter,
            stop: CancellationToken::new(),
            state: Mutex::new(LifecycleState::Created),
            started: AtomicBool::new(false),
            last_failure: Mutex::new(None),
            registered: None,
        })
    }

    pub fn settings(&self) -> &StompSettings {
        &self.settings
    }

    /// Register with a caller-supplied broker client.
    pub fn register_with(&mut self, client: Arc<C>) {
        let descriptor = self.settings.descriptor();
        let url = descriptor.url();
        let manager = Arc::new(
            ConnectionManager::new(
                client.clone(),
                self.settings.retry_policy(),
                self.stop.clone(),
                url.clone(),
            )
            .with_debug(self.settings.debug),
        );
        let supervisor = SubscriptionSupervisor::new(
            manager.clone(),
            self.settings.destination.clone(),
            self.settings.header_mode(),
            self.emitter.clone(),
            self.stop.clone(),
        );
        self.registered = Some(Registered {
            client,
            manager,
            supervisor,
            url,
        });
        self.transition(LifecycleState::Registered);
        debug!(url = %descriptor, destination = %self.settings.destination, "stomp input registered");
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// State of the connection manager; `Disconnected` before registration.
    pub fn connection_state(&self) -> ConnectionState {
        self.registered
            .as_ref()
            .map(|r| r.manager.state())
            .unwrap_or_default()
    }

    /// Retry pauses taken so far by the connection manager.
    pub fn retry_count(&self) -> u64 {
        self.registered
            .as_ref()
            .map(|r| r.manager.retry_count())
            .unwrap_or(0)
    }

    /// The connection failure that ended the last `start`, if any.
    pub fn last_failure(&self) -> Option<TerminalFailure> {
        lock(&self.last_failure).clone()
    }

    fn transition(&self, next: LifecycleState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = %*state, to = %next, "lifecycle transition");
            *state = next;
        }
    }

    /// Connect, subscribe and forward events to `sink` until stopped.
    ///
    /// Lost connections are re-established on the same path used at
    /// startup. Connection failures never surface as errors: when a connect
    /// fails with reconnect disabled the failure is logged, recorded in
    /// [`last_failure`](Self::last_failure), and `start` returns `Ok(())`
    /// in the `Stopped` state. Errors are reserved for misuse.
    pub async fn start(&self, sink: UnboundedSender<Event>) -> Result<(), ConnectorError> {
        let Some(parts) = self.registered.as_ref() else {
            return Err(ConnectorError::NotRegistered);
        };
        if self.stop.is_cancelled() {
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectorError::AlreadyStarted);
        }

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();
        parts.client.on_connection_closed(Arc::new(move || {
            let _ = closed_tx.send(());
        }));

        let mut ever_connected = false;
        let failure = loop {
            match parts.manager.connect().await {
                ConnectionState::Connected => {}
                ConnectionState::Stopping => break None,
                _ if self.stop.is_cancelled() => break None,
                _ => {
                    let url = parts.url.clone();
                    break Some(if ever_connected {
                        TerminalFailure::ConnectionLost { url }
                    } else {
                        TerminalFailure::NeverConnected { url }
                    });
                }
            }
            ever_connected = true;
            // Notifications about sessions that ended before this connect
            // must not end the new subscription.
            while closed_rx.try_recv().is_ok() {}

            let exit = parts
                .supervisor
                .run_with(&sink, &mut closed_rx, |_| {
                    let mut state = lock(&self.state);
                    if *state == LifecycleState::Registered {
                        *state = LifecycleState::Running;
                    }
                })
                .await;

            match exit {
                RunExit::Stopped => break None,
                RunExit::ConnectionLost | RunExit::NotConnected => {
                    parts.manager.mark_disconnected();
                    info!(url = %parts.url, "stomp connection lost, reconnecting");
                }
                RunExit::SubscribeFailed(e) => {
                    debug!(error = %e, "dropping connection after failed subscribe");
                    if let Err(e) = parts.client.disconnect().await {
                        debug!(error = %e, "disconnect after failed subscribe");
                    }
                    parts.manager.mark_disconnected();
                    if !parts.manager.wait_before_retry().await {
                        break None;
                    }
                }
            }
        };

        if parts.client.is_connected() {
            if let Err(e) = parts.client.disconnect().await {
                debug!(error = %e, "disconnect on exit failed");
            }
        }
        if let Some(failure) = failure {
            warn!(error = %failure, "stomp input giving up, reconnect is disabled");
            *lock(&self.last_failure) = Some(failure);
        }
        self.transition(LifecycleState::Stopped);
        Ok(())
    }

    /// Request shutdown. Safe to call any number of times, from any task.
    ///
    /// Wakes a pending `start`, which then finishes and moves the state to
    /// `Stopped`. Disconnect failures are logged and ignored.
    pub async fn stop(&self) {
        self.stop.cancel();
        if self.started.load(Ordering::SeqCst) {
            let mut state = lock(&self.state);
            if *state != LifecycleState::Stopped {
                *state = LifecycleState::Stopping;
            }
        } else {
            self.transition(LifecycleState::Stopped);
        }

        let Some(parts) = self.registered.as_ref() else {
            return;
        };
        parts.manager.mark_stopping();
        if parts.client.is_connected() {
            match parts.client.disconnect().await {
                Ok(()) => debug!("disconnected on stop"),
                Err(e) => debug!(error = %e, "disconnect on stop failed"),
            }
        }
    }
}

impl StompInput<StompClient> {
    /// Build the network client from the settings and register it.
    ///
    /// Fails when the TLS material cannot be loaded.
    pub fn register(&mut self) -> Result<(), ConfigError> {
        let client = StompClient::new(self.settings.descriptor())?
            .with_heartbeat(self.settings.heartbeat.clone())
            .with_debug(self.settings.debug);
        self.register_with(Arc::new(client));
        Ok(())
    }
}

impl<C: BrokerClient> fmt::Debug for StompInput<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompInput")
            .field("destination", &self.settings.destination)
            .field("state", &self.state())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}
