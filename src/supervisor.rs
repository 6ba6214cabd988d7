//! Subscription supervisor: subscribes once per connection and parks until
//! the connection is lost or the connector stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BrokerClient, ConnError, Message, MessageHandler, SubscriptionHandle};
use crate::event::{Event, EventEmitter};
use crate::headers::HeaderMode;
use crate::lock;
use crate::manager::ConnectionManager;

/// Why [`SubscriptionSupervisor::run`] returned.
#[derive(Debug)]
pub enum RunExit {
    /// Stop was requested.
    Stopped,
    /// A disconnect notification arrived after subscribing.
    ConnectionLost,
    /// There was no connection to subscribe on; nothing was done.
    NotConnected,
    /// The broker client refused the subscription.
    SubscribeFailed(ConnError),
}

pub struct SubscriptionSupervisor<C: BrokerClient> {
    manager: Arc<ConnectionManager<C>>,
    destination: String,
    header_mode: HeaderMode,
    emitter: Arc<EventEmitter>,
    stop: CancellationToken,
    active: Mutex<Option<SubscriptionHandle>>,
}

impl<C: BrokerClient> SubscriptionSupervisor<C> {
    pub fn new(
        manager: Arc<ConnectionManager<C>>,
        destination: impl Into<String>,
        header_mode: HeaderMode,
        emitter: Arc<EventEmitter>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            manager,
            destination: destination.into(),
            header_mode,
            emitter,
            stop,
            active: Mutex::new(None),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The subscription currently held, if any.
    pub fn active_subscription(&self) -> Option<SubscriptionHandle> {
        lock(&self.active).clone()
    }

    /// Subscribe and wait.
    ///
    /// Returns immediately with [`RunExit::NotConnected`] when the manager
    /// has no live connection. Otherwise every inbound message is turned
    /// into events pushed onto `sink`, and the call parks until stop is
    /// requested or a notification arrives on `closed`.
    pub async fn run(
        &self,
        sink: &UnboundedSender<Event>,
        closed: &mut UnboundedReceiver<()>,
    ) -> RunExit {
        self.run_with(sink, closed, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_subscribed` once the broker
    /// client accepted the subscription and before parking.
    pub async fn run_with<F>(
        &self,
        sink: &UnboundedSender<Event>,
        closed: &mut UnboundedReceiver<()>,
        on_subscribed: F,
    ) -> RunExit
    where
        F: FnOnce(&SubscriptionHandle) + Send,
    {
        if !self.manager.is_connected() {
            debug!(destination = %self.destination, "not connected, skipping subscribe");
            return RunExit::NotConnected;
        }

        let handler = self.message_handler(sink.clone());
        let handle = match self.manager.client().subscribe(&self.destination, handler).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, destination = %self.destination, "subscribe failed");
                return RunExit::SubscribeFailed(e);
            }
        };
        info!(subscription = %handle, "subscribed");
        on_subscribed(&handle);
        *lock(&self.active) = Some(handle);

        let exit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => RunExit::Stopped,
            notified = closed.recv() => match notified {
                Some(()) => RunExit::ConnectionLost,
                // Nobody can report a lost connection any more; only stop
                // ends the wait.
                None => {
                    self.stop.cancelled().await;
                    RunExit::Stopped
                }
            },
        };

        lock(&self.active).take();
        debug!(destination = %self.destination, exit = ?exit, "subscription ended");
        exit
    }

    fn message_handler(&self, sink: UnboundedSender<Event>) -> MessageHandler {
        let header_mode = self.header_mode.clone();
        let emitter = self.emitter.clone();
        let sink_closed = Arc::new(AtomicBool::new(false));
        Arc::new(move |message: Message| {
            for event in message_to_events(&message, &header_mode, &emitter) {
                if sink.send(event).is_err() {
                    if !sink_closed.swap(true, Ordering::SeqCst) {
                        warn!("event sink closed, dropping events");
                    }
                    return;
                }
            }
        })
    }
}

/// Decode and decorate one message.
///
/// An undecodable payload yields a single fallback event carrying the raw
/// payload.
pub fn message_to_events(message: &Message, mode: &HeaderMode, emitter: &EventEmitter) -> Vec<Event> {
    let payload = mode.payload(message);
    let mut events = match emitter.decode(&payload) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "failed to decode message payload");
            vec![emitter.fallback(&payload)]
        }
    };
    for event in &mut events {
        mode.apply(message, event);
        emitter.decorate(event);
    }
    events
}
