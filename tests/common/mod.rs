//! Scripted broker client shared by the lifecycle tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stomp_input::client::{ClosedCallback, MessageHandler};
use stomp_input::{BrokerClient, ConnError, ConnectError, Message, SubscriptionHandle};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Subscribe(String),
    Disconnect,
}

/// What the next connect attempts return once the script runs out.
#[derive(Debug, Clone, Copy)]
enum After {
    Succeed,
    Fail,
}

pub struct ScriptedClient {
    script: Mutex<VecDeque<bool>>,
    after: After,
    connected: AtomicBool,
    calls: Mutex<Vec<Call>>,
    callback: Mutex<Option<ClosedCallback>>,
    handler: Mutex<Option<MessageHandler>>,
    subscribe_failures: AtomicU64,
    subscriptions: watch::Sender<usize>,
}

impl ScriptedClient {
    fn build(script: Vec<bool>, after: After) -> Arc<Self> {
        let (subscriptions, _) = watch::channel(0);
        Arc::new(Self {
            script: Mutex::new(script.into()),
            after,
            connected: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            handler: Mutex::new(None),
            subscribe_failures: AtomicU64::new(0),
            subscriptions,
        })
    }

    /// Every connect succeeds.
    pub fn reliable() -> Arc<Self> {
        Self::build(Vec::new(), After::Succeed)
    }

    /// The first `n` connects fail, later ones succeed.
    pub fn failing_first(n: usize) -> Arc<Self> {
        Self::build(vec![false; n], After::Succeed)
    }

    /// Every connect fails.
    pub fn unreachable() -> Arc<Self> {
        Self::build(Vec::new(), After::Fail)
    }

    /// Connect outcomes in order (`true` = success); failures afterwards.
    pub fn scripted(outcomes: Vec<bool>) -> Arc<Self> {
        Self::build(outcomes, After::Fail)
    }

    pub fn fail_next_subscribes(&self, n: u64) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.handler.lock().unwrap().take();
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Hand `message` to the current subscription handler.
    pub fn deliver(&self, message: Message) {
        let handler = self.handler.lock().unwrap().clone();
        let handler = handler.expect("no active subscription");
        handler(message);
    }

    /// Wait until at least `n` subscriptions succeeded.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        let mut rx = self.subscriptions.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|count| *count >= n))
            .await
            .expect("timed out waiting for subscription")
            .expect("subscription channel closed");
    }
}

#[async_trait]
impl BrokerClient for ScriptedClient {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.calls.lock().unwrap().push(Call::Connect);
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let next = self.script.lock().unwrap().pop_front();
        let ok = match (next, self.after) {
            (Some(ok), _) => ok,
            (None, After::Succeed) => true,
            (None, After::Fail) => false,
        };
        if ok {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ConnectError::Refused(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), ConnError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(ConnError::NotConnected);
        }
        self.calls.lock().unwrap().push(Call::Disconnect);
        self.handler.lock().unwrap().take();
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, ConnError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(destination.to_string()));
        if !self.is_connected() {
            return Err(ConnError::NotConnected);
        }
        let left = self.subscribe_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.subscribe_failures.store(left - 1, Ordering::SeqCst);
            return Err(ConnError::Protocol("subscription rejected".into()));
        }
        *self.handler.lock().unwrap() = Some(handler);
        self.subscriptions.send_modify(|count| *count += 1);
        Ok(SubscriptionHandle::new(
            self.calls().len().to_string(),
            destination,
        ))
    }

    fn on_connection_closed(&self, callback: ClosedCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}
