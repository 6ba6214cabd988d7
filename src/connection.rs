use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    BrokerClient, ClosedCallback, ConnError, ConnectError, Message, MessageHandler,
    SubscriptionHandle,
};
use crate::codec::{StompCodec, StompItem};
use crate::frame::{Frame, SUPPORTED_VERSIONS};
use crate::lock;
use crate::transport::{self, BoxedStream, ConnectionDescriptor, TlsError};

/// Upper bound for the TCP/TLS open plus CONNECT/CONNECTED exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful disconnect waits for the broker's RECEIPT.
pub const DISCONNECT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(2);

// Tick used for heart-beat timers that are disabled; the select! branch is
// guarded off anyway.
const IDLE_TICK: Duration = Duration::from_secs(86400);

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default
/// to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Negotiate heart-beat intervals between client and server.
///
/// Parameters
/// - `client_out`: how often the client can send heart-beats (ms).
/// - `client_in`: how often the client wants to receive heart-beats (ms).
/// - `server_out`: how often the server can send heart-beats (ms).
/// - `server_in`: how often the server wants to receive heart-beats (ms).
///
/// Returns `(outgoing, incoming)`. A direction is disabled (`None`) when
/// either side put `0` for it; otherwise the larger of the two values wins.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Subscription registered on the current session.
struct SubscriptionEntry {
    destination: String,
    handler: MessageHandler,
}

/// subscription id -> entry
type Subscriptions = HashMap<String, SubscriptionEntry>;

/// receipt-id -> waiter
type PendingReceipts = HashMap<String, oneshot::Sender<()>>;

/// State shared between the client handle and its session task.
struct Shared {
    connected: AtomicBool,
    /// Set while a locally requested disconnect is in progress so the end of
    /// the session is not reported as a lost connection.
    closing: AtomicBool,
    subscriptions: Mutex<Subscriptions>,
    pending_receipts: Mutex<PendingReceipts>,
    on_closed: Mutex<Option<ClosedCallback>>,
    debug: bool,
}

impl Shared {
    fn dispatch(&self, frame: Frame) {
        if self.debug {
            debug!(frame = %frame, "received frame");
        }
        match frame.command.as_str() {
            "MESSAGE" => {
                let handler = {
                    let subs = lock(&self.subscriptions);
                    let by_id = frame
                        .get_header("subscription")
                        .and_then(|id| subs.get(id));
                    by_id
                        .or_else(|| {
                            let dest = frame.get_header("destination")?;
                            subs.values().find(|e| e.destination == dest)
                        })
                        .map(|e| e.handler.clone())
                };
                match handler {
                    Some(handler) => handler(Message::from(frame)),
                    None => debug!(
                        subscription = frame.get_header("subscription").unwrap_or(""),
                        "dropping MESSAGE for unknown subscription"
                    ),
                }
            }
            "RECEIPT" => {
                if let Some(id) = frame.get_header("receipt-id") {
                    if let Some(waiter) = lock(&self.pending_receipts).remove(id) {
                        let _ = waiter.send(());
                    }
                }
            }
            "ERROR" => error!(error = %frame.error_summary(), "broker sent ERROR frame"),
            other => debug!(command = other, "ignoring frame"),
        }
    }
}

/// Handles to the running session task.
struct Session {
    outbound_tx: mpsc::Sender<StompItem>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

enum CloseReason {
    Local,
    Remote(String),
}

/// Tears the session down when the session task ends, however it ends.
///
/// Runs on unwind too, so a panicking handler still leaves the client
/// disconnected and reported as lost.
struct SessionEnd {
    shared: Arc<Shared>,
    reason: CloseReason,
}

impl Drop for SessionEnd {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.connected.store(false, Ordering::SeqCst);
        lock(&shared.subscriptions).clear();
        lock(&shared.pending_receipts).clear();

        match &self.reason {
            CloseReason::Remote(why) if !shared.closing.load(Ordering::SeqCst) => {
                warn!(reason = %why, "stomp connection lost");
                let callback = lock(&shared.on_closed).clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
            _ => debug!("stomp session closed"),
        }
    }
}

/// STOMP broker client over TCP or TLS.
///
/// Each successful [`BrokerClient::connect`] spawns a background task that
/// owns the socket: it writes outbound frames, sends heart-beats, watches
/// for missing inbound traffic and dispatches MESSAGE frames to the
/// subscription handlers in arrival order. When that task ends without a
/// local `disconnect`, the closed callback fires once and all subscriptions
/// are forgotten, as brokers drop them with the connection.
pub struct StompClient {
    descriptor: ConnectionDescriptor,
    tls: Option<TlsConnector>,
    heartbeat: String,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    /// Serialises connect attempts so two callers cannot open two sessions.
    connect_lock: tokio::sync::Mutex<()>,
    sub_id_counter: AtomicU64,
    receipt_counter: AtomicU64,
}

impl StompClient {
    /// Create a client for `descriptor`.
    ///
    /// The TLS connector is built here when TLS is enabled, so certificate
    /// problems surface before any connection attempt.
    pub fn new(descriptor: ConnectionDescriptor) -> Result<Self, TlsError> {
        let tls = if descriptor.tls.enabled {
            Some(transport::build_tls_connector(&descriptor.tls)?)
        } else {
            None
        };
        Ok(Self {
            descriptor,
            tls,
            heartbeat: "0,0".to_string(),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
                pending_receipts: Mutex::new(HashMap::new()),
                on_closed: Mutex::new(None),
                debug: false,
            }),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            sub_id_counter: AtomicU64::new(1),
            receipt_counter: AtomicU64::new(1),
        })
    }

    /// Client `heart-beat` header value ("cx,cy" in milliseconds).
    pub fn with_heartbeat(mut self, heartbeat: impl Into<String>) -> Self {
        self.heartbeat = heartbeat.into();
        self
    }

    /// Log every frame sent and received at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.debug = debug;
        }
        self
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn handshake(&self) -> Result<(Framed<BoxedStream, StompCodec>, Frame), ConnectError> {
        let stream = transport::open(&self.descriptor, self.tls.as_ref()).await?;
        let mut framed = Framed::new(stream, StompCodec::new());

        let creds = &self.descriptor.credentials;
        let connect = Frame::connect(
            self.descriptor.virtual_host(),
            &creds.login,
            creds.passcode.expose(),
            &self.heartbeat,
        );
        if self.shared.debug {
            debug!(frame = %connect, "sending frame");
        }
        framed
            .send(StompItem::Frame(connect))
            .await
            .map_err(|e| ConnectError::Failed(format!("failed to send CONNECT: {}", e)))?;

        let connected = await_connected(&mut framed).await?;
        Ok((framed, connected))
    }
}

/// Read frames until the broker answers the CONNECT.
async fn await_connected(
    framed: &mut Framed<BoxedStream, StompCodec>,
) -> Result<Frame, ConnectError> {
    while let Some(item) = framed.next().await {
        match item {
            Ok(StompItem::Heartbeat) => continue,
            Ok(StompItem::Frame(f)) if f.is("CONNECTED") => {
                return match f.get_header("version") {
                    Some(v) if !SUPPORTED_VERSIONS.contains(&v) => Err(
                        ConnectError::UnsupportedProtocolVersion(format!(
                            "broker selected version {}",
                            v
                        )),
                    ),
                    _ => Ok(f),
                };
            }
            Ok(StompItem::Frame(f)) if f.is("ERROR") => {
                // A `version` header on ERROR lists what the broker speaks
                // when negotiation failed.
                return Err(match f.get_header("version") {
                    Some(v) => ConnectError::UnsupportedProtocolVersion(format!(
                        "broker supports {}",
                        v
                    )),
                    None => ConnectError::Failed(format!(
                        "broker rejected CONNECT: {}",
                        f.error_summary()
                    )),
                });
            }
            Ok(StompItem::Frame(f)) => {
                debug!(command = %f.command, "ignoring frame before CONNECTED")
            }
            Err(e) => {
                return Err(ConnectError::Failed(format!(
                    "invalid frame during handshake: {}",
                    e
                )));
            }
        }
    }
    Err(ConnectError::Failed(
        "connection closed before CONNECTED".to_string(),
    ))
}

async fn run_session(
    framed: Framed<BoxedStream, StompCodec>,
    mut outbound_rx: mpsc::Receiver<StompItem>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
) {
    let mut end = SessionEnd {
        shared: shared.clone(),
        reason: CloseReason::Remote("session task ended unexpectedly".to_string()),
    };
    let (mut sink, mut stream) = framed.split();
    let mut hb_tick = tokio::time::interval(send_interval.unwrap_or(IDLE_TICK));
    let mut watchdog = tokio::time::interval(recv_interval.unwrap_or(IDLE_TICK));
    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                break CloseReason::Local;
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(item) => {
                    if shared.debug {
                        if let StompItem::Frame(f) = &item {
                            debug!(frame = %f, "sending frame");
                        }
                    }
                    if let Err(e) = sink.send(item).await {
                        break CloseReason::Remote(format!("write failed: {}", e));
                    }
                    last_sent = Instant::now();
                }
                None => break CloseReason::Local,
            },
            item = stream.next() => match item {
                Some(Ok(StompItem::Heartbeat)) => last_received = Instant::now(),
                Some(Ok(StompItem::Frame(frame))) => {
                    last_received = Instant::now();
                    shared.dispatch(frame);
                }
                Some(Err(e)) => break CloseReason::Remote(format!("read failed: {}", e)),
                None => break CloseReason::Remote("connection closed by broker".to_string()),
            },
            _ = hb_tick.tick(), if send_interval.is_some() => {
                let every = send_interval.unwrap_or(IDLE_TICK);
                if last_sent.elapsed() >= every {
                    if let Err(e) = sink.send(StompItem::Heartbeat).await {
                        break CloseReason::Remote(format!("heart-beat write failed: {}", e));
                    }
                    last_sent = Instant::now();
                }
            }
            _ = watchdog.tick(), if recv_interval.is_some() => {
                let expected = recv_interval.unwrap_or(IDLE_TICK);
                if last_received.elapsed() > expected * 2 {
                    break CloseReason::Remote(format!(
                        "no data from broker for {:?}",
                        last_received.elapsed()
                    ));
                }
            }
        }
    };

    end.reason = reason;
}

#[async_trait]
impl BrokerClient for StompClient {
    async fn connect(&self) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!(url = %self.descriptor, "connect called while connected");
            return Ok(());
        }

        let (framed, connected) = match tokio::time::timeout(CONNECT_TIMEOUT, self.handshake()).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConnectError::Failed(format!(
                    "no CONNECTED frame within {:?}",
                    CONNECT_TIMEOUT
                )));
            }
        };

        let (cx, cy) = parse_heartbeat_header(&self.heartbeat);
        let (sx, sy) = parse_heartbeat_header(connected.get_header("heart-beat").unwrap_or("0,0"));
        let (send_interval, recv_interval) = negotiate_heartbeats(cx, cy, sx, sy);

        let (outbound_tx, outbound_rx) = mpsc::channel::<StompItem>(32);
        let shutdown = CancellationToken::new();
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_session(
            framed,
            outbound_rx,
            shutdown.clone(),
            self.shared.clone(),
            send_interval,
            recv_interval,
        ));

        let previous = lock(&self.session).replace(Session {
            outbound_tx,
            shutdown,
            task,
        });
        if let Some(previous) = previous {
            previous.shutdown.cancel();
        }

        debug!(
            url = %self.descriptor,
            version = connected.get_header("version").unwrap_or("1.0"),
            send_heartbeat = ?send_interval,
            recv_heartbeat = ?recv_interval,
            "stomp session established"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), ConnError> {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            return Err(ConnError::NotConnected);
        };

        self.shared.closing.store(true, Ordering::SeqCst);
        let was_connected = self.is_connected();
        if was_connected {
            let receipt_id = format!(
                "disconnect-{}",
                self.receipt_counter.fetch_add(1, Ordering::SeqCst)
            );
            let (tx, rx) = oneshot::channel();
            lock(&self.shared.pending_receipts).insert(receipt_id.clone(), tx);
            let frame = Frame::disconnect(&receipt_id);
            if session.outbound_tx.send(StompItem::Frame(frame)).await.is_ok() {
                match tokio::time::timeout(DISCONNECT_RECEIPT_TIMEOUT, rx).await {
                    Ok(Ok(())) => debug!("broker acknowledged DISCONNECT"),
                    _ => debug!("no RECEIPT for DISCONNECT, closing anyway"),
                }
            }
        }

        session.shutdown.cancel();
        if let Err(e) = session.task.await {
            warn!(error = %e, "stomp session task ended abnormally");
        }
        self.shared.connected.store(false, Ordering::SeqCst);

        if was_connected {
            info!(url = %self.descriptor, "disconnected from stomp server");
            Ok(())
        } else {
            Err(ConnError::NotConnected)
        }
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, ConnError> {
        if !self.is_connected() {
            return Err(ConnError::NotConnected);
        }
        let outbound = lock(&self.session)
            .as_ref()
            .map(|s| s.outbound_tx.clone())
            .ok_or(ConnError::NotConnected)?;

        let id = self
            .sub_id_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        lock(&self.shared.subscriptions).insert(
            id.clone(),
            SubscriptionEntry {
                destination: destination.to_string(),
                handler,
            },
        );

        let frame = Frame::subscribe(&id, destination);
        if outbound.send(StompItem::Frame(frame)).await.is_err() {
            lock(&self.shared.subscriptions).remove(&id);
            return Err(ConnError::Protocol("send channel closed".into()));
        }
        debug!(destination, id = %id, "subscribed");
        Ok(SubscriptionHandle::new(id, destination))
    }

    fn on_connection_closed(&self, callback: ClosedCallback) {
        *lock(&self.shared.on_closed) = Some(callback);
    }
}

impl Drop for StompClient {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            self.shared.closing.store(true, Ordering::SeqCst);
            session.shutdown.cancel();
        }
    }
}
