//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the single logical connection to the broker. It
//! never blocks: transports report what happens to an attempt through an
//! [`EventSink`], and the manager folds those events into [`ConnectionState`]
//! from [`ConnectionManager::next_change`], which the application loop polls
//! alongside its other inputs.
//!
//! Every connection attempt gets a fresh epoch. Events carrying an older epoch
//! belong to an attempt that has since been torn down and are dropped, so a
//! handshake completing after [`ConnectionManager::stop`] cannot bring the
//! connection back.

pub mod stomp;

#[cfg(feature = "websocket")]
pub mod websocket;

use std::fmt;
use std::time::Duration;
use stomp::{FrameError, HeartBeat};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Default delay before reconnecting after a failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Default heart-beat interval in both directions.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(4000);

/// Default limit for the broker to answer CONNECT once the socket is open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How long [`ConnectionManager::shutdown`] waits for a graceful close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(2000);

/// Logical destination scans are published to.
pub const DEFAULT_DESTINATION: &str = "/app/barcode/send";

/// Errors raised inside a transport. They never reach callers of the manager;
/// transports turn them into [`ConnectionEvent::Error`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Broker reported error: {0}")]
    Broker(String),
    #[error("No heart-beat from broker for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("No CONNECTED frame from broker within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Link closed")]
    LinkClosed,
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Errored => write!(f, "errored"),
        }
    }
}

/// Lifecycle events raised by a transport, in the order they happened.
///
/// Socket failures and broker `ERROR` frames both arrive as `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Why a publish was not handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotConnected,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotConnected => write!(f, "not connected"),
        }
    }
}

/// Result of [`ConnectionManager::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport; delivery is not confirmed
    Accepted,
    Rejected(RejectReason),
}

/// Fixed-delay reconnect policy. Retries never give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

/// Everything needed to (re)establish the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// WebSocket URL, e.g. `ws://192.168.10.9:8080/ws-mobile`
    pub url: String,
    /// STOMP `host` header; the URL host is used when unset
    pub vhost: Option<String>,
    pub credentials: Option<Credentials>,
    /// Client side of the heart-beat negotiation
    pub heart_beat: HeartBeat,
    /// Send frames as binary WebSocket messages instead of text
    pub binary_frames: bool,
    /// Limit on opening the socket and receiving CONNECTED
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        BrokerConfig {
            url: url.into(),
            vhost: None,
            credentials: None,
            heart_beat: HeartBeat::new(DEFAULT_HEARTBEAT, DEFAULT_HEARTBEAT),
            binary_frames: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Where a transport reports events for one connection attempt.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
}

impl EventSink {
    /// Report an event. Returns `false` once the manager is gone.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A transport capable of opening broker connections.
pub trait Transport: Send + Sync {
    /// Begin a connection attempt and return immediately.
    ///
    /// The outcome of the handshake and everything after it is reported on
    /// `events`. The returned [`Link`] is how the manager sends and closes.
    fn connect(&self, config: &BrokerConfig, events: EventSink) -> Box<dyn Link>;
}

/// Resolves once a link has finished closing, or its task is gone.
pub type Closing = oneshot::Receiver<()>;

/// Handle to one connection attempt.
pub trait Link: Send {
    /// Queue a message for delivery without waiting for it to be written.
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError>;

    /// Disconnect gracefully. Further events from this link are ignored.
    ///
    /// The close happens in the background; await the returned handle to know
    /// it is done.
    fn close(&self) -> Closing;
}

/// Owns the broker connection and its reconnect loop.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    config: Option<BrokerConfig>,
    state: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, ConnectionEvent)>,
    /// Epoch of the current attempt; bumped on every connect and teardown
    epoch: u64,
    link: Option<Box<dyn Link>>,
    /// Close handle of the most recently torn down link
    closing: Option<Closing>,
    retry_at: Option<Instant>,
    /// Set by `start`, cleared by `stop`
    active: bool,
    last_error: Option<String>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            transport,
            config: None,
            state,
            events_tx,
            events_rx,
            epoch: 0,
            link: None,
            closing: None,
            retry_at: None,
            active: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes from the presentation layer.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Detail of the most recent transport or broker error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Start connecting. No-op while `Connecting` or `Connected`.
    ///
    /// From `Errored` any pending retry is cancelled and a new attempt begins
    /// right away.
    pub fn start(&mut self, config: BrokerConfig) {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(%state, "start ignored, connection already in progress");
            return;
        }

        info!(url = %config.url, "starting broker connection");
        self.config = Some(config);
        self.active = true;
        self.retry_at = None;
        self.connect();
    }

    /// Tear the connection down and cancel any pending retry. Safe in any state.
    pub fn stop(&mut self) {
        if self.active {
            info!("stopping broker connection");
        }
        self.active = false;
        self.retry_at = None;
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    /// [`stop`](Self::stop), then wait up to `grace` for the transport to
    /// finish closing.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.stop();
        let Some(closing) = self.closing.take() else {
            return;
        };
        if timeout(grace, closing).await.is_err() {
            warn!(?grace, "transport did not close in time");
        }
    }

    /// Hand `payload` to the transport if connected.
    ///
    /// Never waits for I/O, never buffers: when not connected the payload is
    /// rejected and the transport is not touched.
    pub fn publish(&mut self, destination: &str, payload: &str) -> PublishOutcome {
        if self.state() != ConnectionState::Connected {
            return PublishOutcome::Rejected(RejectReason::NotConnected);
        }
        let Some(link) = self.link.as_ref() else {
            return PublishOutcome::Rejected(RejectReason::NotConnected);
        };

        match link.send(destination, payload) {
            Ok(()) => {
                debug!(destination, payload, "publish handed to transport");
                PublishOutcome::Accepted
            }
            Err(error) => {
                warn!(%error, "publish handoff failed");
                PublishOutcome::Rejected(RejectReason::NotConnected)
            }
        }
    }

    /// Wait for the next state change caused by a transport event or a retry.
    ///
    /// Cancel safe: dropping the future loses no events.
    pub async fn next_change(&mut self) -> ConnectionState {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;
                event = self.events_rx.recv() => {
                    // The manager holds a sender, so the channel never closes
                    let Some((epoch, event)) = event else {
                        std::future::pending::<()>().await;
                        continue;
                    };
                    if let Some(state) = self.apply(epoch, event) {
                        return state;
                    }
                }
                _ = sleep_until_some(retry_at) => {
                    self.retry_at = None;
                    if self.active {
                        info!("retrying broker connection");
                        self.connect();
                        return self.state();
                    }
                }
            }
        }
    }

    /// Fold one transport event into the state machine.
    fn apply(&mut self, epoch: u64, event: ConnectionEvent) -> Option<ConnectionState> {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, ?event, "dropping event from stale attempt");
            return None;
        }

        match (self.state(), event) {
            (ConnectionState::Connecting, ConnectionEvent::Connected) => {
                self.last_error = None;
                self.set_state(ConnectionState::Connected)
            }
            (
                ConnectionState::Connecting | ConnectionState::Connected,
                ConnectionEvent::Error(detail),
            ) => self.fail(detail),
            (ConnectionState::Connecting, ConnectionEvent::Disconnected) => {
                self.fail(TransportError::ClosedDuringHandshake.to_string())
            }
            (ConnectionState::Connected, ConnectionEvent::Disconnected) => {
                info!("broker closed the connection");
                self.teardown();
                self.schedule_retry();
                self.set_state(ConnectionState::Disconnected)
            }
            (state, event) => {
                debug!(%state, ?event, "ignoring connection event");
                None
            }
        }
    }

    fn fail(&mut self, detail: String) -> Option<ConnectionState> {
        warn!(%detail, "broker connection failed");
        self.last_error = Some(detail);
        self.teardown();
        self.schedule_retry();
        self.set_state(ConnectionState::Errored)
    }

    fn connect(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        self.epoch += 1;
        let sink = EventSink {
            epoch: self.epoch,
            tx: self.events_tx.clone(),
        };
        let link = self.transport.connect(config, sink);
        self.link = Some(link);
        self.set_state(ConnectionState::Connecting);
    }

    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            self.closing = Some(link.close());
        }
        self.epoch += 1;
    }

    fn schedule_retry(&mut self) {
        if !self.active {
            return;
        }
        let delay = self.config.as_ref().map(|c| c.retry.delay).unwrap_or_default();
        info!(?delay, "reconnect scheduled");
        self.retry_at = Some(Instant::now() + delay);
    }

    fn set_state(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        let previous = self.state.send_replace(next);
        if previous == next {
            return None;
        }
        info!(from = %previous, to = %next, "connection state changed");
        Some(next)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.close();
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
