//! Core application runner (business logic) for `scan-relay`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically with an injected detection source and
//! an injected transport.

use crate::connection::stomp::HeartBeat;
use crate::connection::{
    BrokerConfig, ConnectionManager, ConnectionState, Credentials, DEFAULT_CLOSE_GRACE,
    DEFAULT_DESTINATION, PublishOutcome, RetryPolicy, Transport,
};
use crate::debounce::{Debouncer, parse_duration};
use crate::detection::{RawDetection, ScanEvent};
use crate::publisher::{EventPublisher, PublishStats};
use crate::source::{self, SourceError};
use clap::Parser;
use std::future::Future;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// STOMP-over-WebSocket endpoint of the broker.
    #[arg(
        long,
        env = "SCAN_RELAY_BROKER_URL",
        default_value = "ws://127.0.0.1:8080/ws-mobile"
    )]
    pub broker_url: String,

    /// Virtual host for the STOMP host header. Defaults to the URL host.
    #[arg(long, env = "SCAN_RELAY_VHOST")]
    pub vhost: Option<String>,

    /// Broker login.
    #[arg(long, env = "SCAN_RELAY_LOGIN", requires = "passcode")]
    pub login: Option<String>,

    /// Broker passcode.
    #[arg(long, env = "SCAN_RELAY_PASSCODE", requires = "login", hide_env_values = true)]
    pub passcode: Option<String>,

    /// Destination each scan is sent to.
    #[arg(long, env = "SCAN_RELAY_DESTINATION", default_value = DEFAULT_DESTINATION)]
    pub destination: String,

    /// Read scans from this file or named pipe instead of stdin.
    #[arg(long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Ignore further detections for this long after an accepted scan.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, value_parser = parse_duration, default_value = "1000ms")]
    pub debounce: Duration,

    /// Delay before reconnecting after the connection fails.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub reconnect_delay: Duration,

    /// Give up on a connection attempt if the broker has not answered by then.
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub connect_timeout: Duration,

    /// Heart-beat interval expected from the broker (0 disables).
    #[arg(long, value_parser = parse_duration, default_value = "4000ms")]
    pub heartbeat_incoming: Duration,

    /// Heart-beat interval sent to the broker (0 disables).
    #[arg(long, value_parser = parse_duration, default_value = "4000ms")]
    pub heartbeat_outgoing: Duration,

    /// Send STOMP frames as text WebSocket messages instead of binary.
    #[arg(long)]
    pub text_frames: bool,

    /// Verbose output, log connection and frame details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Broker connection settings derived from the command line.
    pub fn broker_config(&self) -> BrokerConfig {
        let credentials = match (&self.login, &self.passcode) {
            (Some(login), Some(passcode)) => Some(Credentials {
                login: login.clone(),
                passcode: passcode.clone(),
            }),
            _ => None,
        };

        BrokerConfig {
            url: self.broker_url.clone(),
            vhost: self.vhost.clone(),
            credentials,
            heart_beat: HeartBeat::new(self.heartbeat_outgoing, self.heartbeat_incoming),
            binary_frames: !self.text_frames,
            connect_timeout: self.connect_timeout,
            retry: RetryPolicy {
                delay: self.reconnect_delay,
            },
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Detection source abstraction to enable deterministic unit tests without scanner hardware.
pub trait DetectionSource: Send + Sync {
    fn start<'a>(
        &'a self,
        input: Option<&'a Path>,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<RawDetection>, SourceError>> + Send + 'a>>;
}

/// Real source reading one scan per line from stdin or the given path.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineSource;

impl DetectionSource for LineSource {
    fn start<'a>(
        &'a self,
        input: Option<&'a Path>,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<RawDetection>, SourceError>> + Send + 'a>>
    {
        Box::pin(async move {
            match input {
                Some(path) => source::start_file(path).await,
                None => Ok(source::start_stdin()),
            }
        })
    }
}

/// An accepted scan and what happened when it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub event: ScanEvent,
    pub outcome: PublishOutcome,
}

/// The scan pipeline: debouncer, publisher and broker connection.
///
/// This is the surface a presentation layer drives. It accepts the
/// `start_session` / `stop_session` commands and exposes connection state,
/// the session list and the last scan read-only.
pub struct ScanRelay {
    debouncer: Debouncer,
    publisher: EventPublisher,
    connection: ConnectionManager,
}

impl ScanRelay {
    pub fn new(
        transport: Box<dyn Transport>,
        destination: impl Into<String>,
        debounce_window: Duration,
    ) -> Self {
        ScanRelay {
            debouncer: Debouncer::new(debounce_window),
            publisher: EventPublisher::new(destination),
            connection: ConnectionManager::new(transport),
        }
    }

    /// Start the broker connection. It outlives sessions.
    pub fn connect(&mut self, config: BrokerConfig) {
        self.connection.start(config);
    }

    pub fn disconnect(&mut self) {
        self.connection.stop();
    }

    /// Disconnect and wait briefly for the transport to say goodbye.
    pub async fn shutdown(&mut self) {
        self.connection.shutdown(DEFAULT_CLOSE_GRACE).await;
    }

    /// Clear the scan list and restart sequence numbering.
    pub fn start_session(&mut self, now: Instant) {
        self.debouncer.reset();
        self.publisher.start_session(now);
    }

    pub fn stop_session(&mut self) {
        self.publisher.stop_session();
    }

    /// Feed one raw detection through the pipeline.
    ///
    /// Returns `None` when no session is active or the debouncer suppressed it.
    pub fn on_detection(&mut self, raw: RawDetection) -> Option<ScanOutcome> {
        if !self.publisher.session().is_active() {
            debug!(payload = %raw.payload, "no active session, detection dropped");
            return None;
        }

        let Some(event) = self.debouncer.accept(raw) else {
            debug!("detection suppressed");
            return None;
        };

        let outcome = self.publisher.on_scan(event.clone(), &mut self.connection);
        Some(ScanOutcome { event, outcome })
    }

    /// Wait for the next connection state change.
    pub async fn next_connection_change(&mut self) -> ConnectionState {
        self.connection.next_change().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }
}

fn write_outcome(scan: &ScanOutcome, out: &mut dyn Write, err: &mut dyn Write) -> io::Result<()> {
    let ScanEvent {
        payload,
        sequence_number,
    } = &scan.event;
    match scan.outcome {
        PublishOutcome::Accepted => writeln!(out, "sent #{sequence_number} {payload}"),
        PublishOutcome::Rejected(reason) => {
            writeln!(err, "{reason}, scan #{sequence_number} not sent: {payload}")
        }
    }
}

/// Run the core processing loop, writing scan results to `out` and delivery
/// problems to `err`.
///
/// - Connection state changes are written to `out` as they happen.
/// - Each accepted scan is published once; rejections are written to `err`.
/// - At end of input the session is stopped, the connection closed and a
///   summary line written.
pub async fn run_with_io(
    options: Options,
    source: &dyn DetectionSource,
    transport: Box<dyn Transport>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<PublishStats, RunError> {
    let mut detections = source.start(options.input.as_deref()).await?;

    let mut relay = ScanRelay::new(transport, options.destination.clone(), options.debounce);
    relay.connect(options.broker_config());
    writeln!(out, "connection: {}", relay.connection().state())?;
    relay.start_session(Instant::now());

    loop {
        tokio::select! {
            biased;
            state = relay.next_connection_change() => {
                writeln!(out, "connection: {state}")?;
                if state == ConnectionState::Errored
                    && let Some(detail) = relay.connection().last_error()
                {
                    writeln!(err, "connection error: {detail}")?;
                }
            }
            detection = detections.recv() => {
                let Some(raw) = detection else {
                    break;
                };
                if let Some(scan) = relay.on_detection(raw) {
                    write_outcome(&scan, out, err)?;
                }
            }
        }
    }

    relay.stop_session();
    relay.shutdown().await;
    writeln!(out, "connection: {}", relay.connection().state())?;

    let stats = relay.publisher().stats();
    writeln!(
        out,
        "session: {} scans, {} sent, {} not sent",
        relay.publisher().session().current_events().len(),
        stats.accepted,
        stats.rejected
    )?;
    Ok(stats)
}
