//! STOMP over WebSocket transport.
//!
//! Each connection attempt runs in its own task that owns the socket. The
//! manager talks to it through a command channel and hears back through the
//! attempt's [`EventSink`].

use super::stomp::{self, Command, Frame, HeartBeat, Inbound};
use super::{
    BrokerConfig, Closing, ConnectionEvent, EventSink, Link, Transport, TransportError,
};
use futures::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, interval_at, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message, http::Uri};
use tracing::{debug, info, trace, warn};

/// Inbound silence tolerated, as a multiple of the negotiated interval.
const HEARTBEAT_GRACE: u32 = 2;

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// Opens STOMP sessions over `ws://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect(&self, config: &BrokerConfig, events: EventSink) -> Box<dyn Link> {
        let (commands, rx) = mpsc::unbounded_channel();
        let config = config.clone();

        tokio::spawn(async move {
            match run_link(&config, rx, &events).await {
                Ok(Closed::ByClient) => debug!(epoch = events.epoch(), "link closed"),
                Ok(Closed::ByBroker) => {
                    events.emit(ConnectionEvent::Disconnected);
                }
                Err(error) => {
                    events.emit(ConnectionEvent::Error(error.to_string()));
                }
            }
        });

        Box::new(WebSocketLink { commands })
    }
}

#[derive(Debug)]
enum LinkCommand {
    Send { destination: String, body: String },
    Close { done: oneshot::Sender<()> },
}

struct WebSocketLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl Link for WebSocketLink {
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        self.commands
            .send(LinkCommand::Send {
                destination: destination.to_string(),
                body: body.to_string(),
            })
            .map_err(|_| TransportError::LinkClosed)
    }

    fn close(&self) -> Closing {
        let (done, closing) = oneshot::channel();
        // If the task already exited, `done` is dropped and `closing` resolves
        let _ = self.commands.send(LinkCommand::Close { done });
        closing
    }
}

enum Closed {
    ByClient,
    ByBroker,
}

/// Resolve the STOMP `host` header: explicit vhost, else the URL host.
pub fn virtual_host(config: &BrokerConfig) -> Result<String, TransportError> {
    if let Some(vhost) = &config.vhost {
        return Ok(vhost.clone());
    }
    let uri: Uri = config
        .url
        .parse()
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", config.url)))?;
    uri.host()
        .map(str::to_string)
        .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing host", config.url)))
}

async fn run_link(
    config: &BrokerConfig,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: &EventSink,
) -> Result<Closed, TransportError> {
    let host = virtual_host(config)?;
    let binary = config.binary_frames;

    let handshake = async {
        info!(url = %config.url, host = %host, "opening WebSocket");
        let (socket, _) = connect_async(config.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let credentials = config.credentials.as_ref();
        let connect = Frame::connect(
            &host,
            credentials.map(|c| c.login.as_str()),
            credentials.map(|c| c.passcode.as_str()),
            config.heart_beat,
        );
        sink.send(to_message(connect.encode(), binary)).await?;

        let server = await_connected(&mut stream).await?;
        Ok::<_, TransportError>((sink, stream, HeartBeat::negotiate(config.heart_beat, server)))
    };

    // Before CONNECTED nothing can be published, so any command means close
    let limit = config.connect_timeout;
    let (mut sink, mut stream, heart_beat) = tokio::select! {
        opened = timeout(limit, handshake) => match opened {
            Ok(opened) => opened?,
            Err(_) => return Err(TransportError::HandshakeTimeout(limit)),
        },
        _ = commands.recv() => return Ok(Closed::ByClient),
    };

    debug!(
        outgoing = ?heart_beat.outgoing,
        incoming = ?heart_beat.incoming,
        "heart-beat negotiated"
    );
    events.emit(ConnectionEvent::Connected);

    let mut outgoing = every(heart_beat.outgoing);
    let mut watchdog = every(heart_beat.incoming);
    let silence_limit = heart_beat.incoming * HEARTBEAT_GRACE;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send { destination, body }) => {
                    let frame = Frame::send(&destination, &body);
                    sink.send(to_message(frame.encode(), binary)).await?;
                    debug!(%destination, "SEND written");
                }
                close => {
                    let _ = sink.send(to_message(Frame::disconnect().encode(), binary)).await;
                    let _ = sink.close().await;
                    if let Some(LinkCommand::Close { done }) = close {
                        let _ = done.send(());
                    }
                    return Ok(Closed::ByClient);
                }
            },
            message = stream.next() => {
                last_inbound = Instant::now();
                match message {
                    Some(Ok(Message::Binary(data))) => handle_inbound(&data)?,
                    Some(Ok(Message::Text(text))) => handle_inbound(text.as_bytes())?,
                    Some(Ok(Message::Close(_))) | None => return Ok(Closed::ByBroker),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return Err(error.into()),
                }
            }
            _ = tick(&mut outgoing) => {
                trace!("heart-beat out");
                sink.send(to_message(b"\n".to_vec(), binary)).await?;
            }
            _ = tick(&mut watchdog) => {
                if last_inbound.elapsed() > silence_limit {
                    return Err(TransportError::HeartbeatTimeout(last_inbound.elapsed()));
                }
            }
        }
    }
}

/// Read until the broker answers the CONNECT frame.
async fn await_connected<S>(stream: &mut S) -> Result<HeartBeat, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let data = match message? {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => return Err(TransportError::ClosedDuringHandshake),
            _ => continue,
        };

        for item in stomp::decode(&data)? {
            let Inbound::Frame(frame) = item else {
                continue;
            };
            match frame.command {
                Command::Connected => {
                    let server = match frame.header("heart-beat") {
                        Some(value) => HeartBeat::parse(value)?,
                        None => HeartBeat::default(),
                    };
                    info!(version = frame.header("version").unwrap_or("1.0"), "STOMP session established");
                    return Ok(server);
                }
                Command::Error => return Err(TransportError::Broker(error_detail(&frame))),
                other => debug!(command = %other, "unexpected frame during handshake"),
            }
        }
    }

    Err(TransportError::ClosedDuringHandshake)
}

/// Process a message received on an established session.
///
/// Broker `ERROR` frames end the session. Frames that fail to decode are
/// logged and skipped.
fn handle_inbound(data: &[u8]) -> Result<(), TransportError> {
    let items = match stomp::decode(data) {
        Ok(items) => items,
        Err(error) => {
            warn!(%error, "dropping undecodable frame");
            return Ok(());
        }
    };

    for item in items {
        match item {
            Inbound::HeartBeat => trace!("heart-beat in"),
            Inbound::Frame(frame) if frame.command == Command::Error => {
                return Err(TransportError::Broker(error_detail(&frame)));
            }
            Inbound::Frame(frame) => debug!(command = %frame.command, "frame received"),
        }
    }
    Ok(())
}

/// Broker error text: the `message` header, then the body if there is one.
pub fn error_detail(frame: &Frame) -> String {
    let message = frame.header("message").unwrap_or("unspecified error");
    let body = frame.body_text();
    let body = body.trim_end_matches('\0').trim();
    if body.is_empty() {
        message.to_string()
    } else {
        format!("{message}: {body}")
    }
}

fn to_message(bytes: Vec<u8>, binary: bool) -> Message {
    if binary {
        Message::Binary(bytes)
    } else {
        Message::Text(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Interval that first fires one period from now; `None` when disabled.
fn every(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        None
    } else {
        Some(interval_at(Instant::now() + period, period))
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
