//! STOMP 1.2 frame codec.
//!
//! Only the subset a publishing client needs: `CONNECT`, `SEND` and
//! `DISCONNECT` going out, `CONNECTED`, `RECEIPT`, `MESSAGE` and `ERROR`
//! coming in, plus heart-beats. See <https://stomp.github.io/stomp-specification-1.2.html>.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol versions offered in the `CONNECT` frame.
pub const ACCEPT_VERSIONS: &str = "1.0,1.1,1.2";

const NULL: u8 = 0;
const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// Errors raised while decoding an inbound frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),
    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("Frame ended before the blank line after its headers")]
    MissingHeaderTerminator,
    #[error("Body shorter than content-length ({expected} > {actual})")]
    TruncatedBody { expected: usize, actual: usize },
    #[error("Invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Frame commands understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Send,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Send => "SEND",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(src: &str) -> Result<Self, FrameError> {
        match src {
            "CONNECT" => Ok(Command::Connect),
            "SEND" => Ok(Command::Send),
            "DISCONNECT" => Ok(Command::Disconnect),
            "CONNECTED" => Ok(Command::Connected),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heart-beat intervals. A zero duration means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often the sender of the header promises to send beats
    pub outgoing: Duration,
    /// How often the sender of the header wants to receive beats
    pub incoming: Duration,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        HeartBeat { outgoing, incoming }
    }

    /// Value for the `heart-beat` header, in milliseconds.
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Parse a `heart-beat` header value such as `10000,10000`.
    pub fn parse(value: &str) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidHeartBeat(value.to_string());
        let (outgoing, incoming) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing: u64 = outgoing.trim().parse().map_err(|_| invalid())?;
        let incoming: u64 = incoming.trim().parse().map_err(|_| invalid())?;
        Ok(HeartBeat::new(
            Duration::from_millis(outgoing),
            Duration::from_millis(incoming),
        ))
    }

    /// Effective intervals for the client after the broker answered with `server`.
    ///
    /// Each direction is disabled if either side declines it, otherwise the
    /// slower of the two rates wins.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> HeartBeat {
        fn pick(ours: Duration, theirs: Duration) -> Duration {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        }

        HeartBeat {
            outgoing: pick(client.outgoing, server.incoming),
            incoming: pick(client.incoming, server.outgoing),
        }
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Build the `CONNECT` frame that opens a session.
    pub fn connect(
        host: &str,
        login: Option<&str>,
        passcode: Option<&str>,
        heart_beat: HeartBeat,
    ) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSIONS)
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.header_value());
        if let Some(login) = login {
            frame = frame.with_header("login", login);
        }
        if let Some(passcode) = passcode {
            frame = frame.with_header("passcode", passcode);
        }
        frame
    }

    /// Build a `SEND` frame carrying a text body.
    pub fn send(destination: &str, body: &str) -> Self {
        let mut frame = Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-length", body.len().to_string());
        frame.body = body.as_bytes().to_vec();
        frame
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// First value of the named header. Repeated headers keep the first one.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Body as text, lossy for non UTF-8 content.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize to wire format, including the trailing NUL.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(LF);
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                out.extend_from_slice(escape(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(LF);
        }
        out.push(LF);
        out.extend_from_slice(&self.body);
        out.push(NULL);
        out
    }
}

/// One unit decoded from a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bare end-of-line keep-alive
    HeartBeat,
    Frame(Frame),
}

/// Decode every frame in a WebSocket message.
///
/// A message made only of line endings is a heart-beat. The final frame may
/// lack its NUL terminator; the end of the message terminates it instead.
pub fn decode(data: &[u8]) -> Result<Vec<Inbound>, FrameError> {
    let mut items = Vec::new();
    let mut rest = data;

    loop {
        let trimmed = skip_eols(rest);
        if trimmed.len() != rest.len() && items.is_empty() && trimmed.is_empty() {
            items.push(Inbound::HeartBeat);
        }
        rest = trimmed;
        // Stray NULs between frames carry no content
        while let Some((&NULL, tail)) = rest.split_first() {
            rest = tail;
        }
        if rest.is_empty() {
            break;
        }
        let (frame, tail) = decode_frame(rest)?;
        items.push(Inbound::Frame(frame));
        rest = tail;
    }

    Ok(items)
}

fn decode_frame(data: &[u8]) -> Result<(Frame, &[u8]), FrameError> {
    let (command_line, mut rest) = split_line(data).ok_or(FrameError::MissingHeaderTerminator)?;
    let command = Command::parse(to_str(command_line)?)?;

    let mut headers = Vec::new();
    loop {
        let (line, tail) = split_line(rest).ok_or(FrameError::MissingHeaderTerminator)?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let line = to_str(line)?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut frame = Frame {
        command,
        headers,
        body: Vec::new(),
    };

    let content_length = frame
        .header("content-length")
        .and_then(|value| value.trim().parse::<usize>().ok());

    let (body, tail) = match content_length {
        Some(expected) if expected > rest.len() => {
            return Err(FrameError::TruncatedBody {
                expected,
                actual: rest.len(),
            });
        }
        Some(expected) => {
            let (body, tail) = rest.split_at(expected);
            (body, tail.strip_prefix(&[NULL]).unwrap_or(tail))
        }
        None => match rest.iter().position(|&b| b == NULL) {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (rest, &rest[rest.len()..]),
        },
    };

    frame.body = body.to_vec();
    Ok((frame, tail))
}

/// Split off one line, accepting both LF and CRLF endings.
fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = data.iter().position(|&b| b == LF)?;
    let line = &data[..end];
    let line = line.strip_suffix(&[CR]).unwrap_or(line);
    Some((line, &data[end + 1..]))
}

fn skip_eols(mut data: &[u8]) -> &[u8] {
    while let Some((&first, tail)) = data.split_first() {
        if first == LF || first == CR {
            data = tail;
        } else {
            break;
        }
    }
    data
}

fn to_str(bytes: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)
}

fn escape(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(src: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(src.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn single_frame(data: &[u8]) -> Frame {
        match decode(data).unwrap().as_slice() {
            [Inbound::Frame(frame)] => frame.clone(),
            other => panic!("expected one frame, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_send_frame() {
        let frame = Frame::send("/app/barcode/send", "ABC123");
        assert_eq!(
            frame.encode(),
            b"SEND\ndestination:/app/barcode/send\ncontent-length:6\n\nABC123\0".to_vec()
        );
    }

    #[test]
    fn test_encode_connect_frame() {
        let frame = Frame::connect("192.168.10.9", None, None, HeartBeat::new(ms(4000), ms(4000)));
        let text = String::from_utf8(frame.encode()).unwrap();
        assert!(text.starts_with("CONNECT\n"));
        assert!(text.contains("accept-version:1.0,1.1,1.2\n"));
        assert!(text.contains("host:192.168.10.9\n"));
        assert!(text.contains("heart-beat:4000,4000\n"));
        assert!(!text.contains("login"));
        assert!(text.ends_with("\n\n\0"));
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::connect("host:8080", Some("user"), Some("p:w"), HeartBeat::default());
        let text = String::from_utf8(frame.encode()).unwrap();
        assert!(text.contains("host:host:8080\n"));
        assert!(text.contains("passcode:p:w\n"));
    }

    #[test]
    fn test_send_headers_escaped() {
        let frame = Frame::new(Command::Send).with_header("destination", "a:b\nc\\d");
        let text = String::from_utf8(frame.encode()).unwrap();
        assert!(text.contains("destination:a\\cb\\nc\\\\d\n"));
    }

    #[test]
    fn test_decode_connected_frame() {
        let frame = single_frame(b"CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some("1.2"));
        assert_eq!(frame.header("heart-beat"), Some("0,0"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_decode_tolerates_missing_null() {
        let frame = single_frame(b"CONNECTED\nversion:1.2\n\n");
        assert_eq!(frame.command, Command::Connected);

        let frame = single_frame(b"ERROR\nmessage:bad\n\ndetails here");
        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.body_text(), "details here");
    }

    #[test]
    fn test_decode_crlf_lines() {
        let frame = single_frame(b"RECEIPT\r\nreceipt-id:77\r\n\r\n\0");
        assert_eq!(frame.command, Command::Receipt);
        assert_eq!(frame.header("receipt-id"), Some("77"));
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(decode(b"\n").unwrap(), vec![Inbound::HeartBeat]);
        assert_eq!(decode(b"\r\n").unwrap(), vec![Inbound::HeartBeat]);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let items = decode(b"RECEIPT\nreceipt-id:1\n\n\0\nRECEIPT\nreceipt-id:2\n\n\0").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_decode_content_length_body_with_null() {
        let frame = single_frame(b"MESSAGE\ncontent-length:3\n\na\0b\0");
        assert_eq!(frame.body, b"a\0b".to_vec());
    }

    #[test]
    fn test_decode_truncated_body() {
        let err = decode(b"MESSAGE\ncontent-length:10\n\nabc\0").unwrap_err();
        assert_eq!(
            err,
            FrameError::TruncatedBody {
                expected: 10,
                actual: 4
            }
        );
    }

    #[test]
    fn test_decode_unescapes_headers() {
        let frame = single_frame(b"MESSAGE\ndestination:a\\cb\n\n\0");
        assert_eq!(frame.header("destination"), Some("a:b"));
    }

    #[test]
    fn test_decode_repeated_header_first_wins() {
        let frame = single_frame(b"MESSAGE\nfoo:1\nfoo:2\n\n\0");
        assert_eq!(frame.header("foo"), Some("1"));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode(b"HELLO\n\n\0").unwrap_err(),
            FrameError::UnknownCommand("HELLO".to_string())
        );
        assert!(matches!(
            decode(b"MESSAGE\nnocolon\n\n\0").unwrap_err(),
            FrameError::MalformedHeader(_)
        ));
        assert_eq!(
            decode(b"MESSAGE\nfoo:bar").unwrap_err(),
            FrameError::MissingHeaderTerminator
        );
        assert!(matches!(
            decode(b"MESSAGE\nfoo:\\t\n\n\0").unwrap_err(),
            FrameError::InvalidEscape(_)
        ));
    }

    #[test]
    fn test_heartbeat_parse() {
        assert_eq!(
            HeartBeat::parse("10000,5000").unwrap(),
            HeartBeat::new(ms(10000), ms(5000))
        );
        assert!(HeartBeat::parse("10000").is_err());
        assert!(HeartBeat::parse("a,b").is_err());
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let client = HeartBeat::new(ms(4000), ms(4000));

        // Slower side wins in each direction
        let server = HeartBeat::new(ms(10000), ms(2000));
        assert_eq!(
            HeartBeat::negotiate(client, server),
            HeartBeat::new(ms(4000), ms(10000))
        );

        // Broker declines both directions
        assert_eq!(
            HeartBeat::negotiate(client, HeartBeat::default()),
            HeartBeat::default()
        );

        // Client declines incoming
        let client = HeartBeat::new(ms(4000), Duration::ZERO);
        let server = HeartBeat::new(ms(1000), ms(1000));
        assert_eq!(
            HeartBeat::negotiate(client, server),
            HeartBeat::new(ms(4000), Duration::ZERO)
        );
    }
}
