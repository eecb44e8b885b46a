//! `scan-relay` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The core “business logic” lives in [`crate::app`] where
//! it can be tested deterministically with an injected detection source and an
//! injected transport.

pub mod app;
pub mod connection;
pub mod debounce;
pub mod detection;
pub mod publisher;
pub mod session;
pub mod source;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{ScanOutcome, ScanRelay};
pub use connection::stomp::HeartBeat;
pub use connection::{
    BrokerConfig, ConnectionEvent, ConnectionManager, ConnectionState, PublishOutcome,
    RejectReason, Transport,
};
pub use debounce::{Debouncer, parse_duration};
pub use detection::{RawDetection, ScanEvent};
pub use publisher::{EventPublisher, Publish};
pub use session::SessionState;
