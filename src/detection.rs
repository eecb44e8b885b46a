//! Scan data structures.

use std::time::Instant;

/// A raw detection reported by the scanning hardware.
///
/// Detections are ephemeral: the debouncer consumes them immediately and only
/// accepted ones survive as [`ScanEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDetection {
    /// Decoded barcode contents
    pub payload: String,
    /// Monotonic time the detection was reported
    pub detected_at: Instant,
}

impl RawDetection {
    pub fn new(payload: impl Into<String>, detected_at: Instant) -> Self {
        RawDetection {
            payload: payload.into(),
            detected_at,
        }
    }
}

/// A debounced scan, numbered within the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    /// Barcode contents, sent verbatim as the message body
    pub payload: String,
    /// Position within the session, starting at 1
    pub sequence_number: u64,
}
