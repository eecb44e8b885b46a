//! Debouncing of raw scanner detections.
//!
//! A camera or laser scanner keeps reporting the same barcode for as long as it
//! is in view. This module collapses such bursts into a single [`ScanEvent`]
//! by suppressing every detection that arrives within a fixed window after an
//! accepted one.

use crate::detection::{RawDetection, ScanEvent};
use std::time::{Duration, Instant};

/// Default suppression window after an accepted detection.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Debouncer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Ready to accept the next detection
    Idle,
    /// Discarding detections until the window closes
    Suppressing { until: Instant },
}

/// Turns a stream of raw detections into numbered scan events.
///
/// The window is measured from the accepted detection, not slid forward by
/// suppressed ones, and payload values are not compared: a different barcode
/// arriving inside the window is dropped just like a repeat.
#[derive(Debug)]
pub struct Debouncer {
    /// Length of the suppression window
    window: Duration,
    state: DebounceState,
    /// Sequence number handed to the next accepted detection
    next_sequence: u64,
}

impl Debouncer {
    /// Create a debouncer with the given suppression window.
    ///
    /// # Example
    /// ```
    /// use std::time::{Duration, Instant};
    /// use scan_relay::debounce::Debouncer;
    /// use scan_relay::RawDetection;
    ///
    /// let mut debouncer = Debouncer::new(Duration::from_secs(1));
    /// let now = Instant::now();
    /// assert!(debouncer.accept(RawDetection::new("ABC123", now)).is_some());
    /// assert!(debouncer.accept(RawDetection::new("ABC123", now)).is_none());
    /// ```
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            state: DebounceState::Idle,
            next_sequence: 1,
        }
    }

    /// Offer a raw detection.
    ///
    /// Returns a [`ScanEvent`] only on the `Idle -> Suppressing` transition.
    /// A detection stamped at or after the end of the current window first
    /// closes the window, so a gap of exactly `window` is accepted.
    pub fn accept(&mut self, raw: RawDetection) -> Option<ScanEvent> {
        self.elapse(raw.detected_at);

        match self.state {
            DebounceState::Suppressing { .. } => None,
            DebounceState::Idle => {
                self.state = DebounceState::Suppressing {
                    until: raw.detected_at + self.window,
                };
                let sequence_number = self.next_sequence;
                self.next_sequence += 1;
                Some(ScanEvent {
                    payload: raw.payload,
                    sequence_number,
                })
            }
        }
    }

    /// Whether detections at `now` would be discarded.
    pub fn is_suppressing(&self, now: Instant) -> bool {
        matches!(self.state, DebounceState::Suppressing { until } if now < until)
    }

    /// Current state, without applying any elapsed window.
    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Return to `Idle` and restart sequence numbering at 1.
    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
        self.next_sequence = 1;
    }

    fn elapse(&mut self, now: Instant) {
        if let DebounceState::Suppressing { until } = self.state
            && now >= until
        {
            self.state = DebounceState::Idle;
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Debouncer::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use scan_relay::debounce::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(parse_duration("4000ms").unwrap(), Duration::from_millis(4000));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s"
    if let Some(num) = src.strip_suffix("ms") {
        let millis: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid milliseconds: {}", num))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(num) = src.strip_suffix('h') {
        let hours: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid hours: {}", num))?;
        let secs = hours
            .checked_mul(3600)
            .ok_or_else(|| format!("hours out of range: {}", num))?;
        return Ok(Duration::from_secs(secs));
    }

    if let Some(num) = src.strip_suffix('m') {
        let minutes: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid minutes: {}", num))?;
        let secs = minutes
            .checked_mul(60)
            .ok_or_else(|| format!("minutes out of range: {}", num))?;
        return Ok(Duration::from_secs(secs));
    }

    if let Some(num) = src.strip_suffix('s') {
        let secs: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid seconds: {}", num))?;
        return Ok(Duration::from_secs(secs));
    }

    let secs: u64 = src
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    Ok(Duration::from_secs(secs))
}
