//! Bookkeeping for the current scanning session.

use crate::detection::ScanEvent;
use std::time::Instant;

/// Scans recorded since the session started, in acceptance order.
///
/// Only the [`EventPublisher`](crate::publisher::EventPublisher) mutates a
/// session; everything else gets read-only access.
#[derive(Debug)]
pub struct SessionState {
    events: Vec<ScanEvent>,
    started_at: Instant,
    active: bool,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            events: Vec::new(),
            started_at: Instant::now(),
            active: false,
        }
    }

    /// Clear the list and begin a new session.
    pub(crate) fn start(&mut self, now: Instant) {
        self.events.clear();
        self.started_at = now;
        self.active = true;
    }

    /// End the session. Recorded events stay readable until the next start.
    pub(crate) fn stop(&mut self) {
        self.active = false;
    }

    pub(crate) fn record(&mut self, event: ScanEvent) {
        self.events.push(event);
    }

    pub fn current_events(&self) -> &[ScanEvent] {
        &self.events
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}
