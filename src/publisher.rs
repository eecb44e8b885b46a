//! Publishing debounced scans to the broker.

use crate::connection::{ConnectionManager, PublishOutcome, RejectReason};
use crate::detection::ScanEvent;
use crate::session::SessionState;
use std::time::Instant;
use tracing::{info, warn};

/// Anything scans can be published through.
///
/// [`ConnectionManager`] is the real implementation; tests substitute a recorder.
pub trait Publish {
    fn publish(&mut self, destination: &str, payload: &str) -> PublishOutcome;
}

impl Publish for ConnectionManager {
    fn publish(&mut self, destination: &str, payload: &str) -> PublishOutcome {
        ConnectionManager::publish(self, destination, payload)
    }
}

/// A scan that was recorded locally but not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub event: ScanEvent,
    pub reason: RejectReason,
}

/// Running totals of publish attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Records each scan in the session and hands it to the broker.
///
/// Delivery is attempted once. A rejected scan stays in the session list but
/// is never retried.
#[derive(Debug)]
pub struct EventPublisher {
    destination: String,
    session: SessionState,
    last_payload: Option<String>,
    last_rejection: Option<Rejection>,
    stats: PublishStats,
}

impl EventPublisher {
    pub fn new(destination: impl Into<String>) -> Self {
        EventPublisher {
            destination: destination.into(),
            session: SessionState::new(),
            last_payload: None,
            last_rejection: None,
            stats: PublishStats::default(),
        }
    }

    /// Record `event` and publish its payload.
    pub fn on_scan(&mut self, event: ScanEvent, sink: &mut dyn Publish) -> PublishOutcome {
        let outcome = sink.publish(&self.destination, &event.payload);

        match outcome {
            PublishOutcome::Accepted => {
                self.stats.accepted += 1;
                info!(
                    payload = %event.payload,
                    sequence = event.sequence_number,
                    "scan sent"
                );
            }
            PublishOutcome::Rejected(reason) => {
                self.stats.rejected += 1;
                warn!(
                    payload = %event.payload,
                    sequence = event.sequence_number,
                    %reason,
                    "scan not sent"
                );
                self.last_rejection = Some(Rejection {
                    event: event.clone(),
                    reason,
                });
            }
        }

        self.last_payload = Some(event.payload.clone());
        self.session.record(event);
        outcome
    }

    /// Begin a new session, discarding the previous scan list.
    pub fn start_session(&mut self, now: Instant) {
        self.session.start(now);
        self.last_payload = None;
        self.last_rejection = None;
        info!("scan session started");
    }

    /// End the session without touching the broker connection.
    pub fn stop_session(&mut self) {
        self.session.stop();
        info!(scans = self.session.current_events().len(), "scan session stopped");
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Payload of the most recent scan, sent or not.
    pub fn last_payload(&self) -> Option<&str> {
        self.last_payload.as_deref()
    }

    /// Most recent scan that could not be sent.
    pub fn last_rejection(&self) -> Option<&Rejection> {
        self.last_rejection.as_ref()
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}
