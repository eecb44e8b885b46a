use crate::connection::{
    BrokerConfig, Closing, ConnectionEvent, EventSink, Link, PublishOutcome, RejectReason,
    Transport, TransportError,
};
use crate::publisher::Publish;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct FakeState {
    configs: Vec<BrokerConfig>,
    sinks: Vec<EventSink>,
    sent: Vec<(String, String)>,
    closes: usize,
    fail_sends: bool,
    auto_connect: bool,
    /// Close handles held open instead of completing at once
    stuck_closes: Option<Vec<oneshot::Sender<()>>>,
}

/// In-memory transport. Clones share state so tests can keep a handle after
/// boxing one into a `ConnectionManager`.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    /// A transport whose every attempt succeeds immediately.
    pub fn auto_connecting() -> Self {
        let transport = FakeTransport::default();
        transport.state.lock().unwrap().auto_connect = true;
        transport
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().sinks.len()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn last_config(&self) -> Option<BrokerConfig> {
        self.state.lock().unwrap().configs.last().cloned()
    }

    /// Sink of the most recent attempt.
    pub fn last_sink(&self) -> EventSink {
        self.state
            .lock()
            .unwrap()
            .sinks
            .last()
            .cloned()
            .expect("no connection attempt yet")
    }

    /// Raise an event on the most recent attempt.
    pub fn emit(&self, event: ConnectionEvent) {
        self.last_sink().emit(event);
    }

    /// Make every later send fail as if the socket task had exited.
    pub fn fail_sends(&self) {
        self.state.lock().unwrap().fail_sends = true;
    }

    /// Make later closes never report completion.
    pub fn stall_closes(&self) {
        self.state.lock().unwrap().stuck_closes = Some(Vec::new());
    }
}

impl Transport for FakeTransport {
    fn connect(&self, config: &BrokerConfig, events: EventSink) -> Box<dyn Link> {
        let mut state = self.state.lock().unwrap();
        state.configs.push(config.clone());
        if state.auto_connect {
            events.emit(ConnectionEvent::Connected);
        }
        state.sinks.push(events);
        Box::new(FakeLink {
            state: Arc::clone(&self.state),
        })
    }
}

struct FakeLink {
    state: Arc<Mutex<FakeState>>,
}

impl Link for FakeLink {
    fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(TransportError::LinkClosed);
        }
        state.sent.push((destination.to_string(), body.to_string()));
        Ok(())
    }

    fn close(&self) -> Closing {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        let (done, closing) = oneshot::channel();
        match state.stuck_closes.as_mut() {
            Some(stuck) => stuck.push(done),
            None => {
                let _ = done.send(());
            }
        }
        closing
    }
}

/// Records every publish call and answers according to `connected`.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub connected: bool,
    pub calls: Vec<(String, String)>,
}

impl RecordingSink {
    pub fn connected() -> Self {
        RecordingSink {
            connected: true,
            calls: Vec::new(),
        }
    }

    pub fn disconnected() -> Self {
        RecordingSink::default()
    }
}

impl Publish for RecordingSink {
    fn publish(&mut self, destination: &str, payload: &str) -> PublishOutcome {
        self.calls
            .push((destination.to_string(), payload.to_string()));
        if self.connected {
            PublishOutcome::Accepted
        } else {
            PublishOutcome::Rejected(RejectReason::NotConnected)
        }
    }
}
