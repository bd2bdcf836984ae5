//! Outbound, topic-based event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber sees every
//! event, and a slow subscriber only ever hurts itself: once it falls more
//! than `capacity` events behind, its oldest pending events are dropped and
//! it is told how many.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::SafetyEvents`] | One event per detected issue, plus every safety state transition |
//! | [`Topic::Telemetry`] | One snapshot per control cycle |
//!
//! Publishing never blocks and never fails for lack of listeners, so the
//! control thread can publish unconditionally.

use rtjoint_types::{ControlError, Event};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Events buffered per topic before slow subscribers start losing the
/// oldest ones.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Safety issues and safety state transitions.
    SafetyEvents,
    /// Per-cycle telemetry snapshots.
    Telemetry,
}

/// Shared event bus.  Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    safety_events: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose topics each buffer `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (safety_events, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        Self {
            safety_events,
            telemetry,
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns the number of subscribers that were handed the event;
    /// `Ok(0)` when nobody is listening, which is a normal condition.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, ControlError> {
        match self.topic_sender(topic).send(event) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(_)) => Ok(0),
        }
    }

    /// Subscribe to `topic`.  Only events published after this call are
    /// delivered.
    pub fn subscribe_to(&self, topic: Topic) -> EventReceiver {
        EventReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::SafetyEvents => &self.safety_events,
            Topic::Telemetry => &self.telemetry,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A receiver bound to one [`Topic`].
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct EventReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event.  Lag is logged and skipped over; returns
    /// `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "event receiver lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take everything pending without blocking.
    ///
    /// Returns the events in publication order and the number of events
    /// dropped because this receiver fell behind.
    pub fn drain(&mut self) -> (Vec<Event>, u64) {
        let mut events = Vec::new();
        let mut dropped = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(n)) => dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        (events, dropped)
    }
}
