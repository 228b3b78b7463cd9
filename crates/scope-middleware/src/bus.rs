//! Headless, topic-based publish/subscribe message bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message without any single subscriber blocking the others. The
//! acquisition core only touches the synchronous half of the receivers
//! (`try_recv` / `blocking_recv`), so it runs on a plain thread; the
//! WebSocket bridge uses the async half on a tokio runtime.
//!
//! # Lanes
//!
//! | Lane | Payload | Direction |
//! |---|---|---|
//! | [`Lane::Commands`] | `"<device> <verb> [args]"` text | inbound |
//! | [`Lane::Status`] | `"<listener> <json>"` text | outbound |
//! | [`Lane::Data`] | shared [`FrameBatch`] | outbound |

use std::sync::Arc;

use scope_types::{DeviceError, FrameBatch};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default channel capacity (messages buffered before slow subscribers start
/// losing the oldest ones).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Commands,
    Status,
    Data,
}

/// Shared message bus. Clone it cheaply; all clones share the same
/// underlying broadcast channels.
#[derive(Clone, Debug)]
pub struct MessageBus {
    commands: broadcast::Sender<String>,
    status: broadcast::Sender<String>,
    data: broadcast::Sender<Arc<FrameBatch>>,
}

impl MessageBus {
    /// Create a new bus. `capacity` applies to every lane independently.
    pub fn new(capacity: usize) -> Self {
        let (commands, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        let (data, _) = broadcast::channel(capacity);
        Self { commands, status, data }
    }

    /// Publish a command line.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Channel`] when no device is subscribed; the command
    /// would be lost.
    pub fn publish_command(&self, line: impl Into<String>) -> Result<usize, DeviceError> {
        self.commands
            .send(line.into())
            .map_err(|e| DeviceError::Channel(format!("no subscriber for command {:?}", e.0)))
    }

    /// Publish a status message. Returns the number of receivers; `Ok(0)`
    /// when nobody is listening.
    pub fn publish_status(&self, message: String) -> Result<usize, DeviceError> {
        Ok(self.status.send(message).unwrap_or_else(|_| {
            debug!(lane = ?Lane::Status, "no subscribers, message dropped");
            0
        }))
    }

    /// Publish a data batch. Ownership moves into the bus; the memory is
    /// released once the last subscriber drops it. `Ok(0)` when nobody is
    /// listening.
    pub fn publish_data(&self, batch: FrameBatch) -> Result<usize, DeviceError> {
        let bytes = batch.len();
        Ok(self.data.send(Arc::new(batch)).unwrap_or_else(|_| {
            debug!(lane = ?Lane::Data, bytes, "no subscribers, batch dropped");
            0
        }))
    }

    /// Subscribe to command lines starting with `topic`.
    pub fn subscribe_commands(&self, topic: impl Into<String>) -> CommandSubscriber {
        CommandSubscriber {
            topic: topic.into(),
            receiver: self.commands.subscribe(),
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<String> {
        self.status.subscribe()
    }

    pub fn subscribe_data(&self) -> broadcast::Receiver<Arc<FrameBatch>> {
        self.data.subscribe()
    }

    /// Current receiver count on `lane`.
    pub fn subscriber_count(&self, lane: Lane) -> usize {
        match lane {
            Lane::Commands => self.commands.receiver_count(),
            Lane::Status => self.status.receiver_count(),
            Lane::Data => self.data.receiver_count(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Prefix-filtered command subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers command lines starting with the given
/// topic prefix.
pub struct CommandSubscriber {
    topic: String,
    receiver: broadcast::Receiver<String>,
}

impl CommandSubscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next matching line if one is already waiting.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Channel`] once the bus has shut down.
    pub fn try_recv(&mut self) -> Result<Option<String>, DeviceError> {
        loop {
            match self.receiver.try_recv() {
                Ok(line) if line.starts_with(&self.topic) => return Ok(Some(line)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "CommandSubscriber lagged");
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(closed(&self.topic)),
            }
        }
    }

    /// Block the calling thread until a matching line arrives.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Channel`] once the bus has shut down.
    pub fn blocking_recv(&mut self) -> Result<String, DeviceError> {
        loop {
            match self.receiver.blocking_recv() {
                Ok(line) if line.starts_with(&self.topic) => return Ok(line),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "CommandSubscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(closed(&self.topic)),
            }
        }
    }
}

fn closed(topic: &str) -> DeviceError {
    DeviceError::Channel(format!("command lane closed for {topic}"))
}
