//! The channel seams the acquisition core talks through.
//!
//! The core never speaks to a socket. It reads commands from a
//! [`CommandSource`] and writes to a [`StatusSink`] and a [`DataSink`]; the
//! [`MessageBus`][crate::bus::MessageBus] implements all three, and the
//! [`ws_bridge`][crate::ws_bridge] moves bus traffic to and from the
//! network.

use scope_types::{DeviceError, FrameBatch};

use crate::bus::{CommandSubscriber, MessageBus};

/// Inbound command lines, already filtered to this device's topic.
pub trait CommandSource {
    /// A waiting line, or `None` if there is nothing to read right now.
    fn try_next(&mut self) -> Result<Option<String>, DeviceError>;

    /// Block until a line arrives.
    fn next_blocking(&mut self) -> Result<String, DeviceError>;
}

/// Outbound status messages.
pub trait StatusSink {
    fn send_status(&self, message: String) -> Result<(), DeviceError>;
}

/// Outbound frame batches. Ownership of the batch moves to the sink.
pub trait DataSink {
    fn send_batch(&self, batch: FrameBatch) -> Result<(), DeviceError>;
}

impl CommandSource for CommandSubscriber {
    fn try_next(&mut self) -> Result<Option<String>, DeviceError> {
        self.try_recv()
    }

    fn next_blocking(&mut self) -> Result<String, DeviceError> {
        self.blocking_recv()
    }
}

impl StatusSink for MessageBus {
    fn send_status(&self, message: String) -> Result<(), DeviceError> {
        self.publish_status(message).map(|_| ())
    }
}

impl DataSink for MessageBus {
    fn send_batch(&self, batch: FrameBatch) -> Result<(), DeviceError> {
        self.publish_data(batch).map(|_| ())
    }
}
