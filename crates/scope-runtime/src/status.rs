//! [`StatusPublisher`] – fans a [`StatusRecord`] out to every configured
//! status listener.
//!
//! Each listener gets its own message, `"<listener> <json>"`, so a hub can
//! route on the leading word the same way devices route commands.

use scope_middleware::StatusSink;
use scope_types::{DeviceError, StatusRecord};
use tracing::debug;

/// Listeners addressed when none are configured.
pub const DEFAULT_LISTENERS: &[&str] = &["hub", "logger"];

pub struct StatusPublisher<P: StatusSink> {
    sink: P,
    listeners: Vec<String>,
}

impl<P: StatusSink> StatusPublisher<P> {
    pub fn new(sink: P, listeners: Vec<String>) -> Self {
        Self { sink, listeners }
    }

    /// Publisher addressing [`DEFAULT_LISTENERS`].
    pub fn with_default_listeners(sink: P) -> Self {
        Self::new(sink, DEFAULT_LISTENERS.iter().map(|l| l.to_string()).collect())
    }

    pub fn publish(&self, record: &StatusRecord) -> Result<(), DeviceError> {
        let json = record.to_wire()?;
        for listener in &self.listeners {
            self.sink.send_status(format!("{listener} {json}"))?;
        }
        debug!(
            device = %record.device_name,
            stack_size = record.batch_size,
            streaming = record.streaming,
            alive = record.process_alive,
            "status published"
        );
        Ok(())
    }

    pub fn listeners(&self) -> &[String] {
        &self.listeners
    }

    pub fn sink(&self) -> &P {
        &self.sink
    }
}
