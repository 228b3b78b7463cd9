//! [`DeviceError`] – the single error type shared by every scope crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AcquisitionState;

/// Errors raised while configuring or driving an imaging device.
///
/// The first four variants are the categories the acquisition core reasons
/// about; the rest come from the plumbing around it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceError {
    /// Configuration rejected before any hardware call was made.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sensor refused a pushed property value.
    #[error("Device rejected {property}: {details}")]
    DeviceConfig { property: String, details: String },

    /// No frame arrived within the wait bound.
    #[error("Timed out after {waited_ms} ms waiting for a frame")]
    HardwareTimeout { waited_ms: u64 },

    /// Frame memory could not be reserved.
    #[error("Could not reserve {requested_bytes} bytes: {details}")]
    ResourceExhausted {
        requested_bytes: usize,
        details: String,
    },

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Cannot {action} while {from}")]
    IllegalTransition {
        from: AcquisitionState,
        action: String,
    },

    /// Pool release attempted while the hardware still owns slots.
    #[error("{0} buffer slot(s) still queued to hardware")]
    BuffersInFlight(usize),

    #[error("No device with serial number {0}")]
    DeviceNotFound(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl DeviceError {
    /// Build a [`DeviceError::DeviceConfig`] for `property`.
    pub fn rejected(property: impl ToString, details: impl Into<String>) -> Self {
        Self::DeviceConfig {
            property: property.to_string(),
            details: details.into(),
        }
    }

    /// `true` for errors the acquisition loop must not survive: running
    /// without frame memory is unsafe, and a closed command lane means the
    /// device can never be told to shut down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::Channel(_))
    }
}
