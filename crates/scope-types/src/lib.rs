//! `scope-types` – shared vocabulary of the imaging device services.
//!
//! Configuration, commands, property identifiers, status records and the
//! crate-wide [`DeviceError`]. No I/O happens here.

pub mod command;
pub mod config;
pub mod error;
pub mod property;
pub mod status;

pub use command::Command;
pub use config::{
    AcquisitionState, BYTES_PER_PIXEL, Binning, DeviceConfig, Geometry, SensorSettings, TriggerMode,
};
pub use error::DeviceError;
pub use property::{Property, PropertyValue};
pub use status::{FrameBatch, StatusRecord};
