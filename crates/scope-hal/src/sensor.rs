//! Generic `Sensor` trait: the capability surface a scientific camera driver
//! exposes to the acquisition core.
//!
//! The shape follows vendor SDKs that work on caller-provided buffers: slots
//! are queued to the driver, filled in the background, and handed back by
//! [`Sensor::wait_buffer`] in fill order. A filled slot holds the raw
//! hardware layout (rows may be padded); [`Sensor::convert`] unpacks it
//! into tightly packed 16-bit pixels.

use std::time::Duration;

use scope_types::{DeviceError, Geometry, Property, PropertyValue};

use crate::pool::Slot;

/// Geometry of a raw frame as the driver writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub geometry: Geometry,
    /// Bytes per raw row, padding included.
    pub stride: usize,
    /// Bytes the driver needs per slot.
    pub slot_bytes: usize,
}

impl FrameLayout {
    /// Size of the converted, unpadded frame.
    pub fn frame_bytes(&self) -> usize {
        self.geometry.frame_bytes()
    }
}

/// A slot the driver refused to queue, returned to the caller together with
/// the reason.
#[derive(Debug)]
pub struct Rejected {
    pub slot: Slot,
    pub error: DeviceError,
}

/// A buffer-queue camera.
///
/// Implementations must be `Send` so a session can be built on one thread
/// and driven from another. Property errors map to
/// [`DeviceError::DeviceConfig`]; a missing frame maps to
/// [`DeviceError::HardwareTimeout`].
pub trait Sensor: Send {
    /// Serial number the driver was opened with.
    fn serial_number(&self) -> &str;

    /// Open the driver connection. Called once per session.
    fn arm(&mut self) -> Result<(), DeviceError>;

    /// Close the driver connection. Any queued slots are dropped.
    fn disarm(&mut self) -> Result<(), DeviceError>;

    fn get(&self, property: Property) -> Result<PropertyValue, DeviceError>;

    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), DeviceError>;

    fn start_acquisition(&mut self) -> Result<(), DeviceError>;

    fn stop_acquisition(&mut self) -> Result<(), DeviceError>;

    /// Give a slot to the driver for filling.
    fn queue_buffer(&mut self, slot: Slot) -> Result<(), Rejected>;

    /// Block until the oldest queued slot is filled, at most `timeout`.
    fn wait_buffer(&mut self, timeout: Duration) -> Result<Slot, DeviceError>;

    /// Drop every pending slot from the driver queue and return them.
    fn flush(&mut self) -> Vec<Slot>;

    /// Unpack `raw` (as laid out by `layout`) into `destination`, which is
    /// exactly `layout.frame_bytes()` long.
    fn convert(&self, raw: &[u8], layout: &FrameLayout, destination: &mut [u8]) -> Result<(), DeviceError>;
}
