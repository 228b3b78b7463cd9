//! `scope-hal` – Sensor Hardware Abstraction
//!
//! Everything that touches the camera driver lives here; nothing above this
//! crate sees a raw buffer queue.
//!
//! # Modules
//!
//! - [`sensor`] – the [`Sensor`] capability trait a driver implements, plus
//!   [`FrameLayout`] describing raw frames.
//! - [`pool`] – [`FrameBufferPool`]: the fixed set of frame slots shuttled
//!   between the application and the driver.
//! - [`session`] – [`HardwareSession`]: an armed sensor with its pool and the
//!   configure / prepare / teardown sequences.
//! - [`sim`] – [`SimSensor`][sim::SimSensor]: an in-process camera for tests
//!   and headless runs.

pub mod pool;
pub mod sensor;
pub mod session;
pub mod sim;

pub use pool::{DEFAULT_SLOT_COUNT, FrameBufferPool, Slot};
pub use sensor::{FrameLayout, Rejected, Sensor};
pub use session::{DEFAULT_FRAME_TIMEOUT, HardwareSession};
