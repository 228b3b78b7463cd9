//! `scope-kernel` – Acquisition Control
//!
//! Decides what the sensor is allowed to do and when. It owns the
//! acquisition state and screens configuration before the hardware sees it.
//!
//! # Modules
//!
//! - [`state_machine`] – [`AcquisitionStateMachine`][state_machine::AcquisitionStateMachine]:
//!   Idle / Prepared / Streaming over a [`HardwareSession`][scope_hal::HardwareSession],
//!   with teardown-first reconfiguration and rollback on rejected settings.
//! - [`config_verifier`] – [`ConfigVerifier`][config_verifier::ConfigVerifier]:
//!   a rule engine that rejects malformed configuration requests with
//!   [`InvalidConfig`][scope_types::DeviceError::InvalidConfig].

pub mod config_verifier;
pub mod state_machine;

pub use config_verifier::{
    BatchSizeRule, ConfigRequest, ConfigVerifier, ExposureRule, MAX_BATCH_SIZE, PositiveGeometryRule, Rule,
    TriggerModeRule,
};
pub use state_machine::AcquisitionStateMachine;
