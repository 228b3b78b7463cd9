//! `scope-runtime` – The Device Service Engine
//!
//! Wires the acquisition kernel to the message transport and runs the
//! control loop of one device service.
//!
//! # Modules
//!
//! - [`acquisition_loop`] – [`AcquisitionLoop`][acquisition_loop::AcquisitionLoop]:
//!   the single-threaded poll / dispatch / acquire loop that interleaves
//!   command handling with batched frame delivery.
//! - [`router`] – [`CommandRouter`][router::CommandRouter]: decodes command
//!   lines, screens configuration through the
//!   [`ConfigVerifier`][scope_kernel::ConfigVerifier] and drives the
//!   [`AcquisitionStateMachine`][scope_kernel::AcquisitionStateMachine].
//! - [`status`] – [`StatusPublisher`][status::StatusPublisher]: sends a
//!   status record to every configured listener.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod acquisition_loop;
pub mod router;
pub mod status;
pub mod telemetry;

pub use acquisition_loop::AcquisitionLoop;
pub use router::CommandRouter;
pub use status::{DEFAULT_LISTENERS, StatusPublisher};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
