//! `scope-middleware` – Message Transport
//!
//! Moves commands, status records and frame data between the acquisition
//! core and the network without caring what they mean.
//!
//! # Modules
//!
//! - [`bus`] – in-process publish/subscribe [`MessageBus`] with command,
//!   status and data lanes, built on Tokio broadcast channels.
//! - [`channel`] – the [`CommandSource`], [`StatusSink`] and [`DataSink`]
//!   seams the core is written against.
//! - [`ws_bridge`] – WebSocket bridge connecting the bus lanes to command,
//!   status and data endpoints.

pub mod bus;
pub mod channel;
pub mod ws_bridge;

pub use bus::{CommandSubscriber, Lane, MessageBus};
pub use channel::{CommandSource, DataSink, StatusSink};
pub use ws_bridge::WsBridge;
