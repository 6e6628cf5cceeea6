//! The dltrelay daemon core.
//!
//! Producers register applications and contexts and send log messages;
//! consumers attach, receive every message and send control requests. In
//! between sit:
//! - [`Registry`]: applications and contexts per ECU, with their levels
//! - [`RingBuffer`]: holds messages while no consumer is attached
//! - [`DeliveryStateMachine`]: decides between buffering and direct delivery
//! - [`Dispatcher`]: applies producer envelopes and control requests
//!
//! [`Daemon`] runs a dispatcher behind real sockets.

pub mod config;
mod control;
pub mod dispatcher;
pub mod error;
pub mod output;
pub mod persist;
pub mod registry;
pub mod ring_buffer;
#[cfg(unix)]
pub mod runtime;
pub mod state;

pub use config::DaemonConfig;
pub use dispatcher::{Dispatcher, SendMode, CONTROL_APID, CONTROL_CTID};
pub use error::{DaemonError, Result};
pub use output::{
    stream_channel, Channel, ChannelError, OutputChannels, TraceSink, WriteReport,
    WriterTraceSink,
};
pub use persist::{LoggingMode, RuntimeStore};
pub use registry::{
    Application, Context, ContextRegistration, Registry, RegistrySettings, UserList,
};
pub use ring_buffer::{RingBuffer, RingBufferConfig, RingBufferError};
#[cfg(unix)]
pub use runtime::Daemon;
pub use state::{DeliveryState, DeliveryStateMachine};
