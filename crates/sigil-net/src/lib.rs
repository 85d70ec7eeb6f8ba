//! Relay transport for Sigil: a single WebSocket connection with
//! subscribe-on-open, heartbeats and exponential-backoff reconnect.

pub mod backoff;
pub mod transport;
pub mod ws;

pub use backoff::Backoff;
pub use transport::{
    spawn_transport, TransportCommand, TransportConfig, TransportEvent, TransportHandle,
};
