//! Tunnel endpoints.
//!
//! # Components
//!
//! - [`Device`] - peripheral role: advertises, accepts logical connections
//! - [`Host`] - central role: negotiates the MTU, opens logical connections
//! - [`Connection`] - one logical connection as a tokio byte stream
//! - [`bridge`] - full-duplex copy between two streams
//! - [`Stdio`] - the process's stdin/stdout as one stream

mod bridge;
mod connection;
mod device;
mod host;
mod stdio;

pub use bridge::{bridge, BridgeStats};
pub use connection::{Connection, ConnectionHandle};
pub use device::{Device, DeviceState};
pub use host::Host;
pub use stdio::Stdio;
