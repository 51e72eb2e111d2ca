//! TCP-over-BLE tunnel library.
//!
//! Carries a reliable, ordered byte stream over a BLE GATT link whose writes
//! are size-limited and whose notifications may arrive out of order. The
//! peripheral ([`Device`]) exposes the tunnel service; the central ([`Host`])
//! negotiates the MTU and opens logical connections.
//!
//! The Bluetooth stack itself sits behind the [`link::Link`] trait, so every
//! component here runs and is tested on the host without radio hardware.

pub mod ble;
pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod tunnel;

// Re-export commonly used items
pub use ble::{Characteristic, Frame, Reassembler, Segmenter, Sequencer, SERVICE_UUID};
pub use config::TunnelConfig;
pub use control::mtu::ProbeConfig;
pub use control::ControlMessage;
pub use error::{is_connection_closed, LinkError, ProtocolError, TunnelError};
pub use link::Link;
pub use tunnel::{bridge, BridgeStats, Connection, Device, DeviceState, Host, Stdio};
