//! BLE tunnel framing components.
//!
//! This module contains the GATT service layout and the framing that carries a
//! byte stream across BLE's small, unordered transfers.

mod fragmentation;
mod gatt;
mod reassembly;

pub use fragmentation::{
    decode, encode, payload_capacity, ChunkWriter, Frame, Segmenter, Sequencer, MIN_MTU, SEQ_LEN,
};
pub use gatt::{Characteristic, CONTROL_CHAR_UUID, RX_CHAR_UUID, SERVICE_UUID, TX_CHAR_UUID};
pub use reassembly::{Reassembler, DEFAULT_MAX_PENDING};
