//! Control channel messages.
//!
//! The central writes control messages to the `control` characteristic to
//! manage logical connections. The first byte is the tag:
//!
//! | Tag | Message  | Body                                  |
//! |-----|----------|---------------------------------------|
//! | 0   | Greeting | none                                  |
//! | 1   | TestMtu  | zero padding up to the probed size    |
//! | 2   | NewConn  | u32 little-endian MTU                 |
//! | 3   | Close    | none                                  |
//!
//! Any other tag is read as a legacy Greeting, which older centrals sent as
//! an arbitrary short string.
//!
//! # Components
//!
//! - [`mtu`] - MTU discovery by probing writes of increasing size

pub mod mtu;

use crate::ble::Characteristic;
use crate::error::{LinkError, ProtocolError};
use crate::link::{self, Link};
use log::debug;

/// Tag byte of a Greeting.
pub const TAG_GREETING: u8 = 0;
/// Tag byte of a TestMtu probe.
pub const TAG_TEST_MTU: u8 = 1;
/// Tag byte of a NewConn request.
pub const TAG_NEW_CONN: u8 = 2;
/// Tag byte of a Close request.
pub const TAG_CLOSE: u8 = 3;

/// A message on the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Open a connection at the default MTU.
    Greeting,
    /// Probe write of the given total size; carries no meaning for the peripheral.
    TestMtu(usize),
    /// Open a connection at the given MTU.
    NewConn {
        /// Frame size limit for the new connection.
        mtu: u32,
    },
    /// Close the current connection.
    Close,
}

impl ControlMessage {
    /// Serialize to bytes.
    ///
    /// `TestMtu(n)` produces exactly `n` bytes (at least one, the tag).
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Greeting => vec![TAG_GREETING],
            Self::TestMtu(size) => {
                let mut bytes = vec![0u8; size.max(1)];
                bytes[0] = TAG_TEST_MTU;
                bytes
            }
            Self::NewConn { mtu } => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(TAG_NEW_CONN);
                bytes.extend_from_slice(&mtu.to_le_bytes());
                bytes
            }
            Self::Close => vec![TAG_CLOSE],
        }
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&tag, body)) = bytes.split_first() else {
            return Err(ProtocolError::EmptyControl);
        };
        match tag {
            TAG_GREETING => Ok(Self::Greeting),
            TAG_TEST_MTU => Ok(Self::TestMtu(bytes.len())),
            TAG_NEW_CONN => {
                let Some(mtu) = body.first_chunk::<4>() else {
                    return Err(ProtocolError::TruncatedNewConn { len: bytes.len() });
                };
                Ok(Self::NewConn {
                    mtu: u32::from_le_bytes(*mtu),
                })
            }
            TAG_CLOSE => Ok(Self::Close),
            other => {
                debug!("unknown control tag {}, treating as greeting", other);
                Ok(Self::Greeting)
            }
        }
    }
}

/// Write a control message to the peripheral in one transfer.
pub fn send_control(link: &dyn Link, message: &ControlMessage) -> Result<(), LinkError> {
    link::write_all(link, Characteristic::Control, &message.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        assert_eq!(ControlMessage::Greeting.encode(), vec![0]);
        assert_eq!(ControlMessage::Close.encode(), vec![3]);
        assert_eq!(
            ControlMessage::NewConn { mtu: 0x0102 }.encode(),
            vec![2, 0x02, 0x01, 0, 0]
        );

        let probe = ControlMessage::TestMtu(64).encode();
        assert_eq!(probe.len(), 64);
        assert_eq!(probe[0], TAG_TEST_MTU);
        assert!(probe[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode() {
        assert_eq!(ControlMessage::decode(&[0]), Ok(ControlMessage::Greeting));
        assert_eq!(
            ControlMessage::decode(&[2, 128, 0, 0, 0]),
            Ok(ControlMessage::NewConn { mtu: 128 })
        );
        assert_eq!(
            ControlMessage::decode(&[1, 0, 0, 0]),
            Ok(ControlMessage::TestMtu(4))
        );
        assert_eq!(ControlMessage::decode(&[3]), Ok(ControlMessage::Close));
    }

    #[test]
    fn test_decode_unknown_tag_is_greeting() {
        assert_eq!(
            ControlMessage::decode(b"hello"),
            Ok(ControlMessage::Greeting)
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            ControlMessage::decode(&[]),
            Err(ProtocolError::EmptyControl)
        );
        assert_eq!(
            ControlMessage::decode(&[2, 1, 2]),
            Err(ProtocolError::TruncatedNewConn { len: 3 })
        );
    }

    #[test]
    fn test_new_conn_ignores_trailing_bytes() {
        assert_eq!(
            ControlMessage::decode(&[2, 64, 0, 0, 0, 9, 9]),
            Ok(ControlMessage::NewConn { mtu: 64 })
        );
    }
}
