//! Error types shared by the tunnel layers.
//!
//! The taxonomy follows the layer that detects the problem:
//!
//! - [`LinkError`] - the GATT transport refused or failed a transfer
//! - [`ProtocolError`] - bytes arrived that cannot be part of a valid stream
//! - [`TunnelError::ConnectionClosed`] - the logical connection was closed;
//!   this is the normal way blocked operations end and is not a failure
//! - [`TunnelError::Negotiation`] - MTU probing found no usable size

use crate::ble::Characteristic;
use std::io;
use thiserror::Error;

/// Failure reported by a [`Link`](crate::link::Link) implementation.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The characteristic cannot be written from this role.
    #[error("characteristic {0} is not writable from this side")]
    NotWritable(Characteristic),
    /// The transfer is larger than the link accepts in one write.
    #[error("write of {len} bytes exceeds the link limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    /// Only part of the transfer was accepted.
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
    /// The physical link is gone.
    #[error("link disconnected")]
    Disconnected,
    /// Platform I/O failure.
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Malformed data on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame too short to hold the sequence header.
    #[error("frame of {len} bytes is shorter than the sequence header")]
    ShortFrame { len: usize },
    /// Chunk does not fit into one frame at the negotiated MTU.
    #[error("chunk of {len} bytes exceeds frame capacity of {max} bytes")]
    Oversized { len: usize, max: usize },
    /// Control write with no bytes at all.
    #[error("empty control message")]
    EmptyControl,
    /// NewConn message without its 4-byte MTU.
    #[error("truncated NewConn message ({len} bytes)")]
    TruncatedNewConn { len: usize },
    /// MTU cannot carry the sequence header plus one payload byte.
    #[error("MTU {mtu} is too small for a sequenced frame")]
    MtuTooSmall { mtu: usize },
    /// Too many frames buffered ahead of a gap.
    #[error("reorder window exceeded with {pending} frames pending")]
    WindowExceeded { pending: usize },
}

/// Top-level error for tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("tcp-over-ble: connection closed")]
    ConnectionClosed,
    #[error("MTU negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl TunnelError {
    /// Whether this is the normal end-of-connection signal.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Failure of a segmented write, with the bytes forwarded before it.
#[derive(Debug, Error)]
#[error("segmented write failed after {written} bytes: {source}")]
pub struct SegmentError {
    /// Bytes successfully handed downstream before the failure.
    pub written: usize,
    /// The downstream failure.
    pub source: TunnelError,
}

impl From<TunnelError> for io::Error {
    fn from(e: TunnelError) -> Self {
        let kind = match &e {
            TunnelError::ConnectionClosed => io::ErrorKind::ConnectionAborted,
            TunnelError::Link(_) => io::ErrorKind::BrokenPipe,
            TunnelError::Protocol(_) => io::ErrorKind::InvalidData,
            TunnelError::Negotiation(_) | TunnelError::Config(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Check whether an I/O error carries [`TunnelError::ConnectionClosed`].
pub fn is_connection_closed(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<TunnelError>())
        .is_some_and(TunnelError::is_closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_maps_to_connection_aborted() {
        let err: io::Error = TunnelError::ConnectionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(is_connection_closed(&err));
    }

    #[test]
    fn test_other_errors_are_not_closed() {
        let err: io::Error = TunnelError::Link(LinkError::Disconnected).into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!is_connection_closed(&err));

        let plain = io::Error::new(io::ErrorKind::ConnectionAborted, "peer reset");
        assert!(!is_connection_closed(&plain));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = TunnelError::from(ProtocolError::ShortFrame { len: 2 });
        assert_eq!(
            err.to_string(),
            "protocol error: frame of 2 bytes is shorter than the sequence header"
        );
    }
}
