//! Stream segmentation and sequencing.
//!
//! A GATT write carries at most one MTU worth of bytes, and notifications may
//! be delivered out of order. Outbound stream data therefore goes through two
//! stages:
//!
//! 1. [`Segmenter`] cuts the stream into chunks of at most `mtu - SEQ_LEN`
//!    bytes.
//! 2. [`Sequencer`] prefixes each chunk with a sequence number and writes the
//!    resulting frame to the link.
//!
//! # Frame Format
//!
//! ```text
//! [sequence: 4 bytes, little-endian][payload: up to mtu - 4 bytes]
//! ```
//!
//! Sequence numbers start at 0 for every logical connection and grow by one
//! per frame. The u32 space is far larger than anything a BLE link can move
//! during one connection, so it is never expected to wrap.
//!
//! # Example
//!
//! ```
//! use ble_tunnel::ble::{Frame, Segmenter};
//!
//! // Collect chunks into a Vec instead of writing to a link.
//! let mut segmenter = Segmenter::new(Vec::<Vec<u8>>::new(), 3).unwrap();
//! assert_eq!(segmenter.write(b"abcdefgh").unwrap(), 8);
//! assert_eq!(segmenter.get_ref().len(), 3);
//!
//! let frame = Frame::new(7, b"hi".to_vec());
//! assert_eq!(frame.to_bytes(), vec![7, 0, 0, 0, b'h', b'i']);
//! ```

use crate::ble::Characteristic;
use crate::error::{ProtocolError, SegmentError, TunnelError};
use crate::link::{self, Link};
use log::{debug, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sequence header size in bytes.
pub const SEQ_LEN: usize = 4;

/// Smallest MTU that fits the header plus one payload byte.
pub const MIN_MTU: usize = SEQ_LEN + 1;

/// Payload bytes one frame can carry at `mtu`.
pub fn payload_capacity(mtu: usize) -> Result<usize, ProtocolError> {
    if mtu < MIN_MTU {
        return Err(ProtocolError::MtuTooSmall { mtu });
    }
    Ok(mtu - SEQ_LEN)
}

/// One sequenced unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position of this frame in the connection's stream.
    pub sequence: u32,
    /// Payload data (without header).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(sequence: u32, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    /// Serialize to bytes (header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.sequence, &self.payload)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (sequence, payload) = decode(bytes)?;
        Ok(Self::new(sequence, payload.to_vec()))
    }
}

/// Build the wire form of a frame without an intermediate [`Frame`].
pub fn encode(sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SEQ_LEN + payload.len());
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Split wire bytes into sequence number and borrowed payload.
pub fn decode(bytes: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    let Some((header, payload)) = bytes.split_first_chunk::<SEQ_LEN>() else {
        return Err(ProtocolError::ShortFrame { len: bytes.len() });
    };
    Ok((u32::from_le_bytes(*header), payload))
}

/// Downstream of a [`Segmenter`]: accepts one chunk per call.
pub trait ChunkWriter {
    /// Forward one chunk; returns the number of chunk bytes accepted.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, TunnelError>;
}

impl ChunkWriter for Vec<Vec<u8>> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, TunnelError> {
        self.push(chunk.to_vec());
        Ok(chunk.len())
    }
}

/// Splits a byte stream into bounded chunks.
#[derive(Debug)]
pub struct Segmenter<W> {
    inner: W,
    chunk_size: usize,
}

impl<W: ChunkWriter> Segmenter<W> {
    /// Create a segmenter forwarding chunks of at most `chunk_size` bytes.
    pub fn new(inner: W, chunk_size: usize) -> Result<Self, TunnelError> {
        if chunk_size == 0 {
            return Err(TunnelError::Config("chunk size must be > 0"));
        }
        Ok(Self { inner, chunk_size })
    }

    /// Create a segmenter sized for frames of `mtu` bytes.
    pub fn for_mtu(inner: W, mtu: usize) -> Result<Self, TunnelError> {
        Self::new(inner, payload_capacity(mtu)?)
    }

    /// Maximum chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The downstream writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Forward `data` as consecutive chunks, in order.
    ///
    /// Stops at the first failing chunk. The error reports how many bytes were
    /// forwarded before it; nothing is retried.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, SegmentError> {
        let mut written = 0;
        for chunk in data.chunks(self.chunk_size) {
            match self.inner.write_chunk(chunk) {
                Ok(n) => written += n,
                Err(source) => return Err(SegmentError { written, source }),
            }
        }
        Ok(written)
    }
}

/// Prefixes chunks with a per-connection sequence number and writes them.
pub struct Sequencer {
    link: Arc<dyn Link>,
    characteristic: Characteristic,
    mtu: usize,
    next_sequence: u32,
    cancel: Option<CancellationToken>,
}

impl Sequencer {
    /// Create a sequencer writing frames of at most `mtu` bytes to `characteristic`.
    pub fn new(
        link: Arc<dyn Link>,
        characteristic: Characteristic,
        mtu: usize,
    ) -> Result<Self, TunnelError> {
        payload_capacity(mtu)?;
        Ok(Self {
            link,
            characteristic,
            mtu,
            next_sequence: 0,
            cancel: None,
        })
    }

    /// Refuse further frames once `cancel` fires.
    ///
    /// Checked before every chunk, so a multi-frame write stops at the next
    /// frame boundary after cancellation.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Sequence number the next successful write will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Frame size limit.
    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl ChunkWriter for Sequencer {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, TunnelError> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            debug!(
                "frame {} on {} dropped: connection closed",
                self.next_sequence, self.characteristic
            );
            return Err(TunnelError::ConnectionClosed);
        }
        let max = self.mtu - SEQ_LEN;
        if chunk.len() > max {
            return Err(ProtocolError::Oversized {
                len: chunk.len(),
                max,
            }
            .into());
        }

        let frame = encode(self.next_sequence, chunk);
        if let Err(e) = link::write_all(self.link.as_ref(), self.characteristic, &frame) {
            warn!(
                "frame {} on {} failed: {}",
                self.next_sequence, self.characteristic, e
            );
            return Err(e.into());
        }

        debug!(
            "frame {} sent on {} ({} bytes)",
            self.next_sequence,
            self.characteristic,
            chunk.len()
        );
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(chunk.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::link::{DisconnectHandler, NotifyHandler};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Link recording every write, optionally failing on demand.
    #[derive(Default)]
    struct RecordingLink {
        writes: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl Link for RecordingLink {
        fn write(&self, _: Characteristic, data: &[u8]) -> Result<usize, LinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LinkError::Disconnected);
            }
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn subscribe(&self, _: Characteristic, _: NotifyHandler) -> Result<(), LinkError> {
            Ok(())
        }

        fn on_disconnect(&self, _: DisconnectHandler) {}

        fn advertise(&self, _: Uuid) -> Result<(), LinkError> {
            Ok(())
        }
    }

    /// Accepts `remaining` chunks, then fails.
    struct FailAfter {
        remaining: usize,
        chunks: Vec<Vec<u8>>,
    }

    impl ChunkWriter for FailAfter {
        fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, TunnelError> {
            if self.remaining == 0 {
                return Err(LinkError::Disconnected.into());
            }
            self.remaining -= 1;
            self.chunks.push(chunk.to_vec());
            Ok(chunk.len())
        }
    }

    // ==================== Frame Tests ====================

    #[test]
    fn test_frame_layout_little_endian() {
        let frame = Frame::new(0x0102_0304, vec![0xAA, 0xBB]);
        assert_eq!(frame.to_bytes(), vec![0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]);
        assert_eq!(Frame::from_bytes(&frame.to_bytes()).unwrap(), frame);
    }

    #[test]
    fn test_frame_header_only_is_valid() {
        let frame = Frame::from_bytes(&[5, 0, 0, 0]).unwrap();
        assert_eq!(frame.sequence, 5);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_frame_too_short() {
        for len in 0..SEQ_LEN {
            assert_eq!(
                Frame::from_bytes(&vec![0; len]),
                Err(ProtocolError::ShortFrame { len })
            );
        }
    }

    #[test]
    fn test_payload_capacity() {
        assert_eq!(payload_capacity(64), Ok(60));
        assert_eq!(payload_capacity(MIN_MTU), Ok(1));
        assert_eq!(
            payload_capacity(SEQ_LEN),
            Err(ProtocolError::MtuTooSmall { mtu: SEQ_LEN })
        );
    }

    // ==================== Segmenter Tests ====================

    #[test]
    fn test_segmenter_chunks_and_rejoins() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        for chunk_size in [1, 7, 60, 999, 1000, 4096] {
            let mut segmenter = Segmenter::new(Vec::new(), chunk_size).unwrap();
            assert_eq!(segmenter.write(&data).unwrap(), data.len());

            let chunks = segmenter.get_ref();
            assert_eq!(chunks.len(), data.len().div_ceil(chunk_size));
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= chunk_size));
            assert_eq!(chunks.concat(), data);
        }
    }

    #[test]
    fn test_segmenter_exact_fit() {
        let mut segmenter = Segmenter::new(Vec::new(), 3).unwrap();
        segmenter.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(segmenter.get_ref(), &vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_segmenter_empty_write() {
        let mut segmenter = Segmenter::new(Vec::new(), 3).unwrap();
        assert_eq!(segmenter.write(&[]).unwrap(), 0);
        assert!(segmenter.get_ref().is_empty());
    }

    #[test]
    fn test_segmenter_reports_partial_progress() {
        let writer = FailAfter {
            remaining: 2,
            chunks: Vec::new(),
        };
        let mut segmenter = Segmenter::new(writer, 4).unwrap();

        let err = segmenter.write(&[0; 10]).unwrap_err();
        assert_eq!(err.written, 8);
        assert!(matches!(
            err.source,
            TunnelError::Link(LinkError::Disconnected)
        ));
        assert_eq!(segmenter.get_ref().chunks.len(), 2);
    }

    #[test]
    fn test_segmenter_zero_chunk_size() {
        assert!(matches!(
            Segmenter::new(Vec::new(), 0),
            Err(TunnelError::Config(_))
        ));
        assert!(Segmenter::for_mtu(Vec::new(), 3).is_err());
        assert_eq!(Segmenter::for_mtu(Vec::new(), 64).unwrap().chunk_size(), 60);
    }

    // ==================== Sequencer Tests ====================

    #[test]
    fn test_sequencer_numbers_frames_from_zero() {
        let link = Arc::new(RecordingLink::default());
        let sequencer = Sequencer::new(link.clone(), Characteristic::Tx, 8).unwrap();
        let mut segmenter = Segmenter::for_mtu(sequencer, 8).unwrap();

        segmenter.write(b"abcdefghij").unwrap();
        segmenter.write(b"k").unwrap();

        let writes = link.writes.lock().unwrap();
        let frames: Vec<Frame> = writes.iter().map(|w| Frame::from_bytes(w).unwrap()).collect();
        let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert!(writes.iter().all(|w| w.len() <= 8));

        let payload: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(payload, b"abcdefghijk");
    }

    #[test]
    fn test_sequencer_failure_keeps_counter() {
        let link = Arc::new(RecordingLink::default());
        let mut sequencer = Sequencer::new(link.clone(), Characteristic::Tx, 16).unwrap();

        sequencer.write_chunk(b"one").unwrap();
        link.fail.store(true, Ordering::SeqCst);
        assert!(sequencer.write_chunk(b"two").is_err());
        assert_eq!(sequencer.next_sequence(), 1);

        link.fail.store(false, Ordering::SeqCst);
        sequencer.write_chunk(b"two").unwrap();

        let writes = link.writes.lock().unwrap();
        assert_eq!(writes[1], encode(1, b"two"));
    }

    #[test]
    fn test_sequencer_rejects_oversized_chunk() {
        let link = Arc::new(RecordingLink::default());
        let mut sequencer = Sequencer::new(link.clone(), Characteristic::Tx, 8).unwrap();

        let err = sequencer.write_chunk(&[0; 5]).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::Oversized { len: 5, max: 4 })
        ));
        assert!(link.writes.lock().unwrap().is_empty());
        assert_eq!(sequencer.next_sequence(), 0);
    }

    #[test]
    fn test_sequencer_stops_when_cancelled() {
        let link = Arc::new(RecordingLink::default());
        let cancel = CancellationToken::new();
        let sequencer = Sequencer::new(link.clone(), Characteristic::Tx, 8)
            .unwrap()
            .with_cancel(cancel.clone());
        let mut segmenter = Segmenter::for_mtu(sequencer, 8).unwrap();

        segmenter.write(b"abcd").unwrap();
        cancel.cancel();

        let err = segmenter.write(b"efghijkl").unwrap_err();
        assert_eq!(err.written, 0);
        assert!(err.source.is_closed());
        assert_eq!(link.writes.lock().unwrap().len(), 1);
        assert_eq!(segmenter.get_ref().next_sequence(), 1);
    }

    #[test]
    fn test_sequencer_mtu_too_small() {
        let link: Arc<dyn Link> = Arc::new(RecordingLink::default());
        assert!(Sequencer::new(link, Characteristic::Tx, SEQ_LEN).is_err());
    }
}
