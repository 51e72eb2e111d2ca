//! Ordered reassembly of sequenced frames.
//!
//! Frames may arrive in any order and from any number of threads at once.
//! [`Reassembler::receive`] files them by sequence number and releases payloads
//! strictly in order; [`Reassembler::read`] hands the contiguous prefix to the
//! single consumer.
//!
//! # State
//!
//! ```text
//! next_expected ──┐
//!                 v
//! ready: [p0][p1]  | pending: {5: p5, 7: p7}
//!   ^ cursor       |  (waiting for 2, 3, 4, 6)
//! ```
//!
//! Everything below `next_expected` has been released; `pending` only holds
//! keys above it. A frame with a key already released or already pending is a
//! duplicate and is dropped, so redelivery is idempotent.
//!
//! The state lives behind one std mutex that is held only for the map and
//! queue updates, never across an await or a link call. A blocked reader is
//! woken through its stored [`Waker`].

use super::fragmentation::decode;
use crate::error::{ProtocolError, TunnelError};
use log::{debug, warn};
use std::collections::{BTreeMap, VecDeque};
use std::future::poll_fn;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::ReadBuf;
use tokio_util::sync::CancellationToken;

/// Default cap on frames buffered ahead of a gap.
pub const DEFAULT_MAX_PENDING: usize = 1024;

#[derive(Default)]
struct ReassemblyState {
    next_expected: u32,
    pending: BTreeMap<u32, Vec<u8>>,
    ready: VecDeque<Vec<u8>>,
    /// Bytes of `ready[0]` already handed out.
    cursor: usize,
    reader: Option<Waker>,
}

impl ReassemblyState {
    fn buffered_len(&self) -> usize {
        self.ready.iter().map(Vec::len).sum::<usize>() - self.cursor
    }

    fn push_ready(&mut self, payload: Vec<u8>) {
        if !payload.is_empty() {
            self.ready.push_back(payload);
        }
        self.next_expected = self.next_expected.wrapping_add(1);
    }

    fn drain_pending(&mut self) {
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            self.push_ready(payload);
        }
    }

    /// Copy as much ready data as fits into `buf`.
    fn copy_into(&mut self, buf: &mut ReadBuf<'_>) {
        while buf.remaining() > 0 {
            let Some(front) = self.ready.front() else {
                break;
            };
            let available = &front[self.cursor..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            self.cursor += n;
            if self.cursor == front.len() {
                self.ready.pop_front();
                self.cursor = 0;
            }
        }
    }
}

/// Restores stream order for one logical connection.
pub struct Reassembler {
    state: Mutex<ReassemblyState>,
    cancel: CancellationToken,
    max_pending: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Create a reassembler with the default reorder window.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }

    /// Create a reassembler that tolerates at most `max_pending` out-of-order frames.
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(ReassemblyState::default()),
            cancel: CancellationToken::new(),
            max_pending,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReassemblyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("reassembly mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Accept one raw frame from the link.
    ///
    /// Safe to call concurrently from any number of threads. A malformed frame
    /// or an exhausted reorder window closes the reassembler, since the stream
    /// can no longer be reproduced exactly.
    pub fn receive(&self, frame: &[u8]) -> Result<(), TunnelError> {
        let (sequence, payload) = match decode(frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("dropping connection on malformed frame: {}", e);
                self.close();
                return Err(e.into());
            }
        };

        let waker = {
            let mut state = self.lock();
            if self.cancel.is_cancelled() {
                return Err(TunnelError::ConnectionClosed);
            }

            if sequence < state.next_expected || state.pending.contains_key(&sequence) {
                debug!("duplicate frame {} ignored", sequence);
                return Ok(());
            }

            if sequence != state.next_expected {
                if state.pending.len() >= self.max_pending {
                    let pending = state.pending.len();
                    drop(state);
                    warn!(
                        "reorder window exhausted waiting for frame {}",
                        sequence
                    );
                    self.close();
                    return Err(ProtocolError::WindowExceeded { pending }.into());
                }
                state.pending.insert(sequence, payload.to_vec());
                return Ok(());
            }

            state.push_ready(payload.to_vec());
            state.drain_pending();
            if state.ready.is_empty() {
                None
            } else {
                state.reader.take()
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Poll for in-order bytes.
    ///
    /// Fills `buf` with as much contiguous data as is available. Returns
    /// [`TunnelError::ConnectionClosed`] once closed, even if data was
    /// buffered.
    pub fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), TunnelError>> {
        let mut state = self.lock();
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(TunnelError::ConnectionClosed));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if state.ready.is_empty() {
            state.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }
        state.copy_into(buf);
        Poll::Ready(Ok(()))
    }

    /// Read in-order bytes into `buf`, waiting until at least one is available.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut buf = ReadBuf::new(buf);
        poll_fn(|cx| self.poll_read(cx, &mut buf)).await?;
        Ok(buf.filled().len())
    }

    /// Close the stream and wake a blocked reader. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let waker = {
            let mut state = self.lock();
            state.pending.clear();
            state.ready.clear();
            state.cursor = 0;
            state.reader.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wait until the stream is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled by [`close`](Self::close).
    pub(crate) fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sequence number the stream is waiting for.
    pub fn next_expected(&self) -> u32 {
        self.lock().next_expected
    }

    /// Number of frames held back by a gap.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Bytes ready for the reader.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffered_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fragmentation::encode;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Deterministic Fisher-Yates shuffle driven by a 64-bit LCG.
    fn shuffle<T>(items: &mut [T], seed: u64) {
        let mut state = seed;
        for i in (1..items.len()).rev() {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let j = ((state >> 33) % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }

    fn frames(payloads: &[&[u8]]) -> Vec<Vec<u8>> {
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| encode(i as u32, p))
            .collect()
    }

    async fn read_exact(r: &Reassembler, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < len {
            let n = r.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let r = Reassembler::new();
        for f in frames(&[b"hello ", b"world"]) {
            r.receive(&f).unwrap();
        }
        assert_eq!(read_exact(&r, 11).await, b"hello world");
        assert_eq!(r.next_expected(), 2);
    }

    #[tokio::test]
    async fn test_reversed_delivery() {
        let r = Reassembler::new();
        let f = frames(&[b"A", b"B", b"C"]);
        r.receive(&f[2]).unwrap();
        r.receive(&f[1]).unwrap();
        assert_eq!(r.buffered_len(), 0);
        assert_eq!(r.pending_count(), 2);

        r.receive(&f[0]).unwrap();
        assert_eq!(r.pending_count(), 0);
        assert_eq!(read_exact(&r, 3).await, b"ABC");
    }

    #[tokio::test]
    async fn test_duplicates_are_idempotent() {
        let r = Reassembler::new();
        let f = frames(&[b"x", b"y", b"z"]);
        r.receive(&f[2]).unwrap();
        r.receive(&f[2]).unwrap();
        r.receive(&f[0]).unwrap();
        r.receive(&f[0]).unwrap();
        r.receive(&f[1]).unwrap();
        r.receive(&f[1]).unwrap();
        assert_eq!(r.buffered_len(), 3);
        assert_eq!(read_exact(&r, 3).await, b"xyz");
    }

    #[tokio::test]
    async fn test_shuffled_permutations() {
        let data: Vec<u8> = (0..50u8).flat_map(|i| [i; 3]).collect();
        let chunks: Vec<&[u8]> = data.chunks(3).collect();
        for seed in [1, 7, 42, 1234, 0xDEAD_BEEF] {
            let mut f = frames(&chunks);
            shuffle(&mut f, seed);
            let r = Reassembler::new();
            for frame in &f {
                r.receive(frame).unwrap();
            }
            assert_eq!(read_exact(&r, data.len()).await, data, "seed {seed}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        let chunks: Vec<&[u8]> = data.chunks(10).collect();
        let mut all = frames(&chunks);
        shuffle(&mut all, 99);

        let r = Arc::new(Reassembler::new());
        let handles: Vec<_> = all
            .chunks(all.len().div_ceil(4))
            .map(|part| {
                let part = part.to_vec();
                let r = r.clone();
                thread::spawn(move || {
                    for frame in part {
                        r.receive(&frame).unwrap();
                    }
                })
            })
            .collect();

        let out = tokio::time::timeout(Duration::from_secs(5), read_exact(&r, data.len()))
            .await
            .unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_read_waits_for_gap() {
        let r = Arc::new(Reassembler::new());
        let f = frames(&[b"first", b"second"]);
        r.receive(&f[1]).unwrap();

        let reader = {
            let r = r.clone();
            tokio::spawn(async move { read_exact(&r, 11).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        r.receive(&f[0]).unwrap();
        let out = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"firstsecond");
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let r = Arc::new(Reassembler::new());
        let reader = {
            let r = r.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                r.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        r.close();
        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
        assert!(r.is_closed());
    }

    #[tokio::test]
    async fn test_read_after_close_fails_even_with_data() {
        let r = Reassembler::new();
        r.receive(&encode(0, b"late")).unwrap();
        r.close();
        r.close();
        let mut buf = [0u8; 8];
        assert!(matches!(
            r.read(&mut buf).await,
            Err(TunnelError::ConnectionClosed)
        ));
        assert!(matches!(
            r.receive(&encode(1, b"more")),
            Err(TunnelError::ConnectionClosed)
        ));
        r.closed().await;
    }

    #[test]
    fn test_malformed_frame_closes() {
        let r = Reassembler::new();
        let err = r.receive(&[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::ShortFrame { len: 2 })
        ));
        assert!(r.is_closed());
    }

    #[test]
    fn test_window_exceeded_closes() {
        let r = Reassembler::with_limit(2);
        r.receive(&encode(1, b"a")).unwrap();
        r.receive(&encode(2, b"b")).unwrap();
        let err = r.receive(&encode(3, b"c")).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::WindowExceeded { pending: 2 })
        ));
        assert!(r.is_closed());
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remainder() {
        let r = Reassembler::new();
        r.receive(&encode(0, b"abcdef")).unwrap();

        let mut small = [0u8; 4];
        assert_eq!(r.read(&mut small).await.unwrap(), 4);
        assert_eq!(&small, b"abcd");
        assert_eq!(r.buffered_len(), 2);

        r.receive(&encode(1, b"gh")).unwrap();
        let mut rest = [0u8; 16];
        assert_eq!(r.read(&mut rest).await.unwrap(), 4);
        assert_eq!(&rest[..4], b"efgh");
    }

    #[tokio::test]
    async fn test_empty_payload_advances_sequence() {
        let r = Reassembler::new();
        r.receive(&encode(1, b"after")).unwrap();
        r.receive(&encode(0, b"")).unwrap();
        assert_eq!(r.next_expected(), 2);
        assert_eq!(read_exact(&r, 5).await, b"after");
    }
}
