//! Logical connection over a physical link.
//!
//! A [`Connection`] is the byte-stream view of one tunnel session: reads come
//! out of its [`Reassembler`], writes go through Segmenter, Sequencer and the
//! link. It implements tokio's [`AsyncRead`] and [`AsyncWrite`], so it can be
//! handed to anything that copies streams.
//!
//! Link writes block, so every write runs on the blocking pool. At most one
//! write is in flight; it is completed before the next one starts, on flush
//! and on shutdown. Closing the connection stops an in-flight write at the
//! next frame boundary.
//!
//! `shutdown` only ends the write side; reads keep working until the
//! connection is closed or dropped.

use crate::ble::{Characteristic, Reassembler, Segmenter, Sequencer};
use crate::error::{SegmentError, TunnelError};
use crate::link::Link;
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;

type WriteResult = (Segmenter<Sequencer>, Result<usize, SegmentError>);

/// Callback run once when the connection is dropped.
pub(crate) type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Receive-side handle kept by the role that owns the link callbacks.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    reassembler: Arc<Reassembler>,
}

impl ConnectionHandle {
    /// Connection identifier, unique per role instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Feed one raw frame from the link.
    pub fn receive(&self, frame: &[u8]) -> Result<(), TunnelError> {
        self.reassembler.receive(frame)
    }

    /// Close the connection, waking a blocked reader.
    pub fn close(&self) {
        self.reassembler.close();
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.reassembler.is_closed()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.reassembler.closed().await;
    }
}

/// One tunnelled byte stream.
pub struct Connection {
    id: u64,
    mtu: usize,
    reassembler: Arc<Reassembler>,
    writer: Option<Segmenter<Sequencer>>,
    in_flight: Option<JoinHandle<WriteResult>>,
    on_shutdown: Option<ShutdownHook>,
}

impl Connection {
    /// Create a connection writing frames to `characteristic`.
    pub(crate) fn open(
        id: u64,
        link: Arc<dyn Link>,
        characteristic: Characteristic,
        mtu: usize,
        max_pending: usize,
    ) -> Result<(Self, ConnectionHandle), TunnelError> {
        let reassembler = Arc::new(Reassembler::with_limit(max_pending));
        let sequencer =
            Sequencer::new(link, characteristic, mtu)?.with_cancel(reassembler.close_token());
        let segmenter = Segmenter::for_mtu(sequencer, mtu)?;

        let handle = ConnectionHandle {
            id,
            reassembler: reassembler.clone(),
        };
        let connection = Self {
            id,
            mtu,
            reassembler,
            writer: Some(segmenter),
            in_flight: None,
            on_shutdown: None,
        };
        Ok((connection, handle))
    }

    pub(crate) fn set_shutdown_hook(&mut self, hook: ShutdownHook) {
        self.on_shutdown = Some(hook);
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Negotiated frame size limit.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// A receive-side handle to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            reassembler: self.reassembler.clone(),
        }
    }

    /// Close both directions without notifying the peer.
    pub fn close(&self) {
        self.reassembler.close();
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.reassembler.is_closed()
    }

    /// Wait for the in-flight write, if any, and surface its failure.
    fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(task) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let joined = ready!(Pin::new(task).poll(cx));
        self.in_flight = None;

        match joined {
            Ok((segmenter, Ok(_))) => {
                self.writer = Some(segmenter);
                Poll::Ready(Ok(()))
            }
            Ok((segmenter, Err(e))) => {
                self.writer = Some(segmenter);
                warn!(
                    "connection {}: write failed after {} bytes: {}",
                    self.id, e.written, e.source
                );
                self.reassembler.close();
                Poll::Ready(Err(e.source.into()))
            }
            Err(e) => {
                warn!("connection {}: write task failed: {}", self.id, e);
                self.reassembler.close();
                Poll::Ready(Err(io::Error::other(e)))
            }
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reassembler.poll_read(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_complete(cx))?;

        if this.reassembler.is_closed() {
            return Poll::Ready(Err(TunnelError::ConnectionClosed.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let Some(mut segmenter) = this.writer.take() else {
            return Poll::Ready(Err(TunnelError::ConnectionClosed.into()));
        };

        let data = buf.to_vec();
        this.in_flight = Some(tokio::task::spawn_blocking(move || {
            let result = segmenter.write(&data);
            (segmenter, result)
        }));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_complete(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let flushed = ready!(this.poll_complete(cx));
        if this.writer.take().is_some() {
            debug!("connection {}: write side shut down", this.id);
        }
        Poll::Ready(flushed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(hook) = self.on_shutdown.take() {
            hook();
        }
        self.reassembler.close();
    }
}
