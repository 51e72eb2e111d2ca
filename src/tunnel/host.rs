//! Central role.
//!
//! The host owns the physical link's lifecycle decisions: it negotiates the
//! MTU once when constructed, then opens logical connections on demand with
//! `NewConn`. Only the host can close a connection explicitly; the device
//! learns about it through a `Close` control message.
//!
//! Control messages carry no connection identity, so their order on the wire
//! is what ties them to a connection. Every control write goes through one
//! lock, and `open` waits for a `Close` still in flight before its `NewConn`.

use super::connection::{Connection, ConnectionHandle};
use crate::ble::Characteristic;
use crate::config::TunnelConfig;
use crate::control::mtu::probe;
use crate::control::{send_control, ControlMessage};
use crate::error::{LinkError, TunnelError};
use crate::link::Link;
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct HostInner {
    link: Arc<dyn Link>,
    config: TunnelConfig,
    mtu: usize,
    current: Mutex<Option<ConnectionHandle>>,
    control: Mutex<()>,
    pending_close: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("host {} mutex was poisoned, recovering", what);
            poisoned.into_inner()
        }
    }
}

impl HostInner {
    fn lock(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        lock_or_recover(&self.current, "connection")
    }

    /// Blocking control write, serialized with every other one.
    fn send(&self, message: &ControlMessage) -> Result<(), LinkError> {
        let _control = lock_or_recover(&self.control, "control");
        send_control(self.link.as_ref(), message)
    }

    /// Wait for `Close` writes started by dropped connections.
    async fn flush_closes(&self) {
        let pending = std::mem::take(&mut *lock_or_recover(&self.pending_close, "close"));
        for task in pending {
            if let Err(e) = task.await {
                warn!("close task failed: {}", e);
            }
        }
    }

    fn handle_notification(&self, data: &[u8]) {
        let current = self.lock().clone();
        let Some(conn) = current else {
            debug!("no connection, dropping {} bytes", data.len());
            return;
        };
        match conn.receive(data) {
            Ok(()) => {}
            Err(e) if e.is_closed() => debug!("connection {} already closed", conn.id()),
            Err(e) => {
                warn!("connection {}: {}", conn.id(), e);
                self.take_if_current(conn.id());
            }
        }
    }

    fn take_if_current(&self, id: u64) -> Option<ConnectionHandle> {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|c| c.id() == id) {
            current.take()
        } else {
            None
        }
    }

    /// Local shutdown of connection `id`: tell the device, unless already replaced.
    fn finish(self: Arc<Self>, id: u64) {
        let Some(conn) = self.take_if_current(id) else {
            return;
        };
        conn.close();
        info!("connection {} closed", id);

        match Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                let task = runtime.spawn_blocking(move || inner.send_close(id));
                lock_or_recover(&self.pending_close, "close").push(task);
            }
            Err(_) => self.send_close(id),
        }
    }

    fn send_close(&self, id: u64) {
        if let Err(e) = self.send(&ControlMessage::Close) {
            warn!("failed to send close for connection {}: {}", id, e);
        }
    }
}

/// Central end of the tunnel.
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Subscribe to the device's notifications and negotiate the MTU.
    ///
    /// Probing is skipped when `config.fixed_mtu` is set. A failed probe is
    /// fatal for this link.
    pub async fn new(link: Arc<dyn Link>, config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;

        let mtu = match config.fixed_mtu {
            Some(mtu) => {
                info!("using fixed MTU {}", mtu);
                mtu
            }
            None => {
                let probe_link = link.clone();
                let probe_config = config.probe;
                tokio::task::spawn_blocking(move || probe(probe_link.as_ref(), &probe_config))
                    .await
                    .map_err(|e| TunnelError::Negotiation(format!("probe task failed: {}", e)))??
            }
        };

        let inner = Arc::new(HostInner {
            link: link.clone(),
            config,
            mtu,
            current: Mutex::new(None),
            control: Mutex::new(()),
            pending_close: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        link.subscribe(
            Characteristic::Tx,
            Arc::new(move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_notification(data);
                }
            }),
        )?;

        let weak = Arc::downgrade(&inner);
        link.on_disconnect(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                let current = inner.lock().take();
                if let Some(conn) = current {
                    info!("connection {} lost with the link", conn.id());
                    conn.close();
                }
            }
        }));

        Ok(Self { inner })
    }

    /// Negotiated MTU.
    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    /// Open a fresh logical connection, replacing any existing one.
    ///
    /// Dropping the returned connection sends `Close` to the device. Shutting
    /// down its write side does not.
    pub async fn open(&self) -> Result<Connection, TunnelError> {
        let inner = &self.inner;
        inner.flush_closes().await;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mtu = u32::try_from(inner.mtu).map_err(|_| TunnelError::Config("MTU exceeds u32"))?;

        let (mut conn, handle) = Connection::open(
            id,
            inner.link.clone(),
            Characteristic::Rx,
            inner.mtu,
            inner.config.max_pending_frames,
        )?;

        // Installed before NewConn goes out so the first notifications find it.
        let previous = inner.lock().replace(handle);
        if let Some(previous) = previous {
            info!("connection {} replaced by connection {}", previous.id(), id);
            previous.close();
        }

        let sender = inner.clone();
        let sent =
            tokio::task::spawn_blocking(move || sender.send(&ControlMessage::NewConn { mtu }))
                .await;
        let failure = match sent {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(TunnelError::from(e)),
            Err(e) => Some(LinkError::Io(io::Error::other(e)).into()),
        };
        if let Some(e) = failure {
            warn!("connection {}: NewConn failed: {}", id, e);
            inner.take_if_current(id);
            conn.close();
            return Err(e);
        }

        let weak: Weak<HostInner> = Arc::downgrade(inner);
        conn.set_shutdown_hook(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.finish(id);
            }
        }));

        info!("connection {} open with MTU {}", id, inner.mtu);
        Ok(conn)
    }

    /// Close the current connection and tell the device.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let current = self.inner.lock().take();
        let Some(conn) = current else {
            return Ok(());
        };
        conn.close();
        info!("connection {} closed", conn.id());

        let sender = self.inner.clone();
        tokio::task::spawn_blocking(move || sender.send(&ControlMessage::Close))
            .await
            .map_err(|e| LinkError::Io(io::Error::other(e)))??;
        Ok(())
    }
}
