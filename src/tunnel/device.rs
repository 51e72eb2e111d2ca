//! Peripheral role.
//!
//! The device advertises the tunnel service and waits for the central to open
//! a logical connection through the control characteristic.
//!
//! # State Machine
//!
//! ```text
//!            NewConn / Greeting
//!   Idle ───────────────────────> PendingOpen ───> Connected
//!    ^                                                 │
//!    └──────── Close / link loss / protocol error ─────┘
//! ```
//!
//! Advertising restarts every time the device returns to `Idle`. A `NewConn`
//! while `Connected` replaces the current connection.

use super::bridge::bridge;
use super::connection::{Connection, ConnectionHandle};
use crate::ble::{Characteristic, SERVICE_UUID};
use crate::config::{TunnelConfig, MAX_ATTRIBUTE_LEN};
use crate::control::ControlMessage;
use crate::error::TunnelError;
use crate::link::Link;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Lifecycle of the device's single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No connection; advertising.
    Idle,
    /// A connection request is being set up.
    PendingOpen,
    /// A connection is installed and receiving data.
    Connected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PendingOpen => write!(f, "pending-open"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

struct Slot {
    state: DeviceState,
    current: Option<ConnectionHandle>,
}

struct DeviceInner {
    link: Arc<dyn Link>,
    config: TunnelConfig,
    slot: Mutex<Slot>,
    states: watch::Sender<DeviceState>,
    accepted: mpsc::UnboundedSender<Connection>,
    next_id: AtomicU64,
}

impl DeviceInner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("device slot mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Update the state under the slot lock and publish it.
    fn set_state(&self, slot: &mut Slot, state: DeviceState) {
        slot.state = state;
        self.states.send_replace(state);
    }

    fn advertise(&self) {
        if let Err(e) = self.link.advertise(SERVICE_UUID) {
            warn!("failed to resume advertising: {}", e);
        }
    }

    fn handle_control(&self, data: &[u8]) {
        match ControlMessage::decode(data) {
            Ok(ControlMessage::TestMtu(size)) => debug!("MTU probe of {} bytes", size),
            Ok(ControlMessage::Greeting) => self.open(self.config.greeting_mtu),
            Ok(ControlMessage::NewConn { mtu }) => self.open(mtu as usize),
            Ok(ControlMessage::Close) => self.close_current("peer requested close"),
            Err(e) => warn!("ignoring malformed control write: {}", e),
        }
    }

    fn handle_data(&self, data: &[u8]) {
        let current = self.lock().current.clone();
        let Some(conn) = current else {
            debug!("no connection, dropping {} bytes", data.len());
            return;
        };
        match conn.receive(data) {
            Ok(()) => {}
            Err(e) if e.is_closed() => debug!("connection {} already closed", conn.id()),
            Err(e) => {
                warn!("connection {}: {}", conn.id(), e);
                self.release(conn.id());
            }
        }
    }

    fn open(&self, mtu: usize) {
        if mtu > MAX_ATTRIBUTE_LEN {
            warn!(
                "rejecting connection with MTU {}: above the {} byte attribute limit",
                mtu, MAX_ATTRIBUTE_LEN
            );
            self.enter_idle();
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = {
            let mut slot = self.lock();
            self.set_state(&mut slot, DeviceState::PendingOpen);
            slot.current.take()
        };
        if let Some(previous) = previous {
            info!("connection {} replaced by connection {}", previous.id(), id);
            previous.close();
        }

        let opened = Connection::open(
            id,
            self.link.clone(),
            Characteristic::Tx,
            mtu,
            self.config.max_pending_frames,
        );
        let (conn, handle) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                warn!("rejecting connection with MTU {}: {}", mtu, e);
                self.enter_idle();
                return;
            }
        };

        let displaced = {
            let mut slot = self.lock();
            self.set_state(&mut slot, DeviceState::Connected);
            slot.current.replace(handle)
        };
        if let Some(displaced) = displaced {
            displaced.close();
        }
        info!("connection {} open with MTU {}", id, mtu);

        if self.accepted.send(conn).is_err() {
            warn!("device is shutting down, dropping connection {}", id);
        }
    }

    /// Close whatever connection is current and go back to advertising.
    fn close_current(&self, reason: &str) {
        let current = {
            let mut slot = self.lock();
            self.set_state(&mut slot, DeviceState::Idle);
            slot.current.take()
        };
        if let Some(conn) = current {
            info!("connection {} closed: {}", conn.id(), reason);
            conn.close();
        }
        self.advertise();
    }

    /// Return to `Idle` if connection `id` is still the current one.
    fn release(&self, id: u64) {
        let released = {
            let mut slot = self.lock();
            if slot.current.as_ref().is_some_and(|c| c.id() == id) {
                self.set_state(&mut slot, DeviceState::Idle);
                slot.current.take()
            } else {
                None
            }
        };
        if let Some(conn) = released {
            conn.close();
            info!("connection {} released, advertising", id);
            self.advertise();
        }
    }

    fn enter_idle(&self) {
        let previous = {
            let mut slot = self.lock();
            self.set_state(&mut slot, DeviceState::Idle);
            slot.current.take()
        };
        if let Some(conn) = previous {
            conn.close();
        }
        self.advertise();
    }
}

/// Peripheral end of the tunnel.
pub struct Device {
    inner: Arc<DeviceInner>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
}

impl Device {
    /// Register the tunnel service callbacks on `link` and start advertising.
    pub fn new(link: Arc<dyn Link>, config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let (accepted, incoming) = mpsc::unbounded_channel();
        let (states, _) = watch::channel(DeviceState::Idle);
        let inner = Arc::new(DeviceInner {
            link: link.clone(),
            config,
            slot: Mutex::new(Slot {
                state: DeviceState::Idle,
                current: None,
            }),
            states,
            accepted,
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        link.subscribe(
            Characteristic::Rx,
            Arc::new(move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_data(data);
                }
            }),
        )?;

        let weak = Arc::downgrade(&inner);
        link.subscribe(
            Characteristic::Control,
            Arc::new(move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_control(data);
                }
            }),
        )?;

        let weak = Arc::downgrade(&inner);
        link.on_disconnect(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.close_current("link lost");
            }
        }));

        link.advertise(SERVICE_UUID)?;
        info!("device advertising {}", SERVICE_UUID);

        Ok(Self {
            inner,
            incoming: tokio::sync::Mutex::new(incoming),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Wait until the device is back in `Idle`.
    ///
    /// Returns at once if it already is.
    pub async fn idle(&self) {
        let mut states = self.inner.states.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = states.wait_for(|state| *state == DeviceState::Idle).await;
    }

    /// Wait for the central to open a logical connection.
    ///
    /// Connections that were replaced or closed before being accepted are
    /// skipped. The device returns to `Idle` when the returned connection
    /// closes.
    pub async fn accept(&self) -> Result<Connection, TunnelError> {
        let mut incoming = self.incoming.lock().await;
        loop {
            let Some(conn) = incoming.recv().await else {
                return Err(TunnelError::ConnectionClosed);
            };
            if conn.is_closed() {
                debug!("connection {} closed before accept, skipping", conn.id());
                continue;
            }

            let handle = conn.handle();
            let inner = Arc::downgrade(&self.inner);
            tokio::spawn(release_when_closed(inner, handle));
            return Ok(conn);
        }
    }

    /// Accept connections forever, bridging each to a fresh TCP connection to `target`.
    pub async fn serve(&self, target: &str) -> Result<(), TunnelError> {
        loop {
            let conn = self.accept().await?;
            let target = target.to_owned();
            tokio::spawn(async move {
                let id = conn.id();
                let stream = match TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("connection {}: failed to reach {}: {}", id, target, e);
                        conn.close();
                        return;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("connection {}: failed to set TCP_NODELAY: {}", id, e);
                }
                info!("connection {} bridged to {}", id, target);

                let stats = bridge(conn, stream).await;
                info!(
                    "connection {} finished: {} bytes from central, {} bytes to central",
                    id, stats.a_to_b, stats.b_to_a
                );
            });
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let current = self.inner.lock().current.take();
        if let Some(conn) = current {
            conn.close();
        }
    }
}

async fn release_when_closed(inner: Weak<DeviceInner>, handle: ConnectionHandle) {
    handle.closed().await;
    if let Some(inner) = inner.upgrade() {
        inner.release(handle.id());
    }
}
