//! In-process link pair.
//!
//! [`pair`] returns a peripheral end and a central end wired to each other,
//! standing in for a radio. Writes from one end are delivered to the handler
//! the other end registered for that characteristic.
//!
//! With [`Delivery::Detached`] every notification (a peripheral write to
//! `Tx`) runs on its own OS thread, which reproduces the unordered, concurrent
//! notification dispatch seen on real stacks. Central writes are acknowledged
//! GATT writes and are always handled before `write` returns.
//! [`Delivery::Inline`] calls every handler on the writer's thread and is fully
//! deterministic.
//!
//! # Example
//!
//! ```
//! use ble_tunnel::ble::Characteristic;
//! use ble_tunnel::link::loopback::{pair, LoopbackConfig};
//! use ble_tunnel::link::Link;
//! use std::sync::{Arc, Mutex};
//!
//! let (peripheral, central) = pair(LoopbackConfig::inline(64));
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! central
//!     .subscribe(Characteristic::Tx, Arc::new(move |data: &[u8]| {
//!         sink.lock().unwrap().extend_from_slice(data);
//!     }))
//!     .unwrap();
//!
//! peripheral.write(Characteristic::Tx, b"hello").unwrap();
//! assert_eq!(&*seen.lock().unwrap(), b"hello");
//! ```

use super::{DisconnectHandler, Link, NotifyHandler};
use crate::ble::Characteristic;
use crate::error::LinkError;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use uuid::Uuid;

/// How writes are handed to the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Call the handler on the writing thread, in write order.
    Inline,
    /// Call notification handlers on a fresh thread per write, in no
    /// particular order. Central writes stay inline.
    Detached,
}

/// Simulated link parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    /// Largest single write the simulated hardware accepts.
    pub max_write: usize,
    /// Delivery strategy.
    pub delivery: Delivery,
}

impl LoopbackConfig {
    /// Deterministic in-order delivery.
    pub fn inline(max_write: usize) -> Self {
        Self {
            max_write,
            delivery: Delivery::Inline,
        }
    }

    /// Unordered, concurrent delivery.
    pub fn detached(max_write: usize) -> Self {
        Self {
            max_write,
            delivery: Delivery::Detached,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Peripheral,
    Central,
}

#[derive(Default)]
struct Endpoint {
    handlers: Mutex<HashMap<Characteristic, NotifyHandler>>,
    disconnect: Mutex<Vec<DisconnectHandler>>,
}

struct Shared {
    config: LoopbackConfig,
    peripheral: Endpoint,
    central: Endpoint,
    connected: AtomicBool,
    advertisements: AtomicUsize,
}

impl Shared {
    fn endpoint(&self, role: Role) -> &Endpoint {
        match role {
            Role::Peripheral => &self.peripheral,
            Role::Central => &self.central,
        }
    }
}

/// One end of an in-process link.
#[derive(Clone)]
pub struct LoopbackLink {
    shared: Arc<Shared>,
    role: Role,
}

/// Create a connected `(peripheral, central)` pair.
pub fn pair(config: LoopbackConfig) -> (LoopbackLink, LoopbackLink) {
    let shared = Arc::new(Shared {
        config,
        peripheral: Endpoint::default(),
        central: Endpoint::default(),
        connected: AtomicBool::new(true),
        advertisements: AtomicUsize::new(0),
    });
    (
        LoopbackLink {
            shared: shared.clone(),
            role: Role::Peripheral,
        },
        LoopbackLink {
            shared,
            role: Role::Central,
        },
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("loopback link mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl LoopbackLink {
    /// Tear down the physical link and fire both ends' disconnect handlers.
    ///
    /// Later writes fail with [`LinkError::Disconnected`].
    pub fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("loopback link disconnected");
        for role in [Role::Peripheral, Role::Central] {
            let handlers = lock(&self.shared.endpoint(role).disconnect).clone();
            for handler in handlers {
                handler();
            }
        }
    }

    /// Whether the link is still up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of times advertising was (re)started.
    pub fn advertisement_count(&self) -> usize {
        self.shared.advertisements.load(Ordering::SeqCst)
    }

    fn peer(&self) -> Role {
        match self.role {
            Role::Peripheral => Role::Central,
            Role::Central => Role::Peripheral,
        }
    }
}

impl Link for LoopbackLink {
    fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<usize, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        let writer_is_peripheral = self.role == Role::Peripheral;
        if characteristic.written_by_peripheral() != writer_is_peripheral {
            return Err(LinkError::NotWritable(characteristic));
        }
        let max = self.shared.config.max_write;
        if data.len() > max {
            return Err(LinkError::TooLarge {
                len: data.len(),
                max,
            });
        }

        let handler = lock(&self.shared.endpoint(self.peer()).handlers)
            .get(&characteristic)
            .cloned();
        let Some(handler) = handler else {
            debug!("no subscriber on {}, dropping {} bytes", characteristic, data.len());
            return Ok(data.len());
        };

        match self.shared.config.delivery {
            Delivery::Detached if writer_is_peripheral => {
                let data = data.to_vec();
                thread::spawn(move || handler(&data));
            }
            _ => handler(data),
        }
        Ok(data.len())
    }

    fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotifyHandler,
    ) -> Result<(), LinkError> {
        lock(&self.shared.endpoint(self.role).handlers).insert(characteristic, handler);
        Ok(())
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        lock(&self.shared.endpoint(self.role).disconnect).push(handler);
    }

    fn advertise(&self, service: Uuid) -> Result<(), LinkError> {
        if self.role != Role::Peripheral {
            return Ok(());
        }
        let count = self.shared.advertisements.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("advertising {} (#{})", service, count);
        Ok(())
    }
}
