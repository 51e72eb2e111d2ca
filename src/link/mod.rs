//! Interface to the BLE GATT transport.
//!
//! The tunnel core never talks to a Bluetooth stack directly. Both roles get
//! an explicit [`Link`] handle, which hides adapter enablement, service
//! registration, scanning and connection establishment.
//!
//! # Delivery guarantees
//!
//! Handlers registered with [`Link::subscribe`] may be invoked from any thread,
//! concurrently with each other and in a different order than the peer wrote
//! them. On some platforms every notification is dispatched on its own task.
//! The reassembly layer is responsible for restoring order; nothing above the
//! link may assume in-order callbacks.
//!
//! # Components
//!
//! - [`loopback`] - in-process link pair used by tests and the `loopback` binary

pub mod loopback;

use crate::ble::Characteristic;
use crate::error::LinkError;
use std::sync::Arc;
use uuid::Uuid;

/// Callback for writes (peripheral) or notifications (central) on a characteristic.
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback fired once when the physical link goes away.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// One end of a physical BLE link.
///
/// Implementations are shared read-only across the process (`&self` methods),
/// so they must be internally synchronised. `write` may block until the
/// platform accepts the transfer.
pub trait Link: Send + Sync {
    /// Write `data` to `characteristic` in one transfer.
    ///
    /// Returns the number of bytes accepted. Callers treat anything short of
    /// `data.len()` as a failure (see [`write_all`]).
    fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<usize, LinkError>;

    /// Register the handler for incoming data on `characteristic`.
    ///
    /// On the peripheral this receives central writes (`rx`, `control`); on the
    /// central it receives notifications (`tx`). A later registration replaces
    /// an earlier one.
    fn subscribe(&self, characteristic: Characteristic, handler: NotifyHandler)
        -> Result<(), LinkError>;

    /// Register a handler for loss of the physical link.
    fn on_disconnect(&self, handler: DisconnectHandler);

    /// Start (or resume) advertising `service`. Only meaningful on the peripheral.
    fn advertise(&self, service: Uuid) -> Result<(), LinkError>;
}

/// Write all of `data` in one transfer, turning short writes into errors.
pub fn write_all(
    link: &dyn Link,
    characteristic: Characteristic,
    data: &[u8],
) -> Result<(), LinkError> {
    let written = link.write(characteristic, data)?;
    if written < data.len() {
        return Err(LinkError::ShortWrite {
            written,
            len: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Link that accepts at most `accept` bytes per write.
    struct Truncating {
        accept: usize,
    }

    impl Link for Truncating {
        fn write(&self, _: Characteristic, data: &[u8]) -> Result<usize, LinkError> {
            Ok(data.len().min(self.accept))
        }

        fn subscribe(&self, _: Characteristic, _: NotifyHandler) -> Result<(), LinkError> {
            Ok(())
        }

        fn on_disconnect(&self, _: DisconnectHandler) {}

        fn advertise(&self, _: Uuid) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[test]
    fn test_write_all_accepts_full_write() {
        let link = Truncating { accept: 8 };
        assert!(write_all(&link, Characteristic::Rx, &[0; 8]).is_ok());
    }

    #[test]
    fn test_write_all_rejects_short_write() {
        let link = Truncating { accept: 3 };
        let err = write_all(&link, Characteristic::Rx, &[0; 8]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::ShortWrite { written: 3, len: 8 }
        ));
    }
}
