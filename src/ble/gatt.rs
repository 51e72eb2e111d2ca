//! GATT layout of the tunnel service.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: TCP tunnel
//! ├── Tx (Read, Notify)  - peripheral → central frames
//! ├── Rx (Write)         - central → peripheral frames
//! └── Control (Write)    - central → peripheral control messages
//! ```
//!
//! The UUIDs were generated once with `uuidgen` and are shared by both roles;
//! changing any of them breaks interoperability with existing peers.

use std::fmt;
use uuid::Uuid;

/// Tunnel service UUID, advertised by the peripheral.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x923BFB18_A711_4923_82A8_988AD38AF7C1);

/// UUID for the Tx characteristic (peripheral notifies the central).
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x3F33F755_C5A9_4F25_B0CA_8BFFEF13B905);

/// UUID for the Rx characteristic (central writes to the peripheral).
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x41F94EAB_B906_4AE6_BEB9_0D5CA55EC4CB);

/// UUID for the Control characteristic.
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0xA004120C_300F_4049_8280_E98AC615ACA1);

/// Characteristics of the tunnel service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Peripheral → central data (notify).
    Tx,
    /// Central → peripheral data (write).
    Rx,
    /// Central → peripheral control messages (write).
    Control,
}

impl Characteristic {
    /// All characteristics in discovery order.
    pub const ALL: [Characteristic; 3] = [Self::Tx, Self::Rx, Self::Control];

    /// The characteristic's UUID.
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Tx => TX_CHAR_UUID,
            Self::Rx => RX_CHAR_UUID,
            Self::Control => CONTROL_CHAR_UUID,
        }
    }

    /// Look up a characteristic by UUID.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Whether the peripheral is the writing side of this characteristic.
    pub const fn written_by_peripheral(self) -> bool {
        matches!(self, Self::Tx)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Tx => "tx",
            Self::Rx => "rx",
            Self::Control => "control",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
