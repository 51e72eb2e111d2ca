//! MTU discovery.
//!
//! BLE stacks rarely report the negotiated ATT MTU in a portable way, so the
//! central discovers it empirically: it writes `TestMtu` probes of growing
//! size to the control characteristic and keeps the largest size the link
//! accepted.
//!
//! # Algorithm
//!
//! 1. Write a probe of `base` bytes; failure here is fatal
//! 2. Double the size (capped at `max`) and write again
//! 3. Stop at the first rejected write, or after a successful write at `max`
//! 4. Return the last accepted size
//!
//! # Example
//!
//! ```
//! use ble_tunnel::control::mtu::{probe, ProbeConfig};
//! use ble_tunnel::link::loopback::{pair, LoopbackConfig};
//!
//! let (_peripheral, central) = pair(LoopbackConfig::inline(256));
//! assert_eq!(probe(&central, &ProbeConfig::default()).unwrap(), 256);
//! ```

use super::{send_control, ControlMessage};
use crate::ble::MIN_MTU;
use crate::config::MAX_ATTRIBUTE_LEN;
use crate::error::TunnelError;
use crate::link::Link;
use log::{debug, info};

/// Probe sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// First probe size in bytes. Must be accepted by the link.
    pub base: usize,
    /// Largest size to try.
    pub max: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base: 64,
            max: MAX_ATTRIBUTE_LEN,
        }
    }
}

impl ProbeConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.base < MIN_MTU {
            return Err(TunnelError::Config(
                "probe base must fit a sequence header and one payload byte",
            ));
        }
        if self.max < self.base {
            return Err(TunnelError::Config("probe max must be >= probe base"));
        }
        Ok(())
    }
}

/// Find the largest control write the link accepts.
///
/// Blocks on link writes; async callers run it through `spawn_blocking`.
pub fn probe(link: &dyn Link, config: &ProbeConfig) -> Result<usize, TunnelError> {
    config.validate()?;

    if let Err(e) = send_control(link, &ControlMessage::TestMtu(config.base)) {
        return Err(TunnelError::Negotiation(format!(
            "base probe of {} bytes rejected: {}",
            config.base, e
        )));
    }
    let mut best = config.base;
    debug!("MTU probe {} accepted", best);

    while best < config.max {
        let size = best.saturating_mul(2).min(config.max);
        match send_control(link, &ControlMessage::TestMtu(size)) {
            Ok(()) => {
                debug!("MTU probe {} accepted", size);
                best = size;
            }
            Err(e) => {
                debug!("MTU probe {} rejected: {}", size, e);
                break;
            }
        }
    }

    info!("negotiated MTU {}", best);
    Ok(best)
}
