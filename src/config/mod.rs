//! Tunnel configuration.
//!
//! Both roles take a [`TunnelConfig`]. The defaults match what deployed peers
//! expect, so most callers only override `fixed_mtu` on links whose MTU is
//! known in advance.

use crate::ble::MIN_MTU;
use crate::control::mtu::ProbeConfig;
use crate::error::TunnelError;

/// MTU assumed when a connection is opened without negotiation.
pub const DEFAULT_MTU: usize = 64;

/// Largest ATT attribute value (Bluetooth Core Spec, Vol 3, Part F, 3.2.9).
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// Configuration shared by [`Device`](crate::tunnel::Device) and
/// [`Host`](crate::tunnel::Host).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// MTU probe parameters (host only).
    pub probe: ProbeConfig,

    /// Use this MTU instead of probing (host only).
    pub fixed_mtu: Option<usize>,

    /// MTU for connections opened by a legacy greeting (device only).
    pub greeting_mtu: usize,

    /// Out-of-order frames buffered per connection before it is closed.
    pub max_pending_frames: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            fixed_mtu: None,
            greeting_mtu: DEFAULT_MTU,
            max_pending_frames: crate::ble::DEFAULT_MAX_PENDING,
        }
    }
}

impl TunnelConfig {
    /// Create config with a fixed MTU and no probing.
    pub fn with_fixed_mtu(mtu: usize) -> Self {
        Self {
            fixed_mtu: Some(mtu),
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), TunnelError> {
        self.probe.validate()?;
        if self.fixed_mtu.is_some_and(|mtu| mtu < MIN_MTU) {
            return Err(TunnelError::Config(
                "fixed_mtu must fit a sequence header and one payload byte",
            ));
        }
        if self.greeting_mtu < MIN_MTU {
            return Err(TunnelError::Config(
                "greeting_mtu must fit a sequence header and one payload byte",
            ));
        }
        if self.max_pending_frames == 0 {
            return Err(TunnelError::Config("max_pending_frames must be > 0"));
        }
        Ok(())
    }
}
