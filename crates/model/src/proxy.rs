//! Proxy interfaces
//!
//! A proxy is one side of the relayed USB connection. The device-side proxy
//! talks to the real device being impersonated; the host-side proxy presents
//! the impersonated device to the upstream host (typically through a UDC
//! gadget). Concrete backends live outside this workspace; the relay core
//! only ever sees these traits.

use std::time::Duration;

use thiserror::Error;

use crate::device::{Configuration, Device, Endpoint};
use crate::transfer::Transfer;

/// Errors surfaced by proxy backends
///
/// `Timeout` is the one recoverable kind: connect loops retry it while setup
/// is still in progress, and relay tasks treat it as "no data yet".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Operation timed out; retryable
    #[error("operation timed out")]
    Timeout,

    /// Endpoint stalled
    #[error("endpoint pipe stalled")]
    Pipe,

    /// The device went away
    #[error("no device")]
    NoDevice,

    /// Resource busy (interface claimed elsewhere)
    #[error("resource busy")]
    Busy,

    /// Permission denied by the backend
    #[error("access denied")]
    Access,

    /// Caller handed the backend something it cannot act on
    #[error("invalid parameter")]
    InvalidParam,

    /// Transport-level failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Anything else a backend needs to report
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Whether a relay loop should retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProxyError::Timeout)
    }
}

/// The datapath surface shared by both proxy sides
///
/// Readers and writers are handed one of these per endpoint; they never see
/// the wider lifecycle surface of [`DeviceProxy`] / [`HostProxy`].
pub trait Proxy: Send + Sync {
    /// Pull the next transfer pending on `endpoint`, waiting at most
    /// `timeout`. Returns [`ProxyError::Timeout`] when nothing arrived.
    fn read(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Transfer, ProxyError>;

    /// Push one transfer out through this side of the bus.
    fn write(&self, transfer: &Transfer) -> Result<(), ProxyError>;
}

/// The device-facing side: lifecycle, descriptor queries, and interface
/// management on the real device
pub trait DeviceProxy: Proxy {
    /// Attach to the device. [`ProxyError::Timeout`] is retried by the
    /// manager while setup is still in progress; anything else aborts.
    fn connect(&self) -> Result<(), ProxyError>;

    /// Detach from the device.
    fn disconnect(&self);

    /// Raw 18-byte device descriptor.
    fn device_descriptor(&self) -> Result<Vec<u8>, ProxyError>;

    /// Full configuration blob for descriptor index `index`.
    fn configuration_blob(&self, index: u8) -> Result<Vec<u8>, ProxyError>;

    /// Raw device qualifier bytes, or None when the device is not
    /// high-speed capable.
    fn device_qualifier(&self) -> Result<Option<Vec<u8>>, ProxyError>;

    /// Other-speed configuration blob for descriptor index `index`.
    fn other_speed_configuration_blob(&self, index: u8) -> Result<Vec<u8>, ProxyError>;

    /// Whether the connected device enumerated at high speed.
    fn is_highspeed(&self) -> bool;

    /// Claim interface `number` for exclusive relay use.
    fn claim_interface(&self, number: u8) -> Result<(), ProxyError>;

    /// Release a previously claimed interface.
    fn release_interface(&self, number: u8) -> Result<(), ProxyError>;

    /// Tell the backend which interface number backs an endpoint address.
    fn set_endpoint_interface(&self, address: u8, interface: u8);

    /// Apply a configuration change. `full_speed` is the full-speed
    /// configuration and `high_speed` the high-speed one when a device
    /// qualifier supplies it; `highspeed` says which of the two the session
    /// currently runs at.
    fn set_config(
        &self,
        full_speed: &Configuration,
        high_speed: Option<&Configuration>,
        highspeed: bool,
    ) -> Result<(), ProxyError>;
}

/// The host-facing side: presents the enumerated device model upstream
pub trait HostProxy: Proxy {
    /// Bring up the impersonated device toward the host. Receives the
    /// enumerated model so the backend can answer descriptor requests.
    /// [`ProxyError::Timeout`] is retried by the manager during setup.
    fn connect(&self, device: &Device) -> Result<(), ProxyError>;

    /// Tear down the host-facing function.
    fn disconnect(&self);

    /// Mirror of [`DeviceProxy::set_config`] for the host side.
    fn set_config(
        &self,
        full_speed: &Configuration,
        high_speed: Option<&Configuration>,
        highspeed: bool,
    ) -> Result<(), ProxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_only_recoverable_error() {
        assert!(ProxyError::Timeout.is_recoverable());
        assert!(!ProxyError::Pipe.is_recoverable());
        assert!(!ProxyError::NoDevice.is_recoverable());
        assert!(!ProxyError::Io("eio".into()).is_recoverable());
    }
}
