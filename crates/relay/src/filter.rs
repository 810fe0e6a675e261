//! Packet filters
//!
//! A filter is installed into the writers whose entities its four match
//! predicates accept; the predicates run once at relay setup, `filter` runs
//! per packet. Default predicates match everything, so a filter only
//! overrides the scopes it cares about. Stateful filters are allowed but
//! must tolerate running on several writer threads at once, since each
//! matching endpoint gets its own chain entry.

use model::{Configuration, Device, Endpoint, Interface, Transfer};
use tracing::debug;

/// What a filter decided about one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Forward the transfer (possibly mutated in place)
    Pass,
    /// Forward with the payload swapped out
    Replace(Vec<u8>),
    /// Discard; the rest of the chain never sees the transfer
    Drop,
}

/// Per-endpoint transform applied by a relay writer
pub trait PacketFilter: Send + Sync {
    /// Scope predicate: does this filter apply to the device?
    fn matches_device(&self, _device: &Device) -> bool {
        true
    }

    /// Scope predicate: does this filter apply to the configuration?
    fn matches_configuration(&self, _config: &Configuration) -> bool {
        true
    }

    /// Scope predicate: does this filter apply to the interface?
    fn matches_interface(&self, _interface: &Interface) -> bool {
        true
    }

    /// Scope predicate: does this filter apply to the endpoint?
    fn matches_endpoint(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    /// Inspect, rewrite, or drop one transfer
    fn filter(&self, transfer: &mut Transfer) -> FilterAction;
}

/// Logs every transfer it sees and passes it through unchanged
pub struct LoggingFilter {
    endpoint: Option<u8>,
}

impl LoggingFilter {
    /// Log traffic on `endpoint`, or on every endpoint when None
    pub fn new(endpoint: Option<u8>) -> Self {
        Self { endpoint }
    }
}

impl PacketFilter for LoggingFilter {
    fn matches_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.endpoint.map_or(true, |address| address == endpoint.address())
    }

    fn filter(&self, transfer: &mut Transfer) -> FilterAction {
        let direction = if transfer.is_in() { "IN " } else { "OUT" };
        let preview = &transfer.data[..transfer.data.len().min(16)];
        debug!(
            "{} endpoint {:#04x}: {} bytes {:02x?}{}",
            direction,
            transfer.endpoint,
            transfer.data.len(),
            preview,
            if transfer.setup.is_some() { " (control)" } else { "" },
        );
        FilterAction::Pass
    }
}

/// Rotates alphabetic payload bytes by 13 places
pub struct Rot13Filter {
    endpoint: Option<u8>,
}

impl Rot13Filter {
    /// Rewrite traffic on `endpoint`, or on every endpoint when None
    pub fn new(endpoint: Option<u8>) -> Self {
        Self { endpoint }
    }
}

impl PacketFilter for Rot13Filter {
    fn matches_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.endpoint.map_or(true, |address| address == endpoint.address())
    }

    fn filter(&self, transfer: &mut Transfer) -> FilterAction {
        for byte in &mut transfer.data {
            *byte = match *byte {
                b'a'..=b'z' => b'a' + (*byte - b'a' + 13) % 26,
                b'A'..=b'Z' => b'A' + (*byte - b'A' + 13) % 26,
                other => other,
            };
        }
        FilterAction::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::endpoint;

    #[test]
    fn test_default_predicates_match_everything() {
        let filter = LoggingFilter::new(None);
        assert!(filter.matches_endpoint(&endpoint(0x81, 0x02)));
        assert!(filter.matches_endpoint(&endpoint(0x02, 0x02)));
    }

    #[test]
    fn test_endpoint_scoping() {
        let filter = Rot13Filter::new(Some(0x81));
        assert!(filter.matches_endpoint(&endpoint(0x81, 0x02)));
        assert!(!filter.matches_endpoint(&endpoint(0x01, 0x02)));
    }

    #[test]
    fn test_rot13_rewrites_in_place() {
        let filter = Rot13Filter::new(None);
        let mut transfer = Transfer::new(0x81, b"Hello, USB!".to_vec());
        assert_eq!(filter.filter(&mut transfer), FilterAction::Pass);
        assert_eq!(transfer.data, b"Uryyb, HFO!".to_vec());

        // Applying it twice restores the original payload.
        filter.filter(&mut transfer);
        assert_eq!(transfer.data, b"Hello, USB!".to_vec());
    }
}
