//! Model error types

use thiserror::Error;

/// Errors raised while decoding descriptors or building the device tree
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input shorter than the descriptor it claims to hold
    #[error("descriptor too short: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// Descriptor type byte did not match what the caller expected
    #[error("unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// A descriptor block with a bogus bLength or one that overruns the blob
    #[error("malformed descriptor block at offset {offset}")]
    Malformed { offset: usize },

    /// Lookup of a configuration value that the device does not carry
    #[error("configuration {0} not present in descriptor tree")]
    UnknownConfiguration(u8),

    /// A device descriptor advertising zero configurations
    #[error("device reports no configurations")]
    NoConfigurations,

    /// Proxy failure while querying descriptors
    #[error("proxy error: {0}")]
    Proxy(#[from] crate::proxy::ProxyError),
}

/// Type alias for model results
pub type Result<T> = std::result::Result<T, ModelError>;
