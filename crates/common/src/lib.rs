//! Common utilities for usb-mitm
//!
//! Shared plumbing used across the workspace: the error type, tracing
//! subscriber setup, and the cooperative stop token that every relay and
//! injector task polls.

pub mod error;
pub mod logging;
pub mod stop;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use stop::StopToken;
