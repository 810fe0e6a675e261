//! usb-mitm relay core
//!
//! A man-in-the-middle for the USB protocol: the relay impersonates a target
//! device toward an upstream host while forwarding traffic to the real
//! device, with filters that may inspect, mutate, or drop transfers in
//! flight and injectors that synthesize new ones.
//!
//! This crate holds the [`manager::Manager`] lifecycle controller and the
//! per-endpoint relay fabric; the descriptor model and the proxy traits the
//! concrete backends implement live in the `model` crate.

pub mod config;
pub mod fabric;
pub mod filter;
pub mod inject;
pub mod manager;
pub mod plugin;
pub mod reader;
pub mod testing;
pub mod writer;

pub use config::RelayConfig;
pub use fabric::{packet_queue, PacketReceiver, PacketSender, ProxyEnd};
pub use filter::{FilterAction, PacketFilter};
pub use inject::{InjectionPorts, Injector};
pub use manager::{Manager, ManagerError, ManagerState};
pub use plugin::{PluginRegistry, PluginSet};
pub use reader::RelayReader;
pub use writer::{RelayWriter, SetConfigHook};
