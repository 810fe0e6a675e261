//! USB model library for usb-mitm
//!
//! This crate defines the shared vocabulary of the relay core: the transfer
//! record passed between relay tasks, raw USB descriptor decoding, the
//! in-memory descriptor tree (device, configurations, interfaces, endpoints),
//! and the proxy trait interfaces that concrete host/device backends
//! implement.
//!
//! # Example
//!
//! ```
//! use model::{SetupPacket, Transfer};
//!
//! // The 8-byte setup packet of a SET_CONFIGURATION(1) request.
//! let setup = SetupPacket::decode(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
//! assert!(setup.is_set_configuration());
//! assert_eq!(setup.configuration_value(), 1);
//!
//! let transfer = Transfer::control(setup, Vec::new());
//! assert_eq!(transfer.endpoint, 0);
//! ```

pub mod descriptors;
pub mod device;
pub mod error;
pub mod proxy;
pub mod transfer;

pub use descriptors::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceQualifierDescriptor, EndpointDescriptor,
    InterfaceDescriptor, TransferKind, DT_CONFIGURATION, DT_DEVICE, DT_DEVICE_QUALIFIER,
    DT_ENDPOINT, DT_INTERFACE, DT_OTHER_SPEED_CONFIGURATION, ENDPOINT_DIR_IN,
    ENDPOINT_NUMBER_MASK,
};
pub use device::{Configuration, Device, DeviceQualifier, Endpoint, Interface, InterfaceKey};
pub use error::{ModelError, Result};
pub use proxy::{DeviceProxy, HostProxy, Proxy, ProxyError};
pub use transfer::{SetupPacket, Transfer, MAX_CONTROL_PAYLOAD, REQUEST_SET_CONFIGURATION};
