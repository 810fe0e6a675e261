//! In-memory USB descriptor tree
//!
//! Mirrors the hierarchy a device enumerates with: a [`Device`] holds one or
//! more [`Configuration`]s (plus an optional [`DeviceQualifier`] on
//! high-speed capable devices), each configuration holds interfaces with
//! their alternate settings, and each interface alternate holds its
//! [`Endpoint`]s. The tree is built once per relaying session by querying
//! the device-side proxy and is immutable afterwards, except for the active
//! configuration value which is swapped atomically on SET_CONFIGURATION.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::descriptors::{
    ConfigurationDescriptor, DescriptorIter, DeviceDescriptor, DeviceQualifierDescriptor,
    EndpointDescriptor, InterfaceDescriptor, TransferKind, DT_ENDPOINT, DT_INTERFACE,
};
use crate::error::ModelError;
use crate::proxy::DeviceProxy;

/// Identity of the interface alternate that owns an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceKey {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alternate: u8,
}

/// One endpoint of an interface alternate, or the synthesized EP0
///
/// Immutable after construction. EP0 has no owning interface.
#[derive(Debug, Clone)]
pub struct Endpoint {
    descriptor: EndpointDescriptor,
    interface: Option<InterfaceKey>,
}

impl Endpoint {
    /// Build from a raw 7-byte endpoint descriptor
    pub fn from_bytes(interface: Option<InterfaceKey>, bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(Self {
            descriptor: EndpointDescriptor::decode(bytes)?,
            interface,
        })
    }

    /// Build from an already-decoded descriptor
    pub fn new(interface: Option<InterfaceKey>, descriptor: EndpointDescriptor) -> Self {
        Self {
            descriptor,
            interface,
        }
    }

    /// Full endpoint address including the direction bit
    pub fn address(&self) -> u8 {
        self.descriptor.address
    }

    /// Endpoint number 0..15
    pub fn number(&self) -> u8 {
        self.descriptor.number()
    }

    /// Direction bit of the address
    pub fn is_in(&self) -> bool {
        self.descriptor.is_in()
    }

    /// Transfer type from bmAttributes
    pub fn transfer_kind(&self) -> TransferKind {
        self.descriptor.transfer_kind()
    }

    /// wMaxPacketSize
    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size
    }

    /// Owning interface alternate, None for EP0
    pub fn interface(&self) -> Option<InterfaceKey> {
        self.interface
    }

    /// The raw descriptor fields
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }
}

/// One alternate setting of an interface
#[derive(Debug, Clone)]
pub struct Interface {
    descriptor: InterfaceDescriptor,
    endpoints: Vec<Arc<Endpoint>>,
}

impl Interface {
    /// bInterfaceNumber
    pub fn number(&self) -> u8 {
        self.descriptor.interface_number
    }

    /// bAlternateSetting
    pub fn alternate_setting(&self) -> u8 {
        self.descriptor.alternate_setting
    }

    /// Endpoints of this alternate
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// The raw descriptor fields
    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }
}

/// One configuration with all interface alternates flattened in blob order
#[derive(Debug, Clone)]
pub struct Configuration {
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<Interface>,
}

impl Configuration {
    /// Parse a full configuration blob (the 9-byte head followed by
    /// interface, endpoint, and class-specific descriptors)
    ///
    /// Class-specific blocks are skipped; interface and endpoint blocks
    /// build the tree. Works for other-speed configuration blobs as well.
    pub fn parse(blob: &[u8]) -> Result<Self, ModelError> {
        let descriptor = ConfigurationDescriptor::decode(blob)?;
        let total = descriptor.total_length as usize;
        if blob.len() < total {
            return Err(ModelError::Truncated {
                needed: total,
                got: blob.len(),
            });
        }

        let mut interfaces: Vec<Interface> = Vec::new();
        for block in DescriptorIter::new(&blob[..total]).skip(1) {
            let (descriptor_type, bytes) = block?;
            match descriptor_type {
                DT_INTERFACE => {
                    interfaces.push(Interface {
                        descriptor: InterfaceDescriptor::decode(bytes)?,
                        endpoints: Vec::new(),
                    });
                }
                DT_ENDPOINT => {
                    let interface = interfaces.last_mut().ok_or(ModelError::UnexpectedType {
                        expected: DT_INTERFACE,
                        found: DT_ENDPOINT,
                    })?;
                    let key = InterfaceKey {
                        number: interface.descriptor.interface_number,
                        alternate: interface.descriptor.alternate_setting,
                    };
                    interface
                        .endpoints
                        .push(Arc::new(Endpoint::from_bytes(Some(key), bytes)?));
                }
                // Class- and vendor-specific descriptors ride along in the
                // blob but do not contribute to the relay topology.
                _ => {}
            }
        }

        Ok(Self {
            descriptor,
            interfaces,
        })
    }

    /// bConfigurationValue
    pub fn value(&self) -> u8 {
        self.descriptor.configuration_value
    }

    /// bNumInterfaces
    pub fn num_interfaces(&self) -> u8 {
        self.descriptor.num_interfaces
    }

    /// All interface alternates in blob order
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Look up one interface alternate
    pub fn interface(&self, number: u8, alternate: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|ifc| ifc.number() == number && ifc.alternate_setting() == alternate)
    }

    /// The raw descriptor fields
    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }
}

/// Device qualifier plus the other-speed configurations it announces
#[derive(Debug, Clone)]
pub struct DeviceQualifier {
    descriptor: DeviceQualifierDescriptor,
    configurations: Vec<Configuration>,
}

impl DeviceQualifier {
    /// Look up an other-speed configuration by bConfigurationValue
    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|cfg| cfg.value() == value)
    }

    /// All other-speed configurations
    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// The raw descriptor fields
    pub fn descriptor(&self) -> &DeviceQualifierDescriptor {
        &self.descriptor
    }
}

/// The root of the descriptor tree for one relaying session
pub struct Device {
    descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
    qualifier: Option<DeviceQualifier>,
    highspeed: bool,
    active_value: AtomicU8,
}

impl Device {
    /// Build the tree by querying a connected device-side proxy
    pub fn from_proxy(proxy: &dyn DeviceProxy) -> Result<Self, ModelError> {
        let descriptor = DeviceDescriptor::decode(&proxy.device_descriptor()?)?;
        if descriptor.num_configurations == 0 {
            return Err(ModelError::NoConfigurations);
        }

        let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
        for index in 0..descriptor.num_configurations {
            configurations.push(Configuration::parse(&proxy.configuration_blob(index)?)?);
        }

        let qualifier = match proxy.device_qualifier()? {
            Some(bytes) => {
                let qualifier_descriptor = DeviceQualifierDescriptor::decode(&bytes)?;
                let mut other_speed = Vec::with_capacity(
                    qualifier_descriptor.num_configurations as usize,
                );
                for index in 0..qualifier_descriptor.num_configurations {
                    other_speed.push(Configuration::parse(
                        &proxy.other_speed_configuration_blob(index)?,
                    )?);
                }
                Some(DeviceQualifier {
                    descriptor: qualifier_descriptor,
                    configurations: other_speed,
                })
            }
            None => None,
        };

        let active_value = AtomicU8::new(configurations[0].value());
        Ok(Self {
            descriptor,
            configurations,
            qualifier,
            highspeed: proxy.is_highspeed(),
            active_value,
        })
    }

    /// The raw device descriptor fields
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// All configurations
    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// Look up a configuration by bConfigurationValue
    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|cfg| cfg.value() == value)
    }

    /// Device qualifier, present iff the device is high-speed capable
    pub fn qualifier(&self) -> Option<&DeviceQualifier> {
        self.qualifier.as_ref()
    }

    /// Whether the session runs at high speed
    pub fn is_highspeed(&self) -> bool {
        self.highspeed
    }

    /// bConfigurationValue of the active configuration
    pub fn active_value(&self) -> u8 {
        self.active_value.load(Ordering::Acquire)
    }

    /// The active configuration (falls back to the first one before any
    /// SET_CONFIGURATION has been observed)
    pub fn active_configuration(&self) -> &Configuration {
        let value = self.active_value();
        self.configuration(value)
            .unwrap_or(&self.configurations[0])
    }

    /// Swap the active configuration; the store is atomic so relay tasks
    /// reading the tree never observe a torn update
    pub fn set_active_configuration(&self, value: u8) -> Result<(), ModelError> {
        if self.configuration(value).is_none() {
            return Err(ModelError::UnknownConfiguration(value));
        }
        self.active_value.store(value, Ordering::Release);
        Ok(())
    }

    /// Render the descriptor tree for the setup-time log line
    pub fn tree_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "device {:04x}:{:04x} usb {:x}.{:02x} class {:02x} max-packet0 {} configurations {}{}",
            self.descriptor.vendor_id,
            self.descriptor.product_id,
            self.descriptor.usb_version >> 8,
            self.descriptor.usb_version & 0xff,
            self.descriptor.device_class,
            self.descriptor.max_packet_size0,
            self.descriptor.num_configurations,
            if self.highspeed { " (high-speed)" } else { "" },
        );
        for cfg in &self.configurations {
            let _ = writeln!(
                out,
                "  configuration {}: interfaces {} attributes {:#04x} max-power {}mA",
                cfg.value(),
                cfg.num_interfaces(),
                cfg.descriptor().attributes,
                cfg.descriptor().max_power as u16 * 2,
            );
            for ifc in cfg.interfaces() {
                let _ = writeln!(
                    out,
                    "    interface {} alt {} class {:02x}",
                    ifc.number(),
                    ifc.alternate_setting(),
                    ifc.descriptor().interface_class,
                );
                for ep in ifc.endpoints() {
                    let _ = writeln!(
                        out,
                        "      endpoint {:#04x} {:?} max-packet {} interval {}",
                        ep.address(),
                        ep.transfer_kind(),
                        ep.max_packet_size(),
                        ep.descriptor().interval,
                    );
                }
            }
        }
        if let Some(qualifier) = &self.qualifier {
            let _ = writeln!(
                out,
                "  device qualifier: other-speed configurations {}",
                qualifier.descriptor().num_configurations,
            );
        }
        out
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("vendor_id", &self.descriptor.vendor_id)
            .field("product_id", &self.descriptor.product_id)
            .field("configurations", &self.configurations.len())
            .field("highspeed", &self.highspeed)
            .field("active_value", &self.active_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DT_CONFIGURATION, DT_ENDPOINT, DT_INTERFACE};

    fn config_blob(value: u8, endpoints: &[(u8, u8)]) -> Vec<u8> {
        let mut blob = vec![9, DT_CONFIGURATION, 0, 0, 1, value, 0, 0xa0, 50];
        blob.extend_from_slice(&[9, DT_INTERFACE, 0, 0, endpoints.len() as u8, 0xff, 0, 0, 0]);
        for &(address, attributes) in endpoints {
            blob.extend_from_slice(&[7, DT_ENDPOINT, address, attributes, 64, 0, 0]);
        }
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());
        blob
    }

    #[test]
    fn test_configuration_parse() {
        let cfg = Configuration::parse(&config_blob(1, &[(0x81, 0x02), (0x02, 0x02)])).unwrap();
        assert_eq!(cfg.value(), 1);
        assert_eq!(cfg.interfaces().len(), 1);
        let endpoints = cfg.interfaces()[0].endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].address(), 0x81);
        assert_eq!(
            endpoints[0].interface(),
            Some(InterfaceKey {
                number: 0,
                alternate: 0
            })
        );
        assert_eq!(endpoints[1].address(), 0x02);
    }

    #[test]
    fn test_configuration_parse_skips_class_blocks() {
        let mut blob = vec![9, DT_CONFIGURATION, 0, 0, 1, 1, 0, 0xa0, 50];
        blob.extend_from_slice(&[9, DT_INTERFACE, 0, 0, 1, 3, 1, 1, 0]);
        // A class-specific (HID) descriptor between interface and endpoint.
        blob.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00]);
        blob.extend_from_slice(&[7, DT_ENDPOINT, 0x81, 0x03, 8, 0, 10]);
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());

        let cfg = Configuration::parse(&blob).unwrap();
        assert_eq!(cfg.interfaces()[0].endpoints().len(), 1);
    }

    #[test]
    fn test_configuration_parse_orphan_endpoint() {
        let mut blob = vec![9, DT_CONFIGURATION, 0, 0, 1, 1, 0, 0xa0, 50];
        blob.extend_from_slice(&[7, DT_ENDPOINT, 0x81, 0x02, 64, 0, 0]);
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());

        assert!(Configuration::parse(&blob).is_err());
    }

    #[test]
    fn test_endpoint_zero_synthesis() {
        let ep0 = Endpoint::from_bytes(None, &[7, DT_ENDPOINT, 0, 0, 64, 0, 0]).unwrap();
        assert_eq!(ep0.address(), 0);
        assert_eq!(ep0.transfer_kind(), TransferKind::Control);
        assert!(ep0.interface().is_none());
        assert_eq!(ep0.max_packet_size(), 64);
    }
}
