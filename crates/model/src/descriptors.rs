//! Raw USB descriptor decoding
//!
//! Fixed-layout views over the standard descriptors the relay core needs:
//! device, configuration, interface, endpoint, and device qualifier. All
//! decoding is length- and type-checked; multi-byte fields are little-endian
//! per the USB specification.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// bDescriptorType: device
pub const DT_DEVICE: u8 = 0x01;
/// bDescriptorType: configuration
pub const DT_CONFIGURATION: u8 = 0x02;
/// bDescriptorType: string
pub const DT_STRING: u8 = 0x03;
/// bDescriptorType: interface
pub const DT_INTERFACE: u8 = 0x04;
/// bDescriptorType: endpoint
pub const DT_ENDPOINT: u8 = 0x05;
/// bDescriptorType: device qualifier
pub const DT_DEVICE_QUALIFIER: u8 = 0x06;
/// bDescriptorType: other-speed configuration
pub const DT_OTHER_SPEED_CONFIGURATION: u8 = 0x07;

/// Direction bit of an endpoint address (set = IN)
pub const ENDPOINT_DIR_IN: u8 = 0x80;
/// Endpoint number bits of an endpoint address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;
/// Transfer-type bits of bmAttributes
pub const ENDPOINT_XFERTYPE_MASK: u8 = 0x03;

const DEVICE_DESCRIPTOR_LEN: usize = 18;
const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;
const INTERFACE_DESCRIPTOR_LEN: usize = 9;
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
const DEVICE_QUALIFIER_LEN: usize = 10;

fn check_len(bytes: &[u8], needed: usize) -> Result<(), ModelError> {
    if bytes.len() < needed {
        return Err(ModelError::Truncated {
            needed,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn check_type(bytes: &[u8], expected: u8) -> Result<(), ModelError> {
    if bytes[1] != expected {
        return Err(ModelError::UnexpectedType {
            expected,
            found: bytes[1],
        });
    }
    Ok(())
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Endpoint transfer type, from the low two bits of bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control (EP0)
    Control,
    /// Isochronous; recognized but refused by the relay fabric
    Isochronous,
    /// Bulk
    Bulk,
    /// Interrupt
    Interrupt,
}

impl TransferKind {
    /// Decode from bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDPOINT_XFERTYPE_MASK {
            0x00 => TransferKind::Control,
            0x01 => TransferKind::Isochronous,
            0x02 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

/// The 18-byte standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    /// bDeviceClass
    pub device_class: u8,
    /// bDeviceSubClass
    pub device_subclass: u8,
    /// bDeviceProtocol
    pub device_protocol: u8,
    /// bMaxPacketSize0: EP0 max packet size
    pub max_packet_size0: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    /// iManufacturer string index
    pub manufacturer_index: u8,
    /// iProduct string index
    pub product_index: u8,
    /// iSerialNumber string index
    pub serial_number_index: u8,
    /// bNumConfigurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Decode from raw descriptor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        check_len(bytes, DEVICE_DESCRIPTOR_LEN)?;
        check_type(bytes, DT_DEVICE)?;
        Ok(Self {
            usb_version: le16(bytes, 2),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: le16(bytes, 8),
            product_id: le16(bytes, 10),
            device_version: le16(bytes, 12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// The 9-byte head of a configuration descriptor
///
/// Shared by DT_CONFIGURATION and DT_OTHER_SPEED_CONFIGURATION, which have
/// identical layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// wTotalLength: length of the full blob including class descriptors
    pub total_length: u16,
    /// bNumInterfaces
    pub num_interfaces: u8,
    /// bConfigurationValue: the value SET_CONFIGURATION selects by
    pub configuration_value: u8,
    /// iConfiguration string index
    pub description_index: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower in 2mA units
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    /// Decode from raw descriptor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        check_len(bytes, CONFIGURATION_DESCRIPTOR_LEN)?;
        if bytes[1] != DT_CONFIGURATION && bytes[1] != DT_OTHER_SPEED_CONFIGURATION {
            return Err(ModelError::UnexpectedType {
                expected: DT_CONFIGURATION,
                found: bytes[1],
            });
        }
        Ok(Self {
            total_length: le16(bytes, 2),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            description_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }
}

/// The 9-byte standard interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub interface_number: u8,
    /// bAlternateSetting
    pub alternate_setting: u8,
    /// bNumEndpoints
    pub num_endpoints: u8,
    /// bInterfaceClass
    pub interface_class: u8,
    /// bInterfaceSubClass
    pub interface_subclass: u8,
    /// bInterfaceProtocol
    pub interface_protocol: u8,
    /// iInterface string index
    pub description_index: u8,
}

impl InterfaceDescriptor {
    /// Decode from raw descriptor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        check_len(bytes, INTERFACE_DESCRIPTOR_LEN)?;
        check_type(bytes, DT_INTERFACE)?;
        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
            description_index: bytes[8],
        })
    }
}

/// The 7-byte standard endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress: direction bit plus 4-bit endpoint number
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Decode from raw descriptor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        check_len(bytes, ENDPOINT_DESCRIPTOR_LEN)?;
        check_type(bytes, DT_ENDPOINT)?;
        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: le16(bytes, 4),
            interval: bytes[6],
        })
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    /// Direction bit of the address
    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }

    /// Transfer type carried in bmAttributes
    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }
}

/// The 10-byte device qualifier descriptor (present on high-speed capable
/// devices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQualifierDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    /// bDeviceClass
    pub device_class: u8,
    /// bDeviceSubClass
    pub device_subclass: u8,
    /// bDeviceProtocol
    pub device_protocol: u8,
    /// bMaxPacketSize0 at the other speed
    pub max_packet_size0: u8,
    /// bNumConfigurations at the other speed
    pub num_configurations: u8,
}

impl DeviceQualifierDescriptor {
    /// Decode from raw descriptor bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        check_len(bytes, DEVICE_QUALIFIER_LEN)?;
        check_type(bytes, DT_DEVICE_QUALIFIER)?;
        Ok(Self {
            usb_version: le16(bytes, 2),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            num_configurations: bytes[8],
        })
    }
}

/// Iterator over the `(bDescriptorType, bytes)` blocks of a descriptor blob
///
/// Used to walk a full configuration blob: the configuration head, its
/// interfaces, endpoints, and any class-specific descriptors in between.
pub struct DescriptorIter<'a> {
    blob: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    /// Walk `blob` from its first descriptor
    pub fn new(blob: &'a [u8]) -> Self {
        Self { blob, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<(u8, &'a [u8]), ModelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.blob.len() {
            return None;
        }
        let rest = &self.blob[self.offset..];
        if rest.len() < 2 {
            let offset = self.offset;
            self.offset = self.blob.len();
            return Some(Err(ModelError::Malformed { offset }));
        }
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            let offset = self.offset;
            self.offset = self.blob.len();
            return Some(Err(ModelError::Malformed { offset }));
        }
        let block = &rest[..len];
        self.offset += len;
        Some(Ok((block[1], block)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_descriptor_decode() {
        let bytes = [
            18, DT_DEVICE, 0x00, 0x02, 0x00, 0x00, 0x00, 64, 0x34, 0x12, 0x78, 0x56, 0x01, 0x00,
            1, 2, 3, 1,
        ];
        let desc = DeviceDescriptor::decode(&bytes).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn test_device_descriptor_wrong_type() {
        let mut bytes = [0u8; 18];
        bytes[0] = 18;
        bytes[1] = DT_CONFIGURATION;
        assert!(matches!(
            DeviceDescriptor::decode(&bytes),
            Err(ModelError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_endpoint_descriptor_decode() {
        let bytes = [7, DT_ENDPOINT, 0x81, 0x02, 0x00, 0x02, 0x00];
        let desc = EndpointDescriptor::decode(&bytes).unwrap();
        assert_eq!(desc.address, 0x81);
        assert_eq!(desc.number(), 1);
        assert!(desc.is_in());
        assert_eq!(desc.transfer_kind(), TransferKind::Bulk);
        assert_eq!(desc.max_packet_size, 512);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(
            TransferKind::from_attributes(0x01),
            TransferKind::Isochronous
        );
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Upper synchronization bits must not leak into the type.
        assert_eq!(
            TransferKind::from_attributes(0x0d),
            TransferKind::Isochronous
        );
    }

    #[test]
    fn test_descriptor_iter_walks_blocks() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&[9, DT_CONFIGURATION, 25, 0, 1, 1, 0, 0xa0, 50]);
        blob.extend_from_slice(&[9, DT_INTERFACE, 0, 0, 1, 3, 0, 0, 0]);
        blob.extend_from_slice(&[7, DT_ENDPOINT, 0x81, 0x03, 8, 0, 10]);

        let kinds: Vec<u8> = DescriptorIter::new(&blob)
            .map(|block| block.unwrap().0)
            .collect();
        assert_eq!(kinds, vec![DT_CONFIGURATION, DT_INTERFACE, DT_ENDPOINT]);
    }

    #[test]
    fn test_descriptor_iter_rejects_zero_length() {
        let blob = [0u8, DT_ENDPOINT, 0, 0];
        let mut iter = DescriptorIter::new(&blob);
        assert!(matches!(
            iter.next(),
            Some(Err(ModelError::Malformed { offset: 0 }))
        ));
        assert!(iter.next().is_none());
    }
}
