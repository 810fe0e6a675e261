//! Transfer records and setup packets
//!
//! A [`Transfer`] is the unit handed between relay tasks: one USB
//! packet/transaction as delivered by a proxy. Transfers are uniquely owned
//! by whichever component currently holds them; handing one to a queue moves
//! ownership to the far side.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Length of a USB setup packet
pub const SETUP_PACKET_LEN: usize = 8;

/// Upper bound on a control transfer payload (data stages are bounded by
/// wMaxPacketSize instead)
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;

/// Standard request: GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Standard request: SET_CONFIGURATION
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
/// Standard request: SET_INTERFACE
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

/// The 8-byte setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType: direction, type, and recipient bits
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength: size of the data stage
    pub length: u16,
}

impl SetupPacket {
    /// Decode the 8-byte setup packet prefix of a control transfer
    pub fn decode(bytes: &[u8]) -> Result<Self, ModelError> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(ModelError::Truncated {
                needed: SETUP_PACKET_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Encode back to wire layout
    pub fn encode(&self) -> [u8; SETUP_PACKET_LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction bit 7 clear means host-to-device
    pub fn is_host_to_device(&self) -> bool {
        self.request_type & 0x80 == 0
    }

    /// A standard SET_CONFIGURATION request (bmRequestType 0x00, bRequest 0x09)
    pub fn is_set_configuration(&self) -> bool {
        self.request_type == 0x00 && self.request == REQUEST_SET_CONFIGURATION
    }

    /// Configuration value carried in the low byte of wValue
    pub fn configuration_value(&self) -> u8 {
        (self.value & 0x00ff) as u8
    }
}

/// One USB transfer in flight between a reader and its paired writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Endpoint address: bit 7 is the direction (1 = IN), bits 0-3 the number
    pub endpoint: u8,
    /// Setup stage, present only for control transfers
    pub setup: Option<SetupPacket>,
    /// Payload bytes (data stage)
    pub data: Vec<u8>,
}

impl Transfer {
    /// A data transfer on `endpoint`
    pub fn new(endpoint: u8, data: Vec<u8>) -> Self {
        Self {
            endpoint,
            setup: None,
            data,
        }
    }

    /// A control transfer on EP0
    pub fn control(setup: SetupPacket, data: Vec<u8>) -> Self {
        Self {
            endpoint: 0,
            setup: Some(setup),
            data,
        }
    }

    /// Endpoint number without the direction bit
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & 0x0f
    }

    /// Direction bit of the endpoint address
    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_roundtrip() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQUEST_GET_DESCRIPTOR,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let decoded = SetupPacket::decode(&setup.encode()).unwrap();
        assert_eq!(decoded, setup);
    }

    #[test]
    fn test_setup_packet_too_short() {
        assert!(matches!(
            SetupPacket::decode(&[0x00, 0x09, 0x01]),
            Err(ModelError::Truncated { needed: 8, got: 3 })
        ));
    }

    #[test]
    fn test_set_configuration_recognition() {
        let setup = SetupPacket::decode(&[0x00, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert!(setup.is_set_configuration());
        assert!(setup.is_host_to_device());
        assert_eq!(setup.configuration_value(), 2);

        // Same request code but class-typed bmRequestType must not match.
        let class = SetupPacket {
            request_type: 0x21,
            ..setup
        };
        assert!(!class.is_set_configuration());
    }

    #[test]
    fn test_transfer_direction() {
        let transfer = Transfer::new(0x81, vec![1, 2, 3]);
        assert!(transfer.is_in());
        assert_eq!(transfer.endpoint_number(), 1);

        let transfer = Transfer::new(0x02, vec![]);
        assert!(!transfer.is_in());
        assert_eq!(transfer.endpoint_number(), 2);
    }
}
