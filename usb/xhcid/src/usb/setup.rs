use std::convert::TryInto;

use super::DescriptorKind;

/// The 8-byte setup packet that opens every control transfer. USB32 9.3
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

impl Setup {
    /// Decodes the first eight bytes of `bytes`, which hold the packet in wire order.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self {
            kind: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.kind, self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn is_in(&self) -> bool {
        self.kind & USB_SETUP_DIR_BIT != 0
    }

    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetAddress as u8,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: 0b0000_0001,
            request: SetupReq::SetInterface as u8,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_little_endian_on_the_wire() {
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0]);
        assert!(setup.is_in());
        assert_eq!(Setup::parse(&setup.to_bytes()), Some(setup));
    }

    #[test]
    fn parse_needs_eight_bytes() {
        assert_eq!(Setup::parse(&[0x80, 0x06, 0, 1, 0, 0, 18]), None);
        let mut long = Setup::set_interface(2, 1).to_bytes().to_vec();
        long.extend_from_slice(&[0xAA; 4]);
        let setup = Setup::parse(&long).unwrap();
        assert_eq!((setup.request, setup.index, setup.value), (0x0B, 2, 1));
        assert_eq!(setup.req_recipient(), 1);
        assert!(!setup.is_in());
    }
}
