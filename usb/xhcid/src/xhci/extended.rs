use std::time::Duration;

use common::io::{Io, Reg, RegisterWindow};
use common::timeout::Timeout;
use log::{debug, warn};

/// Walks the extended capability list, yielding the byte offset and id of every entry.
pub struct ExtendedCapabilitiesIter<'a> {
    window: &'a dyn RegisterWindow,
    current: usize,
    next_rel_in_dwords: usize,
}

impl<'a> ExtendedCapabilitiesIter<'a> {
    /// `xecp` is the xECP field of HCCPARAMS1, in dwords from the base of the window.
    pub fn new(window: &'a dyn RegisterWindow, xecp: u16) -> Self {
        Self {
            window,
            current: 0,
            next_rel_in_dwords: usize::from(xecp),
        }
    }
}

impl Iterator for ExtendedCapabilitiesIter<'_> {
    type Item = (usize, u8); // offset, capability id

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_rel_in_dwords == 0 {
            return None;
        }
        self.current += self.next_rel_in_dwords << 2;
        if self.current + 4 > self.window.size() {
            self.next_rel_in_dwords = 0;
            return None;
        }

        let reg = self.window.read32(self.current);
        self.next_rel_in_dwords = ((reg & 0xFF00) >> 8) as usize;
        Some((self.current, (reg & 0xFF) as u8))
    }
}

#[repr(u8)]
pub enum CapabilityId {
    // bit 0 is reserved
    UsbLegacySupport = 1,
    SupportedProtocol,
    ExtendedPowerManagement,
    IoVirtualization,
    MessageInterrupt,
    LocalMem,
    // bits 7-9 are reserved
    UsbDebugCapability = 10,
    // bits 11-16 are reserved
    ExtendedMessageInterrupt = 17,
    // bits 18-191 are reserved
    // bits 192-255 are vendor-defined
}

pub const USBLEGSUP_BIOS_OWNED: u32 = 1 << 16;
pub const USBLEGSUP_OS_OWNED: u32 = 1 << 24;

/// SMI enable bits of USBLEGCTLSTS that are kept; everything else is cleared.
pub const USBLEGCTLSTS_PRESERVED: u32 = 7 << 1 | 255 << 5 | 7 << 17 | 7 << 29;

/// The USB Legacy Support capability. XHC 7.1
pub struct UsbLegacySupport<'a> {
    pub usblegsup: Reg<'a>,
    pub usblegctlsts: Reg<'a>,
}

impl<'a> UsbLegacySupport<'a> {
    pub fn new(window: &'a dyn RegisterWindow, offset: usize) -> Self {
        Self {
            usblegsup: Reg::new(window, offset),
            usblegctlsts: Reg::new(window, offset + 4),
        }
    }

    /// Takes the controller away from the BIOS.
    ///
    /// Unless `request` is false, OS ownership is requested and the BIOS gets up to a second to
    /// let go. SMIs are disabled and BIOS ownership is cleared either way.
    pub fn handoff(&mut self, request: bool) {
        if request {
            self.usblegsup.writef(USBLEGSUP_OS_OWNED, true);
            let timeout = Timeout::from_secs(1).with_interval(Duration::from_millis(10));
            if !timeout.wait_until(|| !self.usblegsup.readf(USBLEGSUP_BIOS_OWNED)) {
                warn!("BIOS did not release the xHC, taking it anyway");
            }
        }
        let ctlsts = self.usblegctlsts.read();
        self.usblegctlsts.write(ctlsts & USBLEGCTLSTS_PRESERVED);

        self.usblegsup.writef(USBLEGSUP_BIOS_OWNED, false);
        debug!("USBLEGSUP after handoff: {:#x}", self.usblegsup.read());
    }
}

/// The name field of a Supported Protocol capability for USB ports.
pub const PROTOCOL_NAME_USB: [u8; 4] = *b"USB ";

/// A snapshot of one Supported Protocol capability. XHC 7.2
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SupportedProtoCap {
    a: u32,
    b: u32,
    c: u32,
    d: u32,
}

impl SupportedProtoCap {
    pub fn read(window: &dyn RegisterWindow, offset: usize) -> Self {
        Self {
            a: window.read32(offset),
            b: window.read32(offset + 4),
            c: window.read32(offset + 8),
            d: window.read32(offset + 12),
        }
    }

    /// Major and minor revision in BCD, 0x0300 for USB 3.0.
    pub fn revision(&self) -> u16 {
        (self.a >> 16) as u16
    }

    pub fn rev_major(&self) -> u8 {
        (self.a >> 24) as u8
    }

    pub fn rev_minor(&self) -> u8 {
        (self.a >> 16) as u8
    }

    pub fn name(&self) -> [u8; 4] {
        self.b.to_le_bytes()
    }

    /// First root hub port (1-based) this protocol applies to.
    pub fn compat_port_offset(&self) -> u8 {
        self.c as u8
    }

    pub fn compat_port_count(&self) -> u8 {
        (self.c >> 8) as u8
    }

    pub fn proto_slot_ty(&self) -> u8 {
        (self.d & 0x1F) as u8
    }

    pub fn is_usb3(&self) -> bool {
        self.name() == PROTOCOL_NAME_USB && self.revision() >= 0x0300
    }
}
