use common::io::{self, Reg, RegisterWindow};

bitflags! {
    /// USBCMD, XHC 5.4.1
    pub struct UsbCmd: u32 {
        const RS = 1 << 0;
        const HCRST = 1 << 1;
        const INTE = 1 << 2;
        const HSEE = 1 << 3;
        const LHCRST = 1 << 7;
        const CSS = 1 << 8;
        const CRS = 1 << 9;
        const EWE = 1 << 10;
        const EU3S = 1 << 11;
    }
}

bitflags! {
    /// USBSTS, XHC 5.4.2
    pub struct UsbSts: u32 {
        const HCH = 1 << 0; // RO
        const HSE = 1 << 2; // RW1C
        const EINT = 1 << 3; // RW1C
        const PCD = 1 << 4; // RW1C
        const SSS = 1 << 8; // RO
        const RSS = 1 << 9; // RO
        const SRE = 1 << 10; // RW1C
        const CNR = 1 << 11; // RO
        const HCE = 1 << 12; // RO
    }
}

bitflags! {
    /// The low dword of CRCR, XHC 5.4.5
    pub struct Crcr: u32 {
        const RCS = 1 << 0;
        const CS = 1 << 1; // RW1S
        const CA = 1 << 2; // RW1S
        const CRR = 1 << 3; // RO
    }
}

pub const OP_CONFIG_MAX_SLOTS_EN_MASK: u32 = 0x0000_03FF;
pub const OP_CONFIG_CIE_BIT: u32 = 1 << 9;

/// The operational registers, starting CAPLENGTH bytes into the register window. XHC 5.4
pub struct OperationalRegs<'a> {
    window: &'a dyn RegisterWindow,
    base: usize,
    pub usb_cmd: Reg<'a>,
    pub usb_sts: Reg<'a>,
    pub page_size: Reg<'a>,
    pub dn_ctrl: Reg<'a>,
    pub crcr_low: Reg<'a>,
    pub config: Reg<'a>,
}

impl<'a> OperationalRegs<'a> {
    pub fn new(window: &'a dyn RegisterWindow, base: usize) -> Self {
        let reg = |offset| Reg::new(window, base + offset);
        Self {
            window,
            base,
            usb_cmd: reg(0x00),
            usb_sts: reg(0x04),
            page_size: reg(0x08),
            dn_ctrl: reg(0x14),
            crcr_low: reg(0x18),
            config: reg(0x38),
        }
    }

    pub fn write_crcr(&self, value: u64) {
        io::write64(self.window, self.base + 0x18, value);
    }

    pub fn write_dcbaap(&self, value: u64) {
        io::write64(self.window, self.base + 0x30, value);
    }

    /// Byte offset of the port register set for the 1-based `port`. XHC 5.4.8
    pub fn port_offset(&self, port: usize) -> usize {
        self.base + 0x400 + (port - 1) * 0x10
    }
}
