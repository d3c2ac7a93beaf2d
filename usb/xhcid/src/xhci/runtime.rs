use common::io::{self, Reg, RegisterWindow};

/// MFINDEX holds a 14-bit microframe counter.
pub const MFINDEX_MASK: u32 = (1 << 14) - 1;

pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

/// Event Handler Busy, written back together with ERDP to acknowledge it.
pub const ERDP_EHB: u64 = 1 << 3;

/// One interrupter register set. XHC 5.5.2
pub struct Interrupter<'a> {
    window: &'a dyn RegisterWindow,
    base: usize,
    pub iman: Reg<'a>,
    pub imod: Reg<'a>,
    pub erstsz: Reg<'a>,
}

impl<'a> Interrupter<'a> {
    pub fn write_erstba(&self, value: u64) {
        io::write64(self.window, self.base + 0x10, value);
    }

    pub fn write_erdp(&self, value: u64) {
        io::write64(self.window, self.base + 0x18, value);
    }
}

/// The runtime registers, RTSOFF bytes into the register window. XHC 5.5
pub struct RuntimeRegs<'a> {
    window: &'a dyn RegisterWindow,
    base: usize,
    pub mfindex: Reg<'a>,
}

impl<'a> RuntimeRegs<'a> {
    pub fn new(window: &'a dyn RegisterWindow, base: usize) -> Self {
        Self {
            window,
            base,
            mfindex: Reg::new(window, base),
        }
    }

    pub fn interrupter(&self, index: usize) -> Interrupter<'a> {
        let base = self.base + 0x20 + index * 0x20;
        Interrupter {
            window: self.window,
            base,
            iman: Reg::new(self.window, base),
            imod: Reg::new(self.window, base + 0x4),
            erstsz: Reg::new(self.window, base + 0x8),
        }
    }
}
