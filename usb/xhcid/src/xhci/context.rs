use std::sync::Arc;

use common::dma::{Dma, DmaError, DmaOps};
use log::debug;

/// Contexts are 32 bytes, or 64 when HCCPARAMS1.CSZ is set. Only the first 32 bytes of each are
/// defined either way.
pub const CONTEXT_32: u32 = 0;
pub const CONTEXT_64: u32 = 1;

/// An output device context holds the slot context and 31 endpoint contexts.
pub const DEVICE_CONTEXTS: usize = 32;
/// An input context prepends the input control context.
pub const INPUT_CONTEXTS: usize = DEVICE_CONTEXTS + 1;

/// Context index of the input control context inside an input context.
pub const INPUT_CONTROL: usize = 0;
/// Context index of the slot context inside an input context.
pub const INPUT_SLOT: usize = 1;
/// Context index of the slot context inside an output context.
pub const OUTPUT_SLOT: usize = 0;

/// Input context index of the endpoint context with device context index `dci`.
pub fn input_ep(dci: u8) -> usize {
    usize::from(dci) + 1
}

/// Output context index of the endpoint context with device context index `dci`.
pub fn output_ep(dci: u8) -> usize {
    usize::from(dci)
}

// Slot context, XHC 6.2.2
pub const SLOT_CONTEXT_ROUTE_STRING_MASK: u32 = 0x000F_FFFF;
pub const SLOT_CONTEXT_SPEED_SHIFT: u8 = 20;
pub const SLOT_CONTEXT_MTT_BIT: u32 = 1 << 25;
pub const SLOT_CONTEXT_HUB_BIT: u32 = 1 << 26;
pub const SLOT_CONTEXT_ENTRIES_SHIFT: u8 = 27;
pub const SLOT_CONTEXT_ENTRIES_MASK: u32 = 0xF800_0000;
pub const SLOT_CONTEXT_ROOT_PORT_SHIFT: u8 = 16;
pub const SLOT_CONTEXT_TT_PORT_SHIFT: u8 = 8;
pub const SLOT_CONTEXT_ADDRESS_MASK: u32 = 0xFF;
pub const SLOT_CONTEXT_STATE_SHIFT: u8 = 27;

// Endpoint context, XHC 6.2.3
pub const ENDPOINT_CONTEXT_STATUS_MASK: u32 = 0x7;
pub const ENDPOINT_CONTEXT_INTERVAL_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_CERR_SHIFT: u8 = 1;
pub const ENDPOINT_CONTEXT_TYPE_SHIFT: u8 = 3;
pub const ENDPOINT_CONTEXT_MAX_BURST_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_MAX_PACKET_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_MAX_ESIT_SHIFT: u8 = 16;
/// Dequeue Cycle State, bit 0 of the TR dequeue pointer.
pub const ENDPOINT_CONTEXT_DCS: u64 = 1;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
}

impl EndpointState {
    pub fn from_context(w0: u32) -> Option<Self> {
        Some(match w0 & ENDPOINT_CONTEXT_STATUS_MASK {
            0 => Self::Disabled,
            1 => Self::Running,
            2 => Self::Halted,
            3 => Self::Stopped,
            4 => Self::Error,
            _ => return None,
        })
    }
}

/// A block of device or input contexts, addressed as `(context index, word)`.
pub struct ContextArea {
    dma: Dma,
    csz: u32,
    count: usize,
}

impl ContextArea {
    fn new(ops: &Arc<dyn DmaOps>, count: usize, csz: u32, pagesize: usize) -> Result<Self, DmaError> {
        let dma = Dma::new(ops, (32 * count) << csz, 64, pagesize)?;
        Ok(Self { dma, csz, count })
    }

    /// Staging memory for Address Device, Configure Endpoint and Evaluate Context.
    pub fn input(ops: &Arc<dyn DmaOps>, csz: u32, pagesize: usize) -> Result<Self, DmaError> {
        Self::new(ops, INPUT_CONTEXTS, csz, pagesize)
    }

    /// The device context the controller owns and publishes slot state in.
    pub fn output(ops: &Arc<dyn DmaOps>, csz: u32, pagesize: usize) -> Result<Self, DmaError> {
        Self::new(ops, DEVICE_CONTEXTS, csz, pagesize)
    }

    fn word(&self, ctx: usize, w: usize) -> usize {
        assert!(ctx < self.count && w < 8, "context {} word {} out of range", ctx, w);
        ((ctx * 8) << self.csz) + w
    }

    pub fn read(&self, ctx: usize, w: usize) -> u32 {
        self.dma.read32(self.word(ctx, w))
    }

    pub fn write(&self, ctx: usize, w: usize, value: u32) {
        self.dma.write32(self.word(ctx, w), value)
    }

    pub fn write64(&self, ctx: usize, w: usize, value: u64) {
        self.dma.write64(self.word(ctx, w), value)
    }

    pub fn update(&self, ctx: usize, w: usize, f: impl FnOnce(u32) -> u32) {
        self.write(ctx, w, f(self.read(ctx, w)))
    }

    /// Zeroes the defined words of one context.
    pub fn zero(&self, ctx: usize) {
        self.dma.zero_words(self.word(ctx, 0), 8)
    }

    /// Zeroes every context in the area.
    pub fn clear(&self) {
        self.dma.zero_words(0, self.dma.len() / 4)
    }

    pub fn bus_addr(&self) -> u64 {
        self.dma.bus_addr()
    }

    pub fn flush(&self) {
        self.dma.flush()
    }

    pub fn invalidate(&self) {
        self.dma.invalidate()
    }

    /// Reads back one context as the controller left it.
    pub fn invalidate_ctx(&self, ctx: usize) {
        let size = 32 << self.csz;
        self.dma.invalidate_range(ctx * size, size)
    }

    pub fn dump_control(&self) {
        debug!(
            "INPUT CONTEXT: drop {:#x} add {:#x} [{:#x}]",
            self.read(INPUT_CONTROL, 0),
            self.read(INPUT_CONTROL, 1),
            self.read(INPUT_CONTROL, 7)
        );
    }
}

/// The Device Context Base Address Array. Entry 0 points at the scratchpad array, entry `n` at
/// the output context of slot `n`. XHC 6.1
pub struct DeviceContextList {
    dcbaa: Dma,
    nslots: u8,
}

impl DeviceContextList {
    pub fn new(ops: &Arc<dyn DmaOps>, nslots: u8, pagesize: usize) -> Result<Self, DmaError> {
        let dcbaa = Dma::new(ops, (1 + usize::from(nslots)) * 8, 64, pagesize)?;
        dcbaa.flush();
        Ok(Self { dcbaa, nslots })
    }

    pub fn dcbaap(&self) -> u64 {
        self.dcbaa.bus_addr()
    }

    pub fn get(&self, index: u8) -> u64 {
        self.dcbaa.read64(usize::from(index) * 2)
    }

    pub fn set(&self, index: u8, addr: u64) {
        assert!(index <= self.nslots);
        self.dcbaa.write64(usize::from(index) * 2, addr);
        self.dcbaa.flush_range(usize::from(index) * 8, 8);
    }
}

/// Working memory the controller asked for in HCSPARAMS2, and the array pointing at it.
pub struct ScratchpadBufferArray {
    array: Dma,
    pages: Vec<Dma>,
}

impl ScratchpadBufferArray {
    pub fn new(ops: &Arc<dyn DmaOps>, count: u32, pagesize: usize) -> Result<Self, DmaError> {
        let array = Dma::new(ops, count as usize * 8, 64, pagesize)?;
        let pages = (0..count as usize)
            .map(|i| {
                let page = Dma::new(ops, pagesize, pagesize, 0)?;
                page.flush();
                array.write64(i * 2, page.bus_addr());
                Ok(page)
            })
            .collect::<Result<Vec<_>, DmaError>>()?;
        array.flush();
        Ok(Self { array, pages })
    }

    pub fn register(&self) -> u64 {
        self.array.bus_addr()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Drop for ScratchpadBufferArray {
    fn drop(&mut self) {
        // Drop whatever the controller left in the cache before the pages are reused.
        for page in &self.pages {
            page.invalidate();
        }
    }
}
