use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::dma::{Dma, DmaError, DmaOps};

use super::ring::Ring;
use super::trb::Trb;

/// log2 of the number of entries in the event ring segment.
pub const EVENT_RING_SHIFT: u32 = 8;

/// Whether the event at consumer index `x` was written during the current pass.
///
/// The consumer cycle state starts at 1 and flips on every wrap, so a fresh entry carries the
/// complement of the pass parity.
pub fn consumer_owns(x: u32, shift: u32, control: u32) -> bool {
    ((x >> shift) ^ control) & 1 != 0
}

// Segment table entry: 64-bit base, then the segment size in TRBs.
const ERST_ENTRY_SIZE: usize = 16;

/// The single segment event ring of interrupter 0 and its segment table.
pub struct EventRing {
    pub ring: Ring,
    erst: Dma,
    stopped: AtomicBool,
}

impl EventRing {
    pub fn new(ops: &Arc<dyn DmaOps>) -> Result<Self, DmaError> {
        let ring = Ring::new(ops, EVENT_RING_SHIFT, 0, 0)?;
        let erst = Dma::new(ops, ERST_ENTRY_SIZE, 64, 0)?;
        erst.write64(0, ring.base());
        erst.write32(2, ring.mask() + 1);
        erst.flush();

        Ok(Self {
            ring,
            erst,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn erstba(&self) -> u64 {
        self.erst.bus_addr()
    }

    /// The dequeue pointer for consumer index `x`, without flags.
    pub fn erdp(&self, x: u32) -> u64 {
        self.ring.trb_addr(x)
    }

    /// Returns the event at consumer index `x` if the controller has produced it.
    pub fn next(&self, x: u32) -> Option<Trb> {
        let trb = self.ring.read_trb(x);
        if consumer_owns(x, self.ring.shift(), trb.control) {
            Some(trb)
        } else {
            None
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Marks event processing as halted so that recovery takes over.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
