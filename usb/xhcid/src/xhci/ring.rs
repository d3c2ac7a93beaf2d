use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::dma::{Dma, DmaError, DmaOps};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use smallvec::SmallVec;

use super::trb::{Trb, TRB_CONTROL_CYCLE};

pub const TRB_SIZE: usize = 16;

/// Rings never straddle a 64 KiB boundary. XHC 6.1
const RING_BOUNDARY: usize = 64 * 1024;

/// The cycle bit software writes into the entry with write index `x`.
pub fn producer_cycle(x: u32, shift: u32) -> u32 {
    (!x >> shift) & 1
}

struct Pending {
    td: u64,
    tx: Sender<Trb>,
}

/// Cursors and outstanding requests, guarded by the ring lock.
pub struct RingState {
    pub rp: u32,
    pub wp: u32,
    pending: SmallVec<[Pending; 4]>,
}

impl RingState {
    pub fn outstanding(&self) -> u32 {
        self.wp.wrapping_sub(self.rp)
    }
}

/// Why a [Wait] ended without a completion event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitError {
    TimedOut,
    /// The request was dropped from its ring by a flush or reset.
    Flushed,
}

/// One in-flight request, matched to its completion by the bus address of its TRB.
#[derive(Debug)]
pub struct Wait {
    td: u64,
    rx: Receiver<Trb>,
}

impl Wait {
    pub fn td(&self) -> u64 {
        self.td
    }

    /// Blocks until the completion event arrives. `None` waits until woken.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Trb, WaitError> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => WaitError::TimedOut,
                RecvTimeoutError::Disconnected => WaitError::Flushed,
            }),
            None => self.rx.recv().map_err(|_| WaitError::Flushed),
        }
    }
}

/// A single-segment TRB ring, closed by a link TRB in its last entry.
///
/// `rp` and `wp` count entries forever and are reduced by `mask` only to index the segment;
/// the pass `x >> shift` decides the cycle bit.
pub struct Ring {
    trbs: Dma,
    shift: u32,
    mask: u32,
    /// Doorbell index: 0 for the command ring, the slot id otherwise.
    slot: u8,
    /// Doorbell target: the DCI of the endpoint, 0 for the command ring.
    id: u8,
    stopped: AtomicBool,
    state: Mutex<RingState>,
}

impl Ring {
    pub fn new(ops: &Arc<dyn DmaOps>, shift: u32, slot: u8, id: u8) -> Result<Self, DmaError> {
        let trbs = Dma::new(ops, TRB_SIZE << shift, 64, RING_BOUNDARY)?;
        trbs.flush();
        Ok(Self {
            trbs,
            shift,
            mask: (1 << shift) - 1,
            slot,
            id,
            stopped: AtomicBool::new(false),
            state: Mutex::new(RingState {
                rp: 0,
                wp: 0,
                pending: SmallVec::new(),
            }),
        })
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn base(&self) -> u64 {
        self.trbs.bus_addr()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::SeqCst)
    }

    /// Clears the stopped flag under the ring lock, so that no completion routed by
    /// [Ring::complete_stopped] can race with new work.
    pub fn restart(&self) {
        let _state = self.lock();
        self.set_stopped(false);
    }

    pub fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap()
    }

    /// Bus address of the entry with index `x`.
    pub fn trb_addr(&self, x: u32) -> u64 {
        self.trbs.bus_addr_at(TRB_SIZE * (x & self.mask) as usize)
    }

    /// Reads the entry with index `x` as the device left it.
    pub fn read_trb(&self, x: u32) -> Trb {
        let offset = TRB_SIZE * (x & self.mask) as usize;
        self.trbs.invalidate_range(offset, TRB_SIZE);
        let word = offset / 4;
        Trb::from_words([
            self.trbs.read32(word),
            self.trbs.read32(word + 1),
            self.trbs.read32(word + 2),
            self.trbs.read32(word + 3),
        ])
    }

    /// Writes the entry with index `x`, control word last, with the producer cycle bit for `x`.
    pub(super) fn write_trb(&self, x: u32, trb: Trb) {
        let offset = TRB_SIZE * (x & self.mask) as usize;
        let word = offset / 4;
        let words = trb.words();
        self.trbs.write32(word, words[0]);
        self.trbs.write32(word + 1, words[1]);
        self.trbs.write32(word + 2, words[2]);
        fence(Ordering::SeqCst);
        // The control word carries the cycle bit and hands the entry to the controller.
        self.trbs.write32(
            word + 3,
            (words[3] & !TRB_CONTROL_CYCLE) | producer_cycle(x, self.shift),
        );
        self.trbs.flush_range(offset, TRB_SIZE);
    }

    fn enqueue(&self, trb: Trb, wait: bool) -> (u64, Option<Wait>) {
        let mut state = self.lock();

        let mut x = state.wp;
        state.wp = state.wp.wrapping_add(1);
        if x & self.mask == self.mask {
            self.write_trb(x, Trb::link(self.base()));
            x = state.wp;
            state.wp = state.wp.wrapping_add(1);
        }
        assert!(
            x.wrapping_sub(state.rp) <= self.mask,
            "xhci: ring {}/{} overrun (rp {}, wp {})",
            self.slot,
            self.id,
            state.rp,
            x
        );

        let td = self.trb_addr(x);
        let wait = if wait {
            let (tx, rx) = crossbeam_channel::bounded(1);
            state.pending.push(Pending { td, tx });
            Some(Wait { td, rx })
        } else {
            None
        };
        self.write_trb(x, trb);
        (td, wait)
    }

    /// Appends `trb` without tracking its completion. Returns the bus address of the entry.
    pub fn queue(&self, trb: Trb) -> u64 {
        self.enqueue(trb, false).0
    }

    /// Appends `trb` and registers a [Wait] for its completion before handing it over.
    pub fn queue_wait(&self, trb: Trb) -> Wait {
        match self.enqueue(trb, true) {
            (_, Some(wait)) => wait,
            (td, None) => unreachable!("no wait registered for {:#x}", td),
        }
    }

    /// Wakes every outstanding request with [WaitError::Flushed].
    pub fn flush(&self) {
        self.lock().pending.clear();
    }

    /// Marks the ring stopped and flushes it, as one step.
    pub fn stop_and_flush(&self) {
        let mut state = self.lock();
        self.set_stopped(true);
        state.pending.clear();
    }

    /// Forgets everything outstanding and returns the dequeue pointer (with DCS) at which the
    /// controller should resume.
    pub fn reset(&self) -> u64 {
        let mut state = self.lock();
        state.pending.clear();
        state.rp = state.wp;
        self.trb_addr(state.wp) | u64::from(producer_cycle(state.wp, self.shift))
    }

    /// Drops the request queued at `td`, if it is still outstanding.
    pub fn forget(&self, td: u64) {
        self.lock().pending.retain(|p| p.td != td);
    }

    /// Rewrites the entry at `td` in place, keeping the cycle bit it was handed over with. Only
    /// valid for an entry the controller has not fetched.
    pub fn replace(&self, td: u64, trb: Trb) {
        let _state = self.lock();
        let offset = (td - self.base()) as usize;
        assert!(offset < TRB_SIZE << self.shift && offset % TRB_SIZE == 0);
        let word = offset / 4;
        let cycle = self.trbs.read32(word + 3) & TRB_CONTROL_CYCLE;
        let words = trb.words();
        self.trbs.write32(word, words[0]);
        self.trbs.write32(word + 1, words[1]);
        self.trbs.write32(word + 2, words[2]);
        fence(Ordering::SeqCst);
        self.trbs.write32(word + 3, (words[3] & !TRB_CONTROL_CYCLE) | cycle);
        self.trbs.flush_range(offset, TRB_SIZE);
    }

    /// Routes a completion event to the request whose TRB it names. Returns whether one matched.
    pub fn complete(&self, event: &Trb) -> bool {
        let mut state = self.lock();
        self.route(&mut state, event)
    }

    /// Like [Ring::complete], but only while the ring is stopped. A Command Ring Stopped event
    /// names the first entry the controller has not fetched, which only belongs to a request
    /// while an abort is in progress.
    pub fn complete_stopped(&self, event: &Trb) -> bool {
        let mut state = self.lock();
        self.is_stopped() && self.route(&mut state, event)
    }

    fn route(&self, state: &mut RingState, event: &Trb) -> bool {
        let pa = event.event_trb_pointer();

        let mut x = state.rp;
        while (state.wp.wrapping_sub(x) as i32) > 0 {
            let td = self.trb_addr(x);
            x = x.wrapping_add(1);
            if td == pa {
                state.rp = x;
                break;
            }
        }

        match state.pending.iter().position(|p| p.td == pa) {
            Some(i) => {
                let pending = state.pending.remove(i);
                // The waiter may have given up already.
                let _ = pending.tx.send(*event);
                true
            }
            None => false,
        }
    }

    /// Whether anything was ever queued on the ring.
    pub fn is_used(&self) -> bool {
        self.lock().wp != 0
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}
