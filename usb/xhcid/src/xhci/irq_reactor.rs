//! Event ring processing.
//!
//! [Xhci::interrupt] is the interrupt handler: it drains the event ring of interrupter 0 and
//! hands every completion to the request waiting for it. Platforms without a usable interrupt
//! line run an [IrqReactor], which calls the handler from a thread at a fixed interval.
use std::convert::TryFrom;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::io::Io as _;
use log::{debug, error, info, trace, warn};

use super::runtime::{ERDP_EHB, IMAN_IE, IMAN_IP};
use super::trb::{CompletionCode, Trb, TrbCompletionCode, TrbType};
use super::{ControllerState, Runtime, Xhci};

impl Xhci {
    /// Consumes every event the controller produced since the last call.
    pub fn interrupt(&self) {
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(_) => return,
        };
        let mut ir = self.run_regs(&rt).interrupter(0);
        let iman = ir.iman.read();
        if iman & IMAN_IP != 0 {
            ir.iman.write(iman & (IMAN_IP | IMAN_IE));
        }

        let debug = self.debug.load(Ordering::Relaxed);
        let mut state = rt.er.ring.lock();
        loop {
            let x = state.rp;
            let event = match rt.er.next(x) {
                Some(event) => event,
                None => break,
            };
            if debug > 1 {
                debug!("xhci: event {}: {:?}", x, event);
            }

            match TrbType::try_from(event.trb_type()) {
                Ok(TrbType::CommandCompletion)
                    if event.completion_code()
                        == CompletionCode::from(TrbCompletionCode::CommandRingStopped) =>
                {
                    if !rt.cr.complete_stopped(&event) {
                        trace!("xhci: command ring stopped at {:#x}", event.event_trb_pointer());
                    }
                }
                Ok(TrbType::CommandCompletion) => {
                    if !rt.cr.complete(&event) {
                        trace!("xhci: unclaimed command completion {:?}", event);
                    }
                }
                Ok(TrbType::Transfer) => self.complete_transfer(&rt, &event),
                Ok(TrbType::MfindexWrap) => self.mfindex_wrapped(&rt),
                Ok(TrbType::HostController) => {
                    error!(
                        "xhci: host controller error: {} ({:?})",
                        event.completion_code(),
                        event
                    );
                    rt.er.stop();
                    self.wake_recovery();
                    return;
                }
                Ok(TrbType::PortStatusChange) => (),
                Ok(other) => info!("xhci: unhandled event {:?}: {:?}", other, event),
                Err(raw) => warn!("xhci: unknown event type {}: {:?}", raw, event),
            }
            state.rp = x.wrapping_add(1);
        }
        ir.write_erdp(rt.er.erdp(state.rp) | ERDP_EHB);
    }

    fn complete_transfer(&self, rt: &Runtime, event: &Trb) {
        let id = event.event_slot();
        if id == 0 || id > rt.nslots {
            warn!("xhci: transfer event for bad slot {}", id);
            return;
        }
        let slot = match rt.slots.read().unwrap()[usize::from(id)].clone() {
            Some(slot) => slot,
            None => {
                debug!("xhci: transfer event for free slot {}", id);
                return;
            }
        };
        let dci = event.endpoint_id();
        match slot.ring(dci) {
            Some(ring) => {
                if !ring.complete(event) {
                    trace!("xhci: unclaimed transfer event on {}/{}: {:?}", id, dci, event);
                }
            }
            None => debug!("xhci: transfer event for closed ring {}/{}", id, dci),
        }
    }
}

/// Calls [Xhci::interrupt] periodically until the controller is shut down or dropped.
pub struct IrqReactor {
    hci: Weak<Xhci>,
    interval: Duration,
}

impl IrqReactor {
    pub fn new(hci: &Arc<Xhci>) -> Self {
        Self {
            hci: Arc::downgrade(hci),
            interval: hci.config().irq_poll_interval(),
        }
    }

    fn pause(&self) {
        thread::sleep(self.interval);
    }

    pub fn run(self) {
        debug!("Running IRQ reactor in polling mode.");
        loop {
            match self.hci.upgrade() {
                Some(hci) if hci.state() != ControllerState::ShutDown => hci.interrupt(),
                _ => break,
            }
            self.pause();
        }
        debug!("IRQ reactor stopped.");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }
}
