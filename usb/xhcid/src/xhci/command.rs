use std::sync::Arc;
use std::time::Duration;

use common::io::Io;
use log::{debug, error, warn};

use super::operational::{Crcr, OperationalRegs};
use super::ring::{Ring, Wait, WaitError};
use super::trb::{CompletionCode, Trb, TrbCompletionCode};
use super::{Runtime, Xhci};
use crate::error::{Error, Result};

impl Xhci {
    /// Runs one command on the command ring and returns its completion event.
    pub(crate) fn command(&self, rt: &Arc<Runtime>, trb: Trb) -> Result<Trb> {
        let _cmd = self.cmdlock.lock().unwrap();
        if self.needs_recovery(rt) {
            return Err(Error::NeedsReset);
        }
        rt.cr.restart();
        let wait = rt.cr.queue_wait(trb);
        if self.debug.load(std::sync::atomic::Ordering::Relaxed) > 0 {
            debug!("xhci: command {:?} at {:#x}", trb, wait.td());
        }
        let result = self.wait_td(rt, &rt.cr, &wait, Some(self.config.command_timeout()));
        if let Err(Error::Completion(code)) = &result {
            if *code == CompletionCode::from(TrbCompletionCode::CommandRingStopped) {
                // The controller stopped in front of the command and would run it on restart.
                debug!("xhci: command at {:#x} was not fetched, cancelling", wait.td());
                rt.cr.replace(wait.td(), Trb::noop_command());
            }
        }
        result
    }

    /// Rings the doorbell for `ring` and waits for the completion of the request behind `wait`.
    ///
    /// A request that does not complete in time is aborted: the command ring through CRCR.CA, a
    /// transfer ring with Stop Endpoint. If the abort does not complete either, the event ring is
    /// declared stopped and the request waits for recovery to flush it.
    pub(crate) fn wait_td(
        &self,
        rt: &Arc<Runtime>,
        ring: &Ring,
        wait: &Wait,
        timeout: Option<Duration>,
    ) -> Result<Trb> {
        self.ring_doorbell(rt, ring);
        let result = self.wait_completion(rt, ring, wait, timeout);
        if result.is_err() {
            ring.forget(wait.td());
        }
        result
    }

    fn wait_completion(
        &self,
        rt: &Arc<Runtime>,
        ring: &Ring,
        wait: &Wait,
        mut timeout: Option<Duration>,
    ) -> Result<Trb> {
        let mut escalated = false;
        loop {
            match wait.wait(timeout) {
                Ok(event) => return check_completion(event),
                Err(WaitError::Flushed) if escalated => return Err(Error::TimedOut),
                Err(WaitError::Flushed) => return Err(Error::NeedsReset),
                Err(WaitError::TimedOut) if ring.is_stopped() => {
                    error!(
                        "xhci: abort of ring {}/{} did not complete, stopping event processing",
                        ring.slot(),
                        ring.id()
                    );
                    rt.er.stop();
                    self.wake_recovery();
                    if !self.recovery_available() {
                        return Err(Error::TimedOut);
                    }
                    escalated = true;
                    timeout = None;
                }
                Err(WaitError::TimedOut) => {
                    // before the abort, so that its completion finds the ring stopped
                    ring.set_stopped(true);
                    if std::ptr::eq(ring, &rt.cr) {
                        warn!("xhci: command at {:#x} timed out, aborting", wait.td());
                        let mut op = OperationalRegs::new(&*self.regs, rt.op_base);
                        let crcr = op.crcr_low.read();
                        op.crcr_low.write(crcr | Crcr::CA.bits());
                    } else {
                        warn!(
                            "xhci: transfer at {:#x} on ring {}/{} timed out, stopping endpoint",
                            wait.td(),
                            ring.slot(),
                            ring.id()
                        );
                        if let Err(err) =
                            self.command(rt, Trb::stop_endpoint(ring.slot(), ring.id()))
                        {
                            debug!("xhci: stop endpoint after timeout: {}", err);
                        }
                    }
                    timeout = Some(self.config.abort_grace());
                }
            }
        }
    }
}

/// Maps a completion event to the caller's result. Short packets count as success.
fn check_completion(event: Trb) -> Result<Trb> {
    let code = event.completion_code();
    if code.is_success() {
        Ok(event)
    } else {
        Err(Error::Completion(code))
    }
}
