//! Bringing a halted or failed controller back.
//!
//! One thread per controller sleeps until it is woken or its poll interval passes, and checks
//! whether the controller needs recovery. If so it stops the controller, fails every outstanding
//! request, waits for the USB layer to give up all device slots, and runs init again.
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use super::{ControllerState, Xhci};

impl Xhci {
    pub(crate) fn spawn_recovery(&self) {
        let mut recovery = self.recovery.lock().unwrap();
        if recovery.is_some() {
            return;
        }
        let hci = self.me.clone();
        let wakeups = self.recover_rx.clone();
        *recovery = Some(thread::spawn(move || run(hci, wakeups)));
    }

    /// One recovery pass. Returns whether the controller is running again.
    pub(crate) fn recover(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ControllerState::ShutDown {
                return false;
            }
            *state = ControllerState::Stopped;
        }
        warn!("xhci: controller at {:#x} needs recovery", self.base);
        self.stop_controller();

        self.set_state(ControllerState::Recovering);
        loop {
            let active = self.quiesce();
            if active == 0 {
                break;
            }
            if self.state() == ControllerState::ShutDown {
                return false;
            }
            debug!("xhci: waiting for {} slots to be released", active);
            thread::sleep(self.config.quiesce_interval());
        }

        let _slots = self.slotlock.lock().unwrap();
        let _cmd = self.cmdlock.lock().unwrap();
        if self.state() == ControllerState::ShutDown {
            return false;
        }
        self.release();
        match self.init_inner() {
            Ok(()) => {
                self.set_state(ControllerState::Running);
                info!("xhci: controller at {:#x} recovered", self.base);
                true
            }
            Err(err) => {
                error!("xhci recovery failed: {}", err);
                self.set_state(ControllerState::Failed);
                false
            }
        }
    }
}

fn run(weak: Weak<Xhci>, wakeups: Receiver<()>) {
    loop {
        let hci = match wait_for_trouble(&weak, &wakeups) {
            Some(hci) => hci,
            None => return,
        };
        // A failed controller stays down until the next init.
        hci.recover();
    }
}

/// Sleeps until a running controller needs recovery. Returns `None` once it is shut down or gone.
fn wait_for_trouble(hci: &Weak<Xhci>, wakeups: &Receiver<()>) -> Option<Arc<Xhci>> {
    loop {
        let poll = {
            let hci = hci.upgrade()?;
            match hci.state() {
                ControllerState::ShutDown => return None,
                ControllerState::Running if hci.needrecover() => return Some(hci),
                _ => (),
            }
            hci.config.recovery_poll()
        };
        match wakeups.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}
