mod sim;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::io::RegisterWindow;
use xhcid::usb::{Endpoint, EndpointTy, EpMode, Speed, UsbDevice};
use xhcid::xhci::trb::CompletionCode;
use xhcid::{ControllerState, Error, PortStatus};

use sim::*;

fn new_device(port: u8) -> (Arc<UsbDevice>, Endpoint) {
    let dev = Arc::new(UsbDevice::new(Speed::High, port));
    let ep0 = Endpoint::control(dev.clone()).with_timeout(Some(Duration::from_secs(2)));
    (dev, ep0)
}

#[test]
fn unanswered_command_is_aborted() {
    let h = Harness::new().start();
    h.sim().knobs.ignore_commands = true;

    let (_dev, ep0) = new_device(1);
    let start = Instant::now();
    match h.hci.epopen(&ep0) {
        Err(Error::Completion(code)) => assert_eq!(code, CompletionCode(CC_ABORTED as u8)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.hci.state(), ControllerState::Running);

    // the command ring keeps working after the abort
    h.sim().knobs.ignore_commands = false;
    let (dev, _ep0) = h.attach(Speed::High, 1);
    assert_ne!(dev.addr(), 0);
    assert_eq!(h.sim().resets, 1);
}

#[test]
fn command_stopped_before_it_ran_is_cancelled() {
    let h = Harness::new().start();
    {
        let mut sim = h.sim();
        sim.knobs.ignore_commands = true;
        sim.knobs.stop_unfetched = true;
    }

    let (_dev, ep0) = new_device(1);
    match h.hci.epopen(&ep0) {
        Err(Error::Completion(code)) => assert_eq!(code, CompletionCode(CC_RING_STOPPED as u8)),
        other => panic!("unexpected {:?}", other),
    }
    // no recovery
    assert_eq!(h.hci.state(), ControllerState::Running);
    assert!(!h.hci.needrecover());

    {
        let mut sim = h.sim();
        sim.knobs.ignore_commands = false;
        sim.knobs.stop_unfetched = false;
    }
    let (dev, _ep0) = h.attach(Speed::High, 1);
    assert_ne!(dev.addr(), 0);

    // the stopped Enable Slot runs as a No Op, so only one slot was taken
    let sim = h.sim();
    assert_eq!(sim.commands[0].ty, CMD_NOOP);
    assert_eq!(sim.commands_of(CMD_ENABLE_SLOT).len(), 1);
    assert_eq!(sim.resets, 1);
}

#[test]
fn ignored_abort_escalates_to_recovery() {
    let h = Harness::new().start();
    {
        let mut sim = h.sim();
        sim.knobs.ignore_commands = true;
        sim.knobs.ignore_abort = true;
    }

    let (_dev, ep0) = new_device(1);
    match h.hci.epopen(&ep0) {
        Err(Error::TimedOut) => (),
        other => panic!("unexpected {:?}", other),
    }

    {
        let mut sim = h.sim();
        sim.knobs.ignore_commands = false;
        sim.knobs.ignore_abort = false;
    }
    assert!(h.wait_running());
    assert_eq!(h.sim().resets, 2);

    let (dev, _ep0) = h.attach(Speed::High, 1);
    assert_ne!(dev.addr(), 0);
}

#[test]
fn host_controller_error_waits_for_devices_to_go() {
    let h = Harness::new().start();
    let (dev, _ep0) = h.attach(Speed::High, 1);
    let ep = Endpoint::new(dev.clone(), 1, EndpointTy::Bulk, EpMode::Read).with_maxpkt(512);
    h.hci.epopen(&ep).unwrap();

    h.sim().host_controller_error();
    assert!(wait_for(Duration::from_secs(2), || {
        h.hci.state() == ControllerState::Recovering
    }));

    // nothing new reaches the controller while it recovers
    assert!(matches!(h.hci.epread(&ep, &mut [0; 4]), Err(Error::NeedsReset)));
    let (_other, other_ep0) = new_device(2);
    assert!(matches!(h.hci.epopen(&other_ep0), Err(Error::NeedsReset)));
    assert_eq!(h.hci.portstatus(1), PortStatus::empty());

    // the slot is held until the USB layer lets go of the device
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.hci.state(), ControllerState::Recovering);
    assert_eq!(h.sim().resets, 1);

    dev.free();
    assert!(h.wait_running());
    assert_eq!(h.sim().resets, 2);

    // endpoints of the old controller instance close without touching the new one
    let before = h.sim().commands.len();
    h.hci.epclose(&ep).unwrap();
    assert_eq!(h.sim().commands.len(), before);

    let (fresh, fresh_ep0) = new_device(1);
    h.hci.epopen(&fresh_ep0).unwrap();
    assert_ne!(fresh.addr(), 0);
}

#[test]
fn halted_controller_is_recovered_without_devices() {
    let h = Harness::new().start();
    // somebody cleared Run/Stop behind the driver's back
    h.hci.debug(2);
    h.sim.write32(OP, 0);
    assert!(wait_for(Duration::from_secs(2), || h.sim().resets == 2));
    assert!(h.wait_running());
    let (dev, _ep0) = h.attach(Speed::High, 1);
    assert_ne!(dev.addr(), 0);
}

#[test]
fn outstanding_transfers_fail_when_recovery_starts() {
    let h = Harness::new().start();
    let (dev, _ep0) = h.attach(Speed::High, 1);
    let ep = Arc::new(
        Endpoint::new(dev.clone(), 1, EndpointTy::Bulk, EpMode::Read)
            .with_maxpkt(512)
            .with_timeout(None),
    );
    h.hci.epopen(&ep).unwrap();

    h.sim().knobs.hang = Some(3);
    let reader = {
        let hci = h.hci.clone();
        let ep = ep.clone();
        thread::spawn(move || hci.epread(&ep, &mut [0; 4]))
    };
    thread::sleep(Duration::from_millis(50));
    h.sim().host_controller_error();

    match reader.join().unwrap() {
        Err(Error::NeedsReset) => (),
        other => panic!("unexpected {:?}", other),
    }
    h.sim().knobs.hang = None;
    dev.free();
    assert!(h.wait_running());
}

#[test]
fn recovery_fails_every_waiter() {
    let h = Harness::new().start();
    let mut devices = Vec::new();
    let mut readers = Vec::new();
    for port in 1..=2u8 {
        let (dev, _ep0) = h.attach(Speed::High, port);
        let ep = Arc::new(
            Endpoint::new(dev.clone(), 1, EndpointTy::Bulk, EpMode::Read)
                .with_maxpkt(512)
                .with_timeout(None),
        );
        h.hci.epopen(&ep).unwrap();
        devices.push(dev);
        readers.push((h.hci.clone(), ep));
    }

    {
        let mut sim = h.sim();
        sim.knobs.hang = Some(3);
        sim.knobs.ignore_commands = true;
        sim.knobs.ignore_abort = true;
    }
    let mut waiters: Vec<_> = readers
        .into_iter()
        .map(|(hci, ep)| thread::spawn(move || hci.epread(&ep, &mut [0; 4]).map(|_| ())))
        .collect();
    waiters.push({
        let hci = h.hci.clone();
        thread::spawn(move || {
            let (_dev, ep0) = new_device(4);
            hci.epopen(&ep0)
        })
    });
    thread::sleep(Duration::from_millis(50));
    h.sim().host_controller_error();

    for waiter in waiters {
        match waiter.join().unwrap() {
            Err(Error::NeedsReset) | Err(Error::TimedOut) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    {
        let mut sim = h.sim();
        sim.knobs = Knobs::default();
    }
    for dev in devices {
        dev.free();
    }
    assert!(h.wait_running());
    assert_eq!(h.sim().resets, 2);
    let (dev, _ep0) = h.attach(Speed::High, 1);
    assert_ne!(dev.addr(), 0);
}

#[test]
fn shutdown_during_recovery_ends_it() {
    let h = Harness::new().start();
    let (_dev, _ep0) = h.attach(Speed::High, 1);
    h.sim().host_controller_error();
    assert!(wait_for(Duration::from_secs(2), || {
        h.hci.state() == ControllerState::Recovering
    }));

    h.hci.shutdown();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(h.hci.state(), ControllerState::ShutDown);
    assert_eq!(h.sim().resets, 1);
}
