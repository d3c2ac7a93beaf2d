//! The eXtensible Host Controller Interface (XHCI) Module
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! The standard can be found [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).
//! The standard is referenced frequently throughout this documentation. The acronyms used for specific
//! documents are specified in the crate-level documentation.
//!
//! Software and controller share three kinds of rings: one command ring, one event ring, and a
//! transfer ring per endpoint direction. Every command and transfer is queued, announced through a
//! doorbell, and waited for; [Xhci::interrupt] routes completion events back to the waiters by TRB
//! address. A background task watches for a halted or failed controller and rebuilds it.
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::dma::DmaOps;
use common::io::{Io, RegisterWindow};
use common::timeout::Timeout;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use crate::config::XhciConfig;
use crate::driver_interface::{HciInfo, PciFunction, PortStatus};
use crate::error::{Error, Result};

mod capability;
mod command;
mod context;
mod doorbell;
mod endpoint;
mod event;
mod extended;
pub mod irq_reactor;
mod operational;
mod port;
mod recovery;
pub mod ring;
mod runtime;
mod slot;
pub mod trb;

pub use self::capability::CapabilityRegs;
pub use self::context::{CONTEXT_32, CONTEXT_64};
pub use self::endpoint::EpIo;
pub use self::slot::{Slot, SlotHandle};

use self::context::{DeviceContextList, ScratchpadBufferArray};
use self::doorbell::Doorbell;
use self::event::EventRing;
use self::extended::{CapabilityId, ExtendedCapabilitiesIter, SupportedProtoCap, UsbLegacySupport};
use self::operational::{OperationalRegs, UsbCmd, UsbSts, OP_CONFIG_MAX_SLOTS_EN_MASK};
use self::port::{Port, PortFlags, PORT_SPEED_HIGH, PORT_SPEED_LOW};
use self::ring::Ring;
use self::runtime::{RuntimeRegs, ERDP_EHB, IMAN_IE, IMAN_IP, MFINDEX_MASK};

/// Where a controller is in its life. `ShutDown` is final.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerState {
    Uninitialized,
    Resetting,
    Running,
    /// Recovery noticed the controller halted and stopped it.
    Stopped,
    /// Recovery is draining requests before it rebuilds the controller.
    Recovering,
    /// Recovery could not bring the controller back.
    Failed,
    ShutDown,
}

/// Protocol of one root hub port, from the Supported Protocol capabilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortProtocol {
    /// Revision in BCD, 0 when no capability covers the port.
    pub revision: u16,
    pub name: [u8; 4],
}

/// Everything that exists only between a successful init and the next release: register
/// offsets, limits, and the memory shared with the controller.
pub struct Runtime {
    op_base: usize,
    db_base: usize,
    rts_base: usize,

    pub(crate) csz: u32,
    pub(crate) pagesize: usize,
    pub(crate) nslots: u8,
    pub(crate) nports: u8,
    pub(crate) nintrs: u16,
    ports: Vec<PortProtocol>,
    superspeed: u64,

    pub(crate) dcbaa: DeviceContextList,
    scratch: Option<ScratchpadBufferArray>,
    pub(crate) cr: Ring,
    pub(crate) er: EventRing,
    /// Slots by slot id; entry 0 is never used.
    pub(crate) slots: RwLock<Vec<Option<Arc<Slot>>>>,
    /// Microframe counter, extended past the 14 bits of MFINDEX by wrap events.
    uframe: AtomicU32,
}

impl Runtime {
    pub fn is_superspeed(&self, port: u8) -> bool {
        port >= 1 && port <= 64 && self.superspeed & (1 << (port - 1)) != 0
    }

    pub fn port_protocol(&self, port: u8) -> Option<PortProtocol> {
        self.ports.get(usize::from(port).checked_sub(1)?).copied()
    }
}

pub struct Xhci {
    me: Weak<Xhci>,
    pci: Box<dyn PciFunction>,
    regs: Arc<dyn RegisterWindow>,
    dma: Arc<dyn DmaOps>,
    config: XhciConfig,
    /// BAR0 base, the "port" the USB layer asks for.
    base: u64,

    state: Mutex<ControllerState>,
    rt: RwLock<Option<Arc<Runtime>>>,
    /// Serializes slot allocation and release, and keeps the slot table steady during recovery.
    slotlock: Mutex<()>,
    /// Serializes use of the command ring: one command is outstanding at a time.
    cmdlock: Mutex<()>,
    debug: AtomicI32,
    active: AtomicBool,

    recover_tx: Sender<()>,
    recover_rx: Receiver<()>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl Xhci {
    pub fn new(
        pci: Box<dyn PciFunction>,
        regs: Arc<dyn RegisterWindow>,
        dma: Arc<dyn DmaOps>,
        config: XhciConfig,
        base: u64,
    ) -> Arc<Self> {
        let (recover_tx, recover_rx) = crossbeam_channel::bounded(1);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pci,
            regs,
            dma,
            config,
            base,
            state: Mutex::new(ControllerState::Uninitialized),
            rt: RwLock::new(None),
            slotlock: Mutex::new(()),
            cmdlock: Mutex::new(()),
            debug: AtomicI32::new(0),
            active: AtomicBool::new(false),
            recover_tx,
            recover_rx,
            recovery: Mutex::new(None),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Claims the controller for a USB layer instance. Returns false if it was already claimed.
    pub(crate) fn claim(&self) -> bool {
        !self.active.swap(true, Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn runtime(&self) -> Result<Arc<Runtime>> {
        self.rt.read().unwrap().clone().ok_or(Error::NeedsReset)
    }

    fn cap(&self) -> CapabilityRegs<'_> {
        CapabilityRegs::new(&*self.regs)
    }

    fn op(&self, rt: &Runtime) -> OperationalRegs<'_> {
        OperationalRegs::new(&*self.regs, rt.op_base)
    }

    fn run_regs(&self, rt: &Runtime) -> RuntimeRegs<'_> {
        RuntimeRegs::new(&*self.regs, rt.rts_base)
    }

    fn port(&self, rt: &Runtime, port: u8) -> Port<'_> {
        Port::new(&*self.regs, self.op(rt).port_offset(usize::from(port)))
    }

    /// Whether `rt` is still the live runtime. Requests holding an older one must not touch the
    /// controller any more.
    fn is_current(&self, rt: &Arc<Runtime>) -> bool {
        self.rt
            .read()
            .unwrap()
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, rt))
    }

    /// Whether the controller or its event ring is in a state normal operation cannot continue
    /// from.
    pub fn needrecover(&self) -> bool {
        match self.runtime() {
            Ok(rt) => self.needs_recovery(&rt),
            Err(_) => true,
        }
    }

    pub(crate) fn needs_recovery(&self, rt: &Arc<Runtime>) -> bool {
        if !self.is_current(rt) || rt.er.is_stopped() {
            return true;
        }
        let sts = UsbSts::from_bits_truncate(self.op(rt).usb_sts.read());
        sts.intersects(UsbSts::HCH | UsbSts::HCE | UsbSts::HSE)
    }

    pub(crate) fn wake_recovery(&self) {
        // A wakeup already pending is as good as a new one.
        let _ = self.recover_tx.try_send(());
    }

    /// Whether a stuck request may count on recovery to flush it.
    pub(crate) fn recovery_available(&self) -> bool {
        let state = self.state();
        state != ControllerState::Failed
            && state != ControllerState::ShutDown
            && self.recovery.lock().unwrap().is_some()
    }

    pub(crate) fn ring_doorbell(&self, rt: &Runtime, ring: &Ring) {
        std::sync::atomic::fence(Ordering::SeqCst);
        Doorbell::new(&*self.regs, rt.db_base, ring.slot()).write(u32::from(ring.id()));
    }

    /// Brings the controller up from reset and starts the recovery task.
    pub fn init(&self) -> Result<()> {
        match self.state() {
            ControllerState::Running => return Ok(()),
            ControllerState::ShutDown => return Err(Error::NeedsReset),
            _ => (),
        }
        self.set_state(ControllerState::Resetting);

        match self.init_inner() {
            Ok(()) => {
                self.set_state(ControllerState::Running);
                self.spawn_recovery();
                Ok(())
            }
            Err(err) => {
                warn!("xhci: init failed: {}", err);
                self.set_state(ControllerState::Uninitialized);
                Err(err)
            }
        }
    }

    pub(crate) fn init_inner(&self) -> Result<()> {
        self.pci.enable();
        let cap = self.cap();
        if cap.vanished() {
            self.pci.disable();
            return Err(Error::ControllerVanished);
        }

        let op_base = cap.caplength();
        let db_base = cap.db_offset();
        let rts_base = cap.rts_offset();
        let xecp = cap.ext_caps_ptr_in_dwords();
        debug!(
            "xhci: version {:#x}, op {:#x}, doorbells {:#x}, runtime {:#x}",
            cap.hci_ver(),
            op_base,
            db_base,
            rts_base
        );

        self.handoff(xecp);

        let mut op = OperationalRegs::new(&*self.regs, op_base);
        if !Timeout::from_secs(1).wait_until(|| !op.usb_sts.readf(UsbSts::CNR.bits())) {
            warn!("xhci: controller not ready after 1s");
        }

        debug!("xhci: resetting");
        op.usb_cmd.write(UsbCmd::HCRST.bits());
        thread::sleep(Duration::from_millis(1));
        let halted = || {
            let sts = op.usb_sts.read() & (UsbSts::CNR | UsbSts::HCH).bits();
            sts == UsbSts::HCH.bits()
        };
        if !Timeout::from_secs(1).wait_until(halted) {
            warn!("xhci: reset did not complete, USBSTS {:#x}", op.usb_sts.read());
        }

        self.pci.set_bus_master(true);
        self.pci.enable_interrupt();

        let rt = match self.setup(op_base, db_base, rts_base, xecp) {
            Ok(rt) => rt,
            Err(err) => {
                self.stop_controller();
                self.release();
                return Err(err);
            }
        };
        info!(
            "xhci: {} slots, {} ports ({:#x} superspeed), {} interrupters, {} scratchpad pages, {}-byte contexts",
            rt.nslots,
            rt.nports,
            rt.superspeed,
            rt.nintrs,
            rt.scratch.as_ref().map_or(0, |s| s.len()),
            32 << rt.csz
        );
        *self.rt.write().unwrap() = Some(Arc::new(rt));

        let sts = op.usb_sts.read();
        op.usb_sts
            .write(sts & (UsbSts::HSE | UsbSts::EINT | UsbSts::PCD | UsbSts::SRE).bits());
        std::sync::atomic::fence(Ordering::SeqCst);

        op.usb_cmd
            .write((UsbCmd::RS | UsbCmd::INTE | UsbCmd::HSEE | UsbCmd::EWE).bits());
        let running = || op.usb_sts.read() & (UsbSts::CNR | UsbSts::HCH).bits() == 0;
        if !Timeout::from_secs(1).wait_until(running) {
            warn!("xhci: controller did not start, USBSTS {:#x}", op.usb_sts.read());
        }
        Ok(())
    }

    fn handoff(&self, xecp: u16) {
        let legacy = ExtendedCapabilitiesIter::new(&*self.regs, xecp)
            .find(|&(_, id)| id == CapabilityId::UsbLegacySupport as u8);
        if let Some((offset, _)) = legacy {
            UsbLegacySupport::new(&*self.regs, offset).handoff(!self.config.noxhcihandoff);
        }
    }

    /// Reads the limits, allocates the shared structures and programs their registers.
    fn setup(&self, op_base: usize, db_base: usize, rts_base: usize, xecp: u16) -> Result<Runtime> {
        let cap = self.cap();
        let mut op = OperationalRegs::new(&*self.regs, op_base);

        let csz = cap.csz();
        let pagesize = ((op.page_size.read() & 0xFFFF) as usize) << 12;
        let nscratch = cap.max_scratchpad_bufs();
        let nintrs = cap.max_interrupters();
        let nslots = cap.max_slots();
        let nports = cap.max_ports();

        let mut ports = vec![PortProtocol::default(); usize::from(nports)];
        let mut superspeed = 0u64;
        for (offset, id) in ExtendedCapabilitiesIter::new(&*self.regs, xecp) {
            if id != CapabilityId::SupportedProtocol as u8 {
                continue;
            }
            let proto = SupportedProtoCap::read(&*self.regs, offset);
            let first = usize::from(proto.compat_port_offset());
            for i in first..first + usize::from(proto.compat_port_count()) {
                if i < 1 || i > ports.len() {
                    break;
                }
                ports[i - 1] = PortProtocol {
                    revision: proto.revision(),
                    name: proto.name(),
                };
                if proto.is_usb3() && i <= 64 {
                    superspeed |= 1 << (i - 1);
                }
            }
        }

        let dcbaa = DeviceContextList::new(&self.dma, nslots, pagesize)?;
        let scratch = if nscratch != 0 {
            let scratch = ScratchpadBufferArray::new(&self.dma, nscratch, pagesize)?;
            dcbaa.set(0, scratch.register());
            Some(scratch)
        } else {
            None
        };

        let config = op.config.read();
        op.config
            .write((config & !OP_CONFIG_MAX_SLOTS_EN_MASK) | u32::from(nslots));
        debug!("xhci: DCBAAP {:#x}", dcbaa.dcbaap());
        op.write_dcbaap(dcbaa.dcbaap());

        let cr = Ring::new(&self.dma, 8, 0, 0)?;
        let crcr = cr.reset();
        debug!("xhci: CRCR {:#x}", crcr);
        op.write_crcr(crcr);

        let er = EventRing::new(&self.dma)?;
        let run = RuntimeRegs::new(&*self.regs, rts_base);
        for i in 0..usize::from(nintrs) {
            let mut ir = run.interrupter(i);
            if i > 0 {
                ir.erstsz.write(0);
                ir.iman.write(IMAN_IP);
                ir.imod.write(0);
                ir.write_erstba(0);
                ir.write_erdp(0);
                continue;
            }
            ir.erstsz.write(1);
            ir.iman.write(IMAN_IP | IMAN_IE);
            ir.imod.write(0);
            ir.write_erstba(er.erstba());
            ir.write_erdp(er.erdp(0) | ERDP_EHB);
        }

        Ok(Runtime {
            op_base,
            db_base,
            rts_base,
            csz,
            pagesize,
            nslots,
            nports,
            nintrs,
            ports,
            superspeed,
            dcbaa,
            scratch,
            cr,
            er,
            slots: RwLock::new(vec![None; usize::from(nslots) + 1]),
            uframe: AtomicU32::new(0),
        })
    }

    /// Halts the controller and takes its interrupt and PCI resources away. Safe on a controller
    /// that is already stopped or never ran.
    pub(crate) fn stop_controller(&self) {
        let cap = self.cap();
        if !cap.vanished() {
            let mut op = OperationalRegs::new(&*self.regs, cap.caplength());
            op.usb_cmd.write(0);
            let timeout = Timeout::from_millis(100);
            if !timeout.wait_until(|| op.usb_sts.readf(UsbSts::HCH.bits())) {
                warn!("xhci: controller did not halt");
            }
        }
        self.pci.disable_interrupt();
        self.pci.disable();
    }

    /// Drops every ring, context array and scratchpad page. Requests still holding the old
    /// runtime keep its memory alive until they return.
    pub(crate) fn release(&self) {
        if self.rt.write().unwrap().take().is_some() {
            debug!("xhci: released controller memory");
        }
    }

    /// Halts the controller for good, failing everything still outstanding.
    pub fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, ControllerState::ShutDown)
        };
        self.stop_controller();
        self.quiesce();
        self.release();
        self.wake_recovery();
        if previous != ControllerState::ShutDown {
            info!("xhci: controller at {:#x} shut down", self.base);
        }
    }

    /// Marks every ring stopped and fails every outstanding request on it. Returns the number of
    /// slots still in the table.
    pub(crate) fn quiesce(&self) -> usize {
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(_) => return 0,
        };
        rt.cr.stop_and_flush();

        let _slots = self.slotlock.lock().unwrap();
        let slots = rt.slots.read().unwrap();
        let mut active = 0;
        for slot in slots.iter().flatten() {
            active += 1;
            slot.stop_and_flush_rings();
        }
        active
    }

    /// Current microframe number.
    pub(crate) fn uframe(&self, rt: &Runtime) -> u32 {
        let cached = rt.uframe.load(Ordering::SeqCst);
        let mfindex = self.run_regs(rt).mfindex.read() & MFINDEX_MASK;
        let uframe = mfindex | (cached & !MFINDEX_MASK);
        if (uframe.wrapping_sub(cached) as i32) < 0 {
            // wrapped, but the wrap event is not processed yet
            uframe.wrapping_add(MFINDEX_MASK + 1)
        } else {
            uframe
        }
    }

    fn mfindex_wrapped(&self, rt: &Runtime) {
        let mfindex = self.run_regs(rt).mfindex.read() & MFINDEX_MASK;
        let cached = rt.uframe.load(Ordering::SeqCst);
        rt.uframe.store(
            mfindex | (cached.wrapping_add(MFINDEX_MASK + 1) & !MFINDEX_MASK),
            Ordering::SeqCst,
        );
    }

    pub fn portstatus(&self, port: u8) -> PortStatus {
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(_) => return PortStatus::empty(),
        };
        if self.needs_recovery(&rt) || port < 1 || port > rt.nports {
            return PortStatus::empty();
        }

        let psc = self.port(&rt, port).read();
        let flags = PortFlags::from_bits_truncate(psc);
        let mut ps = PortStatus::empty();
        ps.set(PortStatus::PRESENT, flags.contains(PortFlags::CCS));
        ps.set(PortStatus::ENABLE, flags.contains(PortFlags::PED));
        ps.set(PortStatus::OVERCURRENT, flags.contains(PortFlags::OCA));
        ps.set(PortStatus::RESET, flags.contains(PortFlags::PR));

        if rt.is_superspeed(port) {
            ps |= PortStatus::from_bits_truncate(psc & (PortFlags::PLS | PortFlags::PP).bits());
            ps.set(PortStatus::STATUSCHG, flags.contains(PortFlags::CSC));
            ps.set(PortStatus::OVERCURRENT_CHANGE, flags.contains(PortFlags::OCC));
            ps.set(PortStatus::CHANGE, flags.contains(PortFlags::PRC));
            ps.set(PortStatus::WARM_RESET_CHANGE, flags.contains(PortFlags::WRC));
            ps.set(PortStatus::LINK_STATE_CHANGE, flags.contains(PortFlags::PLC));
            ps.set(PortStatus::CONFIG_ERROR_CHANGE, flags.contains(PortFlags::CEC));
        } else {
            if !ps.contains(PortStatus::RESET) {
                match ((psc >> 10) & 0xF) as u8 {
                    PORT_SPEED_LOW => ps |= PortStatus::SLOW,
                    PORT_SPEED_HIGH => ps |= PortStatus::HIGH,
                    _ => (),
                }
            }
            ps.set(PortStatus::POWER, flags.contains(PortFlags::PP));
            ps.set(PortStatus::STATUSCHG, flags.contains(PortFlags::CSC));
            ps.set(PortStatus::CHANGE, flags.contains(PortFlags::PRC));
        }
        ps
    }

    /// Starts a reset of the 1-based root hub `port` and gives it time to settle.
    pub fn portreset(&self, port: u8, on: bool) -> Result<()> {
        let rt = match self.runtime() {
            Ok(rt) => rt,
            Err(_) => return Ok(()),
        };
        if self.needs_recovery(&rt) || port < 1 || port > rt.nports {
            return Ok(());
        }
        if on {
            debug!("xhci: resetting port {}", port);
            self.port(&rt, port).set_pr();
            thread::sleep(self.config.port_reset());
        }
        Ok(())
    }

    pub fn debug(&self, level: i32) {
        self.debug.store(level, Ordering::SeqCst);
    }

    pub fn info(&self) -> HciInfo {
        match self.runtime() {
            Ok(rt) => HciInfo {
                nports: rt.nports,
                highspeed: true,
                superspeed: rt.superspeed,
            },
            Err(_) => HciInfo::default(),
        }
    }
}
