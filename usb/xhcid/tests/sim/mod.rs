//! A software xHC behind a register window.
//!
//! The controller runs synchronously inside register writes: ringing a doorbell consumes the
//! command or transfer ring right away and posts the completion events on the event ring. Host
//! DMA hands out bus addresses equal to virtual addresses, so the controller reads rings and
//! contexts straight from memory.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::dma::HostDma;
use common::io::RegisterWindow;
use xhcid::driver_interface::{PciFunction, PciIdentity};
use xhcid::usb::{Endpoint, Speed, UsbDevice};
use xhcid::xhci::irq_reactor::IrqReactor;
use xhcid::{ControllerState, Xhci, XhciConfig};

pub const CAPLENGTH: usize = 0x20;
pub const OP: usize = CAPLENGTH;
pub const PORTS: usize = OP + 0x400;
pub const RTS: usize = 0x600;
pub const DB: usize = 0x800;
pub const XECP: usize = 0x1000;
pub const WINDOW: usize = 0x2000;

pub const NSLOTS: u8 = 8;
pub const NPORTS: usize = 4;
pub const NSCRATCH: u32 = 2;
pub const BAR: u64 = 0xfe00_0000;

const USBCMD: usize = OP;
const USBSTS: usize = OP + 0x04;
const PAGESIZE: usize = OP + 0x08;
const CRCR_LO: usize = OP + 0x18;
const CRCR_HI: usize = OP + 0x1C;
const DCBAAP_LO: usize = OP + 0x30;
const DCBAAP_HI: usize = OP + 0x34;
const CONFIG: usize = OP + 0x38;
const MFINDEX: usize = RTS;
const IMAN: usize = RTS + 0x20;
const ERSTBA_LO: usize = RTS + 0x30;
const ERSTBA_HI: usize = RTS + 0x34;

pub const CMD_RS: u32 = 1 << 0;
pub const CMD_HCRST: u32 = 1 << 1;
pub const CMD_INTE: u32 = 1 << 2;
pub const CMD_HSEE: u32 = 1 << 3;
pub const CMD_EWE: u32 = 1 << 10;
pub const STS_HCH: u32 = 1 << 0;
pub const STS_EINT: u32 = 1 << 3;
pub const STS_HCE: u32 = 1 << 12;

pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PED: u32 = 1 << 1;
pub const PORT_PR: u32 = 1 << 4;
pub const PORT_PP: u32 = 1 << 9;
pub const PORT_CSC: u32 = 1 << 17;
pub const PORT_PRC: u32 = 1 << 21;
const PORT_CHANGE_BITS: u32 = 0x7F << 17;

pub const LEGSUP_BIOS: u32 = 1 << 16;
pub const LEGSUP_OS: u32 = 1 << 24;

pub const TRB_NORMAL: u8 = 1;
pub const TRB_SETUP: u8 = 2;
pub const TRB_DATA: u8 = 3;
pub const TRB_STATUS: u8 = 4;
pub const TRB_ISOCH: u8 = 5;
pub const TRB_LINK: u8 = 6;
pub const CMD_ENABLE_SLOT: u8 = 9;
pub const CMD_DISABLE_SLOT: u8 = 10;
pub const CMD_ADDRESS_DEVICE: u8 = 11;
pub const CMD_CONFIGURE_ENDPOINT: u8 = 12;
pub const CMD_EVALUATE_CONTEXT: u8 = 13;
pub const CMD_RESET_ENDPOINT: u8 = 14;
pub const CMD_STOP_ENDPOINT: u8 = 15;
pub const CMD_SET_TR_DEQUEUE: u8 = 16;
pub const CMD_NOOP: u8 = 23;
const EV_TRANSFER: u32 = 32;
const EV_COMMAND: u32 = 33;
const EV_HOST_CONTROLLER: u32 = 37;

pub const CC_SUCCESS: u32 = 1;
pub const CC_TRB_ERROR: u32 = 5;
pub const CC_STALL: u32 = 6;
pub const CC_NO_SLOTS: u32 = 9;
pub const CC_SHORT_PACKET: u32 = 13;
pub const CC_RING_STOPPED: u32 = 24;
pub const CC_ABORTED: u32 = 25;
pub const CC_STOPPED: u32 = 26;

const EP_RUNNING: u32 = 1;
const EP_HALTED: u32 = 2;
const EP_STOPPED: u32 = 3;

const IOC: u32 = 1 << 5;

/// The device descriptor every simulated device answers GET_DESCRIPTOR(DEVICE) with.
pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
];

fn mem_read32(addr: u64) -> u32 {
    unsafe { std::ptr::read_volatile(addr as usize as *const u32) }
}

fn mem_write32(addr: u64, value: u32) {
    unsafe { std::ptr::write_volatile(addr as usize as *mut u32, value) }
}

fn mem_read64(addr: u64) -> u64 {
    u64::from(mem_read32(addr)) | u64::from(mem_read32(addr + 4)) << 32
}

fn mem_read_bytes(addr: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| unsafe { std::ptr::read_volatile((addr as usize + i) as *const u8) })
        .collect()
}

fn mem_write_bytes(addr: u64, data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
        unsafe { std::ptr::write_volatile((addr as usize + i) as *mut u8, *byte) }
    }
}

fn read_trb(addr: u64) -> [u32; 4] {
    [
        mem_read32(addr),
        mem_read32(addr + 4),
        mem_read32(addr + 8),
        mem_read32(addr + 12),
    ]
}

fn trb_data(trb: &[u32; 4]) -> u64 {
    u64::from(trb[0]) | u64::from(trb[1]) << 32
}

fn trb_type(trb: &[u32; 4]) -> u8 {
    ((trb[3] >> 10) & 0x3F) as u8
}

/// A command as the controller saw it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Command {
    pub ty: u8,
    pub slot: u8,
    pub dci: u8,
}

/// An isochronous TD as the controller saw it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsoTd {
    pub len: u32,
    pub frame: u32,
}

#[derive(Clone, Copy, Debug)]
struct Cursor {
    addr: u64,
    ccs: bool,
}

impl Cursor {
    fn from_dequeue(ptr: u64) -> Self {
        Self {
            addr: ptr & !0xF,
            ccs: ptr & 1 != 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SimEndpoint {
    cursor: Cursor,
    /// A TD the controller sits on without completing it.
    hung: Option<u64>,
}

#[derive(Default)]
struct SimSlot {
    output: u64,
    endpoints: HashMap<u8, SimEndpoint>,
    setup: [u8; 8],
}

struct EventProducer {
    base: u64,
    size: u32,
    index: u32,
    pcs: bool,
}

/// Misbehaviours a test can switch on.
#[derive(Clone, Debug, Default)]
pub struct Knobs {
    /// Leave commands on the ring unprocessed.
    pub ignore_commands: bool,
    /// Do nothing when software sets CRCR.CA.
    pub ignore_abort: bool,
    /// On CRCR.CA, stop in front of the next command instead of aborting it.
    pub stop_unfetched: bool,
    /// Stall the next TD on this DCI.
    pub stall: Option<u8>,
    /// Never complete TDs on this DCI.
    pub hang: Option<u8>,
    /// Answer every register read with all ones.
    pub vanished: bool,
    /// Report this slot id for every Enable Slot.
    pub slot_id: Option<u8>,
}

/// Shape of the simulated controller.
#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    /// Context size bit of HCCPARAMS1.
    pub csz: u32,
    pub nslots: u8,
    pub nintrs: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            csz: 0,
            nslots: NSLOTS,
            nintrs: 2,
        }
    }
}

pub struct SimState {
    regs: Vec<u32>,
    initial: Vec<u32>,
    config: SimConfig,
    cr: Option<Cursor>,
    er: Option<EventProducer>,
    slots: HashMap<u8, SimSlot>,
    started: Instant,

    pub knobs: Knobs,
    pub commands: Vec<Command>,
    pub setups: Vec<[u8; 8]>,
    pub iso: Vec<IsoTd>,
    /// Bytes written to OUT endpoints.
    pub sink: Vec<u8>,
    /// Bytes every IN TD returns, truncated to the TD length.
    pub source: Vec<u8>,
    pub resets: usize,
    /// Most commands other than No Op found waiting on the command ring at a doorbell.
    pub max_queued_commands: usize,
    pub port_resets: Vec<usize>,
    /// Set when software wrote back a port's Connect Status Change bit.
    pub csc_cleared: bool,
    pub scratch_pages: Vec<u64>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let mut regs = vec![0u32; WINDOW / 4];
        let mut set = |offset: usize, value: u32| regs[offset / 4] = value;

        set(0x00, CAPLENGTH as u32 | 0x0110 << 16);
        set(
            0x04,
            u32::from(config.nslots) | config.nintrs << 8 | (NPORTS as u32) << 24,
        );
        set(0x08, NSCRATCH << 27);
        set(0x10, 1 | config.csz << 2 | ((XECP / 4) as u32) << 16);
        set(0x14, DB as u32);
        set(0x18, RTS as u32);

        set(USBSTS, STS_HCH);
        set(PAGESIZE, 1);

        // Port 1: high speed device, connect change pending. Port 3: SuperSpeed device in U0.
        set(PORTS, PORT_CCS | PORT_PED | PORT_PP | 3 << 10 | PORT_CSC);
        set(PORTS + 0x10, PORT_PP);
        set(PORTS + 0x20, PORT_CCS | PORT_PED | PORT_PP | 4 << 10);
        set(PORTS + 0x30, PORT_PP | 5 << 5);

        // USB legacy support, owned by the BIOS, with SMIs enabled.
        set(XECP, 1 | 4 << 8 | LEGSUP_BIOS);
        set(XECP + 4, 0xE000_0001);
        // USB 2 on ports 1-2, USB 3 on ports 3-4.
        set(XECP + 0x10, 2 | 4 << 8 | 0x0200 << 16);
        set(XECP + 0x14, u32::from_le_bytes(*b"USB "));
        set(XECP + 0x18, 1 | 2 << 8);
        set(XECP + 0x20, 2 | 0x0300 << 16);
        set(XECP + 0x24, u32::from_le_bytes(*b"USB "));
        set(XECP + 0x28, 3 | 2 << 8);

        Self {
            initial: regs.clone(),
            regs,
            config,
            cr: None,
            er: None,
            slots: HashMap::new(),
            started: Instant::now(),
            knobs: Knobs::default(),
            commands: Vec::new(),
            setups: Vec::new(),
            iso: Vec::new(),
            sink: Vec::new(),
            source: (0..64).collect(),
            resets: 0,
            max_queued_commands: 0,
            port_resets: Vec::new(),
            csc_cleared: false,
            scratch_pages: Vec::new(),
        }
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    pub fn set_reg(&mut self, offset: usize, value: u32) {
        self.regs[offset / 4] = value;
    }

    pub fn commands_of(&self, ty: u8) -> Vec<Command> {
        self.commands.iter().copied().filter(|c| c.ty == ty).collect()
    }

    fn read(&self, offset: usize) -> u32 {
        if self.knobs.vanished {
            return !0;
        }
        match offset {
            MFINDEX => ((self.started.elapsed().as_micros() / 125) as u32) & 0x3FFF,
            _ => self.regs[offset / 4],
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        if self.knobs.vanished {
            return;
        }
        let w = offset / 4;
        match offset {
            USBCMD => {
                if value & CMD_HCRST != 0 {
                    self.reset();
                    return;
                }
                self.regs[w] = value;
                if value & CMD_RS != 0 {
                    self.regs[USBSTS / 4] &= !STS_HCH;
                } else {
                    self.regs[USBSTS / 4] |= STS_HCH;
                }
            }
            USBSTS => {
                let rw1c = (1 << 2) | (1 << 3) | (1 << 4) | (1 << 10);
                self.regs[w] &= !(value & rw1c);
            }
            CRCR_LO => {
                if value & (1 << 2) != 0 {
                    self.abort();
                } else {
                    self.regs[w] = value;
                }
            }
            CRCR_HI => {
                self.regs[w] = value;
                let lo = self.regs[CRCR_LO / 4];
                self.cr = Some(Cursor::from_dequeue(u64::from(value) << 32 | u64::from(lo)));
            }
            DCBAAP_HI => {
                self.regs[w] = value;
                self.load_scratchpad();
            }
            IMAN => {
                let old = self.regs[w];
                self.regs[w] = (old & !(value & 1) & !2) | (value & 2);
            }
            ERSTBA_HI => {
                self.regs[w] = value;
                let erstba = u64::from(value) << 32 | u64::from(self.regs[ERSTBA_LO / 4]);
                self.er = if erstba == 0 {
                    None
                } else {
                    Some(EventProducer {
                        base: mem_read64(erstba),
                        size: mem_read32(erstba + 8),
                        index: 0,
                        pcs: true,
                    })
                };
            }
            XECP => {
                let value = if value & LEGSUP_OS != 0 {
                    value & !LEGSUP_BIOS
                } else {
                    value
                };
                self.regs[w] = value;
            }
            _ if offset >= PORTS && offset < PORTS + NPORTS * 0x10 => {
                if (offset - PORTS) % 0x10 == 0 {
                    self.write_portsc((offset - PORTS) / 0x10, value);
                } else {
                    self.regs[w] = value;
                }
            }
            _ if offset >= DB && offset < DB + 256 * 4 => {
                let target = (offset - DB) / 4;
                if target == 0 {
                    self.run_commands();
                } else {
                    self.run_transfers(target as u8, value as u8);
                }
            }
            _ => self.regs[w] = value,
        }
    }

    fn reset(&mut self) {
        self.regs[OP / 4..XECP / 4].copy_from_slice(&self.initial[OP / 4..XECP / 4]);
        self.cr = None;
        self.er = None;
        self.slots.clear();
        self.resets += 1;
    }

    fn write_portsc(&mut self, port: usize, value: u32) {
        let w = (PORTS + port * 0x10) / 4;
        let cleared = value & PORT_CHANGE_BITS;
        if cleared & PORT_CSC != 0 {
            self.csc_cleared = true;
        }
        let mut psc = self.regs[w] & !cleared;
        if value & PORT_PR != 0 {
            psc |= PORT_PRC | PORT_PED;
            self.port_resets.push(port + 1);
        }
        self.regs[w] = psc;
    }

    fn load_scratchpad(&mut self) {
        let dcbaap = u64::from(self.regs[DCBAAP_HI / 4]) << 32 | u64::from(self.regs[DCBAAP_LO / 4]);
        self.scratch_pages.clear();
        if dcbaap == 0 {
            return;
        }
        let array = mem_read64(dcbaap);
        if array == 0 {
            return;
        }
        self.scratch_pages = (0..u64::from(NSCRATCH))
            .map(|i| mem_read64(array + i * 8))
            .collect();
    }

    fn post(&mut self, data: u64, status: u32, control: u32) {
        let er = match self.er.as_mut() {
            Some(er) => er,
            None => return,
        };
        let addr = er.base + u64::from(er.index) * 16;
        mem_write32(addr, data as u32);
        mem_write32(addr + 4, (data >> 32) as u32);
        mem_write32(addr + 8, status);
        std::sync::atomic::fence(Ordering::SeqCst);
        mem_write32(addr + 12, control | u32::from(er.pcs));
        er.index += 1;
        if er.index == er.size {
            er.index = 0;
            er.pcs = !er.pcs;
        }
        self.regs[IMAN / 4] |= 1;
        self.regs[USBSTS / 4] |= STS_EINT;
    }

    fn post_transfer(&mut self, td: u64, code: u32, residue: u32, slot: u8, dci: u8) {
        self.post(
            td,
            code << 24 | residue,
            u32::from(slot) << 24 | u32::from(dci) << 16 | EV_TRANSFER << 10,
        );
    }

    /// Posts a Host Controller event and flags HCE, as a controller that hit an internal error.
    pub fn host_controller_error(&mut self) {
        self.regs[USBSTS / 4] |= STS_HCE;
        self.post(0, CC_SUCCESS << 24, EV_HOST_CONTROLLER << 10);
    }

    fn dcbaa_entry(&self, slot: u8) -> u64 {
        let dcbaap = u64::from(self.regs[DCBAAP_HI / 4]) << 32 | u64::from(self.regs[DCBAAP_LO / 4]);
        mem_read64(dcbaap + u64::from(slot) * 8)
    }

    fn ctx(&self, base: u64, index: u8) -> u64 {
        base + u64::from(index) * (32u64 << self.config.csz)
    }

    fn copy_ctx(&self, from: u64, to: u64) {
        for w in 0..8 {
            mem_write32(to + w * 4, mem_read32(from + w * 4));
        }
    }

    fn set_ep_state(&self, slot: u8, dci: u8, state: u32) {
        if let Some(s) = self.slots.get(&slot) {
            let ctx = self.ctx(s.output, dci);
            mem_write32(ctx, (mem_read32(ctx) & !7) | state);
        }
    }

    fn ep_state(&self, slot: u8, dci: u8) -> u32 {
        match self.slots.get(&slot) {
            Some(s) => mem_read32(self.ctx(s.output, dci)) & 7,
            None => 0,
        }
    }

    /// Returns the next TRB owned by the controller at `cursor`, following link TRBs.
    fn fetch(cursor: &mut Cursor) -> Option<(u64, [u32; 4])> {
        loop {
            let trb = read_trb(cursor.addr);
            if (trb[3] & 1 != 0) != cursor.ccs {
                return None;
            }
            if trb_type(&trb) == TRB_LINK {
                let toggle = trb[3] & 2 != 0;
                cursor.addr = trb_data(&trb) & !0xF;
                if toggle {
                    cursor.ccs = !cursor.ccs;
                }
                continue;
            }
            return Some((cursor.addr, trb));
        }
    }

    /// Commands other than No Op the controller would run if it started now.
    fn queued_commands(&self) -> usize {
        let mut cursor = match self.cr {
            Some(cursor) => cursor,
            None => return 0,
        };
        let mut count = 0;
        for _ in 0..256 {
            match Self::fetch(&mut cursor) {
                Some((addr, trb)) => {
                    if trb_type(&trb) != CMD_NOOP {
                        count += 1;
                    }
                    cursor.addr = addr + 16;
                }
                None => break,
            }
        }
        count
    }

    fn run_commands(&mut self) {
        self.max_queued_commands = self.max_queued_commands.max(self.queued_commands());
        if self.knobs.ignore_commands {
            return;
        }
        while let Some(mut cursor) = self.cr {
            let (addr, trb) = match Self::fetch(&mut cursor) {
                Some(next) => next,
                None => {
                    self.cr = Some(cursor);
                    break;
                }
            };
            cursor.addr = addr + 16;
            self.cr = Some(cursor);
            let (code, slot) = self.execute(&trb);
            self.post(addr, code << 24, u32::from(slot) << 24 | EV_COMMAND << 10);
        }
    }

    fn abort(&mut self) {
        if self.knobs.ignore_abort {
            return;
        }
        let mut cursor = match self.cr {
            Some(cursor) => cursor,
            None => return,
        };
        if self.knobs.stop_unfetched {
            if let Some((addr, _)) = Self::fetch(&mut cursor) {
                self.post(addr, CC_RING_STOPPED << 24, EV_COMMAND << 10);
            }
            return;
        }
        if let Some((addr, _)) = Self::fetch(&mut cursor) {
            cursor.addr = addr + 16;
            self.cr = Some(cursor);
            self.post(addr, CC_ABORTED << 24, EV_COMMAND << 10);
            self.post(addr + 16, CC_RING_STOPPED << 24, EV_COMMAND << 10);
        }
    }

    fn execute(&mut self, trb: &[u32; 4]) -> (u32, u8) {
        let ty = trb_type(trb);
        let slot = (trb[3] >> 24) as u8;
        let dci = ((trb[3] >> 16) & 0x1F) as u8;
        self.commands.push(Command { ty, slot, dci });
        let data = trb_data(trb);

        match ty {
            CMD_ENABLE_SLOT => {
                if let Some(id) = self.knobs.slot_id {
                    return (CC_SUCCESS, id);
                }
                let nslots = self.config.nslots;
                match (1..=nslots).find(|id| !self.slots.contains_key(id)) {
                    Some(id) => {
                        self.slots.insert(id, SimSlot::default());
                        (CC_SUCCESS, id)
                    }
                    None => (CC_NO_SLOTS, 0),
                }
            }
            CMD_NOOP => (CC_SUCCESS, 0),
            CMD_DISABLE_SLOT => {
                self.slots.remove(&slot);
                (CC_SUCCESS, slot)
            }
            CMD_ADDRESS_DEVICE => (self.address_device(slot, data), slot),
            CMD_CONFIGURE_ENDPOINT => (self.configure_endpoint(slot, data), slot),
            CMD_EVALUATE_CONTEXT => {
                let output = match self.slots.get(&slot) {
                    Some(s) => s.output,
                    None => return (CC_TRB_ERROR, slot),
                };
                if mem_read32(self.ctx(data, 0) + 4) & 2 != 0 {
                    let from = self.ctx(data, 2) + 4;
                    let to = self.ctx(output, 1) + 4;
                    mem_write32(to, (mem_read32(to) & 0xFFFF) | (mem_read32(from) & 0xFFFF_0000));
                }
                (CC_SUCCESS, slot)
            }
            CMD_RESET_ENDPOINT => {
                self.set_ep_state(slot, dci, EP_STOPPED);
                (CC_SUCCESS, slot)
            }
            CMD_STOP_ENDPOINT => {
                let hung = self
                    .slots
                    .get_mut(&slot)
                    .and_then(|s| s.endpoints.get_mut(&dci))
                    .and_then(|ep| ep.hung.take());
                if let Some(td) = hung {
                    self.post_transfer(td, CC_STOPPED, 0, slot, dci);
                }
                self.set_ep_state(slot, dci, EP_STOPPED);
                (CC_SUCCESS, slot)
            }
            CMD_SET_TR_DEQUEUE => {
                match self.slots.get_mut(&slot).and_then(|s| s.endpoints.get_mut(&dci)) {
                    Some(ep) => {
                        ep.cursor = Cursor::from_dequeue(data);
                        ep.hung = None;
                        (CC_SUCCESS, slot)
                    }
                    None => (CC_TRB_ERROR, slot),
                }
            }
            _ => (CC_TRB_ERROR, slot),
        }
    }

    fn address_device(&mut self, slot: u8, input: u64) -> u32 {
        if !self.slots.contains_key(&slot) {
            return CC_TRB_ERROR;
        }
        let output = self.dcbaa_entry(slot);
        if output == 0 {
            return CC_TRB_ERROR;
        }
        self.copy_ctx(self.ctx(input, 1), self.ctx(output, 0));
        mem_write32(self.ctx(output, 0) + 12, u32::from(slot) | 2 << 27);
        self.copy_ctx(self.ctx(input, 2), self.ctx(output, 1));
        let ep0 = self.ctx(output, 1);
        mem_write32(ep0, (mem_read32(ep0) & !7) | EP_RUNNING);
        let dequeue = mem_read64(ep0 + 8);

        if let Some(s) = self.slots.get_mut(&slot) {
            s.output = output;
            s.endpoints.insert(
                1,
                SimEndpoint {
                    cursor: Cursor::from_dequeue(dequeue),
                    hung: None,
                },
            );
        }
        CC_SUCCESS
    }

    fn configure_endpoint(&mut self, slot: u8, input: u64) -> u32 {
        let output = match self.slots.get(&slot) {
            Some(s) if s.output != 0 => s.output,
            _ => return CC_TRB_ERROR,
        };
        let drop = mem_read32(self.ctx(input, 0));
        let add = mem_read32(self.ctx(input, 0) + 4);

        for dci in 2..32u8 {
            if drop & 1 << dci != 0 {
                let ctx = self.ctx(output, dci);
                mem_write32(ctx, mem_read32(ctx) & !7);
                if let Some(s) = self.slots.get_mut(&slot) {
                    s.endpoints.remove(&dci);
                }
            }
            if add & 1 << dci != 0 {
                let ctx = self.ctx(output, dci);
                self.copy_ctx(self.ctx(input, dci + 1), ctx);
                mem_write32(ctx, (mem_read32(ctx) & !7) | EP_RUNNING);
                let dequeue = mem_read64(ctx + 8);
                if let Some(s) = self.slots.get_mut(&slot) {
                    s.endpoints.insert(
                        dci,
                        SimEndpoint {
                            cursor: Cursor::from_dequeue(dequeue),
                            hung: None,
                        },
                    );
                }
            }
        }
        if add & 1 != 0 {
            // context entries and hub bits; the address stays
            let from = self.ctx(input, 1);
            let to = self.ctx(output, 0);
            mem_write32(to, mem_read32(from));
        }
        CC_SUCCESS
    }

    fn run_transfers(&mut self, slot: u8, dci: u8) {
        match self.ep_state(slot, dci) {
            EP_HALTED | 0 => return,
            _ => self.set_ep_state(slot, dci, EP_RUNNING),
        }
        loop {
            let mut ep = match self.slots.get(&slot).and_then(|s| s.endpoints.get(&dci)) {
                Some(ep) => *ep,
                None => return,
            };
            if ep.hung.is_some() {
                return;
            }
            let (addr, trb) = match Self::fetch(&mut ep.cursor) {
                Some(next) => next,
                None => {
                    self.store_endpoint(slot, dci, ep);
                    return;
                }
            };
            if self.knobs.hang == Some(dci) {
                ep.hung = Some(addr);
                self.store_endpoint(slot, dci, ep);
                return;
            }
            ep.cursor.addr = addr + 16;
            self.store_endpoint(slot, dci, ep);

            let ty = trb_type(&trb);
            if self.knobs.stall == Some(dci) && (ty == TRB_NORMAL || ty == TRB_SETUP) {
                self.knobs.stall = None;
                self.set_ep_state(slot, dci, EP_HALTED);
                self.post_transfer(addr, CC_STALL, trb[2] & 0x1FFFF, slot, dci);
                return;
            }

            let len = trb[2] & 0x1FFFF;
            let (code, residue) = match ty {
                TRB_SETUP => {
                    let setup = trb_data(&trb).to_le_bytes();
                    if let Some(s) = self.slots.get_mut(&slot) {
                        s.setup = setup;
                    }
                    self.setups.push(setup);
                    (CC_SUCCESS, 0)
                }
                TRB_DATA => {
                    let input = trb[3] & 1 << 16 != 0;
                    if input {
                        let reply = self.control_reply(slot);
                        let n = reply.len().min(len as usize);
                        mem_write_bytes(trb_data(&trb), &reply[..n]);
                        let residue = len - n as u32;
                        let code = if residue > 0 { CC_SHORT_PACKET } else { CC_SUCCESS };
                        (code, residue)
                    } else {
                        let data = mem_read_bytes(trb_data(&trb), len as usize);
                        self.sink.extend_from_slice(&data);
                        (CC_SUCCESS, 0)
                    }
                }
                TRB_STATUS => (CC_SUCCESS, 0),
                TRB_NORMAL if dci & 1 == 1 => {
                    let n = self.source.len().min(len as usize);
                    let source = self.source[..n].to_vec();
                    mem_write_bytes(trb_data(&trb), &source);
                    let residue = len - n as u32;
                    let code = if residue > 0 { CC_SHORT_PACKET } else { CC_SUCCESS };
                    (code, residue)
                }
                TRB_NORMAL => {
                    let data = mem_read_bytes(trb_data(&trb), len as usize);
                    self.sink.extend_from_slice(&data);
                    (CC_SUCCESS, 0)
                }
                TRB_ISOCH => {
                    self.iso.push(IsoTd {
                        len,
                        frame: (trb[3] >> 20) & 0x7FF,
                    });
                    (CC_SUCCESS, 0)
                }
                _ => (CC_TRB_ERROR, 0),
            };
            if trb[3] & IOC != 0 || code != CC_SUCCESS {
                self.post_transfer(addr, code, residue, slot, dci);
            }
        }
    }

    fn store_endpoint(&mut self, slot: u8, dci: u8, ep: SimEndpoint) {
        if let Some(s) = self.slots.get_mut(&slot) {
            s.endpoints.insert(dci, ep);
        }
    }

    /// The IN data stage of the last setup packet on `slot`.
    fn control_reply(&self, slot: u8) -> Vec<u8> {
        let setup = match self.slots.get(&slot) {
            Some(s) => s.setup,
            None => return Vec::new(),
        };
        match (setup[0], setup[1], setup[3]) {
            // GET_DESCRIPTOR(DEVICE)
            (0x80, 6, 1) => DEVICE_DESCRIPTOR.to_vec(),
            // GET_CONFIGURATION
            (0x80, 8, _) => vec![1],
            _ => Vec::new(),
        }
    }
}

/// The simulated controller, shared between the driver's register window and the test.
pub struct Sim {
    state: Mutex<SimState>,
}

impl Sim {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(config)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
}

impl RegisterWindow for Sim {
    fn read32(&self, offset: usize) -> u32 {
        self.lock().read(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.lock().write(offset, value)
    }

    fn size(&self) -> usize {
        WINDOW
    }
}

/// What the driver did to the PCI function.
#[derive(Default)]
pub struct PciLog {
    pub enabled: AtomicBool,
    pub bus_master: AtomicBool,
    pub interrupt: AtomicBool,
    pub disables: AtomicUsize,
}

pub struct SimFunction {
    pub identity: PciIdentity,
    pub sim: Option<Arc<Sim>>,
    pub log: Arc<PciLog>,
}

impl SimFunction {
    pub fn xhci(sim: Arc<Sim>, bar0: u64) -> Self {
        Self {
            identity: PciIdentity {
                vendor: 0x1b36,
                device: 0x000d,
                class: 0x0C,
                subclass: 0x03,
                interface: 0x30,
                bar0,
                bar0_size: WINDOW,
                irq: 11,
            },
            sim: Some(sim),
            log: Arc::new(PciLog::default()),
        }
    }
}

impl PciFunction for SimFunction {
    fn identity(&self) -> PciIdentity {
        self.identity
    }

    fn enable(&self) {
        self.log.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.log.enabled.store(false, Ordering::SeqCst);
        self.log.disables.fetch_add(1, Ordering::SeqCst);
    }

    fn set_bus_master(&self, enable: bool) {
        self.log.bus_master.store(enable, Ordering::SeqCst);
    }

    fn enable_interrupt(&self) {
        self.log.interrupt.store(true, Ordering::SeqCst);
    }

    fn disable_interrupt(&self) {
        self.log.interrupt.store(false, Ordering::SeqCst);
    }

    fn map_registers(&self) -> Option<Arc<dyn RegisterWindow>> {
        self.sim.clone().map(|sim| sim as Arc<dyn RegisterWindow>)
    }
}

/// Short timeouts so that abort and recovery paths run in milliseconds.
pub fn test_config() -> XhciConfig {
    XhciConfig::from_toml(
        "command_timeout_ms = 200\n\
         abort_grace_ms = 200\n\
         recovery_poll_ms = 5\n\
         quiesce_interval_ms = 5\n\
         port_reset_ms = 1\n\
         irq_poll_interval_ms = 1\n",
    )
    .unwrap()
}

/// A controller on a simulated xHC, with an IRQ reactor polling its event ring.
pub struct Harness {
    pub sim: Arc<Sim>,
    pub pci: Arc<PciLog>,
    pub hci: Arc<Xhci>,
    reactor: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SimConfig::default(), test_config())
    }

    pub fn with(shape: SimConfig, config: XhciConfig) -> Self {
        let sim = Sim::new(shape);
        let function = SimFunction::xhci(sim.clone(), BAR);
        let pci = function.log.clone();
        let hci = Xhci::new(Box::new(function), sim.clone(), HostDma::shared(), config, BAR);
        Self {
            sim,
            pci,
            hci,
            reactor: None,
        }
    }

    /// Initializes the controller and starts polling its events.
    pub fn start(mut self) -> Self {
        self.hci.init().unwrap();
        self.reactor = Some(IrqReactor::new(&self.hci).spawn());
        self
    }

    pub fn sim(&self) -> MutexGuard<'_, SimState> {
        self.sim.lock()
    }

    /// Opens the default control endpoint of a new device on `port`.
    pub fn attach(&self, speed: Speed, port: u8) -> (Arc<UsbDevice>, Endpoint) {
        let dev = Arc::new(UsbDevice::new(speed, port));
        let ep0 = Endpoint::control(dev.clone()).with_timeout(Some(Duration::from_secs(2)));
        self.hci.epopen(&ep0).unwrap();
        (dev, ep0)
    }

    /// Waits until the controller runs again after recovery.
    pub fn wait_running(&self) -> bool {
        wait_for(Duration::from_secs(5), || {
            self.hci.state() == ControllerState::Running && !self.hci.needrecover()
        })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.hci.shutdown();
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
    }
}

pub fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

/// GET_DESCRIPTOR(DEVICE) for `len` bytes.
pub fn get_device_descriptor(len: u16) -> [u8; 8] {
    let len = len.to_le_bytes();
    [0x80, 6, 0, 1, 0, 0, len[0], len[1]]
}
