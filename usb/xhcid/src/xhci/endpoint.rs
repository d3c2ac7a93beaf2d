use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use common::dma::{Dma, DmaOps};
use log::{debug, trace, warn};

use super::context::*;
use super::ring::Ring;
use super::slot::{Slot, SlotHandle};
use super::trb::{TransferKind, Trb, TRB_MAX_LENGTH};
use super::{Runtime, Xhci};
use crate::error::{Error, Result};
use crate::usb::{Endpoint, EndpointTy, Setup, SetupReq, Speed};

const READ: usize = 0;
const WRITE: usize = 1;

/// Rings of non-control endpoints hold 256 entries.
const TRANSFER_RING_SHIFT: u32 = 8;
/// The default control endpoint has one transfer in flight at a time.
const CONTROL_RING_SHIFT: u32 = 4;

/// A SET_ADDRESS request is handled by Address Device, never sent.
const SET_ADDRESS: u8 = SetupReq::SetAddress as u8;

/// An isochronous OUT stream, cut into one TD per service interval.
struct IsoStream {
    /// Next service interval to fill.
    frame: u32,
    /// Microframes per service interval.
    period: u32,
    /// Samples per service interval, 24.8 fixed point.
    incr: u32,
    /// Bytes reserved for each TD in `buf`.
    tdsz: usize,
    /// Bytes already placed in the TD of `frame`.
    nleft: usize,
    buf: Dma,
}

#[derive(Default)]
struct Direction {
    /// Data stage of the last control IN transfer, and how much of it was read.
    ctl: Vec<u8>,
    ctl_pos: usize,
    iso: Option<IsoStream>,
}

/// The per-endpoint state the driver hangs off an opened [Endpoint].
pub struct EpIo {
    slot: Arc<Slot>,
    rings: [Option<Arc<Ring>>; 2],
    /// Serializes transfers per direction. Control transfers use the READ half for both.
    dirs: [Mutex<Direction>; 2],
}

impl EpIo {
    fn new(slot: Arc<Slot>, read: Option<Arc<Ring>>, write: Option<Arc<Ring>>) -> Self {
        Self {
            slot,
            rings: [read, write],
            dirs: [Mutex::new(Direction::default()), Mutex::new(Direction::default())],
        }
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    pub fn read_ring(&self) -> Option<&Arc<Ring>> {
        self.rings[READ].as_ref()
    }

    pub fn write_ring(&self) -> Option<&Arc<Ring>> {
        self.rings[WRITE].as_ref()
    }

    fn ring(&self, dir: usize) -> Result<&Arc<Ring>> {
        self.rings[dir].as_ref().ok_or(Error::NotConfigured)
    }

    fn lock(&self, dir: usize) -> MutexGuard<'_, Direction> {
        self.dirs[dir].lock().unwrap()
    }
}

fn ep_io(ep: &Endpoint) -> Result<Arc<EpIo>> {
    ep.aux()
        .and_then(|aux| aux.downcast::<EpIo>().ok())
        .ok_or(Error::NotConfigured)
}

/// Fills the endpoint context at `index` of `ctx` for `ep` and its transfer ring. XHC 6.2.3
fn init_ep_context(ctx: &ContextArea, index: usize, ring: &Ring, ep: &Endpoint) {
    let (first, last) = if ep.dev.speed.is_below_high() {
        (3, 11)
    } else {
        (0, 15)
    };
    let mut ival = first;
    while ival < last && (1u32 << ival) < ep.pollival {
        ival += 1;
    }
    ctx.write(index, 0, ival << ENDPOINT_CONTEXT_INTERVAL_SHIFT);

    let maxpkt = u32::from(ep.maxpkt());
    let ntds = ep.ntds.max(1);
    // OUT types are 1 to 3, IN types 5 to 7, control is 4 on the odd DCI 1.
    let ty = ep.ty as u32 | (u32::from(ring.id()) & 1) << 2;
    let mut w1 = ty << ENDPOINT_CONTEXT_TYPE_SHIFT
        | (ntds - 1) << ENDPOINT_CONTEXT_MAX_BURST_SHIFT
        | maxpkt << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT;
    if ep.ty != EndpointTy::Isoch {
        w1 |= 3 << ENDPOINT_CONTEXT_CERR_SHIFT;
    }
    ctx.write(index, 1, w1);
    ctx.write64(index, 2, ring.base() | ENDPOINT_CONTEXT_DCS);

    let mut w4 = 2 * maxpkt;
    if ep.ty == EndpointTy::Interrupt || ep.ty == EndpointTy::Isoch {
        w4 |= (maxpkt * ntds) << ENDPOINT_CONTEXT_MAX_ESIT_SHIFT;
    }
    ctx.write(index, 4, w4);
}

fn iso_stream(ring: &Ring, ep: &Endpoint, dma: &Arc<dyn DmaOps>) -> Result<IsoStream> {
    let period = if ep.dev.speed == Speed::Full {
        ep.pollival << 3
    } else {
        ep.pollival
    };
    let incr = ((u64::from(ep.hz) * u64::from(period)) << 8) / 8000;
    let tdsz = ((incr as usize + 255) >> 8) * ep.samplesz as usize;
    if tdsz == 0 {
        return Err(Error::BadLength);
    }
    let buf = Dma::new(dma, (ring.mask() as usize + 1) * tdsz, 64, 0)?;
    debug!(
        "xhci: iso stream on {}/{}: period {} incr {:#x} tdsz {}",
        ring.slot(),
        ring.id(),
        period,
        incr,
        tdsz
    );
    Ok(IsoStream {
        frame: 0,
        period: period.max(1),
        incr: incr as u32,
        tdsz,
        nleft: 0,
        buf,
    })
}

impl Xhci {
    pub fn epopen(&self, ep: &Endpoint) -> Result<()> {
        if ep.dev.isroot {
            return Ok(());
        }
        let rt = self.runtime()?;
        if self.needs_recovery(&rt) {
            return Err(Error::NeedsReset);
        }

        if let Some(slot) = self.device_slot(&ep.dev) {
            if !rt.owns(&slot) {
                return Err(Error::NeedsReset);
            }
            let io = self.initep(&rt, &slot, ep)?;
            ep.set_aux(Some(Arc::new(io)));
            return Ok(());
        }

        // First open of a device: it has to be the default control endpoint.
        if ep.nb != 0 {
            return Err(Error::Unsupported("opening a data endpoint before endpoint 0"));
        }
        let slot = self.allocslot(&ep.dev)?;
        match self.address_device(&rt, &slot, ep) {
            Ok(io) => {
                ep.set_aux(Some(Arc::new(io)));
                ep.dev.set_aux(Some(Arc::new(SlotHandle {
                    xhci: self.me.clone(),
                    slot,
                })));
                Ok(())
            }
            Err(err) => {
                self.freeslot(&slot);
                Err(err)
            }
        }
    }

    /// Builds the slot and control endpoint contexts of a new device and runs Address Device.
    fn address_device(&self, rt: &Arc<Runtime>, slot: &Arc<Slot>, ep: &Endpoint) -> Result<EpIo> {
        let dev = &ep.dev;
        let ring0 = Arc::new(Ring::new(&self.dma, CONTROL_RING_SHIFT, slot.id, 1)?);
        slot.set_ring(1, Some(ring0.clone()));
        let hub = self.tt_hub(rt, slot, dev);

        let mut state = slot.lock();
        state.nep = 1;
        let ib = &slot.ibase;
        ib.zero(INPUT_CONTROL);
        ib.write(INPUT_CONTROL, 1, 3);
        ib.zero(INPUT_SLOT);
        ib.zero(input_ep(1));

        let mut w0 = (dev.routestr & SLOT_CONTEXT_ROUTE_STRING_MASK)
            | u32::from(dev.speed.xhci_id()) << SLOT_CONTEXT_SPEED_SHIFT
            | u32::from(state.nep) << SLOT_CONTEXT_ENTRIES_SHIFT;
        if dev.ishub {
            w0 |= SLOT_CONTEXT_HUB_BIT;
            if dev.speed == Speed::High {
                w0 |= SLOT_CONTEXT_MTT_BIT;
            }
        }
        let mut w2 = 0;
        if let Some(hub) = hub {
            let hub_high = hub.dev().map_or(false, |hub_dev| hub_dev.speed == Speed::High);
            if dev.speed.is_below_high() && hub_high {
                w0 |= SLOT_CONTEXT_MTT_BIT;
                w2 = u32::from(hub.id) | u32::from(dev.port) << SLOT_CONTEXT_TT_PORT_SHIFT;
            }
        }
        ib.write(INPUT_SLOT, 0, w0);
        ib.write(INPUT_SLOT, 1, u32::from(dev.rootport) << SLOT_CONTEXT_ROOT_PORT_SHIFT);
        ib.write(INPUT_SLOT, 2, w2);
        ib.write(INPUT_SLOT, 3, 0);

        init_ep_context(ib, input_ep(1), &ring0, ep);

        ib.flush();
        self.command(rt, Trb::address_device(slot.id, ib.bus_addr()))?;
        slot.obase.invalidate();

        let addr = (slot.obase.read(OUTPUT_SLOT, 3) & SLOT_CONTEXT_ADDRESS_MASK) as u8;
        dev.set_addr(addr);
        debug!("xhci: slot {} has address {}", slot.id, addr);
        drop(state);

        Ok(EpIo::new(slot.clone(), None, Some(ring0)))
    }

    /// Opens the rings of a data endpoint and tells the controller about them.
    fn initep(&self, rt: &Arc<Runtime>, slot: &Arc<Slot>, ep: &Endpoint) -> Result<EpIo> {
        if ep.nb == 0 {
            let ring0 = slot.ring(1).ok_or(Error::NotConfigured)?;
            return Ok(EpIo::new(slot.clone(), None, Some(ring0)));
        }
        if ep.nb > 15 {
            return Err(Error::Unsupported("endpoint numbers above 15"));
        }
        // Without a sample rate and size there is nothing to cut into TDs.
        if ep.ty == EndpointTy::Isoch && (ep.hz == 0 || ep.samplesz == 0) {
            return Err(Error::BadLength);
        }

        let mut state = slot.lock();
        let ib = &slot.ibase;
        ib.zero(INPUT_CONTROL);
        ib.write(INPUT_CONTROL, 1, 1);
        ib.write(
            INPUT_CONTROL,
            7,
            u32::from(state.altc) << 16 | u32::from(state.iface) << 8 | u32::from(state.confval),
        );

        let mut open = |dci: u8| -> Result<Arc<Ring>> {
            let ring = Arc::new(Ring::new(&self.dma, TRANSFER_RING_SHIFT, slot.id, dci)?);
            slot.set_ring(dci, Some(ring.clone()));
            if dci > state.nep {
                state.nep = dci;
            }
            ib.update(INPUT_CONTROL, 1, |w| w | 1 << dci);
            Ok(ring)
        };
        let write = if ep.mode.writes() {
            Some(open(ep.nb * 2)?)
        } else {
            None
        };
        let read = if ep.mode.reads() {
            match open(ep.nb * 2 + 1) {
                Ok(ring) => Some(ring),
                Err(err) => {
                    slot.set_ring(ep.nb * 2, None);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let nep = state.nep;
        let ishub = ep.dev.ishub;
        ib.update(INPUT_SLOT, 0, |w| {
            let w = (w & !SLOT_CONTEXT_ENTRIES_MASK) | u32::from(nep) << SLOT_CONTEXT_ENTRIES_SHIFT;
            if ishub {
                w
            } else {
                w & !SLOT_CONTEXT_MTT_BIT
            }
        });
        for ring in write.iter().chain(read.iter()) {
            let index = input_ep(ring.id());
            for w in 0..5 {
                ib.write(index, w, 0);
            }
            init_ep_context(ib, index, ring, ep);
        }
        if self.debug.load(std::sync::atomic::Ordering::Relaxed) > 0 {
            ib.dump_control();
        }

        ib.flush();
        let result = self.command(rt, Trb::configure_endpoint(slot.id, ib.bus_addr()));
        slot.obase.invalidate();
        drop(state);
        if let Err(err) = result {
            for ring in write.iter().chain(read.iter()) {
                slot.set_ring(ring.id(), None);
            }
            return Err(err);
        }

        let io = EpIo::new(slot.clone(), read, write);
        if ep.ty == EndpointTy::Isoch {
            for dir in [READ, WRITE].iter().copied() {
                if let Some(ring) = &io.rings[dir] {
                    io.lock(dir).iso = Some(iso_stream(ring, ep, &self.dma)?);
                }
            }
        }
        debug!(
            "xhci: slot {} endpoint {} open ({:?} {:?})",
            slot.id, ep.nb, ep.ty, ep.mode
        );
        Ok(io)
    }

    pub fn epclose(&self, ep: &Endpoint) -> Result<()> {
        if ep.dev.isroot {
            return Ok(());
        }
        let io = match ep.take_aux().and_then(|aux| aux.downcast::<EpIo>().ok()) {
            Some(io) => io,
            None => return Ok(()),
        };
        if ep.nb == 0 || io.rings.iter().all(Option::is_none) {
            return Ok(());
        }

        let slot = &io.slot;
        let rt = match self.runtime() {
            Ok(rt) if rt.owns(slot) => rt,
            _ => {
                for ring in io.rings.iter().flatten() {
                    slot.set_ring(ring.id(), None);
                }
                return Ok(());
            }
        };

        let mut state = slot.lock();
        let ib = &slot.ibase;
        ib.zero(INPUT_CONTROL);
        ib.write(INPUT_CONTROL, 1, 1);
        for ring in io.rings.iter().flatten() {
            let dci = ring.id();
            ib.update(INPUT_CONTROL, 0, |w| w | 1 << dci);
            if dci == state.nep {
                state.nep -= 1;
            }
            // Configure Endpoint drops an idle endpoint in any state.
            if !ring.is_used() {
                continue;
            }
            if let Err(err) = self.command(&rt, Trb::stop_endpoint(slot.id, dci)) {
                debug!("xhci: stop endpoint {}/{}: {}", slot.id, dci, err);
            }
        }

        let nep = state.nep;
        ib.update(INPUT_SLOT, 0, |w| {
            (w & !SLOT_CONTEXT_ENTRIES_MASK) | u32::from(nep) << SLOT_CONTEXT_ENTRIES_SHIFT
        });
        ib.zero(input_ep(ep.nb * 2));
        ib.zero(input_ep(ep.nb * 2 + 1));
        ib.flush();
        if let Err(err) = self.command(&rt, Trb::configure_endpoint(slot.id, ib.bus_addr())) {
            warn!("xhci: dropping endpoint {} of slot {}: {}", ep.nb, slot.id, err);
        }
        slot.obase.invalidate();
        drop(state);

        for ring in io.rings.iter().flatten() {
            slot.set_ring(ring.id(), None);
        }
        Ok(())
    }

    /// Gets a transfer ring ready for new work: clears a halt the controller or the USB layer
    /// reported and moves the dequeue pointer past whatever was left on a stopped ring.
    fn unstall(&self, rt: &Arc<Runtime>, slot: &Slot, ring: &Ring, ep: &Endpoint) -> Result<()> {
        let dci = ring.id();
        let ctx = output_ep(dci);
        slot.obase.invalidate_ctx(ctx);
        match EndpointState::from_context(slot.obase.read(ctx, 0)) {
            Some(EndpointState::Halted) | Some(EndpointState::Error) => {
                ep.clrhalt.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            _ => (),
        }

        if ep.clrhalt.swap(false, std::sync::atomic::Ordering::SeqCst) {
            debug!("xhci: resetting endpoint {}/{}", slot.id, dci);
            let result = self.command(rt, Trb::reset_endpoint(slot.id, dci));
            slot.obase.invalidate_ctx(ctx);
            result?;
            ring.set_stopped(true);
        }

        if ring.is_stopped() {
            let dequeue = ring.reset();
            self.command(rt, Trb::set_tr_dequeue_ptr(slot.id, dci, dequeue))?;
            ring.set_stopped(false);
        }

        if ring.lock().outstanding() >= ring.mask() {
            return Err(Error::RingFull);
        }
        Ok(())
    }

    pub fn epread(&self, ep: &Endpoint, buf: &mut [u8]) -> Result<usize> {
        if ep.dev.isroot {
            return Err(Error::Unsupported("reading the root hub"));
        }
        let io = ep_io(ep)?;
        match ep.ty {
            EndpointTy::Ctrl => {
                let mut dir = io.lock(READ);
                let pending = &dir.ctl[dir.ctl_pos..];
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                dir.ctl_pos += n;
                return Ok(n);
            }
            EndpointTy::Isoch => return Err(Error::Unsupported("isochronous input")),
            _ => (),
        }

        let rt = self.runtime()?;
        if self.needs_recovery(&rt) {
            return Err(Error::NeedsReset);
        }
        let ring = io.ring(READ)?;
        let _dir = io.lock(READ);
        self.transfer(&rt, &io.slot, ring, ep, TransferBuf::In(buf))
    }

    pub fn epwrite(&self, ep: &Endpoint, buf: &[u8]) -> Result<usize> {
        if ep.dev.isroot {
            return Err(Error::Unsupported("writing the root hub"));
        }
        let io = ep_io(ep)?;
        match ep.ty {
            EndpointTy::Ctrl => return self.control_transfer(ep, &io, buf),
            EndpointTy::Isoch => return self.isowrite(ep, &io, buf),
            _ => (),
        }

        let rt = self.runtime()?;
        if self.needs_recovery(&rt) {
            return Err(Error::NeedsReset);
        }
        let ring = io.ring(WRITE)?;
        let _dir = io.lock(WRITE);
        self.transfer(&rt, &io.slot, ring, ep, TransferBuf::Out(buf))
    }

    /// One Normal TD through a bounce buffer. Returns the bytes actually moved.
    fn transfer(
        &self,
        rt: &Arc<Runtime>,
        slot: &Slot,
        ring: &Ring,
        ep: &Endpoint,
        buf: TransferBuf<'_>,
    ) -> Result<usize> {
        if buf.len() > TRB_MAX_LENGTH {
            return Err(Error::BadLength);
        }
        let result = self.unstall(rt, slot, ring, ep).and_then(|()| {
            let len = buf.len();
            let dma = Dma::new(&self.dma, len.max(1), 64, 0)?;
            if let TransferBuf::Out(data) = &buf {
                dma.write_bytes(0, data);
            }
            dma.flush();

            let wait = ring.queue_wait(Trb::normal(dma.bus_addr(), len as u32));
            let event = self.wait_td(rt, ring, &wait, ep.timeout)?;
            let done = len.saturating_sub(event.transfer_length() as usize);
            if let TransferBuf::In(data) = buf {
                dma.invalidate_range(0, done);
                dma.read_bytes(0, &mut data[..done]);
            }
            trace!("xhci: {}/{}: {} of {} bytes", slot.id, ring.id(), done, len);
            Ok(done)
        });
        if result.is_err() {
            slot.obase.invalidate_ctx(output_ep(ring.id()));
        }
        result
    }

    /// Runs the control transfer whose setup packet opens `buf`. An OUT data stage follows the
    /// setup packet in `buf`; an IN data stage is kept for the next [Xhci::epread].
    fn control_transfer(&self, ep: &Endpoint, io: &EpIo, buf: &[u8]) -> Result<usize> {
        let setup = Setup::parse(buf).ok_or(Error::Short)?;
        if setup.kind == 0 && setup.request == SET_ADDRESS {
            return Ok(buf.len());
        }
        let rt = self.runtime()?;
        if self.needs_recovery(&rt) {
            return Err(Error::NeedsReset);
        }
        let slot = &io.slot;
        let ring = io.ring(WRITE)?;

        let mut dir = io.lock(READ);
        dir.ctl.clear();
        dir.ctl_pos = 0;

        let len = usize::from(setup.length);
        let input = setup.is_in();
        let data = &buf[8..];
        if !input && data.len() > len {
            return Err(Error::BadLength);
        }
        let stage = if len > 0 {
            let dma = Dma::new(&self.dma, len, 64, 0)?;
            if !input {
                dma.write_bytes(0, data);
            }
            dma.flush();
            Some(dma)
        } else {
            None
        };

        let result = self.run_control(&rt, slot, ring, ep, setup, stage.as_ref());
        match result {
            Ok(residue) => {
                if let (true, Some(dma)) = (input, &stage) {
                    let got = len.saturating_sub(residue);
                    dma.invalidate_range(0, got);
                    dir.ctl.resize(got, 0);
                    dma.read_bytes(0, &mut dir.ctl);
                }
                self.note_setting(slot, &setup);
                Ok(buf.len())
            }
            Err(err) => {
                ring.flush();
                slot.obase.invalidate_ctx(output_ep(ring.id()));
                Err(err)
            }
        }
    }

    /// Queues the stages of one control transfer and returns the residue of the data stage.
    fn run_control(
        &self,
        rt: &Arc<Runtime>,
        slot: &Slot,
        ring: &Ring,
        ep: &Endpoint,
        setup: Setup,
        stage: Option<&Dma>,
    ) -> Result<usize> {
        self.unstall(rt, slot, ring, ep)?;

        // bMaxPacketSize0 is only known once the device descriptor was read.
        let ctx = output_ep(ring.id());
        slot.obase.invalidate_ctx(ctx);
        let maxpkt = slot.obase.read(ctx, 1) >> ENDPOINT_CONTEXT_MAX_PACKET_SHIFT;
        if maxpkt != u32::from(ep.maxpkt()) {
            debug!("xhci: slot {} maxpkt {} -> {}", slot.id, maxpkt, ep.maxpkt());
            let _state = slot.lock();
            let ib = &slot.ibase;
            ib.write(INPUT_CONTROL, 0, 0);
            ib.write(INPUT_CONTROL, 1, 1 << ring.id());
            init_ep_context(ib, input_ep(ring.id()), ring, ep);
            ib.flush();
            self.command(rt, Trb::evaluate_context(slot.id, ib.bus_addr()))?;
            slot.obase.invalidate();
        }

        let input = setup.is_in();
        let len = usize::from(setup.length);
        let kind = match (len, input) {
            (0, _) => TransferKind::NoData,
            (_, true) => TransferKind::In,
            (_, false) => TransferKind::Out,
        };

        let setup_wait = ring.queue_wait(Trb::setup(setup, kind));
        let data_wait = stage.map(|dma| ring.queue_wait(Trb::data(dma.bus_addr(), len as u32, input)));
        let status_wait = ring.queue_wait(Trb::status(len == 0 || !input));

        self.wait_td(rt, ring, &setup_wait, ep.timeout)?;
        let mut residue = 0;
        if let Some(wait) = &data_wait {
            let event = self.wait_td(rt, ring, wait, ep.timeout)?;
            residue = event.transfer_length() as usize;
        }
        self.wait_td(rt, ring, &status_wait, ep.timeout)?;
        Ok(residue)
    }

    /// Remembers the configuration and interface settings Configure Endpoint has to repeat.
    fn note_setting(&self, slot: &Slot, setup: &Setup) {
        let mut state = slot.lock();
        match (setup.kind, setup.request) {
            (0x00, r) if r == SetupReq::SetConfiguration as u8 => {
                state.confval = setup.value as u8;
            }
            (0x01, r) if r == SetupReq::SetInterface as u8 => {
                state.altc = setup.value as u8;
                state.iface = setup.index as u8;
            }
            _ => (),
        }
    }

    /// Streams `buf` to an isochronous OUT endpoint, one TD per service interval, scheduled a
    /// few milliseconds ahead of the controller.
    fn isowrite(&self, ep: &Endpoint, io: &EpIo, buf: &[u8]) -> Result<usize> {
        let ring = io.ring(WRITE)?;
        let mut dir = io.lock(WRITE);
        let iso = dir.iso.as_mut().ok_or(Error::NotConfigured)?;
        let rt = self.runtime()?;
        if self.needs_recovery(&rt) {
            return Err(Error::NeedsReset);
        }
        let period = iso.period;
        let samplesz = ep.samplesz as usize;

        let mut p = buf;
        let mut i = iso.frame;
        loop {
            loop {
                let m = ring.lock().outstanding() as i32;
                if m <= 0 {
                    // restart 10 ms ahead of the controller
                    i = (80 + self.uframe(&rt)) / period;
                }
                if (m as u32) < ring.mask() {
                    break;
                }
                self.ring_doorbell(&rt, ring);
                thread::sleep(Duration::from_millis(5));
                if self.needs_recovery(&rt) {
                    return Err(Error::NeedsReset);
                }
            }

            let m = ((iso.incr + (i.wrapping_mul(iso.incr) & 0xFF)) >> 8) as usize * samplesz;
            let start = (i & ring.mask()) as usize * iso.tdsz;
            let m = m.saturating_sub(iso.nleft);
            let d = start + iso.nleft;
            if p.len() < m {
                iso.buf.write_bytes(d, p);
                iso.nleft += p.len();
                p = &[];
                break;
            }
            iso.buf.write_bytes(d, &p[..m]);
            p = &p[m..];
            let m = m + iso.nleft;
            iso.nleft = 0;
            iso.buf.flush_range(start, m);
            ring.queue(Trb::isoch(
                iso.buf.bus_addr_at(start),
                m as u32,
                i.wrapping_mul(period) / 8,
            ));
            self.ring_doorbell(&rt, ring);
            i = i.wrapping_add(1);
        }
        iso.frame = i;

        loop {
            let state = ring.lock();
            if state.rp == state.wp {
                break;
            }
            drop(state);
            let ahead = (i.wrapping_mul(period).wrapping_sub(self.uframe(&rt)) as i32) / 8;
            if ahead < 5 {
                break;
            }
            self.ring_doorbell(&rt, ring);
            thread::sleep(Duration::from_millis(ahead as u64));
        }
        Ok(buf.len() - p.len())
    }
}

enum TransferBuf<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl TransferBuf<'_> {
    fn len(&self) -> usize {
        match self {
            TransferBuf::In(buf) => buf.len(),
            TransferBuf::Out(buf) => buf.len(),
        }
    }
}
