use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use log::{debug, warn};

use super::context::ContextArea;
use super::ring::Ring;
use super::trb::Trb;
use super::{Runtime, Xhci};
use crate::error::{Error, Result};
use crate::usb::{DeviceAux, UsbDevice};

/// Settings of a slot that Configure Endpoint has to repeat every time.
#[derive(Debug, Default)]
pub struct SlotState {
    /// Highest DCI in use, the Context Entries field of the slot context.
    pub nep: u8,
    pub confval: u8,
    pub iface: u8,
    pub altc: u8,
}

/// A device slot: the contexts the controller keeps for one device, and its transfer rings.
pub struct Slot {
    pub id: u8,
    pub(crate) ibase: ContextArea,
    pub(crate) obase: ContextArea,
    dev: Weak<UsbDevice>,
    /// Guards the input context as well. Held across the commands that consume it.
    state: Mutex<SlotState>,
    /// Transfer rings by DCI - 1.
    rings: RwLock<Vec<Option<Arc<Ring>>>>,
}

impl Slot {
    fn new(id: u8, ibase: ContextArea, obase: ContextArea, dev: &Arc<UsbDevice>) -> Self {
        Self {
            id,
            ibase,
            obase,
            dev: Arc::downgrade(dev),
            state: Mutex::new(SlotState::default()),
            rings: RwLock::new(vec![None; 31]),
        }
    }

    pub fn dev(&self) -> Option<Arc<UsbDevice>> {
        self.dev.upgrade()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap()
    }

    /// The transfer ring of endpoint `dci`, if one is open.
    pub fn ring(&self, dci: u8) -> Option<Arc<Ring>> {
        let index = usize::from(dci).checked_sub(1)?;
        self.rings.read().unwrap().get(index).cloned().flatten()
    }

    pub(crate) fn set_ring(&self, dci: u8, ring: Option<Arc<Ring>>) {
        assert!(dci >= 1 && dci <= 31, "bad endpoint id {}", dci);
        self.rings.write().unwrap()[usize::from(dci) - 1] = ring;
    }

    /// Marks every open ring stopped and fails what is outstanding on it.
    pub(crate) fn stop_and_flush_rings(&self) {
        for ring in self.rings.read().unwrap().iter().flatten() {
            ring.stop_and_flush();
        }
    }

    fn free_rings(&self) {
        for ring in self.rings.write().unwrap().iter_mut() {
            *ring = None;
        }
    }
}

/// What a [UsbDevice] holds on to while it has a slot on this controller.
pub struct SlotHandle {
    pub(crate) xhci: Weak<Xhci>,
    pub(crate) slot: Arc<Slot>,
}

impl SlotHandle {
    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }
}

impl DeviceAux for SlotHandle {
    fn free(&self) {
        match self.xhci.upgrade() {
            Some(xhci) => xhci.freeslot(&self.slot),
            None => self.slot.free_rings(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Xhci {
    /// Enables a slot for `dev` and publishes its output context.
    pub(crate) fn allocslot(&self, dev: &Arc<UsbDevice>) -> Result<Arc<Slot>> {
        let _slots = self.slotlock.lock().unwrap();
        let rt = self.runtime()?;

        let ibase = ContextArea::input(&self.dma, rt.csz, rt.pagesize)?;
        let obase = ContextArea::output(&self.dma, rt.csz, rt.pagesize)?;

        let event = self.command(&rt, Trb::enable_slot())?;
        let id = event.event_slot();

        let mut slots = rt.slots.write().unwrap();
        if id == 0 || id > rt.nslots || slots[usize::from(id)].is_some() {
            warn!("xhci: controller returned bad slot id {}", id);
            return Err(Error::BadSlotId);
        }

        obase.flush();
        rt.dcbaa.set(id, obase.bus_addr());
        let slot = Arc::new(Slot::new(id, ibase, obase, dev));
        slots[usize::from(id)] = Some(slot.clone());
        debug!("xhci: slot {} enabled for {:?}", id, dev);
        Ok(slot)
    }

    /// Disables the slot if it is still in the live slot table, then drops its rings.
    pub(crate) fn freeslot(&self, slot: &Arc<Slot>) {
        {
            let _slots = self.slotlock.lock().unwrap();
            if let Ok(rt) = self.runtime() {
                if is_listed(&rt, slot) {
                    if let Err(err) = self.command(&rt, Trb::disable_slot(slot.id)) {
                        debug!("xhci: disable slot {}: {}", slot.id, err);
                    }
                    slot.obase.invalidate();
                    rt.dcbaa.set(slot.id, 0);
                    rt.slots.write().unwrap()[usize::from(slot.id)] = None;
                    debug!("xhci: slot {} released", slot.id);
                }
            }
        }
        slot.free_rings();
    }

    /// The slot `dev` holds on this controller, if it is one of ours.
    pub(crate) fn device_slot(&self, dev: &Arc<UsbDevice>) -> Option<Arc<Slot>> {
        let aux = dev.aux()?;
        let handle = aux.as_any().downcast_ref::<SlotHandle>()?;
        let owner = handle.slot.dev()?;
        if Weak::ptr_eq(&handle.xhci, &self.me) && Arc::ptr_eq(&owner, dev) {
            Some(handle.slot.clone())
        } else {
            None
        }
    }

    /// Finds the slot of the high speed hub whose transaction translator serves `dev`.
    pub(crate) fn tt_hub(&self, rt: &Arc<Runtime>, slot: &Arc<Slot>, dev: &Arc<UsbDevice>) -> Option<Arc<Slot>> {
        let _slots = self.slotlock.lock().unwrap();
        let slots = rt.slots.read().unwrap();
        for hub in slots.iter().flatten() {
            if Arc::ptr_eq(hub, slot) {
                continue;
            }
            let hub_dev = match hub.dev() {
                Some(hub_dev) => hub_dev,
                None => continue,
            };
            if Arc::ptr_eq(&hub_dev, dev) {
                continue;
            }
            match self.device_slot(&hub_dev) {
                Some(owned) if Arc::ptr_eq(&owned, hub) => (),
                _ => continue,
            }
            if hub_dev.ishub && hub_dev.addr() == dev.hub && hub_dev.rootport == dev.rootport {
                return Some(hub.clone());
            }
        }
        None
    }
}

fn is_listed(rt: &Runtime, slot: &Arc<Slot>) -> bool {
    rt.slots
        .read()
        .unwrap()
        .get(usize::from(slot.id))
        .and_then(Option::as_ref)
        .map_or(false, |listed| Arc::ptr_eq(listed, slot))
}

impl Runtime {
    /// Whether `slot` is still in the slot table, i.e. was not released by recovery.
    pub(crate) fn owns(&self, slot: &Arc<Slot>) -> bool {
        is_listed(self, slot)
    }
}
