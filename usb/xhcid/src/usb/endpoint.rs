use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::UsbDevice;

/// Mask that is ANDed to the attributes of an endpoint descriptor to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointTy {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
}

/// Which directions of an endpoint number are in use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EpMode {
    Read,
    Write,
    ReadWrite,
}

impl EpMode {
    pub fn reads(self) -> bool {
        self != EpMode::Write
    }

    pub fn writes(self) -> bool {
        self != EpMode::Read
    }
}

/// Type-erased per-endpoint driver state.
pub type EndpointAux = Arc<dyn Any + Send + Sync>;

/// One endpoint number of a device, as opened by the USB layer.
pub struct Endpoint {
    pub dev: Arc<UsbDevice>,
    /// Endpoint number, 0 for the default control endpoint.
    pub nb: u8,
    pub ty: EndpointTy,
    pub mode: EpMode,
    maxpkt: AtomicU16,
    /// bInterval, in frames for full and low speed devices and in microframes otherwise.
    pub pollival: u32,
    /// Transactions per microframe, 1 to 3.
    pub ntds: u32,
    /// `None` waits for transfers until they complete.
    pub timeout: Option<Duration>,
    /// Samples per second and bytes per sample of an isochronous stream.
    pub hz: u32,
    pub samplesz: u32,
    /// Set by the USB layer after it cleared a halt on the device side.
    pub clrhalt: AtomicBool,
    aux: Mutex<Option<EndpointAux>>,
}

impl Endpoint {
    pub fn new(dev: Arc<UsbDevice>, nb: u8, ty: EndpointTy, mode: EpMode) -> Self {
        Self {
            dev,
            nb,
            ty,
            mode,
            maxpkt: AtomicU16::new(8),
            pollival: 0,
            ntds: 1,
            timeout: Some(Duration::from_secs(5)),
            hz: 0,
            samplesz: 0,
            clrhalt: AtomicBool::new(false),
            aux: Mutex::new(None),
        }
    }

    /// The default control endpoint of `dev`.
    pub fn control(dev: Arc<UsbDevice>) -> Self {
        Self::new(dev, 0, EndpointTy::Ctrl, EpMode::ReadWrite)
    }

    pub fn with_maxpkt(self, maxpkt: u16) -> Self {
        self.set_maxpkt(maxpkt);
        self
    }

    pub fn with_pollival(mut self, pollival: u32) -> Self {
        self.pollival = pollival;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_iso(mut self, hz: u32, samplesz: u32) -> Self {
        self.hz = hz;
        self.samplesz = samplesz;
        self
    }

    pub fn maxpkt(&self) -> u16 {
        self.maxpkt.load(Ordering::SeqCst)
    }

    /// Updates the packet size, e.g. once the device descriptor reported bMaxPacketSize0.
    pub fn set_maxpkt(&self, maxpkt: u16) {
        self.maxpkt.store(maxpkt, Ordering::SeqCst)
    }

    pub fn aux(&self) -> Option<EndpointAux> {
        self.aux.lock().unwrap().clone()
    }

    pub fn set_aux(&self, aux: Option<EndpointAux>) {
        *self.aux.lock().unwrap() = aux;
    }

    pub fn take_aux(&self) -> Option<EndpointAux> {
        self.aux.lock().unwrap().take()
    }
}
