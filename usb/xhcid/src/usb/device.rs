use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// A USB Device Descriptor. USB32 9.6.1
///
/// USB32 Table 9-11 describes the USB packet offsets of the fields described by this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// bLength
    pub length: u8,
    /// bDescriptorType, see [super::DescriptorKind]
    pub kind: u8,
    /// bcdUSB. USB 2.1 would be encoded as 210H, 3.2 would be 320H.
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// bMaxPacketSize0, the maximum packet size for endpoint 0.
    ///
    /// For SuperSpeed devices this is an exponent of two.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    /// Reinterprets the data stage of a GET_DESCRIPTOR(DEVICE) request.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        plain::from_bytes::<Self>(bytes).ok().copied()
    }
}

/// Bus speed of a device, as negotiated on its port.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Speed {
    Full,
    Low,
    High,
    Super,
}

impl Speed {
    /// The default protocol speed ID an xHC uses for this speed. XHC 7.2.2.1.1
    pub fn xhci_id(self) -> u8 {
        match self {
            Speed::Full => 1,
            Speed::Low => 2,
            Speed::High => 3,
            Speed::Super => 4,
        }
    }

    pub fn is_below_high(self) -> bool {
        matches!(self, Speed::Full | Speed::Low)
    }
}

/// Per-device state a host controller driver hangs off a [UsbDevice].
pub trait DeviceAux: Send + Sync {
    /// Releases the controller resources of the device. Called once, when the device goes away.
    fn free(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A device as the USB layer describes it to the host controller driver.
pub struct UsbDevice {
    pub speed: Speed,
    /// Route string of hub ports below the root port, four bits per tier. USB32 8.9
    pub routestr: u32,
    /// 1-based root hub port the device is reached through.
    pub rootport: u8,
    /// Address of the hub the device is attached to, 0 for devices on a root port.
    pub hub: u8,
    /// Port on that hub.
    pub port: u8,
    pub ishub: bool,
    /// The root hub of a controller, which has no slot.
    pub isroot: bool,
    addr: AtomicU8,
    aux: Mutex<Option<Arc<dyn DeviceAux>>>,
}

impl UsbDevice {
    pub fn new(speed: Speed, rootport: u8) -> Self {
        Self {
            speed,
            routestr: 0,
            rootport,
            hub: 0,
            port: 0,
            ishub: false,
            isroot: false,
            addr: AtomicU8::new(0),
            aux: Mutex::new(None),
        }
    }

    pub fn root() -> Self {
        Self {
            isroot: true,
            ..Self::new(Speed::High, 0)
        }
    }

    /// Places the device on `port` of the hub with address `hub`.
    pub fn behind(mut self, hub: u8, port: u8, routestr: u32) -> Self {
        self.hub = hub;
        self.port = port;
        self.routestr = routestr;
        self
    }

    pub fn as_hub(mut self) -> Self {
        self.ishub = true;
        self
    }

    pub fn addr(&self) -> u8 {
        self.addr.load(Ordering::SeqCst)
    }

    pub fn set_addr(&self, addr: u8) {
        self.addr.store(addr, Ordering::SeqCst)
    }

    pub fn aux(&self) -> Option<Arc<dyn DeviceAux>> {
        self.aux.lock().unwrap().clone()
    }

    pub fn set_aux(&self, aux: Option<Arc<dyn DeviceAux>>) {
        *self.aux.lock().unwrap() = aux;
    }

    /// Detaches the device, releasing whatever the host controller driver kept for it.
    pub fn free(&self) {
        let aux = self.aux.lock().unwrap().take();
        if let Some(aux) = aux {
            aux.free();
        }
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("speed", &self.speed)
            .field("rootport", &self.rootport)
            .field("hub", &self.hub)
            .field("port", &self.port)
            .field("addr", &self.addr())
            .finish()
    }
}
