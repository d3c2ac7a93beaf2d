//! The surface the USB layer drives host controllers through, and the discovery of xHCI
//! functions on the PCI bus.
use std::fmt;
use std::sync::Arc;

use common::dma::DmaOps;
use common::io::RegisterWindow;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::XhciConfig;
use crate::error::Result;
use crate::usb::Endpoint;
use crate::xhci::Xhci;

/// PCI class triplet of an xHCI controller: serial bus, USB, xHCI.
pub const PCI_CLASS_SERIAL_BUS: u8 = 0x0C;
pub const PCI_SUBCLASS_USB: u8 = 0x03;
pub const PCI_INTERFACE_XHCI: u8 = 0x30;

bitflags! {
    /// Root hub port status, in the layout of a USB 2.0 hub's wPortStatus and wPortChange.
    ///
    /// SuperSpeed ports report their link state and power bits raw from PORTSC instead of the
    /// speed bits. USB2 11.24.2.7, USB32 10.16.2.6
    pub struct PortStatus: u32 {
        const PRESENT = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVERCURRENT = 1 << 3;
        const RESET = 1 << 4;
        const LINK_STATE = 0xF << 5;
        const POWER = 1 << 8;
        const SLOW = 1 << 9;
        /// PORTSC.PP of a SuperSpeed port.
        const SUPERSPEED_POWER = 1 << 9;
        const HIGH = 1 << 10;
        /// Connect status change.
        const STATUSCHG = 1 << 16;
        const OVERCURRENT_CHANGE = 1 << 19;
        /// Reset change.
        const CHANGE = 1 << 20;
        const WARM_RESET_CHANGE = 1 << 21;
        const LINK_STATE_CHANGE = 1 << 22;
        const CONFIG_ERROR_CHANGE = 1 << 23;
    }
}

/// What the USB layer learns about a controller once it is initialized.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HciInfo {
    pub nports: u8,
    pub highspeed: bool,
    /// Bit `n - 1` is set for every SuperSpeed root hub port `n`.
    pub superspeed: u64,
}

/// The operations of a USB host controller driver.
pub trait HostController: Send + Sync {
    /// Brings the controller up. Calling it on a running controller does nothing.
    fn init(&self) -> Result<()>;
    /// Halts the controller for good.
    fn shutdown(&self);
    /// Processes pending events. Called from the interrupt handler or a polling loop.
    fn interrupt(&self);

    fn epopen(&self, ep: &Endpoint) -> Result<()>;
    fn epclose(&self, ep: &Endpoint) -> Result<()>;
    /// Reads from an IN endpoint, or the data stage of the last control transfer.
    fn epread(&self, ep: &Endpoint, buf: &mut [u8]) -> Result<usize>;
    /// Writes to an OUT endpoint. On a control endpoint `buf` is a setup packet followed by the
    /// OUT data stage.
    fn epwrite(&self, ep: &Endpoint, buf: &[u8]) -> Result<usize>;

    fn portstatus(&self, port: u8) -> PortStatus;
    fn portreset(&self, port: u8, on: bool) -> Result<()>;
    fn debug(&self, level: i32);
    fn info(&self) -> HciInfo;
}

impl HostController for Xhci {
    fn init(&self) -> Result<()> {
        Xhci::init(self)
    }

    fn shutdown(&self) {
        Xhci::shutdown(self)
    }

    fn interrupt(&self) {
        Xhci::interrupt(self)
    }

    fn epopen(&self, ep: &Endpoint) -> Result<()> {
        Xhci::epopen(self, ep)
    }

    fn epclose(&self, ep: &Endpoint) -> Result<()> {
        Xhci::epclose(self, ep)
    }

    fn epread(&self, ep: &Endpoint, buf: &mut [u8]) -> Result<usize> {
        Xhci::epread(self, ep, buf)
    }

    fn epwrite(&self, ep: &Endpoint, buf: &[u8]) -> Result<usize> {
        Xhci::epwrite(self, ep, buf)
    }

    fn portstatus(&self, port: u8) -> PortStatus {
        Xhci::portstatus(self, port)
    }

    fn portreset(&self, port: u8, on: bool) -> Result<()> {
        Xhci::portreset(self, port, on)
    }

    fn debug(&self, level: i32) {
        Xhci::debug(self, level)
    }

    fn info(&self) -> HciInfo {
        Xhci::info(self)
    }
}

/// Configuration space facts about one PCI function.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PciIdentity {
    pub vendor: u16,
    pub device: u16,
    pub class: u8,
    pub subclass: u8,
    pub interface: u8,
    /// Raw BAR0, flag bits included.
    pub bar0: u64,
    pub bar0_size: usize,
    pub irq: u8,
}

impl PciIdentity {
    pub fn is_xhci(&self) -> bool {
        self.class == PCI_CLASS_SERIAL_BUS
            && self.subclass == PCI_SUBCLASS_USB
            && self.interface == PCI_INTERFACE_XHCI
    }

    /// BAR0 without its flag bits.
    pub fn base(&self) -> u64 {
        self.bar0 & !0xF
    }
}

impl fmt::Display for PciIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bar0 {:#x} size {:#x} irq {}",
            self.vendor,
            self.device,
            self.base(),
            self.bar0_size,
            self.irq
        )
    }
}

/// The bus side of a controller: configuration space, interrupt line and register mapping.
pub trait PciFunction: Send + Sync {
    fn identity(&self) -> PciIdentity;
    fn enable(&self);
    fn disable(&self);
    fn set_bus_master(&self, enable: bool);
    fn enable_interrupt(&self);
    fn disable_interrupt(&self);
    /// Maps the register space behind BAR0. `None` if it cannot be mapped.
    fn map_registers(&self) -> Option<Arc<dyn RegisterWindow>>;
}

/// The xHCI controllers found on the bus, handed out to USB layer instances one at a time.
pub struct Registry {
    config: XhciConfig,
    dma: Arc<dyn DmaOps>,
    controllers: Vec<Arc<Xhci>>,
    scanned: bool,
}

impl Registry {
    pub fn new(config: XhciConfig, dma: Arc<dyn DmaOps>) -> Self {
        Self {
            config,
            dma,
            controllers: Vec::new(),
            scanned: false,
        }
    }

    /// Registers every xHCI function among `functions`. Only the first call scans.
    pub fn scan(&mut self, functions: Vec<Box<dyn PciFunction>>) {
        if self.scanned {
            return;
        }
        self.scanned = true;

        for function in functions {
            let id = function.identity();
            if !id.is_xhci() || id.base() == 0 {
                continue;
            }
            info!("xhci: found controller {}", id);
            let regs = match function.map_registers() {
                Some(regs) => regs,
                None => {
                    warn!("xhci: {:#x}: cannot map registers", id.base());
                    continue;
                }
            };
            if self.controllers.len() >= self.config.maxxhci {
                error!("xhci: bug: more than {} controllers", self.config.maxxhci);
                continue;
            }
            self.controllers.push(Xhci::new(
                function,
                regs,
                self.dma.clone(),
                self.config.clone(),
                id.base(),
            ));
        }
    }

    pub fn controllers(&self) -> &[Arc<Xhci>] {
        &self.controllers
    }

    /// Claims the first unclaimed controller, or the one at BAR `port` if it is not 0.
    pub fn reset(&self, port: u64) -> Option<Arc<Xhci>> {
        if self.config.nousbxhci {
            return None;
        }
        self.controllers
            .iter()
            .filter(|hci| !hci.is_active() && (port == 0 || port == hci.base()))
            .find(|hci| hci.claim())
            .cloned()
    }
}
