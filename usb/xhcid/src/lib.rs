//! The eXtensible Host Controller Interface (XHCI) driver core
//!
//! This crate drives PCI xHCI controllers on behalf of a USB layer: it brings a controller out of
//! reset, assigns device slots, configures endpoints, moves data over control, bulk, interrupt and
//! isochronous OUT endpoints, reports root hub port status, and rebuilds the controller after it
//! halts or fails.
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! The USB layer owns device enumeration, descriptors, and hub handling. It finds controllers
//! through a [driver_interface::Registry] and talks to each through
//! [driver_interface::HostController].
//!
//! This documentation will refer directly to the relevant standards, which are as follows:
//!
//! - XHC   - [eXtensible Host Controller Interface for Universal Serial Bus (xHCI) Requirements Specification](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf)
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)
//!

#[macro_use]
extern crate bitflags;

pub mod config;
pub mod driver_interface;
pub mod error;
pub mod usb;
pub mod xhci;

pub use crate::config::XhciConfig;
pub use crate::driver_interface::{HciInfo, HostController, PciFunction, PciIdentity, PortStatus, Registry};
pub use crate::error::{Error, Result};
pub use crate::xhci::{ControllerState, Xhci};

/// Installs the driver's logger at the level named in `config`. Returns false if a logger was
/// already installed.
pub fn setup_logging(config: &XhciConfig) -> bool {
    common::setup_logging(
        "usb",
        "host",
        "xhci",
        config.log_level(),
        log::LevelFilter::Info,
    )
}
