//! The slice of the USB device model the host controller driver works against.
//!
//! Devices and endpoints are created and enumerated by the USB layer above the driver; the driver
//! only reads their descriptions, fills in the device address, and hangs its own per-device and
//! per-endpoint state off them.
//!
//! The [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification) and the [Universal Serial Bus 3.2 Specification](https://usb.org/document-library/usb-32-revision-11-june-2022) are
//! the documents that inform this implementation.
pub use self::device::{DeviceAux, DeviceDescriptor, Speed, UsbDevice};
pub use self::endpoint::{Endpoint, EndpointTy, EpMode};
pub use self::setup::{Setup, SetupReq};

/// Enumerates the list of descriptor kinds that can be reported by a USB device to report its
/// attributes to the system. (See USB32 Sections 9.5 and 9.6)
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    Configuration = 2,
    /// A String Descriptor. See (USB32 Section 9.6.9).
    String = 3,
    Interface = 4,
    Endpoint = 5,
    /// USB2 only.
    DeviceQualifier = 6,
    /// USB2 only. See USB2 9.6.4
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    OnTheGo = 9,
    BinaryObjectStorage = 15,
    Hid = 33,
    Hub = 41,
    SuperSpeedCompanion = 48,
}

pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod setup;
