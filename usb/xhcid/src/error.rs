use common::dma::DmaError;
use thiserror::Error;

use crate::xhci::trb::CompletionCode;

/// Everything a host controller entry point can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory: {0}")]
    NoMemory(#[from] DmaError),
    #[error("controller vanished")]
    ControllerVanished,
    #[error("xhci controller needs reset")]
    NeedsReset,
    #[error("timed out")]
    TimedOut,
    /// The controller finished the request with a code other than Success or Short Packet.
    #[error("{0}")]
    Completion(CompletionCode),
    #[error("bad slot id from controller")]
    BadSlotId,
    #[error("usb endpoint not configured")]
    NotConfigured,
    #[error("bad usb request length")]
    BadLength,
    #[error("short usb command")]
    Short,
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Ring Full")]
    RingFull,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
