//! Plumbing shared by the driver crates: register windows, DMA memory, bounded polling and
//! logger setup.

pub mod dma;
pub mod io;
pub mod logger;
pub mod timeout;

pub use logger::setup_logging;

/// Granule used for cache maintenance around device-visible memory.
pub const CACHE_LINE_SIZE: usize = 64;

/// Smallest page size an xHC may report.
pub const PAGE_SIZE: usize = 4096;
