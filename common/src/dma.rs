use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::CACHE_LINE_SIZE;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("allocation of {len} bytes aligned to {align} failed")]
    OutOfMemory { len: usize, align: usize },
    #[error("{len} bytes cannot fit inside a {boundary} byte boundary")]
    Boundary { len: usize, boundary: usize },
    #[error("invalid alignment {0}")]
    Alignment(usize),
}

/// A contiguous, device-visible allocation as handed out by [DmaOps].
#[derive(Debug)]
pub struct DmaRegion {
    pub virt: NonNull<u8>,
    pub bus: u64,
    pub len: usize,
    pub align: usize,
}

/// The platform services a driver needs around device-visible memory.
///
/// Cache maintenance is expressed on CPU virtual ranges. On cache-coherent platforms all three
/// maintenance calls only need to order memory accesses.
pub trait DmaOps: Send + Sync {
    /// Allocates zeroed memory aligned to `align` that does not cross a `boundary` byte boundary
    /// (0 means no boundary).
    fn alloc_zeroed(&self, len: usize, align: usize, boundary: usize) -> Result<DmaRegion, DmaError>;

    /// # Safety
    /// `region` must come from [DmaOps::alloc_zeroed] on the same instance, and must not be used
    /// afterwards.
    unsafe fn free(&self, region: &DmaRegion);

    /// Translates a CPU virtual address into the address the device must use.
    fn bus_address(&self, virt: NonNull<u8>) -> u64;

    /// Writes dirty lines back so the device observes CPU stores.
    fn flush_for_device(&self, virt: *const u8, len: usize);
    /// Discards cached lines so the CPU observes device stores.
    fn invalidate_for_device(&self, virt: *const u8, len: usize);
    /// Writes back, then discards.
    fn writeback_invalidate(&self, virt: *const u8, len: usize);
}

/// [DmaOps] for a cache-coherent host whose devices use CPU virtual addresses directly, such as
/// an identity-mapped IOMMU domain.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostDma;

impl HostDma {
    pub fn shared() -> Arc<dyn DmaOps> {
        Arc::new(HostDma)
    }

    fn alloc_aligned(&self, len: usize, align: usize) -> Result<DmaRegion, DmaError> {
        let layout = Layout::from_size_align(len, align).map_err(|_| DmaError::Alignment(align))?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(DmaError::OutOfMemory { len, align })?;

        Ok(DmaRegion {
            virt,
            bus: self.bus_address(virt),
            len,
            align,
        })
    }
}

/// Whether `len` bytes at `start` straddle a multiple of `boundary`.
fn crosses(start: u64, len: usize, boundary: usize) -> bool {
    let last = start + len as u64 - 1;
    start / boundary as u64 != last / boundary as u64
}

impl DmaOps for HostDma {
    fn alloc_zeroed(&self, len: usize, align: usize, boundary: usize) -> Result<DmaRegion, DmaError> {
        if !align.is_power_of_two() {
            return Err(DmaError::Alignment(align));
        }
        let len = len.max(1);
        if boundary != 0 {
            if !boundary.is_power_of_two() {
                return Err(DmaError::Alignment(boundary));
            }
            if len > boundary {
                return Err(DmaError::Boundary { len, boundary });
            }
        }

        let align = align.max(CACHE_LINE_SIZE);
        let region = self.alloc_aligned(len, align)?;
        if boundary != 0 && crosses(region.bus, len, boundary) {
            unsafe { self.free(&region) };
            // A block aligned to its own power-of-two size never straddles a larger boundary.
            return self.alloc_aligned(len, align.max(len.next_power_of_two()));
        }
        Ok(region)
    }

    unsafe fn free(&self, region: &DmaRegion) {
        alloc::dealloc(
            region.virt.as_ptr(),
            Layout::from_size_align_unchecked(region.len, region.align),
        );
    }

    fn bus_address(&self, virt: NonNull<u8>) -> u64 {
        virt.as_ptr() as usize as u64
    }

    fn flush_for_device(&self, _virt: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn invalidate_for_device(&self, _virt: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn writeback_invalidate(&self, _virt: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }
}

/// An owned, zeroed region of device-visible memory, freed on drop.
///
/// Accessors are volatile and indexed in 32-bit words, which is how the xHC lays out every
/// structure it shares with software.
pub struct Dma {
    ops: Arc<dyn DmaOps>,
    region: DmaRegion,
}

// The region is only touched through volatile accesses; the device is a concurrent writer anyway.
unsafe impl Send for Dma {}
unsafe impl Sync for Dma {}

impl Dma {
    pub fn new(ops: &Arc<dyn DmaOps>, len: usize, align: usize, boundary: usize) -> Result<Self, DmaError> {
        let region = ops.alloc_zeroed(len, align, boundary)?;
        Ok(Self {
            ops: Arc::clone(ops),
            region,
        })
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    pub fn bus_addr(&self) -> u64 {
        self.region.bus
    }

    pub fn bus_addr_at(&self, offset: usize) -> u64 {
        assert!(offset <= self.region.len);
        self.region.bus + offset as u64
    }

    fn word_ptr(&self, word: usize) -> *mut u32 {
        assert!(
            (word + 1) * 4 <= self.region.len,
            "word {} outside dma region of {} bytes",
            word,
            self.region.len
        );
        unsafe { (self.region.virt.as_ptr() as *mut u32).add(word) }
    }

    pub fn read32(&self, word: usize) -> u32 {
        unsafe { ptr::read_volatile(self.word_ptr(word)) }
    }

    pub fn write32(&self, word: usize, value: u32) {
        unsafe { ptr::write_volatile(self.word_ptr(word), value) }
    }

    pub fn read64(&self, word: usize) -> u64 {
        u64::from(self.read32(word)) | u64::from(self.read32(word + 1)) << 32
    }

    pub fn write64(&self, word: usize, value: u64) {
        self.write32(word, value as u32);
        self.write32(word + 1, (value >> 32) as u32);
    }

    /// Zeroes `count` words starting at `word`.
    pub fn zero_words(&self, word: usize, count: usize) {
        for i in word..word + count {
            self.write32(i, 0);
        }
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.region.len);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { ptr::read_volatile(self.region.virt.as_ptr().add(offset + i)) };
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.region.len);
        for (i, byte) in data.iter().enumerate() {
            unsafe { ptr::write_volatile(self.region.virt.as_ptr().add(offset + i), *byte) };
        }
    }

    fn range(&self, offset: usize, len: usize) -> (usize, usize) {
        assert!(offset + len <= self.region.len);
        let start = self.region.virt.as_ptr() as usize + offset;
        (start, start + len)
    }

    /// Makes CPU stores to `offset..offset + len` visible to the device.
    pub fn flush_range(&self, offset: usize, len: usize) {
        let (s, e) = self.range(offset, len);
        let s = s & !(CACHE_LINE_SIZE - 1);
        let e = (e + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
        self.ops.flush_for_device(s as *const u8, e - s);
    }

    /// Makes device stores to `offset..offset + len` visible to the CPU.
    ///
    /// Lines only partially covered by the range are written back before being discarded, so
    /// that neighbouring CPU data sharing them survives.
    pub fn invalidate_range(&self, offset: usize, len: usize) {
        let (mut s, mut e) = self.range(offset, len);
        if s & (CACHE_LINE_SIZE - 1) != 0 {
            s &= !(CACHE_LINE_SIZE - 1);
            self.ops.writeback_invalidate(s as *const u8, CACHE_LINE_SIZE);
            s += CACHE_LINE_SIZE;
        }
        if e & (CACHE_LINE_SIZE - 1) != 0 {
            e &= !(CACHE_LINE_SIZE - 1);
            if e < s {
                return;
            }
            self.ops.writeback_invalidate(e as *const u8, CACHE_LINE_SIZE);
        }
        if s < e {
            self.ops.invalidate_for_device(s as *const u8, e - s);
        }
    }

    pub fn flush(&self) {
        self.flush_range(0, self.region.len)
    }

    pub fn invalidate(&self) {
        self.invalidate_range(0, self.region.len)
    }
}

impl Drop for Dma {
    fn drop(&mut self) {
        unsafe { self.ops.free(&self.region) }
    }
}

impl fmt::Debug for Dma {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dma")
            .field("bus", &format_args!("{:#x}", self.region.bus))
            .field("len", &self.region.len)
            .finish()
    }
}
