use core::{
    cmp::PartialEq,
    ops::{BitAnd, BitOr, Not},
    ptr::{self, NonNull},
};

/// IO abstraction
pub trait Io {
    /// Value type for IO, usually some unsigned number
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    /// Read the underlying value
    fn read(&self) -> Self::Value;
    /// Write the underlying value
    fn write(&mut self, value: Self::Value);

    /// Check whether the underlying value contains bit flags
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) as Self::Value == flags
    }

    /// Enable or disable specific bit flags
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = match value {
            true => self.read() | flags,
            false => self.read() & !flags,
        };
        self.write(tmp);
    }
}

/// A window of memory-mapped device registers, addressed by byte offset from its base.
///
/// All accesses are 32 bits wide. 64-bit registers are written low dword first.
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    /// Size of the window in bytes.
    fn size(&self) -> usize;
}

/// Volatile register window over a mapped BAR.
pub struct Mmio {
    base: NonNull<u8>,
    size: usize,
}

// The mapping is device memory; every access goes through volatile reads and writes.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// # Safety
    /// `base` must point at a mapping of at least `size` bytes that stays valid for the lifetime
    /// of the window, and must be 4-byte aligned.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }
}

impl RegisterWindow for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        if offset + 4 > self.size {
            log::warn!("register read at {:#x} outside window of {:#x}", offset, self.size);
            return !0;
        }
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset + 4 > self.size {
            log::warn!("register write at {:#x} outside window of {:#x}", offset, self.size);
            return;
        }
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset) as *mut u32, value) }
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// A single 32-bit register inside a [RegisterWindow].
#[derive(Clone, Copy)]
pub struct Reg<'a> {
    window: &'a dyn RegisterWindow,
    offset: usize,
}

impl<'a> Reg<'a> {
    pub fn new(window: &'a dyn RegisterWindow, offset: usize) -> Self {
        Self { window, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Io for Reg<'_> {
    type Value = u32;

    #[inline(always)]
    fn read(&self) -> u32 {
        self.window.read32(self.offset)
    }

    #[inline(always)]
    fn write(&mut self, value: u32) {
        self.window.write32(self.offset, value)
    }
}

/// Writes a 64-bit register pair, low half first.
pub fn write64(window: &dyn RegisterWindow, offset: usize, value: u64) {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    window.write32(offset, value as u32);
    window.write32(offset + 4, (value >> 32) as u32);
}

/// Read-only IO
#[repr(transparent)]
pub struct ReadOnly<I> {
    inner: I,
}

impl<I: Io> ReadOnly<I> {
    /// Wraps IO
    pub const fn new(inner: I) -> ReadOnly<I> {
        ReadOnly { inner }
    }

    /// Calls [Io::read]
    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }

    /// Calls [Io::readf]
    #[inline(always)]
    pub fn readf(&self, flags: I::Value) -> bool {
        self.inner.readf(flags)
    }
}

/// Write-only IO
#[repr(transparent)]
pub struct WriteOnly<I> {
    inner: I,
}

impl<I: Io> WriteOnly<I> {
    /// Wraps IO
    pub const fn new(inner: I) -> WriteOnly<I> {
        WriteOnly { inner }
    }

    /// Calls [Io::write]
    #[inline(always)]
    pub fn write(&mut self, value: I::Value) {
        self.inner.write(value)
    }
}
