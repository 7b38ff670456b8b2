//! Volatile access to a memory-mapped register block

use core::ptr::{read_volatile, write_volatile};

/// Memory-mapped register block
///
/// Accessors take `&self`: device registers are shared between the interrupt
/// vector and the foreground, and every access is a single volatile load or
/// store.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region
    ///
    /// # Safety
    /// Caller must ensure `base..base + size` is valid device memory for the
    /// lifetime of the region
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Read a 32-bit register
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: region validity is the constructor's contract
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    /// Write a 32-bit register
    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size);
        debug_assert!(offset % 4 == 0);
        // SAFETY: region validity is the constructor's contract
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Write an 8-bit register (byte-addressable blocks such as NVIC IPR)
    #[inline]
    pub fn write_u8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.size);
        // SAFETY: region validity is the constructor's contract
        unsafe { write_volatile((self.base + offset) as *mut u8, value) }
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.size);
        // SAFETY: region validity is the constructor's contract
        unsafe { read_volatile((self.base + offset) as *const u8) }
    }

    /// Clear then set bits of a 32-bit register in one critical section
    pub fn modify_u32(&self, offset: usize, clear: u32, set: u32) {
        critical_section::with(|_| {
            let value = self.read_u32(offset);
            self.write_u32(offset, (value & !clear) | set);
        });
    }
}
