//! A 64-bit cell emulated with two adjacent 32-bit atomic words.
//!
//! The low-order half lives at the 8-byte aligned address and the high-order half at
//! the same address with bit 2 set. Both halves are only touched while the slot
//! guarding the value is held, which the [`SlotGuard`] parameter stands witness to.

use crate::lock::SlotGuard;
use core::sync::atomic::{AtomicU32, Ordering};

/// The two halves backing one emulated 64-bit value.
#[derive(Debug, Clone, Copy)]
pub struct SplitCell<'a> {
    lo: &'a AtomicU32,
    hi: &'a AtomicU32,
}

impl<'a> SplitCell<'a> {
    /// Splits the 8-byte value at `object` into its two halves.
    ///
    /// # Safety
    ///
    /// `object` must be 8-byte aligned, valid for reads and writes of 8 bytes for `'a`,
    /// and only accessed through atomic operations while `'a` lasts.
    #[inline(always)]
    pub unsafe fn from_ptr(object: *mut u64) -> Self {
        let lo = object.cast::<AtomicU32>();
        let hi = lo.map_addr(|address| address | 4);
        // SAFETY: both words lie inside the aligned 8-byte object.
        unsafe {
            Self {
                lo: &*lo,
                hi: &*hi,
            }
        }
    }

    pub fn from_halves(halves: &'a [AtomicU32; 2]) -> Self {
        Self {
            lo: &halves[0],
            hi: &halves[1],
        }
    }

    /// Reads both halves and reassembles them, low half first.
    #[inline(always)]
    pub fn load(&self, _held: &SlotGuard<'_>) -> u64 {
        self.read()
    }

    /// Writes the low half then the high half, and rewrites both until a read-back
    /// returns `value`.
    #[inline(always)]
    pub fn store(&self, value: u64, _held: &SlotGuard<'_>) {
        loop {
            self.lo.store(value as u32, Ordering::Relaxed);
            self.hi.store((value >> 32) as u32, Ordering::Relaxed);
            if self.read() == value {
                break;
            }
            core::hint::spin_loop();
        }
    }

    #[inline(always)]
    fn read(&self) -> u64 {
        let lo = self.lo.load(Ordering::Relaxed);
        let hi = self.hi.load(Ordering::Relaxed);
        u64::from(lo) | (u64::from(hi) << 32)
    }
}
