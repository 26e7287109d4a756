//! The lock table and the critical section protocol built on a single compare-and-swap.
//!
//! Every slot is an independent binary mutex: `0` is free and `1` is held. No owner is
//! recorded, so a release is an unconditional store of `0`. A slot left held by an
//! aborted dispatch stays held until the host zeroes the table.

use crate::hash::{SlotHasher, SlotIndex};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

/// Value of a free slot.
pub const FREE: u32 = 0;
/// Value of a held slot.
pub const HELD: u32 = 1;

// The next holder of a slot must observe both halves written by the previous holder.
const ACQUIRE: Ordering = Ordering::Acquire;
const RELEASE: Ordering = Ordering::Release;

/// Attempts to move `lock` from free to held exactly once.
#[inline(always)]
pub fn try_acquire(lock: &AtomicU32) -> bool {
    lock.compare_exchange(FREE, HELD, ACQUIRE, Ordering::Relaxed).is_ok()
}

/// Unconditionally frees `lock`.
#[inline(always)]
pub fn release(lock: &AtomicU32) {
    lock.store(FREE, RELEASE);
}

/// Proof that the current thread holds one lock slot. Dropping it releases the slot,
/// which pairs every acquisition with exactly one release on every path.
#[must_use = "the slot is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SlotGuard<'a> {
    lock: &'a AtomicU32,
}

impl<'a> SlotGuard<'a> {
    /// One compare-and-swap attempt.
    #[inline(always)]
    pub fn try_acquire(lock: &'a AtomicU32) -> Option<Self> {
        // `then`, not `then_some`: a guard built for a failed attempt would release the slot
        try_acquire(lock).then(|| Self { lock })
    }

    /// Spins until the slot is acquired.
    ///
    /// This is the retry loop for threads that are not lockstepped with one another
    /// (ordinary CPU threads). It waits on plain loads between attempts so contended
    /// slots are not hammered with failing compare-and-swaps.
    #[inline]
    pub fn acquire(lock: &'a AtomicU32) -> Self {
        loop {
            if let Some(guard) = Self::try_acquire(lock) {
                return guard;
            }
            while lock.load(Ordering::Relaxed) != FREE {
                core::hint::spin_loop();
            }
        }
    }

    pub fn lock(&self) -> &'a AtomicU32 {
        self.lock
    }
}

impl Drop for SlotGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        release(self.lock);
    }
}

/// A view of a lock buffer, addressed the way generated libraries address it: an aligned
/// base whose low bits are zero, or-ed with the byte offset of a slot.
#[derive(Debug, Clone, Copy)]
pub struct LockTable<'a> {
    base: NonNull<AtomicU32>,
    hasher: SlotHasher,
    _buffer: PhantomData<&'a [AtomicU32]>,
}

// SAFETY: the table only hands out shared references to atomics.
unsafe impl Send for LockTable<'_> {}
unsafe impl Sync for LockTable<'_> {}

impl<'a> LockTable<'a> {
    /// Builds a table over `words`.
    ///
    /// Returns `None` unless `words` holds exactly `hasher.slot_count()` slots and starts
    /// at an address aligned to the table size in bytes.
    pub fn new(words: &'a [AtomicU32], hasher: SlotHasher) -> Option<Self> {
        let base = NonNull::from(words).cast::<AtomicU32>();
        let aligned = base.as_ptr().addr() & (hasher.table_bytes() - 1) == 0;
        (aligned && words.len() == hasher.slot_count()).then_some(Self {
            base,
            hasher,
            _buffer: PhantomData,
        })
    }

    /// Rebuilds a table from a base address baked into a generated library.
    ///
    /// # Safety
    ///
    /// `address` must come from an exposed pointer to a live lock buffer of at least
    /// `hasher.slot_count()` words, aligned to `hasher.table_bytes()`, that outlives `'a`.
    pub unsafe fn from_base_address(address: usize, hasher: SlotHasher) -> Self {
        let base = core::ptr::with_exposed_provenance_mut::<AtomicU32>(address);
        debug_assert_eq!(address & (hasher.table_bytes() - 1), 0);
        Self {
            // SAFETY: a live buffer is never at address zero.
            base: unsafe { NonNull::new_unchecked(base) },
            hasher,
            _buffer: PhantomData,
        }
    }

    #[inline(always)]
    pub fn hasher(&self) -> SlotHasher {
        self.hasher
    }

    pub fn base_address(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// The lock word guarding the value at `address`.
    #[inline(always)]
    pub fn lock_for(&self, address: usize) -> &'a AtomicU32 {
        let offset = self.hasher.byte_offset(address);
        // SAFETY: the base is aligned to the table size and the offset is below it, so
        // or-ing them addresses a word inside the table.
        unsafe { &*self.base.as_ptr().map_addr(|base| base | offset) }
    }

    /// The lock word at a given slot index.
    #[inline(always)]
    pub fn slot(&self, index: SlotIndex) -> &'a AtomicU32 {
        debug_assert!((index.get() as usize) < self.hasher.slot_count());
        // SAFETY: as in `lock_for`.
        unsafe {
            &*self
                .base
                .as_ptr()
                .map_addr(|base| base | index.byte_offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Table([AtomicU32; 16]);

    fn table() -> Table {
        Table(core::array::from_fn(|_| AtomicU32::new(FREE)))
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = AtomicU32::new(FREE);
        {
            let _guard = SlotGuard::acquire(&lock);
            assert_eq!(lock.load(Ordering::Relaxed), HELD);
            assert!(SlotGuard::try_acquire(&lock).is_none());
            assert_eq!(lock.load(Ordering::Relaxed), HELD);
        }
        assert_eq!(lock.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn release_ignores_owner() {
        let lock = AtomicU32::new(FREE);
        let guard = SlotGuard::acquire(&lock);
        release(&lock);
        assert!(try_acquire(&lock));
        drop(guard);
        assert_eq!(lock.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn table_requires_alignment_and_length() {
        let words = table();
        let hasher = SlotHasher::new(4, 1);
        assert!(LockTable::new(&words.0, hasher).is_some());
        assert!(LockTable::new(&words.0[..8], hasher).is_none());
        assert!(LockTable::new(&words.0[1..9], SlotHasher::new(3, 1)).is_none());
    }

    #[test]
    fn or_addressing_matches_indexing() {
        let words = table();
        let hasher = SlotHasher::new(4, 0x5);
        let table = LockTable::new(&words.0, hasher).unwrap();
        for address in (0..256).step_by(8) {
            let slot = hasher.slot(address).get() as usize;
            assert!(core::ptr::eq(table.lock_for(address), &words.0[slot]));
            assert!(core::ptr::eq(table.slot(hasher.slot(address)), &words.0[slot]));
        }
    }

    #[test]
    fn base_address_round_trip() {
        let words = table();
        let hasher = SlotHasher::new(4, 0x5);
        let address = words.0.as_ptr().expose_provenance();
        let table = unsafe { LockTable::from_base_address(address, hasher) };
        assert_eq!(table.base_address(), address);
        table.lock_for(0x40).store(HELD, Ordering::Relaxed);
        let slot = hasher.slot(0x40).get() as usize;
        assert_eq!(words.0[slot].load(Ordering::Relaxed), HELD);
    }

    #[test]
    fn contended_slot_serializes_threads() {
        let lock = AtomicU32::new(FREE);
        let inside = AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = SlotGuard::acquire(&lock);
                        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                        inside.fetch_sub(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(lock.load(Ordering::Relaxed), FREE);
    }
}
