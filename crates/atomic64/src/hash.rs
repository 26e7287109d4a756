//! Mapping from target addresses to lock slots.
//!
//! The hash runs on every emulated atomic, so it is limited to a shift, a mask and
//! a xor. It reads nothing but the target address: the lock table's own base
//! address never takes part, which is what lets the table base be aligned and
//! combined with the slot offset through a bitwise or.

/// Number of low address bits that are zero for every 8-byte aligned target.
pub const ALIGNMENT_BITS: u32 = 3;

/// Default window width, giving a 65536-slot table.
pub const DEFAULT_SLOT_BITS: u32 = 16;

/// Default xor constant. Must be odd.
pub const DEFAULT_HASH_XOR: u32 = 0x5A39;

/// Largest supported window width. Slot byte offsets must stay representable in 32 bits.
pub const MAX_SLOT_BITS: u32 = 28;

/// Index of a slot in the lock table, always in `0..slot_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Byte offset of this slot from the start of the table.
    #[inline(always)]
    pub const fn byte_offset(self) -> usize {
        (self.0 as usize) << 2
    }
}

/// Hash parameters for a lock table of `2^slot_bits` slots.
///
/// The slot of an address is `((address >> 3) & mask) ^ (xor & mask)`: a window of
/// `slot_bits` address bits directly above the alignment boundary, decorrelated
/// with a fixed odd constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHasher {
    slot_bits: u32,
    xor: u32,
}

impl Default for SlotHasher {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_BITS, DEFAULT_HASH_XOR)
    }
}

impl SlotHasher {
    /// Creates a hasher for a table of `2^slot_bits` slots.
    ///
    /// # Panics
    ///
    /// Panics if `slot_bits` is zero or larger than [`MAX_SLOT_BITS`].
    pub const fn new(slot_bits: u32, xor: u32) -> Self {
        assert!(
            slot_bits > 0 && slot_bits <= MAX_SLOT_BITS,
            "slot_bits out of range"
        );
        Self { slot_bits, xor }
    }

    #[inline(always)]
    pub const fn slot_bits(&self) -> u32 {
        self.slot_bits
    }

    #[inline(always)]
    pub const fn xor(&self) -> u32 {
        self.xor
    }

    #[inline(always)]
    pub const fn slot_count(&self) -> usize {
        1 << self.slot_bits
    }

    #[inline(always)]
    pub const fn mask(&self) -> u32 {
        (1 << self.slot_bits) - 1
    }

    /// Size of the lock table in bytes. The table base must be aligned to this.
    #[inline(always)]
    pub const fn table_bytes(&self) -> usize {
        self.slot_count() * core::mem::size_of::<u32>()
    }

    /// Maps an 8-byte aligned address to its slot.
    ///
    /// Misaligned addresses still produce a slot, but the two halves of a misaligned
    /// value are not guaranteed to be covered by it.
    #[inline(always)]
    pub const fn slot(&self, address: usize) -> SlotIndex {
        let window = (address >> ALIGNMENT_BITS) as u32 & self.mask();
        SlotIndex(window ^ (self.xor & self.mask()))
    }

    /// Byte offset of the slot guarding `address`, ready to be or-ed onto an aligned base.
    #[inline(always)]
    pub const fn byte_offset(&self, address: usize) -> usize {
        self.slot(address).byte_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_in_range() {
        let hasher = SlotHasher::default();
        for address in (0..1 << 20).step_by(8 * 97) {
            let slot = hasher.slot(address);
            assert_eq!(slot, hasher.slot(address));
            assert!((slot.get() as usize) < hasher.slot_count());
        }
    }

    #[test]
    fn adjacent_values_use_distinct_slots() {
        let hasher = SlotHasher::default();
        let base = 0x7f00_1234_5000usize;
        let slots: std::collections::HashSet<_> =
            (0..1024).map(|i| hasher.slot(base + 8 * i)).collect();
        assert_eq!(slots.len(), 1024);
    }

    #[test]
    fn window_wraps_after_table_span() {
        let hasher = SlotHasher::new(4, 0x5);
        let span = 8 * hasher.slot_count();
        assert_eq!(hasher.slot(0x1000), hasher.slot(0x1000 + span));
        assert_ne!(hasher.slot(0x1000), hasher.slot(0x1008));
    }

    #[test]
    fn xor_constant_relocates_slot_zero() {
        let hasher = SlotHasher::default();
        assert_eq!(hasher.slot(0).get(), DEFAULT_HASH_XOR);
        assert_eq!(hasher.byte_offset(0), (DEFAULT_HASH_XOR as usize) << 2);
    }

    #[test]
    fn offsets_fit_inside_table() {
        let hasher = SlotHasher::new(10, 0x3ff);
        for address in (0..1 << 16).step_by(8) {
            assert!(hasher.byte_offset(address) < hasher.table_bytes());
            assert_eq!(hasher.byte_offset(address) % 4, 0);
        }
    }

    #[test]
    #[should_panic]
    fn zero_slot_bits_rejected() {
        let _ = SlotHasher::new(0, 1);
    }
}
