//! Allocation and maintenance of the lock buffer.

use std::sync::atomic::{AtomicU32, Ordering};

use atomic64::lock::FREE;
use atomic64::{LockTable, SlotHasher};
use tracing::{debug, warn};

use crate::device::{Device, StorageMode};
use crate::error::{HostError, HostResult};

/// The device buffer holding the lock table.
///
/// Twice the table size is allocated so that a base address aligned to the table size
/// always fits inside the allocation. Only the aligned window is used as the table.
/// The buffer starts zeroed. A dispatch aborted while a thread held a slot leaves that
/// slot held; [`LockBuffer::reset`] is the only way to recover from that.
#[derive(Debug)]
pub struct LockBuffer {
    device: Device,
    storage_mode: StorageMode,
    hasher: SlotHasher,
    words: Box<[AtomicU32]>,
    /// Index of the first word of the aligned table inside `words`.
    offset: usize,
}

impl LockBuffer {
    pub fn new(device: &Device, hasher: SlotHasher) -> HostResult<Self> {
        let slots = hasher.slot_count();
        let len = 2 * slots;
        let requested = len * size_of::<AtomicU32>();
        if requested > device.max_buffer_length() {
            return Err(HostError::OutOfMemory {
                requested,
                limit: device.max_buffer_length(),
            });
        }

        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| HostError::OutOfMemory {
                requested,
                limit: device.max_buffer_length(),
            })?;
        words.extend((0..len).map(|_| AtomicU32::new(FREE)));
        let words = words.into_boxed_slice();

        let address = words.as_ptr().addr();
        let aligned = align_up(address, hasher.table_bytes());
        let offset = (aligned - address) / size_of::<AtomicU32>();
        let storage_mode = device.preferred_storage_mode();
        debug!(
            bytes = requested,
            slots,
            address = format_args!("{aligned:#x}"),
            ?storage_mode,
            "allocated lock buffer"
        );

        Ok(Self {
            device: device.clone(),
            storage_mode,
            hasher,
            words,
            offset,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn hasher(&self) -> SlotHasher {
        self.hasher
    }

    pub fn slot_count(&self) -> usize {
        self.hasher.slot_count()
    }

    /// Size of the whole allocation in bytes.
    pub fn allocated_bytes(&self) -> usize {
        self.words.len() * size_of::<AtomicU32>()
    }

    /// The lock slots, starting at the aligned base.
    pub fn slots(&self) -> &[AtomicU32] {
        &self.words[self.offset..self.offset + self.slot_count()]
    }

    /// Device address of the aligned table base, with its provenance exposed so generated
    /// code can address the table from the bare number.
    pub fn gpu_address(&self) -> usize {
        self.slots().as_ptr().expose_provenance()
    }

    /// A view of the table for running atomics against this buffer.
    pub fn table(&self) -> LockTable<'_> {
        // SAFETY: `new` aligned the base to the table size and the window holds exactly
        // `slot_count` words that live as long as `self`.
        unsafe { LockTable::from_base_address(self.gpu_address(), self.hasher) }
    }

    /// Number of slots currently held. Nonzero while no dispatch is running means a
    /// dispatch was aborted inside a critical section.
    pub fn held_slots(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != FREE)
            .count()
    }

    /// Frees every slot. Must not be called while a dispatch is using the buffer.
    pub fn reset(&self) {
        let held = self.held_slots();
        if held > 0 {
            warn!(held, "resetting lock buffer with held slots");
        }
        for slot in self.slots() {
            slot.store(FREE, Ordering::Release);
        }
    }
}

fn align_up(address: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (address + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomic64::lock::HELD;

    #[test]
    fn base_is_aligned_to_table_size() {
        let device = Device::system_default();
        for bits in [1, 4, 10, 16] {
            let buffer = LockBuffer::new(&device, SlotHasher::new(bits, 1)).unwrap();
            let bytes = buffer.hasher().table_bytes();
            assert_eq!(buffer.gpu_address() % bytes, 0);
            assert_eq!(buffer.slots().len(), 1 << bits);
            assert_eq!(buffer.allocated_bytes(), 2 * bytes);
        }
    }

    #[test]
    fn starts_zeroed() {
        let buffer = LockBuffer::new(&Device::system_default(), SlotHasher::default()).unwrap();
        assert_eq!(buffer.held_slots(), 0);
        assert_eq!(buffer.slot_count(), 65536);
    }

    #[test]
    fn reset_frees_stuck_slots() {
        let buffer = LockBuffer::new(&Device::system_default(), SlotHasher::new(8, 1)).unwrap();
        buffer.table().lock_for(0x1000).store(HELD, Ordering::Relaxed);
        buffer.slots()[3].store(HELD, Ordering::Relaxed);
        assert_eq!(buffer.held_slots(), 2);
        buffer.reset();
        assert_eq!(buffer.held_slots(), 0);
    }

    #[test]
    fn allocation_limit_enforced() {
        let device = Device::new(crate::device::DeviceProperties {
            max_buffer_length: 1024,
            ..Default::default()
        });
        assert_eq!(
            LockBuffer::new(&device, SlotHasher::new(8, 1)).unwrap_err(),
            HostError::OutOfMemory {
                requested: 2048,
                limit: 1024
            }
        );
        assert!(LockBuffer::new(&device, SlotHasher::new(7, 1)).is_ok());
    }

    #[test]
    fn storage_mode_follows_device() {
        let buffer = LockBuffer::new(&Device::discrete("dgpu"), SlotHasher::new(4, 1)).unwrap();
        assert_eq!(buffer.storage_mode(), StorageMode::Private);
    }
}
