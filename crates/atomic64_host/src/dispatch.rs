//! Encoding and running compute work that calls into an atomics library.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use atomic64::warp::{LockstepGroup, LockstepOutcome, MAX_GROUP_WIDTH};
use atomic64::{Atomics, LockTable, OperationRequest};
use bitflags::bitflags;
use rayon::prelude::*;
use tracing::trace;

use crate::error::{HostError, HostResult};
use crate::library::Atomic64Library;
use crate::lock_buffer::LockBuffer;

bitflags! {
    /// How a dispatch uses a resource it did not receive as an argument.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceUsage: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Records the resources a dispatch needs and runs kernels against an atomics library.
///
/// The library reaches its lock buffer through a baked-in address, so the buffer must be
/// declared with [`ComputeEncoder::use_resource`] for read and write access before any
/// kernel is dispatched.
#[derive(Debug)]
pub struct ComputeEncoder<'a> {
    library: &'a Atomic64Library,
    resources: Vec<(&'a LockBuffer, ResourceUsage)>,
}

impl<'a> ComputeEncoder<'a> {
    pub fn new(library: &'a Atomic64Library) -> Self {
        Self {
            library,
            resources: Vec::new(),
        }
    }

    /// Declares that dispatches use `buffer` with `usage`.
    pub fn use_resource(&mut self, buffer: &'a LockBuffer, usage: ResourceUsage) -> &mut Self {
        trace!(address = format_args!("{:#x}", buffer.gpu_address()), ?usage, "use resource");
        self.resources.push((buffer, usage));
        self
    }

    /// Resolves the library's lock buffer among the declared resources.
    fn bind(&self) -> HostResult<Atomics<'a>> {
        let address = self.library.lock_buffer_address();
        let (buffer, usage) = self
            .resources
            .iter()
            .rev()
            .find(|(buffer, _)| buffer.gpu_address() == address)
            .copied()
            .ok_or(HostError::UndeclaredResource { address })?;
        if !usage.contains(ResourceUsage::READ | ResourceUsage::WRITE) {
            return Err(HostError::ReadOnlyResource { address });
        }
        if buffer.device() != self.library.device() {
            return Err(HostError::DeviceMismatch {
                device: self.library.device().id(),
                library: buffer.device().id(),
            });
        }
        let table = LockTable::new(buffer.slots(), self.library.hasher()).ok_or(
            HostError::LockTableMismatch {
                expected: self.library.hasher().slot_count(),
                actual: buffer.slot_count(),
            },
        )?;
        Ok(Atomics::new(table, self.library.float64().math()))
    }

    /// Runs `kernel` once for every thread index in `0..threads`. Threads are
    /// independent and contend for slots with the per-thread spin loop.
    pub fn dispatch_threads<F>(&self, threads: usize, kernel: F) -> HostResult<()>
    where
        F: Fn(usize, &Atomics<'a>) + Sync + Send,
    {
        let atomics = self.bind()?;
        trace!(threads, "dispatch threads");
        (0..threads)
            .into_par_iter()
            .for_each(|thread| kernel(thread, &atomics));
        Ok(())
    }

    /// Runs `kernel` once for every group index in `0..groups`, each group being
    /// `width` lanes that execute in lockstep.
    pub fn dispatch_lockstep<F>(
        &self,
        groups: usize,
        width: usize,
        kernel: F,
    ) -> HostResult<LockstepStats>
    where
        F: Fn(usize, &Lanes<'_, 'a>) + Sync + Send,
    {
        if width == 0 || width > MAX_GROUP_WIDTH {
            return Err(HostError::InvalidGroupWidth(width));
        }
        let atomics = self.bind()?;
        trace!(groups, width, "dispatch lockstep");
        let executions = AtomicU64::new(0);
        let total_rounds = AtomicU64::new(0);
        let max_rounds = AtomicU32::new(0);
        (0..groups).into_par_iter().for_each(|group| {
            let lanes = Lanes {
                group: LockstepGroup::new(width),
                atomics: &atomics,
                executions: &executions,
                total_rounds: &total_rounds,
                max_rounds: &max_rounds,
            };
            kernel(group, &lanes);
        });
        Ok(LockstepStats {
            executions: executions.into_inner(),
            total_rounds: total_rounds.into_inner(),
            max_rounds: max_rounds.into_inner(),
        })
    }
}

/// The lanes of one lockstep group, handed to a kernel.
#[derive(Debug)]
pub struct Lanes<'s, 'a> {
    group: LockstepGroup,
    atomics: &'s Atomics<'a>,
    executions: &'s AtomicU64,
    total_rounds: &'s AtomicU64,
    max_rounds: &'s AtomicU32,
}

impl<'a> Lanes<'_, 'a> {
    pub fn width(&self) -> usize {
        self.group.width()
    }

    pub fn atomics(&self) -> &Atomics<'a> {
        self.atomics
    }

    /// Executes one request per lane as a single lockstep step.
    ///
    /// # Safety
    ///
    /// Every request must address an 8-byte aligned value that stays valid for the whole
    /// dispatch and is only accessed through the library's entry points meanwhile.
    pub unsafe fn execute(&self, requests: &[OperationRequest]) -> LockstepOutcome {
        // SAFETY: forwarded to the caller.
        let outcome = unsafe { self.group.execute(self.atomics, requests) };
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_rounds.fetch_add(u64::from(outcome.rounds), Ordering::Relaxed);
        self.max_rounds.fetch_max(outcome.rounds, Ordering::Relaxed);
        outcome
    }
}

/// Round counts gathered over a lockstep dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockstepStats {
    /// Lockstep steps executed across all groups.
    pub executions: u64,
    pub total_rounds: u64,
    /// Most rounds any single step needed.
    pub max_rounds: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Atomic64Builder;
    use crate::device::Device;
    use crate::library::{CompileOptions, Float64Library, HASH_XOR, LOCK_BUFFER_ADDRESS, SLOT_MASK};
    use atomic64::prelude::*;

    fn generate() -> (Atomic64Library, LockBuffer) {
        let device = Device::system_default();
        let float64 = Float64Library::new(&device);
        Atomic64Builder::new().slot_count(1 << 8).generate(&float64).unwrap()
    }

    #[test]
    fn undeclared_buffer_rejected() {
        let (library, other) = generate();
        let (_, buffer) = generate();
        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::READ | ResourceUsage::WRITE);
        let err = encoder.dispatch_threads(1, |_, _| {}).unwrap_err();
        assert_eq!(
            err,
            HostError::UndeclaredResource {
                address: library.lock_buffer_address()
            }
        );
        encoder.use_resource(&other, ResourceUsage::READ | ResourceUsage::WRITE);
        assert!(encoder.dispatch_threads(1, |_, _| {}).is_ok());
    }

    #[test]
    fn read_only_buffer_rejected() {
        let (library, buffer) = generate();
        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::READ);
        assert!(matches!(
            encoder.dispatch_threads(1, |_, _| {}),
            Err(HostError::ReadOnlyResource { .. })
        ));
    }

    fn options_for(buffer: &LockBuffer, mask: u64) -> CompileOptions {
        CompileOptions::default()
            .constant(LOCK_BUFFER_ADDRESS, buffer.gpu_address() as u64)
            .constant(SLOT_MASK, mask)
            .constant(HASH_XOR, 0x5A39)
    }

    #[test]
    fn slot_count_mismatch_rejected() {
        let (_, buffer) = generate();
        let float64 = Float64Library::new(buffer.device());
        // half the slots: the buffer is still aligned for the smaller table
        let options = options_for(&buffer, 0x7F);
        let library = Atomic64Library::compile(buffer.device(), &float64, &options).unwrap();
        assert_eq!(library.lock_buffer_address(), buffer.gpu_address());

        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::all());
        assert_eq!(
            encoder.dispatch_threads(1, |_, _| {}).unwrap_err(),
            HostError::LockTableMismatch {
                expected: 128,
                actual: 256
            }
        );
    }

    #[test]
    fn buffer_on_other_device_rejected() {
        let (library, _) = generate();
        let other = Device::discrete("other");
        let buffer = LockBuffer::new(&other, library.hasher()).unwrap();
        let options = options_for(&buffer, 0xFF);
        let library =
            Atomic64Library::compile(library.device(), library.float64(), &options).unwrap();

        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::all());
        assert_eq!(
            encoder.dispatch_lockstep(1, 4, |_, _| {}).unwrap_err(),
            HostError::DeviceMismatch {
                device: library.device().id(),
                library: other.id()
            }
        );
    }

    #[test]
    fn group_width_checked() {
        let (library, buffer) = generate();
        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::all());
        assert_eq!(
            encoder.dispatch_lockstep(1, 65, |_, _| {}).unwrap_err(),
            HostError::InvalidGroupWidth(65)
        );
    }

    #[test]
    fn threads_see_every_index() {
        let (library, buffer) = generate();
        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::all());
        let sum = EmulatedAtomicU64::new(0);
        encoder
            .dispatch_threads(1000, |thread, atomics| {
                sum.fetch_add(thread as u64, atomics);
            })
            .unwrap();
        assert_eq!(sum.into_inner(), 999 * 1000 / 2);
        assert_eq!(buffer.held_slots(), 0);
    }

    #[test]
    fn lockstep_groups_report_rounds() {
        let (library, buffer) = generate();
        let mut encoder = ComputeEncoder::new(&library);
        encoder.use_resource(&buffer, ResourceUsage::all());
        let counter = EmulatedAtomicU64::new(0);
        let address = counter.as_ptr().expose_provenance();
        let stats = encoder
            .dispatch_lockstep(4, 8, |_, lanes| {
                let request = OperationRequest::new(address, TypeId::U64, OperationId::FetchAdd, 1);
                let requests = [request; 8];
                // SAFETY: `counter` outlives the dispatch.
                unsafe { lanes.execute(&requests) };
            })
            .unwrap();
        assert_eq!(counter.into_inner(), 32);
        assert_eq!(stats.executions, 4);
        assert!(stats.max_rounds >= 8);
        assert!(stats.total_rounds >= 32);
    }
}
