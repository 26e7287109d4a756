//! Numeric-support and atomics library handles.
//!
//! An atomics library is "compiled" for one device from a set of named integer
//! constants. The lock buffer address is one of those constants, so the compiled entry
//! points reach the table without it ever being bound as an argument.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use atomic64::dispatch::FusedGroup;
use atomic64::hash::MAX_SLOT_BITS;
use atomic64::{Float64Math, HostFloat64, OperationId, SlotHasher};
use tracing::debug;

use crate::device::Device;
use crate::error::{HostError, HostResult};

/// Base address of the aligned lock table.
pub const LOCK_BUFFER_ADDRESS: &str = "ATOMIC64_LOCK_BUFFER_ADDRESS";
/// Slot count minus one.
pub const SLOT_MASK: &str = "ATOMIC64_SLOT_MASK";
/// Xor constant of the slot hash.
pub const HASH_XOR: &str = "ATOMIC64_HASH_XOR";

/// Default install name of generated libraries.
pub const DEFAULT_INSTALL_NAME: &str = "@loader_path/libAtomic64.so";

/// The numeric-support library providing double precision helpers, compiled for one
/// device.
#[derive(Clone)]
pub struct Float64Library {
    device: Device,
    math: Arc<dyn Float64Math>,
}

impl fmt::Debug for Float64Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Float64Library")
            .field("device", &self.device.id())
            .finish_non_exhaustive()
    }
}

impl Float64Library {
    /// A library using the host's native double precision.
    pub fn new(device: &Device) -> Self {
        Self::with_math(device, HostFloat64)
    }

    pub fn with_math(device: &Device, math: impl Float64Math + 'static) -> Self {
        Self {
            device: device.clone(),
            math: Arc::new(math),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn math(&self) -> &dyn Float64Math {
        &*self.math
    }
}

/// How aggressively module code is optimized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OptLevel {
    None,
    /// Favor small code. Every entry point is a fused path, so this is the default.
    #[default]
    Size,
    Speed,
}

/// Options for compiling an atomics library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Named integer constants baked into the module.
    pub constants: BTreeMap<&'static str, u64>,
    pub opt_level: OptLevel,
    /// Name other modules use to locate the library when loading.
    pub install_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            constants: BTreeMap::new(),
            opt_level: OptLevel::default(),
            install_name: String::from(DEFAULT_INSTALL_NAME),
        }
    }
}

impl CompileOptions {
    pub fn constant(mut self, name: &'static str, value: u64) -> Self {
        self.constants.insert(name, value);
        self
    }

    fn require(&self, name: &'static str) -> HostResult<u64> {
        self.constants
            .get(name)
            .copied()
            .ok_or(HostError::MissingConstant(name))
    }
}

/// A compiled atomics library. Its entry points address the lock table through the
/// constant it was compiled with.
#[derive(Debug, Clone)]
pub struct Atomic64Library {
    device: Device,
    float64: Float64Library,
    lock_buffer_address: usize,
    hasher: SlotHasher,
    opt_level: OptLevel,
    install_name: String,
}

impl Atomic64Library {
    /// Compiles the library for `device`, linked against `float64`.
    pub fn compile(
        device: &Device,
        float64: &Float64Library,
        options: &CompileOptions,
    ) -> HostResult<Self> {
        if float64.device() != device {
            return Err(HostError::DeviceMismatch {
                device: device.id(),
                library: float64.device().id(),
            });
        }

        let address = options.require(LOCK_BUFFER_ADDRESS)?;
        let mask = options.require(SLOT_MASK)?;
        let xor = options.require(HASH_XOR)?;
        let hasher = hasher_from_constants(mask, xor)?;
        let misaligned = HostError::MisalignedLockBuffer {
            address,
            align: hasher.table_bytes(),
        };
        let lock_buffer_address = usize::try_from(address).map_err(|_| misaligned.clone())?;
        if lock_buffer_address & (hasher.table_bytes() - 1) != 0 {
            return Err(misaligned);
        }

        debug!(
            device = device.id(),
            address = format_args!("{lock_buffer_address:#x}"),
            slots = hasher.slot_count(),
            opt_level = ?options.opt_level,
            install_name = %options.install_name,
            "compiled atomics library"
        );

        Ok(Self {
            device: device.clone(),
            float64: float64.clone(),
            lock_buffer_address,
            hasher,
            opt_level: options.opt_level,
            install_name: options.install_name.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn float64(&self) -> &Float64Library {
        &self.float64
    }

    /// The lock table base address baked into the library.
    pub fn lock_buffer_address(&self) -> usize {
        self.lock_buffer_address
    }

    pub fn hasher(&self) -> SlotHasher {
        self.hasher
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    pub fn install_name(&self) -> &str {
        &self.install_name
    }

    /// Symbols the library exports, one per fused group.
    pub fn entry_points(&self) -> impl Iterator<Item = &'static str> {
        FusedGroup::ALL.into_iter().map(FusedGroup::symbol)
    }

    /// The exported symbol implementing `op`.
    pub fn symbol_for(&self, op: OperationId) -> &'static str {
        FusedGroup::of(op).symbol()
    }
}

fn hasher_from_constants(mask: u64, xor: u64) -> HostResult<SlotHasher> {
    let slots = mask.wrapping_add(1);
    let bits = slots.trailing_zeros();
    if !slots.is_power_of_two() || bits == 0 || bits > MAX_SLOT_BITS {
        return Err(HostError::InvalidSlotCount(
            usize::try_from(slots).unwrap_or(usize::MAX),
        ));
    }
    let xor = u32::try_from(xor).map_err(|_| HostError::InvalidHashXor(u32::MAX))?;
    if xor & 1 == 0 {
        return Err(HostError::InvalidHashXor(xor));
    }
    Ok(SlotHasher::new(bits, xor))
}
