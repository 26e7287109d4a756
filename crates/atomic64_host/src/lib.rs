//! # atomic64_host
//!
//! Host-side runtime for [`atomic64`]: allocates the lock buffer, generates atomics
//! libraries that address it, and dispatches kernels that call into them.
//!
//! ```no_run
//! use atomic64_host::prelude::*;
//!
//! let device = Device::system_default();
//! let float64 = Float64Library::new(&device);
//! let (library, lock_buffer) = generate_library(&float64)?;
//!
//! let total = EmulatedAtomicU64::new(0);
//! let mut encoder = ComputeEncoder::new(&library);
//! encoder.use_resource(&lock_buffer, ResourceUsage::READ | ResourceUsage::WRITE);
//! encoder.dispatch_threads(1024, |thread, atomics| {
//!     total.fetch_add(thread as u64, atomics);
//! })?;
//! # Ok::<(), HostError>(())
//! ```
//!
//! The lock buffer is zeroed on allocation. If a dispatch is aborted while one of its
//! threads holds a slot, that slot stays held and every later operation hashing to it
//! spins forever; call [`LockBuffer::reset`] before dispatching again.

pub mod builder;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod library;
pub mod lock_buffer;

pub use atomic64;
pub use builder::{Atomic64Builder, generate_library};
pub use device::{Device, DeviceProperties, StorageMode};
pub use dispatch::{ComputeEncoder, Lanes, LockstepStats, ResourceUsage};
pub use error::{HostError, HostResult};
pub use library::{Atomic64Library, CompileOptions, Float64Library, OptLevel};
pub use lock_buffer::LockBuffer;

pub mod prelude {
    pub use crate::{
        Atomic64Builder, Atomic64Library, ComputeEncoder, Device, Float64Library, HostError,
        HostResult, LockBuffer, ResourceUsage, generate_library,
    };
    pub use atomic64::prelude::*;
}
