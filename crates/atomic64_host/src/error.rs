//! Types for error handling.
//!
//! Every failure on the host side is synchronous and fatal to the call that hit it:
//! nothing is retried and no partially built library or buffer escapes.

use atomic64::DecodeError;
use thiserror::Error;

/// Errors raised while generating, binding or dispatching an atomics library.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// A constant the module source depends on was not supplied at compile time.
    #[error("module constant `{0}` is not defined")]
    MissingConstant(&'static str),

    #[error("numeric-support library belongs to device {library}, not device {device}")]
    DeviceMismatch { device: u64, library: u64 },

    #[error("allocation of {requested} bytes exceeds the device limit of {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },

    #[error("lock slot count {0} is not a power of two between 2 and 2^28")]
    InvalidSlotCount(usize),

    /// The lock buffer address is not aligned to the table size.
    #[error("lock buffer address {address:#x} is not aligned to {align} bytes")]
    MisalignedLockBuffer { address: u64, align: usize },

    #[error("hash xor constant {0:#x} must be odd")]
    InvalidHashXor(u32),

    #[error("environment variable {name} has unparsable value {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    /// The library's lock buffer was not declared on the encoder.
    #[error("lock buffer at {address:#x} is used by the library but was not declared")]
    UndeclaredResource { address: usize },

    #[error("lock buffer at {address:#x} was declared without write access")]
    ReadOnlyResource { address: usize },

    /// The declared buffer does not have the slot count the library was compiled for.
    #[error("lock buffer has {actual} slots but the library expects {expected}")]
    LockTableMismatch { expected: usize, actual: usize },

    #[error("lockstep group width {0} is outside 1..=64")]
    InvalidGroupWidth(usize),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result type for most host functions.
pub type HostResult<T> = Result<T, HostError>;
