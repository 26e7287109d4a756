//! # atomic64
//!
//! Emulated 64-bit atomics for devices whose memory system only provides 32-bit atomic
//! words.
//!
//! Every 64-bit value is stored as two adjacent 32-bit words. A fixed-size table of
//! 32-bit lock slots, addressed by a cheap hash of the value's address, serializes all
//! operations on values that share a slot, which makes every emulated operation
//! linearizable with respect to every other emulated operation on the same value.
//!
//! # Structure
//!
//! - [`hash`] maps addresses to slots.
//! - [`lock`] holds the lock table and the single compare-and-swap critical section.
//! - [`split`] reads and writes the two halves of a value.
//! - [`dispatch`] lowers typed requests onto seven shared code paths and exposes the
//!   per-thread entry points through [`Atomics`].
//! - [`warp`] runs lockstep SIMD groups without the deadlock a per-lane spin loop has.
//! - [`atomic`] provides typed cells on top of [`Atomics`].
//!
//! Nothing here allocates; the lock table is owned by whoever creates it, normally the
//! `atomic64_host` crate.

#![cfg_attr(not(test), no_std)]

pub mod atomic;
pub mod dispatch;
pub mod float;
pub mod hash;
pub mod lock;
pub mod split;
pub mod types;
pub mod warp;

pub use dispatch::Atomics;
pub use float::{F43, F59, Float64Math, HostFloat64};
pub use hash::SlotHasher;
pub use lock::LockTable;
pub use types::{DecodeError, OperationId, OperationRequest, TypeId, TypedValue};

pub mod prelude {
    pub use crate::atomic::{
        Atomic64Value, EmulatedAtomicF43, EmulatedAtomicF59, EmulatedAtomicF64,
        EmulatedAtomicI64, EmulatedAtomicU64,
    };
    pub use crate::dispatch::{Atomics, BitwiseOp};
    pub use crate::float::{F43, F59};
    pub use crate::types::{OperationId, OperationRequest, TypeId};
    pub use crate::warp::LockstepGroup;
}
