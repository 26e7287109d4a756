//! Typed operation dispatch and the per-thread entry points.
//!
//! Operations whose lock, load and store shape is identical share one code path
//! parameterized by a type tag. Only the arithmetic in the middle differs:
//!
//! | group | operations |
//! |---|---|
//! | add | `add_i64/u64`, `add_f64`, `add_f59`, `add_f43` |
//! | sub | `sub_i64/u64`, `sub_f64`, `sub_f59`, `sub_f43` |
//! | max | `max_i64`, `max_u64`, `max_f64`, `max_f59`, `max_f43` |
//! | min | `min_i64`, `min_u64`, `min_f64`, `min_f59`, `min_f43` |
//! | bitwise | `and`, `or`, `xor` |
//! | compare-exchange | `cmpxchg_i64/u64`, `cmpxchg_f64`, `cmpxchg_f59`, `cmpxchg_f43` |
//! | memory | `store`, `load`, `exchange` |
//!
//! Tags are not validated here. Typed enums make an unknown tag unrepresentable; raw
//! tags are decoded before they reach this module.

use crate::float::Float64Math;
use crate::lock::{LockTable, SlotGuard};
use crate::split::SplitCell;
use crate::types::{OperationId, OperationRequest, TypeId};

/// The seven shared code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusedGroup {
    Add,
    Sub,
    Max,
    Min,
    Bitwise,
    CompareExchange,
    Memory,
}

impl FusedGroup {
    pub const ALL: [FusedGroup; 7] = [
        Self::Add,
        Self::Sub,
        Self::Max,
        Self::Min,
        Self::Bitwise,
        Self::CompareExchange,
        Self::Memory,
    ];

    /// The exported symbol implementing this group.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "__atomic64_fetch_add_explicit",
            Self::Sub => "__atomic64_fetch_sub_explicit",
            Self::Max => "__atomic64_fetch_max_explicit",
            Self::Min => "__atomic64_fetch_min_explicit",
            Self::Bitwise => "__atomic64_fetch_bitwise_explicit",
            Self::CompareExchange => "__atomic64_compare_exchange_explicit",
            Self::Memory => "__atomic64_memory_explicit",
        }
    }

    pub const fn of(op: OperationId) -> Self {
        match op {
            OperationId::Store | OperationId::Load | OperationId::Exchange => Self::Memory,
            OperationId::And | OperationId::Or | OperationId::Xor => Self::Bitwise,
            OperationId::FetchAdd => Self::Add,
            OperationId::FetchSub => Self::Sub,
            OperationId::Min => Self::Min,
            OperationId::Max => Self::Max,
            OperationId::CompareExchange => Self::CompareExchange,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Store,
    Load,
    Exchange,
}

/// A request lowered onto its fused path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedOp {
    Add(TypeId, u64),
    Sub(TypeId, u64),
    Max(TypeId, u64),
    Min(TypeId, u64),
    Bitwise(BitwiseOp, u64),
    CompareExchange {
        ty: TypeId,
        expected: u64,
        desired: u64,
    },
    Memory(MemoryOp, u64),
}

/// What a fused path does with the value it read under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    /// Value to write back, if any.
    pub next: Option<u64>,
    /// Value returned to the caller.
    pub result: u64,
}

impl Update {
    #[inline(always)]
    fn write(previous: u64, next: u64) -> Self {
        Self {
            next: Some(next),
            result: previous,
        }
    }
}

impl FusedOp {
    #[inline]
    pub fn lower(request: &OperationRequest) -> Self {
        let OperationRequest {
            ty,
            op,
            operand,
            comparand,
            ..
        } = *request;
        match op {
            OperationId::Store => Self::Memory(MemoryOp::Store, ty.canonicalize(operand)),
            OperationId::Load => Self::Memory(MemoryOp::Load, operand),
            OperationId::Exchange => Self::Memory(MemoryOp::Exchange, ty.canonicalize(operand)),
            OperationId::And => Self::Bitwise(BitwiseOp::And, operand),
            OperationId::Or => Self::Bitwise(BitwiseOp::Or, operand),
            OperationId::Xor => Self::Bitwise(BitwiseOp::Xor, operand),
            OperationId::FetchAdd => Self::Add(ty, operand),
            OperationId::FetchSub => Self::Sub(ty, operand),
            OperationId::Min => Self::Min(ty, operand),
            OperationId::Max => Self::Max(ty, operand),
            OperationId::CompareExchange => Self::CompareExchange {
                ty,
                expected: comparand,
                desired: operand,
            },
        }
    }

    pub fn group(&self) -> FusedGroup {
        match self {
            Self::Add(..) => FusedGroup::Add,
            Self::Sub(..) => FusedGroup::Sub,
            Self::Max(..) => FusedGroup::Max,
            Self::Min(..) => FusedGroup::Min,
            Self::Bitwise(..) => FusedGroup::Bitwise,
            Self::CompareExchange { .. } => FusedGroup::CompareExchange,
            Self::Memory(..) => FusedGroup::Memory,
        }
    }

    /// Computes the read-modify-write step for the value `current` read under the lock.
    #[inline]
    pub fn apply(&self, current: u64, math: &dyn Float64Math) -> Update {
        match *self {
            Self::Add(ty, operand) => {
                Update::write(current, arithmetic(ty, current, operand, math, Arith::Add))
            }
            Self::Sub(ty, operand) => {
                Update::write(current, arithmetic(ty, current, operand, math, Arith::Sub))
            }
            Self::Max(ty, operand) => {
                Update::write(current, arithmetic(ty, current, operand, math, Arith::Max))
            }
            Self::Min(ty, operand) => {
                Update::write(current, arithmetic(ty, current, operand, math, Arith::Min))
            }
            Self::Bitwise(op, operand) => {
                let next = match op {
                    BitwiseOp::And => current & operand,
                    BitwiseOp::Or => current | operand,
                    BitwiseOp::Xor => current ^ operand,
                };
                Update::write(current, next)
            }
            Self::CompareExchange {
                ty,
                expected,
                desired,
            } => {
                if ty.canonicalize(current) == ty.canonicalize(expected) {
                    Update::write(current, ty.canonicalize(desired))
                } else {
                    Update {
                        next: None,
                        result: current,
                    }
                }
            }
            Self::Memory(MemoryOp::Load, _) => Update {
                next: None,
                result: current,
            },
            Self::Memory(MemoryOp::Store | MemoryOp::Exchange, operand) => {
                Update::write(current, operand)
            }
        }
    }

    /// Whether a compare-exchange with this op succeeded, given the value it returned.
    pub fn succeeded(&self, previous: u64) -> bool {
        match *self {
            Self::CompareExchange { ty, expected, .. } => {
                ty.canonicalize(previous) == ty.canonicalize(expected)
            }
            _ => true,
        }
    }
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Max,
    Min,
}

#[inline(always)]
fn arithmetic(ty: TypeId, current: u64, operand: u64, math: &dyn Float64Math, arith: Arith) -> u64 {
    match ty {
        TypeId::I64 | TypeId::U64 => match arith {
            Arith::Add => current.wrapping_add(operand),
            Arith::Sub => current.wrapping_sub(operand),
            Arith::Max if ty == TypeId::I64 => (current as i64).max(operand as i64) as u64,
            Arith::Min if ty == TypeId::I64 => (current as i64).min(operand as i64) as u64,
            Arith::Max => current.max(operand),
            Arith::Min => current.min(operand),
        },
        TypeId::F64 | TypeId::F59 | TypeId::F43 => {
            let lhs = f64::from_bits(ty.canonicalize(current));
            let rhs = f64::from_bits(ty.canonicalize(operand));
            let result = match arith {
                Arith::Add => math.add(lhs, rhs),
                Arith::Sub => math.sub(lhs, rhs),
                Arith::Max => math.max(lhs, rhs),
                Arith::Min => math.min(lhs, rhs),
            };
            ty.canonicalize(result.to_bits())
        }
    }
}

/// Runs one fused step on `cell` while holding its slot.
#[inline(always)]
pub(crate) fn step(
    cell: SplitCell<'_>,
    guard: &SlotGuard<'_>,
    op: &FusedOp,
    math: &dyn Float64Math,
) -> u64 {
    let current = cell.load(guard);
    let update = op.apply(current, math);
    if let Some(next) = update.next {
        cell.store(next, guard);
    }
    update.result
}

/// The entry points of a generated library, bound to its lock table.
///
/// Every operation takes the address of an 8-byte aligned value, hashes it to a slot,
/// spins on that slot until it is acquired, performs the read-modify-write on the split
/// halves and releases the slot. This is the per-thread path for threads that are not
/// lockstepped; see [`crate::warp`] for lockstep groups.
#[derive(Clone, Copy)]
pub struct Atomics<'a> {
    locks: LockTable<'a>,
    math: &'a dyn Float64Math,
}

impl core::fmt::Debug for Atomics<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Atomics")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl<'a> Atomics<'a> {
    pub fn new(locks: LockTable<'a>, math: &'a dyn Float64Math) -> Self {
        Self { locks, math }
    }

    pub fn locks(&self) -> &LockTable<'a> {
        &self.locks
    }

    pub fn math(&self) -> &'a dyn Float64Math {
        self.math
    }

    #[inline(never)]
    unsafe fn fused(&self, object: *mut u64, op: FusedOp) -> u64 {
        let guard = SlotGuard::acquire(self.locks.lock_for(object.addr()));
        // SAFETY: forwarded from the public entry points.
        let cell = unsafe { SplitCell::from_ptr(object) };
        step(cell, &guard, &op, self.math)
    }

    /// Executes a request and returns the value the operation yields: the previous value
    /// for every operation except load, which returns the current value.
    ///
    /// # Safety
    ///
    /// `request.address` must point to an 8-byte aligned value that is valid for reads and
    /// writes and only accessed through these entry points while the call runs.
    pub unsafe fn execute(&self, request: &OperationRequest) -> u64 {
        let object = core::ptr::with_exposed_provenance_mut::<u64>(request.address);
        unsafe { self.fused(object, FusedOp::lower(request)) }
    }

    /// Like [`Atomics::execute`], but a compare-exchange that did not replace the value
    /// returns the previous value as `Err`.
    ///
    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn execute_checked(&self, request: &OperationRequest) -> Result<u64, u64> {
        let object = core::ptr::with_exposed_provenance_mut::<u64>(request.address);
        let op = FusedOp::lower(request);
        let previous = unsafe { self.fused(object, op) };
        if op.succeeded(previous) {
            Ok(previous)
        } else {
            Err(previous)
        }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`]; `object` takes the place of the request address.
    pub unsafe fn store(&self, object: *mut u64, value: u64) {
        unsafe { self.fused(object, FusedOp::Memory(MemoryOp::Store, value)) };
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn load(&self, object: *mut u64) -> u64 {
        unsafe { self.fused(object, FusedOp::Memory(MemoryOp::Load, 0)) }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn exchange(&self, object: *mut u64, value: u64) -> u64 {
        unsafe { self.fused(object, FusedOp::Memory(MemoryOp::Exchange, value)) }
    }

    /// Adds `operand` interpreted as `ty`, returning the previous value.
    ///
    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn fetch_add(&self, object: *mut u64, operand: u64, ty: TypeId) -> u64 {
        unsafe { self.fused(object, FusedOp::Add(ty, operand)) }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn fetch_sub(&self, object: *mut u64, operand: u64, ty: TypeId) -> u64 {
        unsafe { self.fused(object, FusedOp::Sub(ty, operand)) }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn fetch_max(&self, object: *mut u64, operand: u64, ty: TypeId) -> u64 {
        unsafe { self.fused(object, FusedOp::Max(ty, operand)) }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn fetch_min(&self, object: *mut u64, operand: u64, ty: TypeId) -> u64 {
        unsafe { self.fused(object, FusedOp::Min(ty, operand)) }
    }

    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn fetch_bitwise(&self, object: *mut u64, op: BitwiseOp, operand: u64) -> u64 {
        unsafe { self.fused(object, FusedOp::Bitwise(op, operand)) }
    }

    /// Replaces the value with `desired` if its bits equal `expected`. Both are brought
    /// into `ty`'s canonical form first.
    ///
    /// # Safety
    ///
    /// See [`Atomics::execute`].
    pub unsafe fn compare_exchange(
        &self,
        object: *mut u64,
        expected: u64,
        desired: u64,
        ty: TypeId,
    ) -> Result<u64, u64> {
        let op = FusedOp::CompareExchange {
            ty,
            expected,
            desired,
        };
        let previous = unsafe { self.fused(object, op) };
        if op.succeeded(previous) {
            Ok(previous)
        } else {
            Err(previous)
        }
    }
}
