//! Typed 64-bit atomic cells backed by the lock table.
//!
//! Each cell is two 32-bit atomic words at an 8-byte aligned address. Every operation
//! runs through an [`Atomics`] handle, and all accesses to one cell must go through
//! handles sharing the same lock table for the cell to behave atomically. Mixing tables
//! can tear values but never causes undefined behavior, since both halves are atomics.

use crate::dispatch::{Atomics, BitwiseOp};
use crate::float::{F43, F59};
use crate::types::TypeId;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use paste::paste;

/// A value that fits a 64-bit emulated atomic.
pub trait Atomic64Value: Copy {
    const TYPE: TypeId;

    fn to_bits(self) -> u64;

    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_value {
    ($ty:ty, $id:ident, |$v:ident| $to:expr, |$b:ident| $from:expr) => {
        impl Atomic64Value for $ty {
            const TYPE: TypeId = TypeId::$id;

            #[inline(always)]
            fn to_bits(self) -> u64 {
                let $v = self;
                $to
            }

            #[inline(always)]
            fn from_bits(bits: u64) -> Self {
                let $b = bits;
                $from
            }
        }
    };
}

impl_value!(i64, I64, |v| v as u64, |b| b as i64);
impl_value!(u64, U64, |v| v, |b| b);
impl_value!(f64, F64, |v| v.to_bits(), |b| f64::from_bits(b));
impl_value!(F59, F59, |v| v.to_bits(), |b| F59::from_bits(b));
impl_value!(F43, F43, |v| v.to_bits(), |b| F43::from_bits(b));

macro_rules! emulated_atomic {
    ($value_ty:ident, $name:ident $(, $bitwise:ident)?) => {
        paste! {
            #[doc = concat!(
                "An emulated atomic [`", stringify!($value_ty),
                "`] made of two 32-bit atomic words."
            )]
            ///
            /// The low-order half is stored first, so the layout matches a little endian
            #[doc = concat!("`", stringify!($value_ty), "` at the same address.")]
            #[repr(C, align(8))]
            pub struct $name {
                halves: [AtomicU32; 2],
            }

            impl $name {
                pub const fn new(value: $value_ty) -> Self {
                    let bits = [<$value_ty:lower _bits>](value);
                    Self {
                        halves: [AtomicU32::new(bits as u32), AtomicU32::new((bits >> 32) as u32)],
                    }
                }

                pub fn into_inner(self) -> $value_ty {
                    let [lo, hi] = self.halves;
                    let bits = u64::from(lo.into_inner()) | (u64::from(hi.into_inner()) << 32);
                    <$value_ty as Atomic64Value>::from_bits(bits)
                }

                /// The address operations on this cell are hashed by.
                pub fn as_ptr(&self) -> *mut u64 {
                    self.halves[0].as_ptr().cast()
                }

                pub fn load(&self, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: the cell is aligned and only accessed atomically.
                    <$value_ty as Atomic64Value>::from_bits(unsafe { atomics.load(self.as_ptr()) })
                }

                pub fn store(&self, value: $value_ty, atomics: &Atomics<'_>) {
                    // SAFETY: as in `load`.
                    unsafe { atomics.store(self.as_ptr(), value.to_bits()) }
                }

                pub fn swap(&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: as in `load`.
                    let previous = unsafe { atomics.exchange(self.as_ptr(), value.to_bits()) };
                    <$value_ty>::from_bits(previous)
                }

                /// Adds to the current value, returning the previous value.
                pub fn fetch_add(&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: as in `load`.
                    <$value_ty>::from_bits(unsafe {
                        atomics.fetch_add(self.as_ptr(), value.to_bits(), <$value_ty>::TYPE)
                    })
                }

                /// Subtracts from the current value, returning the previous value.
                pub fn fetch_sub(&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: as in `load`.
                    <$value_ty>::from_bits(unsafe {
                        atomics.fetch_sub(self.as_ptr(), value.to_bits(), <$value_ty>::TYPE)
                    })
                }

                /// Stores the maximum of the current value and `value`, returning the
                /// previous value.
                pub fn fetch_max(&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: as in `load`.
                    <$value_ty>::from_bits(unsafe {
                        atomics.fetch_max(self.as_ptr(), value.to_bits(), <$value_ty>::TYPE)
                    })
                }

                /// Stores the minimum of the current value and `value`, returning the
                /// previous value.
                pub fn fetch_min(&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                    // SAFETY: as in `load`.
                    <$value_ty>::from_bits(unsafe {
                        atomics.fetch_min(self.as_ptr(), value.to_bits(), <$value_ty>::TYPE)
                    })
                }

                /// Stores `new` if the current value has the same bits as `current`.
                ///
                /// Returns the previous value, wrapped in `Ok` on success and `Err` on failure.
                pub fn compare_exchange(
                    &self,
                    current: $value_ty,
                    new: $value_ty,
                    atomics: &Atomics<'_>,
                ) -> Result<$value_ty, $value_ty> {
                    // SAFETY: as in `load`.
                    unsafe {
                        atomics.compare_exchange(
                            self.as_ptr(),
                            current.to_bits(),
                            new.to_bits(),
                            <$value_ty>::TYPE,
                        )
                    }
                    .map(<$value_ty>::from_bits)
                    .map_err(<$value_ty>::from_bits)
                }

                $(
                    emulated_atomic!(@$bitwise $value_ty, and, And);
                    emulated_atomic!(@$bitwise $value_ty, or, Or);
                    emulated_atomic!(@$bitwise $value_ty, xor, Xor);
                )?
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let lo = self.halves[0].load(Ordering::Relaxed);
                    let hi = self.halves[1].load(Ordering::Relaxed);
                    let value = <$value_ty>::from_bits(u64::from(lo) | (u64::from(hi) << 32));
                    f.debug_tuple(stringify!($name)).field(&value).finish()
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new(<$value_ty>::default())
                }
            }

            impl From<$value_ty> for $name {
                fn from(value: $value_ty) -> Self {
                    Self::new(value)
                }
            }
        }
    };
    (@bitwise $value_ty:ident, $op:ident, $variant:ident) => {
        paste! {
            #[doc = concat!(
                "Bitwise ", stringify!($op),
                " with the current value, returning the previous value."
            )]
            pub fn [<fetch_ $op>](&self, value: $value_ty, atomics: &Atomics<'_>) -> $value_ty {
                // SAFETY: as in `load`.
                <$value_ty>::from_bits(unsafe {
                    atomics.fetch_bitwise(self.as_ptr(), BitwiseOp::$variant, value.to_bits())
                })
            }
        }
    };
}

// `const` bit conversions for `new`.
const fn i64_bits(value: i64) -> u64 {
    value as u64
}

const fn u64_bits(value: u64) -> u64 {
    value
}

const fn f64_bits(value: f64) -> u64 {
    value.to_bits()
}

const fn f59_bits(value: F59) -> u64 {
    value.to_bits()
}

const fn f43_bits(value: F43) -> u64 {
    value.to_bits()
}

emulated_atomic!(i64, EmulatedAtomicI64, bitwise);
emulated_atomic!(u64, EmulatedAtomicU64, bitwise);
emulated_atomic!(f64, EmulatedAtomicF64);
emulated_atomic!(F59, EmulatedAtomicF59);
emulated_atomic!(F43, EmulatedAtomicF43);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::float::HostFloat64;
    use crate::hash::SlotHasher;
    use crate::lock::LockTable;

    #[repr(C, align(128))]
    struct Locks([AtomicU32; 32]);

    fn with_atomics(f: impl FnOnce(&Atomics<'_>)) {
        let locks = Locks(core::array::from_fn(|_| AtomicU32::new(0)));
        let table = LockTable::new(&locks.0, SlotHasher::new(5, 0x11)).unwrap();
        f(&Atomics::new(table, &HostFloat64));
    }

    #[test]
    fn layout_matches_native_u64() {
        assert_eq!(core::mem::size_of::<EmulatedAtomicU64>(), 8);
        assert_eq!(core::mem::align_of::<EmulatedAtomicF43>(), 8);
        let cell = EmulatedAtomicU64::new(0x0123_4567_89AB_CDEF);
        assert_eq!(unsafe { cell.as_ptr().read() }, 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn integer_cells() {
        with_atomics(|atomics| {
            let cell = EmulatedAtomicI64::new(-5);
            assert_eq!(cell.fetch_add(7, atomics), -5);
            assert_eq!(cell.fetch_max(-10, atomics), 2);
            assert_eq!(cell.fetch_min(-10, atomics), 2);
            assert_eq!(cell.fetch_xor(-1, atomics), -10);
            assert_eq!(cell.compare_exchange(0, 1, atomics), Err(9));
            assert_eq!(cell.compare_exchange(9, 1, atomics), Ok(9));
            assert_eq!(cell.into_inner(), 1);

            let cell = EmulatedAtomicU64::default();
            assert_eq!(cell.fetch_sub(1, atomics), 0);
            assert_eq!(cell.fetch_and(0xFF, atomics), u64::MAX);
            assert_eq!(cell.fetch_or(0x100, atomics), 0xFF);
            assert_eq!(cell.swap(3, atomics), 0x1FF);
            assert_eq!(cell.load(atomics), 3);
        });
    }

    #[test]
    fn float_cells() {
        with_atomics(|atomics| {
            let cell = EmulatedAtomicF64::new(1.5);
            assert_eq!(cell.fetch_add(0.25, atomics), 1.5);
            assert_eq!(cell.fetch_sub(1.0, atomics), 1.75);
            assert_eq!(cell.fetch_max(f64::NAN, atomics), 0.75);
            assert_eq!(cell.load(atomics), 0.75);

            let third = F43::from_f64(1.0 / 3.0);
            let cell = EmulatedAtomicF43::new(third);
            cell.fetch_add(third, atomics);
            let expected = F43::from_f64(third.to_f64() + third.to_f64());
            assert_eq!(cell.load(atomics).to_bits(), expected.to_bits());

            let cell = EmulatedAtomicF59::new(F59::from_f64(2.0));
            assert_eq!(cell.fetch_min(F59::from_f64(-1.0), atomics).to_f64(), 2.0);
            assert_eq!(cell.load(atomics).to_f64(), -1.0);
        });
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let locks = Locks(core::array::from_fn(|_| AtomicU32::new(0)));
        let table = LockTable::new(&locks.0, SlotHasher::new(5, 0x11)).unwrap();
        let atomics = Atomics::new(table, &HostFloat64);
        // values straddling the 32-bit boundary exercise carries between halves
        let cell = EmulatedAtomicU64::new(u64::from(u32::MAX) - 1000);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        cell.fetch_add(1, &atomics);
                    }
                });
            }
        });
        assert_eq!(cell.load(&atomics), u64::from(u32::MAX) + 7000);
    }
}
