//! Floating point support for the emulated atomics.
//!
//! Arithmetic on floating point payloads goes through [`Float64Math`], the seam to the
//! numeric-support library a generated atomics library is linked against. The two
//! reduced-precision formats keep the IEEE double sign and exponent and drop low
//! mantissa bits, so every reduced value is also a valid double bit pattern.

use core::fmt;

/// Double precision helpers supplied by the numeric-support library.
pub trait Float64Math: Send + Sync {
    fn add(&self, lhs: f64, rhs: f64) -> f64;

    fn sub(&self, lhs: f64, rhs: f64) -> f64;

    /// Minimum of two values. A NaN operand yields the other operand.
    fn min(&self, lhs: f64, rhs: f64) -> f64;

    /// Maximum of two values. A NaN operand yields the other operand.
    fn max(&self, lhs: f64, rhs: f64) -> f64;
}

/// [`Float64Math`] backed by the host's native double precision unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFloat64;

impl Float64Math for HostFloat64 {
    #[inline]
    fn add(&self, lhs: f64, rhs: f64) -> f64 {
        lhs + rhs
    }

    #[inline]
    fn sub(&self, lhs: f64, rhs: f64) -> f64 {
        lhs - rhs
    }

    #[inline]
    fn min(&self, lhs: f64, rhs: f64) -> f64 {
        lhs.min(rhs)
    }

    #[inline]
    fn max(&self, lhs: f64, rhs: f64) -> f64 {
        lhs.max(rhs)
    }
}

const F64_MANTISSA_BITS: u32 = 52;
const F64_EXPONENT_MASK: u64 = 0x7FF0_0000_0000_0000;
const F64_QUIET_BIT: u64 = 1 << (F64_MANTISSA_BITS - 1);

macro_rules! reduced_float {
    ($name:ident, $total:literal, $mantissa:literal) => {
        #[doc = concat!(
            "A ", stringify!($total), "-bit float: 1 sign bit, 11 exponent bits and ",
            stringify!($mantissa), " mantissa bits."
        )]
        ///
        /// Stored as an IEEE double whose dropped low mantissa bits are zero. Converting
        /// from `f64` truncates toward zero.
        #[derive(Clone, Copy, Default, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $name(f64);

        impl $name {
            /// Stored mantissa bits.
            pub const MANTISSA_BITS: u32 = $mantissa;
            /// Low double mantissa bits that are always zero.
            pub const DROPPED_BITS: u32 = F64_MANTISSA_BITS - $mantissa;
            const KEEP_MASK: u64 = !((1u64 << Self::DROPPED_BITS) - 1);

            /// Truncates a double bit pattern to this format.
            #[inline(always)]
            pub const fn truncate_bits(bits: u64) -> u64 {
                let kept = bits & Self::KEEP_MASK;
                let is_nan = bits & F64_EXPONENT_MASK == F64_EXPONENT_MASK
                    && bits & !F64_EXPONENT_MASK & !(1 << 63) != 0;
                if is_nan && kept & !F64_EXPONENT_MASK & !(1 << 63) == 0 {
                    // the payload was entirely in the dropped bits; keep it a NaN
                    kept | F64_QUIET_BIT
                } else {
                    kept
                }
            }

            #[inline(always)]
            pub const fn from_f64(value: f64) -> Self {
                Self(f64::from_bits(Self::truncate_bits(value.to_bits())))
            }

            #[inline(always)]
            pub const fn to_f64(self) -> f64 {
                self.0
            }

            /// Reinterprets a 64-bit pattern, truncating any dropped bits.
            #[inline(always)]
            pub const fn from_bits(bits: u64) -> Self {
                Self(f64::from_bits(Self::truncate_bits(bits)))
            }

            #[inline(always)]
            pub const fn to_bits(self) -> u64 {
                self.0.to_bits()
            }
        }

        impl From<f64> for $name {
            fn from(value: f64) -> Self {
                Self::from_f64(value)
            }
        }

        impl From<$name> for f64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

reduced_float!(F59, 59, 47);
reduced_float!(F43, 43, 31);
