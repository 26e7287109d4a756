//! Type and operation tags, and the request a dispatch carries.

use crate::float::{F43, F59};
use core::fmt;

/// Numeric interpretation of a 64-bit payload.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    /// Signed 64-bit integer.
    I64 = 0,
    /// Unsigned 64-bit integer.
    U64 = 1,
    /// IEEE double precision.
    F64 = 2,
    /// 59-bit reduced precision.
    F59 = 3,
    /// 43-bit reduced precision.
    F43 = 4,
}

impl TypeId {
    pub const ALL: [TypeId; 5] = [Self::I64, Self::U64, Self::F64, Self::F59, Self::F43];

    /// Decodes a raw tag, rejecting unknown values.
    pub const fn from_raw(raw: u16) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => Self::I64,
            1 => Self::U64,
            2 => Self::F64,
            3 => Self::F59,
            4 => Self::F43,
            _ => return Err(DecodeError::Type(raw)),
        })
    }

    /// Decodes a raw tag without checking it.
    ///
    /// # Safety
    ///
    /// `raw` must be one of the tags in [`TypeId::ALL`].
    #[inline(always)]
    pub const unsafe fn from_raw_unchecked(raw: u16) -> Self {
        match Self::from_raw(raw) {
            Ok(ty) => ty,
            Err(_) => {
                if cfg!(debug_assertions) {
                    panic!("unknown atomic type id");
                }
                // SAFETY: guaranteed by the caller.
                unsafe { core::hint::unreachable_unchecked() }
            }
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F59 | Self::F43)
    }

    /// Brings a bit pattern into this type's canonical form. Reduced-precision formats
    /// drop their unused mantissa bits; everything else is unchanged.
    #[inline(always)]
    pub const fn canonicalize(self, bits: u64) -> u64 {
        match self {
            Self::F59 => F59::truncate_bits(bits),
            Self::F43 => F43::truncate_bits(bits),
            _ => bits,
        }
    }
}

/// Operation selector.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationId {
    Store = 0,
    Load = 1,
    Exchange = 2,
    And = 3,
    Or = 4,
    Xor = 5,
    FetchAdd = 6,
    FetchSub = 7,
    Min = 8,
    Max = 9,
    CompareExchange = 10,
}

impl OperationId {
    pub const ALL: [OperationId; 11] = [
        Self::Store,
        Self::Load,
        Self::Exchange,
        Self::And,
        Self::Or,
        Self::Xor,
        Self::FetchAdd,
        Self::FetchSub,
        Self::Min,
        Self::Max,
        Self::CompareExchange,
    ];

    /// Decodes a raw tag, rejecting unknown values.
    pub const fn from_raw(raw: u16) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => Self::Store,
            1 => Self::Load,
            2 => Self::Exchange,
            3 => Self::And,
            4 => Self::Or,
            5 => Self::Xor,
            6 => Self::FetchAdd,
            7 => Self::FetchSub,
            8 => Self::Min,
            9 => Self::Max,
            10 => Self::CompareExchange,
            _ => return Err(DecodeError::Operation(raw)),
        })
    }

    /// Decodes a raw tag without checking it.
    ///
    /// # Safety
    ///
    /// `raw` must be one of the tags in [`OperationId::ALL`].
    #[inline(always)]
    pub const unsafe fn from_raw_unchecked(raw: u16) -> Self {
        match Self::from_raw(raw) {
            Ok(op) => op,
            Err(_) => {
                if cfg!(debug_assertions) {
                    panic!("unknown atomic operation id");
                }
                // SAFETY: guaranteed by the caller.
                unsafe { core::hint::unreachable_unchecked() }
            }
        }
    }
}

/// A raw tag that names no known type or operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Type(u16),
    Operation(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Type(raw) => write!(f, "unknown atomic type id {raw}"),
            DecodeError::Operation(raw) => write!(f, "unknown atomic operation id {raw}"),
        }
    }
}

impl core::error::Error for DecodeError {}

/// A 64-bit payload together with its type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedValue {
    I64(i64),
    U64(u64),
    F64(f64),
    F59(F59),
    F43(F43),
}

impl TypedValue {
    pub fn from_bits(ty: TypeId, bits: u64) -> Self {
        match ty {
            TypeId::I64 => Self::I64(bits as i64),
            TypeId::U64 => Self::U64(bits),
            TypeId::F64 => Self::F64(f64::from_bits(bits)),
            TypeId::F59 => Self::F59(F59::from_bits(bits)),
            TypeId::F43 => Self::F43(F43::from_bits(bits)),
        }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            Self::I64(_) => TypeId::I64,
            Self::U64(_) => TypeId::U64,
            Self::F64(_) => TypeId::F64,
            Self::F59(_) => TypeId::F59,
            Self::F43(_) => TypeId::F43,
        }
    }

    pub fn to_bits(&self) -> u64 {
        match *self {
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::F64(v) => v.to_bits(),
            Self::F59(v) => v.to_bits(),
            Self::F43(v) => v.to_bits(),
        }
    }
}

/// One emulated atomic operation on the 8-byte aligned value at `address`.
///
/// `comparand` is only read by [`OperationId::CompareExchange`], where `operand` is the
/// desired value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRequest {
    pub address: usize,
    pub ty: TypeId,
    pub op: OperationId,
    pub operand: u64,
    pub comparand: u64,
}

impl OperationRequest {
    pub fn new(address: usize, ty: TypeId, op: OperationId, operand: u64) -> Self {
        Self {
            address,
            ty,
            op,
            operand,
            comparand: 0,
        }
    }

    pub fn compare_exchange(address: usize, ty: TypeId, expected: u64, desired: u64) -> Self {
        Self {
            address,
            ty,
            op: OperationId::CompareExchange,
            operand: desired,
            comparand: expected,
        }
    }

    /// Builds a request from raw tags, rejecting unknown ones.
    pub fn decode(
        address: usize,
        ty: u16,
        op: u16,
        operand: u64,
        comparand: u64,
    ) -> Result<Self, DecodeError> {
        Ok(Self {
            address,
            ty: TypeId::from_raw(ty)?,
            op: OperationId::from_raw(op)?,
            operand,
            comparand,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tags_round_trip() {
        for ty in TypeId::ALL {
            assert_eq!(TypeId::from_raw(ty as u16), Ok(ty));
        }
        for op in OperationId::ALL {
            assert_eq!(OperationId::from_raw(op as u16), Ok(op));
        }
    }

    #[test]
    fn unknown_tags_rejected() {
        assert_eq!(TypeId::from_raw(5), Err(DecodeError::Type(5)));
        assert_eq!(OperationId::from_raw(11), Err(DecodeError::Operation(11)));
        assert_eq!(
            OperationRequest::decode(0, 0, 99, 1, 0),
            Err(DecodeError::Operation(99))
        );
        assert_eq!(
            DecodeError::Type(7).to_string(),
            "unknown atomic type id 7"
        );
    }

    #[test]
    fn canonicalize_only_touches_reduced_formats() {
        let bits = (1.0f64 + f64::EPSILON).to_bits();
        assert_eq!(TypeId::I64.canonicalize(bits), bits);
        assert_eq!(TypeId::F64.canonicalize(bits), bits);
        assert_eq!(TypeId::F59.canonicalize(bits), 1.0f64.to_bits());
        assert_eq!(TypeId::F43.canonicalize(bits), 1.0f64.to_bits());
    }

    #[test]
    fn typed_value_bits() {
        let value = TypedValue::from_bits(TypeId::I64, u64::MAX);
        assert_eq!(value, TypedValue::I64(-1));
        assert_eq!(value.to_bits(), u64::MAX);
        assert_eq!(TypedValue::F64(2.0).type_id(), TypeId::F64);
    }
}
