//! Element types, buffer layouts and accumulate operators understood by the engine.
//!
//! Datatype description proper belongs to the surrounding runtime; the engine only needs to know
//! the element kind, where each element lives in the target window, and how to combine two elements.
use serde::{Deserialize, Serialize};

use crate::error::{RmaError, RmaResult};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    U8,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElemType {
    pub fn size(&self) -> usize {
        match self {
            ElemType::U8 => 1,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElemType::F32 | ElemType::F64)
    }
}

/// Types that can be moved through an RMA window.
pub trait Element: Copy + PartialEq + std::fmt::Debug + 'static {
    const ELEM: ElemType;
    fn read_bytes(bytes: &[u8]) -> Self;
    fn store(self, out: &mut [u8]);
    fn extend_bytes(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($t:ty, $e:ident) => {
        impl Element for $t {
            const ELEM: ElemType = ElemType::$e;
            fn read_bytes(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_ne_bytes(raw)
            }
            fn store(self, out: &mut [u8]) {
                out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_ne_bytes());
            }
            fn extend_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
        }
    };
}

impl_element!(u8, U8);
impl_element!(i32, I32);
impl_element!(u32, U32);
impl_element!(i64, I64);
impl_element!(u64, U64);
impl_element!(f32, F32);
impl_element!(f64, F64);

pub(crate) fn to_bytes<T: Element>(vals: &[T]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vals.len() * T::ELEM.size());
    for v in vals {
        v.extend_bytes(&mut bytes);
    }
    bytes
}

pub(crate) fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::ELEM.size())
        .map(|c| T::read_bytes(c))
        .collect()
}

/// Layout of a buffer in a window.
///
/// `Contiguous` is a basic datatype, `Vector` is the only derived layout the engine supports:
/// `blocklen` consecutive elements followed by a gap, repeating every `stride` elements.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Contiguous(ElemType),
    Vector {
        elem: ElemType,
        blocklen: usize,
        stride: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeClass {
    Basic,
    Derived,
}

impl Datatype {
    pub fn contiguous<T: Element>() -> Datatype {
        Datatype::Contiguous(T::ELEM)
    }

    pub fn vector<T: Element>(blocklen: usize, stride: usize) -> Datatype {
        Datatype::Vector {
            elem: T::ELEM,
            blocklen,
            stride,
        }
    }

    pub fn elem(&self) -> ElemType {
        match self {
            Datatype::Contiguous(elem) => *elem,
            Datatype::Vector { elem, .. } => *elem,
        }
    }

    pub fn class(&self) -> DatatypeClass {
        match self {
            Datatype::Contiguous(_) => DatatypeClass::Basic,
            Datatype::Vector { .. } => DatatypeClass::Derived,
        }
    }

    /// byte offset of the `index`-th element relative to the start of the buffer
    pub(crate) fn elem_offset(&self, index: usize) -> usize {
        let size = self.elem().size();
        match self {
            Datatype::Contiguous(_) => index * size,
            Datatype::Vector {
                blocklen, stride, ..
            } => ((index / blocklen) * stride + index % blocklen) * size,
        }
    }

    /// bytes spanned by `count` elements
    pub(crate) fn extent(&self, count: usize) -> usize {
        if count == 0 {
            0
        } else {
            self.elem_offset(count - 1) + self.elem().size()
        }
    }

    pub(crate) fn validate(&self) -> RmaResult<()> {
        match self {
            Datatype::Contiguous(_) => Ok(()),
            Datatype::Vector {
                blocklen, stride, ..
            } => {
                if *blocklen == 0 || stride < blocklen {
                    Err(RmaError::InvalidArgument(format!(
                        "vector datatype with blocklen {} and stride {}",
                        blocklen, stride
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Accumulate operators.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccOp {
    Sum,
    Prod,
    Min,
    Max,
    Band,
    Bor,
    Bxor,
    Replace,
    NoOp,
}

impl AccOp {
    pub(crate) fn valid_for(&self, elem: ElemType) -> bool {
        !(elem.is_float() && matches!(self, AccOp::Band | AccOp::Bor | AccOp::Bxor))
    }
}

trait Combine: Element {
    fn combine(self, other: Self, op: AccOp) -> Self;
}

macro_rules! int_combine {
    ($($t:ty),*) => {$(
        impl Combine for $t {
            fn combine(self, other: Self, op: AccOp) -> Self {
                match op {
                    AccOp::Sum => self.wrapping_add(other),
                    AccOp::Prod => self.wrapping_mul(other),
                    AccOp::Min => self.min(other),
                    AccOp::Max => self.max(other),
                    AccOp::Band => self & other,
                    AccOp::Bor => self | other,
                    AccOp::Bxor => self ^ other,
                    AccOp::Replace => other,
                    AccOp::NoOp => self,
                }
            }
        }
    )*};
}

macro_rules! float_combine {
    ($($t:ty),*) => {$(
        impl Combine for $t {
            fn combine(self, other: Self, op: AccOp) -> Self {
                match op {
                    AccOp::Sum => self + other,
                    AccOp::Prod => self * other,
                    AccOp::Min => self.min(other),
                    AccOp::Max => self.max(other),
                    AccOp::Replace => other,
                    // bitwise operators are rejected at enqueue time
                    AccOp::Band | AccOp::Bor | AccOp::Bxor | AccOp::NoOp => self,
                }
            }
        }
    )*};
}

int_combine!(u8, i32, u32, i64, u64);
float_combine!(f32, f64);

fn combine_in_place<T: Combine>(dst: &mut [u8], src: &[u8], op: AccOp) {
    let res = T::read_bytes(dst).combine(T::read_bytes(src), op);
    res.store(dst);
}

/// Combine one element of `src` into `dst`.
pub(crate) fn accumulate_elem(elem: ElemType, op: AccOp, dst: &mut [u8], src: &[u8]) {
    match elem {
        ElemType::U8 => combine_in_place::<u8>(dst, src, op),
        ElemType::I32 => combine_in_place::<i32>(dst, src, op),
        ElemType::U32 => combine_in_place::<u32>(dst, src, op),
        ElemType::I64 => combine_in_place::<i64>(dst, src, op),
        ElemType::U64 => combine_in_place::<u64>(dst, src, op),
        ElemType::F32 => combine_in_place::<f32>(dst, src, op),
        ElemType::F64 => combine_in_place::<f64>(dst, src, op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_offsets() {
        let dt = Datatype::vector::<i32>(2, 3);
        let offsets: Vec<usize> = (0..5).map(|i| dt.elem_offset(i)).collect();
        assert_eq!(offsets, vec![0, 4, 12, 16, 24]);
        assert_eq!(dt.extent(5), 28);
        assert_eq!(dt.class(), DatatypeClass::Derived);
        assert_eq!(Datatype::contiguous::<u64>().extent(3), 24);
    }

    #[test]
    fn bad_vector_rejected() {
        assert!(Datatype::vector::<i32>(0, 3).validate().is_err());
        assert!(Datatype::vector::<i32>(4, 3).validate().is_err());
    }

    #[test]
    fn integer_ops() {
        let mut dst = to_bytes(&[6i64]);
        accumulate_elem(ElemType::I64, AccOp::Sum, &mut dst, &to_bytes(&[4i64]));
        assert_eq!(from_bytes::<i64>(&dst), vec![10]);
        accumulate_elem(ElemType::I64, AccOp::Bxor, &mut dst, &to_bytes(&[3i64]));
        assert_eq!(from_bytes::<i64>(&dst), vec![9]);
        accumulate_elem(ElemType::I64, AccOp::NoOp, &mut dst, &to_bytes(&[100i64]));
        assert_eq!(from_bytes::<i64>(&dst), vec![9]);
        let mut dst = to_bytes(&[u8::MAX]);
        accumulate_elem(ElemType::U8, AccOp::Sum, &mut dst, &to_bytes(&[2u8]));
        assert_eq!(dst, vec![1]);
    }

    #[test]
    fn float_ops() {
        let mut dst = to_bytes(&[1.5f64]);
        accumulate_elem(ElemType::F64, AccOp::Prod, &mut dst, &to_bytes(&[2.0f64]));
        accumulate_elem(ElemType::F64, AccOp::Max, &mut dst, &to_bytes(&[2.5f64]));
        assert_eq!(from_bytes::<f64>(&dst), vec![3.0]);
        assert!(!AccOp::Bor.valid_for(ElemType::F32));
        assert!(AccOp::Bor.valid_for(ElemType::U32));
    }
}
