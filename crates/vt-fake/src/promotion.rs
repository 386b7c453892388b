use crate::{Dim, FakeError, Shape, format_shape};
use vt_core::DType;

const DEFAULT_FLOAT: DType = DType::F32;

fn category(dtype: DType) -> u8 {
    if dtype == DType::Bool {
        0
    } else if dtype.is_integral() {
        1
    } else if dtype.is_floating() {
        2
    } else {
        3
    }
}

fn width(dtype: DType) -> u8 {
    match dtype {
        DType::Bool => 0,
        DType::U8 => 1,
        DType::I32 => 2,
        DType::I64 => 3,
        DType::F16 => 4,
        DType::F32 => 5,
        DType::F64 => 6,
        DType::Complex64 => 7,
    }
}

/// Result dtype of a binary operation on two tensors.
#[must_use]
pub fn promote_types(lhs: DType, rhs: DType) -> DType {
    match category(lhs).cmp(&category(rhs)) {
        std::cmp::Ordering::Greater => lhs,
        std::cmp::Ordering::Less => rhs,
        std::cmp::Ordering::Equal => {
            if width(lhs) >= width(rhs) {
                lhs
            } else {
                rhs
            }
        }
    }
}

/// Tensor/scalar promotion: the tensor keeps its dtype unless the scalar
/// belongs to a higher category.
#[must_use]
pub fn promote_with_scalar(tensor: DType, scalar_is_float: bool, scalar_is_bool: bool) -> DType {
    if scalar_is_float && category(tensor) < 2 {
        DEFAULT_FLOAT
    } else if !scalar_is_float && !scalar_is_bool && tensor == DType::Bool {
        DType::I64
    } else {
        tensor
    }
}

/// Floating result dtype for transcendental ops.
#[must_use]
pub fn to_floating(dtype: DType) -> DType {
    if category(dtype) < 2 {
        DEFAULT_FLOAT
    } else {
        dtype
    }
}

/// Right-aligned broadcast of two shapes. A symbolic dimension meeting a
/// static one of equal hint specializes to the static size.
pub fn broadcast_shapes(op: &str, lhs: &[Dim], rhs: &[Dim]) -> Result<Shape, FakeError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = Shape::with_capacity(rank);
    for idx in 0..rank {
        let l = lhs
            .len()
            .checked_sub(rank - idx)
            .map_or(Dim::Static(1), |i| lhs[i]);
        let r = rhs
            .len()
            .checked_sub(rank - idx)
            .map_or(Dim::Static(1), |i| rhs[i]);
        out.push(broadcast_dim(l, r).ok_or_else(|| FakeError::ShapeMismatch {
            op: op.to_owned(),
            left: format_shape(lhs),
            right: format_shape(rhs),
        })?);
    }
    Ok(out)
}

fn broadcast_dim(l: Dim, r: Dim) -> Option<Dim> {
    match (l, r) {
        _ if l == r => Some(l),
        (Dim::Static(1), other) | (other, Dim::Static(1)) => Some(other),
        (Dim::Static(_), Dim::Static(_)) => None,
        (Dim::Static(size), Dim::Symbolic(sym)) | (Dim::Symbolic(sym), Dim::Static(size)) => {
            (sym.hint == Some(size)).then_some(Dim::Static(size))
        }
        (Dim::Symbolic(a), Dim::Symbolic(b)) => (a.hint.is_some() && a.hint == b.hint).then_some(l),
    }
}

/// Dimensions agree for contraction.
#[must_use]
pub fn dims_agree(lhs: Dim, rhs: Dim) -> bool {
    lhs == rhs || (lhs.hint().is_some() && lhs.hint() == rhs.hint())
}

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize, FakeError> {
    let rank_i = i64::try_from(rank).unwrap_or(i64::MAX);
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if resolved < 0 || resolved >= rank_i.max(1) {
        return Err(FakeError::IndexOutOfRange {
            op: op.to_owned(),
            index: axis,
            len: rank,
        });
    }
    usize::try_from(resolved).map_err(|_| FakeError::IndexOutOfRange {
        op: op.to_owned(),
        index: axis,
        len: rank,
    })
}

#[cfg(test)]
mod tests {
    use super::{broadcast_shapes, normalize_axis, promote_types, promote_with_scalar};
    use crate::Dim;
    use vt_core::{DType, SymInt, SymbolId};

    #[test]
    fn promotion_follows_category_then_width() {
        assert_eq!(promote_types(DType::I32, DType::F16), DType::F16);
        assert_eq!(promote_types(DType::U8, DType::I64), DType::I64);
        assert_eq!(promote_types(DType::F64, DType::F32), DType::F64);
        assert_eq!(promote_types(DType::Bool, DType::U8), DType::U8);
        assert_eq!(promote_types(DType::Complex64, DType::F64), DType::Complex64);
    }

    #[test]
    fn scalar_promotion_keeps_tensor_dtype() {
        assert_eq!(promote_with_scalar(DType::F16, true, false), DType::F16);
        assert_eq!(promote_with_scalar(DType::I64, true, false), DType::F32);
        assert_eq!(promote_with_scalar(DType::Bool, false, false), DType::I64);
        assert_eq!(promote_with_scalar(DType::I32, false, false), DType::I32);
    }

    #[test]
    fn broadcast_aligns_right_and_specializes_matching_hints() {
        let out = broadcast_shapes("add", &[Dim::Static(4), Dim::Static(1)], &[Dim::Static(3)])
            .expect("broadcastable");
        assert_eq!(out.as_slice(), &[Dim::Static(4), Dim::Static(3)]);

        let sym = Dim::Symbolic(SymInt {
            symbol: SymbolId(0),
            hint: Some(3),
        });
        let out = broadcast_shapes("add", &[sym], &[Dim::Static(3)]).expect("hint matches");
        assert_eq!(out.as_slice(), &[Dim::Static(3)]);

        assert!(broadcast_shapes("add", &[Dim::Static(2)], &[Dim::Static(3)]).is_err());
    }

    #[test]
    fn negative_axes_wrap() {
        assert_eq!(normalize_axis("sum", -1, 3).expect("valid"), 2);
        assert!(normalize_axis("sum", 3, 3).is_err());
    }
}
