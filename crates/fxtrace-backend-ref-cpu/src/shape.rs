use fxtrace::value::SymKind;
use fxtrace::{DType, Dim, Literal, Op, SymScalar, TensorRef, TraceError, TraceResult, Value};

pub(crate) const EXECUTOR: &str = "ref-cpu";

pub(crate) fn fail(op: Op, message: impl Into<String>) -> TraceError {
    TraceError::kernel(EXECUTOR, op, message)
}

/// One argument of a pointwise kernel.
#[derive(Clone, Debug)]
pub(crate) enum Operand {
    Tensor(TensorRef),
    Scalar(Literal),
    Sym(SymScalar),
}

impl Operand {
    pub(crate) fn parse(op: Op, value: &Value) -> TraceResult<Operand> {
        match value {
            Value::Tensor(t) => Ok(Operand::Tensor(t.clone())),
            Value::Literal(lit) if lit.sym_kind().is_some() => Ok(Operand::Scalar(lit.clone())),
            Value::Sym(s) => Ok(match s.literal() {
                Some(lit) => Operand::Scalar(lit),
                None => Operand::Sym(s.clone()),
            }),
            other => Err(fail(op, format!("unsupported operand {}", other.type_name()))),
        }
    }

    pub(crate) fn sizes(&self) -> Vec<Dim> {
        match self {
            Operand::Tensor(t) => t.sizes(),
            _ => Vec::new(),
        }
    }

    fn scalar_kind(&self) -> Option<SymKind> {
        match self {
            Operand::Tensor(_) => None,
            Operand::Scalar(lit) => lit.sym_kind(),
            Operand::Sym(s) => Some(s.kind()),
        }
    }
}

/// Result dtype of a binary kernel; scalars only lift the category, never the width.
pub(crate) fn result_dtype(op: Op, lhs: &Operand, rhs: &Operand) -> TraceResult<DType> {
    match (lhs, rhs) {
        (Operand::Tensor(a), Operand::Tensor(b)) => Ok(a.dtype().promote(b.dtype())),
        (Operand::Tensor(t), scalar) | (scalar, Operand::Tensor(t)) => {
            let kind = scalar
                .scalar_kind()
                .ok_or_else(|| fail(op, "scalar operand without a numeric kind"))?;
            Ok(promote_scalar(t.dtype(), kind))
        }
        _ => Err(fail(op, "at least one operand must be a tensor")),
    }
}

fn promote_scalar(dtype: DType, kind: SymKind) -> DType {
    match kind {
        SymKind::Float if !dtype.is_floating() => DType::F32,
        SymKind::Int if dtype == DType::Bool => DType::I64,
        _ => dtype,
    }
}

pub(crate) fn normalize_dim(op: Op, dim: i64, rank: usize) -> TraceResult<usize> {
    let rank = rank as i64;
    let adjusted = if dim < 0 { dim + rank } else { dim };
    if adjusted < 0 || adjusted >= rank.max(1) {
        return Err(fail(op, format!("dimension {dim} out of range for rank {rank}")));
    }
    Ok(adjusted as usize)
}

/// Broadcast of two static shapes, aligned from the trailing dimension.
pub(crate) fn broadcast_static(op: Op, a: &[i64], b: &[i64]) -> TraceResult<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = vec![1i64; rank];
    for (axis, slot) in out.iter_mut().enumerate() {
        let lhs = dim_from_end(a, rank - axis).unwrap_or(1);
        let rhs = dim_from_end(b, rank - axis).unwrap_or(1);
        *slot = match (lhs, rhs) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => {
                return Err(fail(
                    op,
                    format!("shapes {a:?} and {b:?} are not broadcastable at {x} vs {y}"),
                ))
            }
        };
    }
    Ok(out)
}

/// Broadcast of two possibly symbolic shapes. Two distinct symbols are assumed equal.
pub(crate) fn broadcast_dims(op: Op, a: &[Dim], b: &[Dim]) -> TraceResult<Vec<Dim>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for axis in 0..rank {
        let lhs = dim_from_end(a, rank - axis).unwrap_or(Dim::Static(1));
        let rhs = dim_from_end(b, rank - axis).unwrap_or(Dim::Static(1));
        let dim = if lhs.as_static() == Some(1) {
            rhs
        } else if rhs.as_static() == Some(1) || lhs.same_as(&rhs) {
            lhs
        } else {
            match (lhs.as_static(), rhs.as_static()) {
                (Some(x), Some(y)) => {
                    return Err(fail(op, format!("sizes {x} and {y} are not broadcastable")));
                }
                (None, Some(_)) => rhs,
                _ => lhs,
            }
        };
        out.push(dim);
    }
    Ok(out)
}

fn dim_from_end<T: Clone>(dims: &[T], from_end: usize) -> Option<T> {
    dims.len()
        .checked_sub(from_end)
        .and_then(|index| dims.get(index))
        .cloned()
}

/// Row-major strides of a static shape.
pub(crate) fn contiguous_strides(dims: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Materialises `values` (shaped `dims`) at the broadcast shape `out`.
pub(crate) fn expand_values(values: &[f64], dims: &[i64], out: &[i64]) -> Vec<f64> {
    if dims == out {
        return values.to_vec();
    }
    let rank = out.len();
    let offset = rank - dims.len();
    let dense = contiguous_strides(dims);
    let mut in_strides = vec![0i64; rank];
    for (i, &dim) in dims.iter().enumerate() {
        in_strides[offset + i] = if dim == 1 { 0 } else { dense[i] };
    }
    let total: i64 = out.iter().product();
    (0..total)
        .map(|linear| {
            let mut rem = linear;
            let mut index = 0i64;
            for axis in (0..rank).rev() {
                let coord = rem % out[axis];
                rem /= out[axis];
                index += coord * in_strides[axis];
            }
            values[index as usize]
        })
        .collect()
}
