//! Metadata-only execution for simulated tensors.
//!
//! Shapes may contain symbols. Kernels whose output shape depends on tensor contents allocate an
//! unbacked symbol through the solver and refuse to run without one.

use fxtrace::simulate::ShapeSolver;
use fxtrace::value::TensorMeta;
use fxtrace::{CallArgs, DType, Dim, Op, TensorRef, TraceError, TraceResult, Value};

use crate::cpu::{introspect, Kernel};
use crate::shape::{broadcast_dims, fail, normalize_dim, result_dtype, Operand};

pub(crate) fn execute(
    op: Op,
    kernel: Kernel,
    args: &CallArgs,
    solver: Option<&dyn ShapeSolver>,
) -> TraceResult<Value> {
    match kernel {
        Kernel::Binary(_) => {
            let (dtype, sizes) = binary_meta(op, args)?;
            Ok(simulated(dtype, sizes))
        }
        Kernel::BinaryInplace(_) => {
            let target = args.tensor(0)?;
            let (_, sizes) = binary_meta(op, args)?;
            let fits = sizes.len() == target.rank()
                && sizes
                    .iter()
                    .zip(target.sizes())
                    .all(|(a, b)| a.same_as(&b) || a.is_symbolic() || b.is_symbolic());
            if !fits {
                return Err(fail(op, "in-place result does not have the shape of its target"));
            }
            Ok(Value::Tensor(target))
        }
        Kernel::Square => {
            let x = args.tensor(0)?;
            let dtype = if x.dtype() == DType::Bool { DType::I64 } else { x.dtype() };
            Ok(simulated(dtype, x.sizes()))
        }
        Kernel::Clone | Kernel::LiftFreshCopy => {
            let x = args.tensor(0)?;
            Ok(Value::Tensor(TensorRef::simulated(x.meta().clone())))
        }
        Kernel::LiftFresh => Ok(Value::Tensor(args.tensor(0)?)),
        Kernel::Item => {
            let x = args.tensor(0)?;
            let solver = solver.ok_or_else(|| TraceError::DataDependent {
                op: op.qualified_name(),
            })?;
            if x.dtype().is_floating() {
                return Err(fail(
                    op,
                    "cannot allocate an unbacked float for item() of a floating tensor",
                ));
            }
            Ok(Value::Sym(solver.create_unbacked_int()))
        }
        Kernel::ScalarTensor => Ok(simulated(DType::F32, Vec::new())),
        Kernel::Rand => {
            let sizes = size_list(op, args.arg(0)?)?;
            Ok(simulated(DType::F32, sizes))
        }
        Kernel::RandLike => {
            let like = args.tensor(0)?;
            Ok(simulated(DType::F32, like.sizes()))
        }
        Kernel::Cat => cat_meta(op, args),
        Kernel::BroadcastTensors => {
            let tensors = args.arg(0)?.expect_tensors()?;
            let mut sizes = Vec::new();
            for tensor in &tensors {
                sizes = broadcast_dims(op, &sizes, &tensor.sizes())?;
            }
            Ok(Value::Seq(
                tensors
                    .iter()
                    .map(|tensor| simulated(tensor.dtype(), sizes.clone()))
                    .collect(),
            ))
        }
        Kernel::Nonzero => {
            let x = args.tensor(0)?;
            let solver =
                solver.ok_or_else(|| fail(op, "dynamic output shape needs a shape solver"))?;
            let count = Dim::Sym(solver.create_unbacked_int());
            Ok(simulated(DType::I64, vec![count, Dim::Static(x.rank() as i64)]))
        }
        Kernel::Introspect(which) => introspect(op, which, args),
    }
}

fn simulated(dtype: DType, sizes: Vec<Dim>) -> Value {
    Value::Tensor(TensorRef::simulated(TensorMeta::contiguous(dtype, sizes)))
}

fn binary_meta(op: Op, args: &CallArgs) -> TraceResult<(DType, Vec<Dim>)> {
    let lhs = Operand::parse(op, args.arg(0)?)?;
    let rhs = Operand::parse(op, args.arg(1)?)?;
    let dtype = result_dtype(op, &lhs, &rhs)?;
    let sizes = broadcast_dims(op, &lhs.sizes(), &rhs.sizes())?;
    Ok((dtype, sizes))
}

fn size_list(op: Op, value: &Value) -> TraceResult<Vec<Dim>> {
    let items = value
        .as_seq()
        .ok_or_else(|| fail(op, format!("expected a size list, got {}", value.type_name())))?;
    items
        .iter()
        .map(|item| match item {
            Value::Sym(s) => Ok(match s.literal().and_then(|lit| lit.as_i64()) {
                Some(v) => Dim::Static(v),
                None => Dim::Sym(s.clone()),
            }),
            other => other
                .as_literal()
                .and_then(|lit| lit.as_i64())
                .map(Dim::Static)
                .ok_or_else(|| {
                    fail(op, format!("expected an integer size, got {}", other.type_name()))
                }),
        })
        .collect()
}

/// Concatenated extents are summed symbolically, so `cat([x: s0], [y: s1])` has size `s0 + s1`.
fn cat_meta(op: Op, args: &CallArgs) -> TraceResult<Value> {
    let tensors = args.arg(0)?.expect_tensors()?;
    let first = tensors
        .first()
        .ok_or_else(|| fail(op, "cat expects at least one input"))?;
    let rank = first.rank();
    let axis = normalize_dim(op, args.int(1).unwrap_or(0), rank)?;
    let mut sizes = first.sizes();
    let mut dtype = first.dtype();
    for tensor in &tensors[1..] {
        if tensor.rank() != rank {
            return Err(fail(op, "cat rank mismatch"));
        }
        let other = tensor.sizes();
        for (idx, (dim, out)) in other.iter().zip(sizes.iter()).enumerate() {
            let comparable = dim.as_static().zip(out.as_static());
            if idx != axis && matches!(comparable, Some((a, b)) if a != b) {
                return Err(fail(op, "cat dimension mismatch"));
            }
        }
        sizes[axis] = sizes[axis].add(&other[axis]);
        dtype = dtype.promote(tensor.dtype());
    }
    Ok(simulated(dtype, sizes))
}
