use std::cell::RefCell;

use fxtrace::ops::aten;
use fxtrace::simulate::ShapeSolver;
use fxtrace::value::{TensorData, TensorMeta};
use fxtrace::{CallArgs, DType, Dim, KernelExecutor, Op, TensorRef, TraceResult, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::meta;
use crate::shape::{
    broadcast_static, contiguous_strides, expand_values, fail, normalize_dim, result_dtype, Operand,
    EXECUTOR,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Introspection {
    SymSize,
    SymStride,
    SymNumel,
    SymStorageOffset,
    Size,
    Stride,
    StorageOffset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kernel {
    Binary(BinaryOp),
    BinaryInplace(BinaryOp),
    Square,
    Clone,
    Item,
    LiftFresh,
    LiftFreshCopy,
    ScalarTensor,
    Rand,
    RandLike,
    Cat,
    BroadcastTensors,
    Nonzero,
    Introspect(Introspection),
}

const KERNELS: &[(Op, Kernel)] = &[
    (aten::ADD, Kernel::Binary(BinaryOp::Add)),
    (aten::SUB, Kernel::Binary(BinaryOp::Sub)),
    (aten::MUL, Kernel::Binary(BinaryOp::Mul)),
    (aten::ADD_, Kernel::BinaryInplace(BinaryOp::Add)),
    (aten::MUL_, Kernel::BinaryInplace(BinaryOp::Mul)),
    (aten::SQUARE, Kernel::Square),
    (aten::CLONE, Kernel::Clone),
    (aten::ITEM, Kernel::Item),
    (aten::LIFT_FRESH, Kernel::LiftFresh),
    (aten::LIFT_FRESH_COPY, Kernel::LiftFreshCopy),
    (aten::SCALAR_TENSOR, Kernel::ScalarTensor),
    (aten::RAND, Kernel::Rand),
    (aten::RAND_LIKE, Kernel::RandLike),
    (aten::CAT, Kernel::Cat),
    (aten::BROADCAST_TENSORS, Kernel::BroadcastTensors),
    (aten::NONZERO, Kernel::Nonzero),
    (aten::SYM_SIZE, Kernel::Introspect(Introspection::SymSize)),
    (aten::SYM_STRIDE, Kernel::Introspect(Introspection::SymStride)),
    (aten::SYM_NUMEL, Kernel::Introspect(Introspection::SymNumel)),
    (aten::SYM_STORAGE_OFFSET, Kernel::Introspect(Introspection::SymStorageOffset)),
    (aten::SIZE, Kernel::Introspect(Introspection::Size)),
    (aten::STRIDE, Kernel::Introspect(Introspection::Stride)),
    (aten::STORAGE_OFFSET, Kernel::Introspect(Introspection::StorageOffset)),
];

pub(crate) fn kernel_for(op: Op) -> TraceResult<Kernel> {
    KERNELS
        .iter()
        .find(|(candidate, _)| *candidate == op)
        .map(|(_, kernel)| *kernel)
        .ok_or_else(|| fail(op, "operation not supported in the reference cpu executor"))
}

/// Reference kernels for the `aten` catalog, on host memory and on simulated tensors.
pub struct CpuKernels {
    rng: RefCell<StdRng>,
}

impl CpuKernels {
    pub fn new() -> Self {
        Self {
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    /// Executor whose random kernels are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn supports(op: Op) -> bool {
        kernel_for(op).is_ok()
    }

    fn random_values(&self, len: usize) -> Vec<f64> {
        let mut rng = self.rng.borrow_mut();
        (0..len).map(|_| rng.gen::<f32>() as f64).collect()
    }
}

impl Default for CpuKernels {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuKernels").finish_non_exhaustive()
    }
}

impl KernelExecutor for CpuKernels {
    fn name(&self) -> &str {
        EXECUTOR
    }

    fn execute(&self, op: Op, args: &CallArgs) -> TraceResult<Value> {
        let kernel = kernel_for(op)?;
        tracing::trace!(op = %op, ?kernel, "executing on host");
        match kernel {
            Kernel::Binary(bin) => op_binary(op, args, bin).map(Value::Tensor),
            Kernel::BinaryInplace(bin) => op_binary_inplace(op, args, bin).map(Value::Tensor),
            Kernel::Square => op_square(op, args).map(Value::Tensor),
            Kernel::Clone | Kernel::LiftFreshCopy => op_clone(op, args).map(Value::Tensor),
            Kernel::LiftFresh => Ok(Value::Tensor(args.tensor(0)?)),
            Kernel::Item => Ok(Value::Literal(args.tensor(0)?.item()?)),
            Kernel::ScalarTensor => op_scalar_tensor(op, args).map(Value::Tensor),
            Kernel::Rand => {
                let sizes = static_size_list(op, args.arg(0)?)?;
                let values = self.random_values(sizes.iter().product::<i64>() as usize);
                build_tensor(op, DType::F32, &sizes, values).map(Value::Tensor)
            }
            Kernel::RandLike => {
                let like = args.tensor(0)?;
                let sizes = static_sizes(op, &like)?;
                let values = self.random_values(sizes.iter().product::<i64>() as usize);
                build_tensor(op, DType::F32, &sizes, values).map(Value::Tensor)
            }
            Kernel::Cat => op_cat(op, args).map(Value::Tensor),
            Kernel::BroadcastTensors => op_broadcast_tensors(op, args),
            Kernel::Nonzero => op_nonzero(op, args).map(Value::Tensor),
            Kernel::Introspect(which) => introspect(op, which, args),
        }
    }

    fn execute_meta(
        &self,
        op: Op,
        args: &CallArgs,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<Value> {
        let kernel = kernel_for(op)?;
        tracing::trace!(op = %op, ?kernel, symbolic = solver.is_some(), "executing on metadata");
        meta::execute(op, kernel, args, solver)
    }
}

/// Reads tensor metadata; shared by host and simulated execution.
pub(crate) fn introspect(op: Op, which: Introspection, args: &CallArgs) -> TraceResult<Value> {
    let tensor = args.tensor(0)?;
    let dim_arg =
        |index: usize| -> TraceResult<usize> { normalize_dim(op, args.int(index)?, tensor.rank()) };
    let pick = |dims: Vec<Dim>, index: usize| -> TraceResult<Value> {
        dims.into_iter()
            .nth(index)
            .map(Value::from)
            .ok_or_else(|| fail(op, format!("dimension {index} out of range")))
    };
    match which {
        Introspection::SymSize => pick(tensor.sizes(), dim_arg(1)?),
        Introspection::SymStride => pick(tensor.strides(), dim_arg(1)?),
        Introspection::SymNumel => Ok(Value::from(tensor.numel())),
        Introspection::SymStorageOffset | Introspection::StorageOffset => {
            Ok(Value::from(tensor.storage_offset()))
        }
        Introspection::Size => Ok(Value::Seq(
            tensor.sizes().into_iter().map(Value::from).collect(),
        )),
        Introspection::Stride => Ok(Value::Seq(
            tensor.strides().into_iter().map(Value::from).collect(),
        )),
    }
}

fn static_sizes(op: Op, tensor: &TensorRef) -> TraceResult<Vec<i64>> {
    tensor
        .meta()
        .static_sizes()
        .ok_or_else(|| fail(op, "symbolic sizes on a host tensor"))
}

fn static_size_list(op: Op, value: &Value) -> TraceResult<Vec<i64>> {
    let items = value
        .as_seq()
        .ok_or_else(|| fail(op, format!("expected a size list, got {}", value.type_name())))?;
    items
        .iter()
        .map(|item| {
            item.as_literal().and_then(|lit| lit.as_i64()).ok_or_else(|| {
                fail(op, format!("expected an integer size, got {}", item.type_name()))
            })
        })
        .collect()
}

fn host_values(op: Op, tensor: &TensorRef) -> TraceResult<Vec<f64>> {
    let data = tensor
        .data()
        .ok_or_else(|| fail(op, "expected a host tensor, got a simulated one"))?;
    Ok((0..data.len()).filter_map(|i| data.get_f64(i)).collect())
}

fn build_tensor(op: Op, dtype: DType, sizes: &[i64], values: Vec<f64>) -> TraceResult<TensorRef> {
    TensorRef::concrete(
        TensorMeta::with_static_sizes(dtype, sizes),
        to_storage(op, dtype, &values)?,
    )
}

fn to_storage(op: Op, dtype: DType, values: &[f64]) -> TraceResult<TensorData> {
    Ok(match dtype {
        DType::F32 => TensorData::F32(values.iter().map(|v| *v as f32).collect()),
        DType::I64 => TensorData::I64(values.iter().map(|v| *v as i64).collect()),
        DType::Bool => TensorData::Bool(values.iter().map(|v| *v != 0.0).collect()),
        DType::F16 | DType::Bf16 => {
            return Err(fail(op, format!("{dtype} host storage is not supported")));
        }
    })
}

/// Operand as `(sizes, values)`; scalars are rank-0.
fn host_operand(op: Op, operand: &Operand) -> TraceResult<(Vec<i64>, Vec<f64>)> {
    match operand {
        Operand::Tensor(t) => Ok((static_sizes(op, t)?, host_values(op, t)?)),
        Operand::Scalar(lit) => {
            let value = lit
                .as_f64()
                .ok_or_else(|| fail(op, format!("non-numeric scalar {lit}")))?;
            Ok((Vec::new(), vec![value]))
        }
        Operand::Sym(s) => Err(fail(
            op,
            format!("unresolved symbolic scalar {s} on the host path"),
        )),
    }
}

fn binary_values(
    op: Op,
    args: &CallArgs,
    bin: BinaryOp,
) -> TraceResult<(DType, Vec<i64>, Vec<f64>)> {
    let lhs = Operand::parse(op, args.arg(0)?)?;
    let rhs = Operand::parse(op, args.arg(1)?)?;
    let dtype = result_dtype(op, &lhs, &rhs)?;
    let (lhs_dims, lhs_values) = host_operand(op, &lhs)?;
    let (rhs_dims, rhs_values) = host_operand(op, &rhs)?;
    let out_dims = broadcast_static(op, &lhs_dims, &rhs_dims)?;
    let lhs_values = expand_values(&lhs_values, &lhs_dims, &out_dims);
    let rhs_values = expand_values(&rhs_values, &rhs_dims, &out_dims);
    let values = lhs_values
        .iter()
        .zip(rhs_values.iter())
        .map(|(x, y)| bin.apply(*x, *y))
        .collect();
    Ok((dtype, out_dims, values))
}

fn op_binary(op: Op, args: &CallArgs, bin: BinaryOp) -> TraceResult<TensorRef> {
    let (dtype, dims, values) = binary_values(op, args, bin)?;
    build_tensor(op, dtype, &dims, values)
}

fn op_binary_inplace(op: Op, args: &CallArgs, bin: BinaryOp) -> TraceResult<TensorRef> {
    let target = args.tensor(0)?;
    let (_, dims, values) = binary_values(op, args, bin)?;
    if dims != static_sizes(op, &target)? {
        return Err(fail(op, "in-place result does not have the shape of its target"));
    }
    target.replace_data(to_storage(op, target.dtype(), &values)?)?;
    Ok(target)
}

fn op_square(op: Op, args: &CallArgs) -> TraceResult<TensorRef> {
    let x = args.tensor(0)?;
    let values = host_values(op, &x)?.into_iter().map(|v| v * v).collect();
    let dtype = if x.dtype() == DType::Bool { DType::I64 } else { x.dtype() };
    build_tensor(op, dtype, &static_sizes(op, &x)?, values)
}

fn op_clone(op: Op, args: &CallArgs) -> TraceResult<TensorRef> {
    let x = args.tensor(0)?;
    let data = x
        .data()
        .ok_or_else(|| fail(op, "expected a host tensor, got a simulated one"))?;
    TensorRef::concrete(x.meta().clone(), data)
}

fn op_scalar_tensor(op: Op, args: &CallArgs) -> TraceResult<TensorRef> {
    let value = args
        .arg(0)?
        .as_literal()
        .and_then(|lit| lit.as_f64())
        .ok_or_else(|| fail(op, "scalar_tensor expects a numeric scalar"))?;
    build_tensor(op, DType::F32, &[], vec![value])
}

fn tensor_list(op: Op, value: &Value) -> TraceResult<Vec<TensorRef>> {
    value
        .expect_tensors()
        .map_err(|_| fail(op, format!("expected a tensor list, got {}", value.type_name())))
}

fn op_cat(op: Op, args: &CallArgs) -> TraceResult<TensorRef> {
    let tensors = tensor_list(op, args.arg(0)?)?;
    let first = tensors
        .first()
        .ok_or_else(|| fail(op, "cat expects at least one input"))?;
    let rank = first.rank();
    let axis = normalize_dim(op, args.int(1).unwrap_or(0), rank)?;

    let mut out_dims = static_sizes(op, first)?;
    let mut dtype = first.dtype();
    let mut inputs = Vec::with_capacity(tensors.len());
    out_dims[axis] = 0;
    for tensor in &tensors {
        let dims = static_sizes(op, tensor)?;
        if dims.len() != rank {
            return Err(fail(op, "cat rank mismatch"));
        }
        for (idx, (&dim, &out_dim)) in dims.iter().zip(out_dims.iter()).enumerate() {
            if idx != axis && dim != out_dim {
                return Err(fail(op, "cat dimension mismatch"));
            }
        }
        out_dims[axis] += dims[axis];
        dtype = dtype.promote(tensor.dtype());
        inputs.push((dims[axis], host_values(op, tensor)?));
    }

    let inner = out_dims.iter().skip(axis + 1).product::<i64>() as usize;
    let outer = out_dims.iter().take(axis).product::<i64>() as usize;
    let mut values = Vec::with_capacity(out_dims.iter().product::<i64>() as usize);
    for o in 0..outer {
        for (axis_len, data) in &inputs {
            let chunk = *axis_len as usize * inner;
            values.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
        }
    }
    build_tensor(op, dtype, &out_dims, values)
}

fn op_broadcast_tensors(op: Op, args: &CallArgs) -> TraceResult<Value> {
    let tensors = tensor_list(op, args.arg(0)?)?;
    let mut out_dims = Vec::new();
    for tensor in &tensors {
        out_dims = broadcast_static(op, &out_dims, &static_sizes(op, tensor)?)?;
    }
    tensors
        .iter()
        .map(|tensor| {
            let dims = static_sizes(op, tensor)?;
            let values = expand_values(&host_values(op, tensor)?, &dims, &out_dims);
            build_tensor(op, tensor.dtype(), &out_dims, values).map(Value::Tensor)
        })
        .collect::<TraceResult<Vec<_>>>()
        .map(Value::Seq)
}

fn op_nonzero(op: Op, args: &CallArgs) -> TraceResult<TensorRef> {
    let x = args.tensor(0)?;
    let dims = static_sizes(op, &x)?;
    let strides = contiguous_strides(&dims);
    let mut coords = Vec::new();
    let mut count = 0i64;
    for (linear, value) in host_values(op, &x)?.into_iter().enumerate() {
        if value == 0.0 {
            continue;
        }
        count += 1;
        let mut rem = linear as i64;
        for stride in &strides {
            coords.push((rem / stride) as f64);
            rem %= stride;
        }
    }
    build_tensor(op, DType::I64, &[count, dims.len() as i64], coords)
}
