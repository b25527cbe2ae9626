//! Operator catalog understood by the tracer and the reference kernels.

use crate::dispatch::Dispatcher;
use crate::error::TraceResult;
use crate::value::{CallArgs, Value};

use super::{Op, OpDef, OpTag};

macro_rules! op {
    ($ident:ident, $ns:literal, $name:literal, $overload:literal, [$($tag:ident),*]) => {
        op!($ident, $ns, $name, $overload, [$($tag),*], None);
    };
    (
        $ident:ident, $ns:literal, $name:literal, $overload:literal, [$($tag:ident),*],
        $decomp:expr
    ) => {
        pub const $ident: Op = Op {
            def: &OpDef {
                namespace: $ns,
                name: $name,
                overload: $overload,
                tags: &[$(OpTag::$tag),*],
                default_decomposition: $decomp,
            },
        };
    };
}

op!(ADD, "aten", "add", "Tensor", [Pointwise]);
op!(ADD_, "aten", "add_", "Tensor", [Pointwise]);
op!(SUB, "aten", "sub", "Tensor", [Pointwise]);
op!(MUL, "aten", "mul", "Tensor", [Pointwise]);
op!(MUL_, "aten", "mul_", "Tensor", [Pointwise]);
op!(SQUARE, "aten", "square", "default", [Pointwise], Some(square_decomposition));
op!(CLONE, "aten", "clone", "default", []);
op!(ITEM, "aten", "item", "default", [DataDependentOutput]);
op!(LIFT_FRESH, "aten", "lift_fresh", "default", []);
op!(LIFT_FRESH_COPY, "aten", "lift_fresh_copy", "default", []);
op!(SCALAR_TENSOR, "aten", "scalar_tensor", "default", []);
op!(RAND, "aten", "rand", "default", [NondeterministicSeeded]);
op!(RAND_LIKE, "aten", "rand_like", "default", [NondeterministicSeeded]);
op!(CAT, "aten", "cat", "default", []);
op!(BROADCAST_TENSORS, "aten", "broadcast_tensors", "default", []);
op!(NONZERO, "aten", "nonzero", "default", [DynamicOutputShape]);

op!(SYM_SIZE, "aten", "sym_size", "int", []);
op!(SYM_STRIDE, "aten", "sym_stride", "int", []);
op!(SYM_NUMEL, "aten", "sym_numel", "default", []);
op!(SYM_STORAGE_OFFSET, "aten", "sym_storage_offset", "default", []);
op!(SIZE, "aten", "size", "default", []);
op!(STRIDE, "aten", "stride", "default", []);
op!(STORAGE_OFFSET, "aten", "storage_offset", "default", []);

op!(GETITEM, "builtins", "getitem", "default", []);
op!(SET_GRAD_ENABLED, "autograd", "set_grad_enabled", "default", [SideEffectful]);

op!(SYM_ADD, "sym", "add", "default", []);
op!(SYM_SUB, "sym", "sub", "default", []);
op!(SYM_MUL, "sym", "mul", "default", []);
op!(SYM_FLOORDIV, "sym", "floordiv", "default", []);
op!(SYM_EQ, "sym", "eq", "default", []);
op!(SYM_LT, "sym", "lt", "default", []);

/// Introspection operators that never take their own default expansion.
pub const INTROSPECTION: [Op; 3] = [SIZE, STRIDE, STORAGE_OFFSET];

fn square_decomposition(d: &Dispatcher<'_>, args: &CallArgs) -> TraceResult<Value> {
    let x = args.arg(0)?;
    d.call(MUL, CallArgs::new(vec![x.clone(), x.clone()]))
}
