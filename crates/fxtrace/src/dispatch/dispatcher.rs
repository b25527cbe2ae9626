use std::panic::Location;

use crate::error::{TraceError, TraceResult};
use crate::module::AccessPathView;
use crate::ops::{aten, Op};
use crate::session::{self, TraceConfig, TracedGraph};
use crate::value::{CallArgs, Literal, SymOp, TensorRef, Value};

use super::DispatchContext;

/// Handle user code traces through. Every call enters the full layer stack of its context.
#[derive(Clone, Copy)]
pub struct Dispatcher<'a> {
    cx: &'a DispatchContext,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cx: &'a DispatchContext) -> Self {
        Dispatcher { cx }
    }

    pub fn context(&self) -> &'a DispatchContext {
        self.cx
    }

    /// Calls `op`; the caller's source location becomes the node's stack trace.
    #[track_caller]
    pub fn call(&self, op: Op, args: impl Into<CallArgs>) -> TraceResult<Value> {
        let _site = self.cx.call_sites().enter(Location::caller());
        self.cx.call(op, &args.into())
    }

    #[track_caller]
    fn call_tensor(&self, op: Op, args: impl Into<CallArgs>) -> TraceResult<TensorRef> {
        self.call(op, args)?.expect_tensor()
    }

    #[track_caller]
    pub fn add(&self, lhs: &TensorRef, rhs: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::ADD, [lhs.into(), rhs.into()])
    }

    #[track_caller]
    pub fn add_(&self, lhs: &TensorRef, rhs: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::ADD_, [lhs.into(), rhs.into()])
    }

    #[track_caller]
    pub fn sub(&self, lhs: &TensorRef, rhs: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::SUB, [lhs.into(), rhs.into()])
    }

    #[track_caller]
    pub fn mul(&self, lhs: &TensorRef, rhs: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::MUL, [lhs.into(), rhs.into()])
    }

    #[track_caller]
    pub fn mul_(&self, lhs: &TensorRef, rhs: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::MUL_, [lhs.into(), rhs.into()])
    }

    #[track_caller]
    pub fn square(&self, x: &TensorRef) -> TraceResult<TensorRef> {
        self.call_tensor(aten::SQUARE, [x.into()])
    }

    #[track_caller]
    pub fn clone(&self, x: &TensorRef) -> TraceResult<TensorRef> {
        self.call_tensor(aten::CLONE, [x.into()])
    }

    /// Scalar value of a one-element tensor.
    #[track_caller]
    pub fn item(&self, x: &TensorRef) -> TraceResult<Value> {
        self.call(aten::ITEM, [x.into()])
    }

    /// Brings a tensor created outside the trace into it, the way a tensor literal would.
    #[track_caller]
    pub fn constant(&self, data: &TensorRef) -> TraceResult<TensorRef> {
        self.call_tensor(aten::LIFT_FRESH, [data.into()])
    }

    #[track_caller]
    pub fn scalar_tensor(&self, value: impl Into<Value>) -> TraceResult<TensorRef> {
        self.call_tensor(aten::SCALAR_TENSOR, [value.into()])
    }

    #[track_caller]
    pub fn rand(&self, sizes: &[i64]) -> TraceResult<TensorRef> {
        let sizes = sizes.iter().map(|s| Value::from(*s)).collect::<Vec<_>>();
        self.call_tensor(aten::RAND, [Value::Seq(sizes)])
    }

    #[track_caller]
    pub fn rand_like(&self, x: &TensorRef) -> TraceResult<TensorRef> {
        self.call_tensor(aten::RAND_LIKE, [x.into()])
    }

    #[track_caller]
    pub fn cat(&self, tensors: &[TensorRef], dim: i64) -> TraceResult<TensorRef> {
        let tensors = tensors.iter().map(Value::from).collect::<Vec<_>>();
        self.call_tensor(aten::CAT, [Value::Seq(tensors), dim.into()])
    }

    #[track_caller]
    pub fn broadcast_tensors(&self, tensors: &[TensorRef]) -> TraceResult<Vec<TensorRef>> {
        let tensors = tensors.iter().map(Value::from).collect::<Vec<_>>();
        self.call(aten::BROADCAST_TENSORS, [Value::Seq(tensors)])?
            .expect_tensors()
    }

    #[track_caller]
    pub fn nonzero(&self, x: &TensorRef) -> TraceResult<TensorRef> {
        self.call_tensor(aten::NONZERO, [x.into()])
    }

    /// Reads one extent from the tensor metadata. No call is dispatched.
    pub fn size(&self, x: &TensorRef, dim: usize) -> TraceResult<Value> {
        x.size(dim).map(Value::from).ok_or_else(|| {
            TraceError::unexpected("dimension in range", format!("{dim} for rank {}", x.rank()))
        })
    }

    /// Element count, computed through the symbolic layers.
    #[track_caller]
    pub fn numel(&self, x: &TensorRef) -> TraceResult<Value> {
        self.call(aten::SYM_NUMEL, [x.into()])
    }

    /// Scalar arithmetic on literals and symbolic scalars.
    pub fn sym_binary(&self, op: SymOp, lhs: &Value, rhs: &Value) -> TraceResult<Value> {
        self.cx.sym_dispatch(op, lhs, rhs)
    }

    #[track_caller]
    pub fn set_grad_enabled(&self, enabled: bool) -> TraceResult<()> {
        self.call(aten::SET_GRAD_ENABLED, [Value::Literal(Literal::Bool(enabled))])?;
        Ok(())
    }

    /// View of the module hierarchy registered with the current session.
    pub fn root_module(&self) -> TraceResult<AccessPathView> {
        self.cx
            .session()
            .ok_or_else(|| TraceError::Config("no trace session is active".to_string()))?
            .root_view()
    }

    /// Runs a module's forward function, recording its path on every node it creates.
    pub fn call_module(&self, view: &AccessPathView, args: &[Value]) -> TraceResult<Value> {
        match self.cx.session().and_then(|s| s.module_tracer()) {
            Some(module_tracer) => module_tracer.call_module(self, view, args),
            None => view.module().forward(self, view, args),
        }
    }

    /// Traces `f` into an independent graph that shares this session's simulation context.
    pub fn trace_subgraph<F>(&self, f: F, args: Vec<Value>) -> TraceResult<TracedGraph>
    where
        F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
    {
        session::trace_subgraph(self.cx, f, args)
    }

    /// Traces `f` with the active recording layer suspended, as a fresh session on this context.
    pub fn isolated_graph<F>(
        &self,
        config: TraceConfig,
        f: F,
        args: Vec<Value>,
    ) -> TraceResult<TracedGraph>
    where
        F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
    {
        session::isolated_graph(self.cx, config, f, args)
    }
}

impl std::fmt::Debug for Dispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("cx", self.cx).finish()
    }
}
