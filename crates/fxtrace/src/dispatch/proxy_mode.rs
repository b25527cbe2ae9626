use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{TraceError, TraceResult};
use crate::ir::{Argument, ValueSnapshot};
use crate::ops::{Op, OpTag};
use crate::session::BailOutPolicy;
use crate::tracer::{default_node_name, upgrade, Thunk, Tracer};
use crate::value::{symbolic, CallArgs, Literal, SymOp, Value};

use super::guards::{FlagGuard, SlotGuard};
use super::{record, DispatchContext, Dispatched};

/// Behaviour switches of a [`RecordingLayer`], usually derived from the session config.
#[derive(Debug, Clone, Copy)]
pub struct RecordingOptions {
    pub pre_dispatch: bool,
    pub error_on_data_dependent_ops: bool,
    pub bail_out: BailOutPolicy,
    pub emulate_precision_casts: bool,
    pub preserve_node_meta: bool,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        RecordingOptions {
            pre_dispatch: false,
            error_on_data_dependent_ops: true,
            bail_out: BailOutPolicy::Delegate,
            emulate_precision_casts: false,
            preserve_node_meta: false,
        }
    }
}

/// Layer that records every call it intercepts into its tracer's graph.
pub struct RecordingLayer {
    tracer: Rc<Tracer>,
    sym_layer: Rc<SymRecordingLayer>,
    options: RecordingOptions,
    enabled: Cell<bool>,
    decomposition_depth: Cell<usize>,
}

impl RecordingLayer {
    pub fn new(
        tracer: Rc<Tracer>,
        sym_layer: Rc<SymRecordingLayer>,
        options: RecordingOptions,
    ) -> Rc<Self> {
        Rc::new(RecordingLayer {
            tracer,
            sym_layer,
            options,
            enabled: Cell::new(true),
            decomposition_depth: Cell::new(0),
        })
    }

    pub fn tracer(&self) -> &Rc<Tracer> {
        &self.tracer
    }

    pub fn options(&self) -> &RecordingOptions {
        &self.options
    }

    pub fn sym_layer(&self) -> &Rc<SymRecordingLayer> {
        &self.sym_layer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Makes the layer pass every call through untouched until the guard is dropped.
    pub fn disable(&self) -> FlagGuard<'_, bool> {
        FlagGuard::set(&self.enabled, false)
    }

    pub fn decomposition_depth(&self) -> usize {
        self.decomposition_depth.get()
    }

    pub(super) fn enter_decomposition(&self) -> FlagGuard<'_, usize> {
        FlagGuard::set(&self.decomposition_depth, self.decomposition_depth.get() + 1)
    }

    /// Installs this layer in the recording slot, displacing the current one until the scope
    /// ends. The companion symbolic layer is switched on for the same duration.
    pub fn enter<'a>(self: &'a Rc<Self>, cx: &'a DispatchContext) -> RecordingScope<'a> {
        let sym = FlagGuard::set(&self.sym_layer.enabled, true);
        let slot = cx.install_recording(Some(Rc::clone(self)));
        if let Some(Some(previous)) = slot.previous() {
            tracing::trace!(
                displaced_nodes = previous.tracer.graph().len(),
                "recording layer displaced"
            );
        }
        RecordingScope { _slot: slot, _sym: sym }
    }

    pub(super) fn dispatch(
        self: &Rc<Self>,
        cx: &DispatchContext,
        op: Op,
        args: &CallArgs,
    ) -> TraceResult<Dispatched> {
        let _sym = FlagGuard::set(&self.sym_layer.enabled, false);
        let _origin = self
            .options
            .preserve_node_meta
            .then(|| OriginalOpScope::enter(&self.tracer, op));
        if !self.enabled.get() {
            return cx.dispatch(op, args).map(Dispatched::Handled);
        }
        let outcome = record::proxy_call(self, cx, op, args)?;
        if let Dispatched::Handled(_) = &outcome {
            self.maybe_record_pointwise_barrier(op);
        }
        Ok(outcome)
    }

    fn maybe_record_pointwise_barrier(&self, op: Op) {
        if self.decomposition_depth.get() > 0 || !self.options.emulate_precision_casts {
            return;
        }
        if !op.has_tag(OpTag::Pointwise) {
            return;
        }
        let mut graph = self.tracer.graph_mut();
        let Some(last) = graph.last().map(|node| node.id) else {
            return;
        };
        let node = graph.node_mut(last);
        let low_precision = matches!(
            &node.meta.val,
            Some(ValueSnapshot::Tensor(t)) if t.dtype.is_low_precision()
        );
        if low_precision {
            node.meta.low_precision_pointwise_barrier = true;
        }
    }
}

/// Guard returned by [`RecordingLayer::enter`]. Drops the slot first, then the symbolic toggle.
#[must_use = "the recording layer is uninstalled as soon as the scope is dropped"]
pub struct RecordingScope<'a> {
    _slot: SlotGuard<'a, Option<Rc<RecordingLayer>>>,
    _sym: FlagGuard<'a, bool>,
}

/// Attaches the outermost intercepted operator to nodes created beneath it.
struct OriginalOpScope<'a> {
    tracer: &'a Tracer,
    previous: Option<Op>,
    installed: bool,
}

impl<'a> OriginalOpScope<'a> {
    fn enter(tracer: &'a Tracer, op: Op) -> Self {
        let installed = tracer.original_op().is_none();
        let previous = if installed {
            tracer.set_original_op(Some(op))
        } else {
            tracer.original_op()
        };
        OriginalOpScope {
            tracer,
            previous,
            installed,
        }
    }
}

impl Drop for OriginalOpScope<'_> {
    fn drop(&mut self) {
        if self.installed {
            self.tracer.set_original_op(self.previous);
        }
    }
}

/// Records symbolic-scalar arithmetic as lazily materialised nodes.
pub struct SymRecordingLayer {
    tracer: Rc<Tracer>,
    enabled: Cell<bool>,
}

impl SymRecordingLayer {
    pub fn new(tracer: Rc<Tracer>) -> Rc<Self> {
        Rc::new(SymRecordingLayer {
            tracer,
            enabled: Cell::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub(super) fn handle(&self, op: SymOp, lhs: &Value, rhs: &Value) -> TraceResult<Value> {
        if !self.enabled.get() {
            return symbolic::apply(op, lhs, rhs);
        }
        if op == SymOp::Mul {
            if is_int_one(rhs) {
                return Ok(lhs.clone());
            }
            if is_int_one(lhs) {
                return Ok(rhs.clone());
            }
        }
        let out = symbolic::apply(op, lhs, rhs)?;
        if let Value::Sym(scalar) = &out {
            if !scalar.is_literal() {
                let weak = self.tracer.weak();
                let (lhs, rhs, value) = (lhs.clone(), rhs.clone(), out.clone());
                let thunk = Thunk::new(move || {
                    let tracer = upgrade(&weak)?;
                    let args = vec![sym_operand(&tracer, &lhs)?, sym_operand(&tracer, &rhs)?];
                    let target = op.op();
                    let name = default_node_name(target);
                    let proxy = tracer.create_proxy(target, args, BTreeMap::new(), &name);
                    tracer.set_meta(proxy, &value);
                    Ok(proxy)
                });
                self.tracer.slots_mut().bind_sym(scalar, Rc::new(thunk));
            }
        }
        Ok(out)
    }
}

fn is_int_one(value: &Value) -> bool {
    matches!(value, Value::Literal(Literal::Int(1)))
}

/// Graph argument for one operand of a symbolic operator, forcing its thunk if needed.
fn sym_operand(tracer: &Tracer, value: &Value) -> TraceResult<Argument> {
    match value {
        Value::Sym(scalar) => {
            if let Some(literal) = scalar.literal() {
                return Ok(Argument::Literal(literal));
            }
            let thunk = tracer.slots().sym(scalar).ok_or_else(|| {
                TraceError::tracking(format!("{scalar:?} is not tracked by this tracer"))
            })?;
            Ok(Argument::from(thunk.force()?))
        }
        Value::Literal(literal) => Ok(Argument::Literal(literal.clone())),
        other => Err(TraceError::unexpected("symbolic operand", other.type_name())),
    }
}
