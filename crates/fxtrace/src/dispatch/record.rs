//! The per-call recording procedure run by [`RecordingLayer`].

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{TraceError, TraceResult};
use crate::ir::Argument;
use crate::ops::{aten, Op, OpTag};
use crate::session::BailOutPolicy;
use crate::tracer::Tracer;
use crate::value::{CallArgs, Literal, TensorRef, Value};

use super::{DispatchContext, Dispatched, Dispatcher, RecordingLayer};

/// Outputs with more elements than this never get a captured constant.
pub const CONSTANT_NUMEL_LIMIT: i64 = 1;

pub(super) fn proxy_call(
    layer: &Rc<RecordingLayer>,
    cx: &DispatchContext,
    op: Op,
    args: &CallArgs,
) -> TraceResult<Dispatched> {
    let tracer = layer.tracer();
    let options = *layer.options();
    let leaves = args.leaves();

    let unrecognized = unrecognized_types(tracer, &leaves);
    if !unrecognized.is_empty() {
        tracing::debug!(op = %op, types = ?unrecognized, "recording layer declined call");
        return match options.bail_out {
            BailOutPolicy::Delegate => Ok(Dispatched::NotImplemented(unrecognized)),
            BailOutPolicy::Propagate => Err(TraceError::UnrecognizedInput {
                op: op.qualified_name(),
                types: unrecognized,
            }),
        };
    }

    // Decompositions are traced through this layer again, so re-install it around them.
    if let Some(decomposition) = cx.decompositions().get(op) {
        let _scope = layer.enter(cx);
        let _depth = layer.enter_decomposition();
        return decomposition(&Dispatcher::new(cx), args).map(Dispatched::Handled);
    }
    if !options.pre_dispatch && !aten::INTROSPECTION.contains(&op) {
        if let Some(decomposition) = op.default_decomposition() {
            let _scope = layer.enter(cx);
            return decomposition(&Dispatcher::new(cx), args).map(Dispatched::Handled);
        }
    }

    let proxy_args = args
        .args
        .iter()
        .map(|arg| map_argument(tracer, arg))
        .collect::<TraceResult<Vec<_>>>()?;
    let proxy_kwargs = args
        .kwargs
        .iter()
        .map(|(key, value)| Ok((key.clone(), map_argument(tracer, value)?)))
        .collect::<TraceResult<BTreeMap<_, _>>>()?;

    let (all_constant, any_constant) = constant_state(tracer, &leaves);

    if op.has_tag(OpTag::DataDependentOutput) {
        if all_constant {
            let constant_args = unwrap_constants(tracer, args)?;
            let _real = cx.suspend_simulation();
            return cx.dispatch(op, &constant_args).map(Dispatched::Handled);
        }
        let touches_real_data = leaves
            .iter()
            .any(|leaf| matches!(leaf, Value::Tensor(t) if !t.is_simulated()));
        if options.error_on_data_dependent_ops && touches_real_data {
            return Err(TraceError::DataDependent {
                op: op.qualified_name(),
            });
        }
    }

    let op = if op == aten::LIFT_FRESH {
        aten::LIFT_FRESH_COPY
    } else {
        op
    };

    let proxy_out = tracer.create_proxy(op, proxy_args, proxy_kwargs, op.name());

    if op.is_inplace() {
        match args.args.first() {
            Some(Value::Tensor(t)) => tracer.track_tensor(t, proxy_out, None),
            Some(Value::Seq(items)) => {
                let first = tracer.getitem(proxy_out, Literal::Int(0));
                for (i, item) in items.iter().enumerate() {
                    if let Value::Tensor(t) = item {
                        let element = tracer.getitem(first, Literal::Int(i as i64));
                        tracer.track_tensor(t, element, None);
                    }
                }
            }
            _ => {}
        }
    }

    let out = cx.dispatch(op, args)?;

    let constant = if op == aten::LIFT_FRESH_COPY && within_constant_limit(&out) {
        args.tensor(0)
            .ok()
            .filter(|t| !t.is_simulated())
            .map(|t| Value::Tensor(t.deep_clone()))
    } else if !op.has_tag(OpTag::NondeterministicSeeded)
        && all_constant
        && any_constant
        && within_constant_limit(&out)
    {
        let constant_args = unwrap_constants(tracer, args)?;
        let _real = cx.suspend_simulation();
        Some(cx.dispatch(op, &constant_args)?)
    } else {
        None
    };

    let simulation = cx.simulation();
    let solver = simulation.as_deref().and_then(|s| s.solver());
    tracer.track_tensor_tree(&out, proxy_out, constant.as_ref(), solver)?;
    Ok(Dispatched::Handled(out))
}

fn unrecognized_types(tracer: &Tracer, leaves: &[Value]) -> Vec<String> {
    let slots = tracer.slots();
    let mut types = Vec::new();
    for leaf in leaves {
        if let Value::Tensor(t) = leaf {
            if !t.kind().is_directly_supported() && !slots.is_bound(leaf) {
                let name = t.kind().type_name().to_string();
                if !types.contains(&name) {
                    types.push(name);
                }
            }
        }
    }
    types
}

/// Graph argument for one runtime argument tree.
fn map_argument(tracer: &Tracer, value: &Value) -> TraceResult<Argument> {
    match value {
        Value::Tensor(t) => {
            let bound = tracer.slots().tensor(t).map(|slot| slot.proxy);
            Ok(match bound {
                Some(proxy) => Argument::from(proxy),
                None => tracer.intern_tensor(t),
            })
        }
        Value::Opaque(o) => {
            let bound = tracer.slots().opaque(o);
            Ok(match bound {
                Some(proxy) => Argument::from(proxy),
                None => tracer.intern_opaque(o),
            })
        }
        Value::Sym(s) => {
            if let Some(literal) = s.literal() {
                return Ok(Argument::Literal(literal));
            }
            let thunk = tracer.slots().sym(s).ok_or_else(|| {
                TraceError::tracking(format!("{s:?} is not tracked by this tracer"))
            })?;
            Ok(Argument::from(thunk.force()?))
        }
        Value::Literal(literal) => Ok(Argument::Literal(literal.clone())),
        Value::Seq(items) => Ok(Argument::Seq(
            items
                .iter()
                .map(|item| map_argument(tracer, item))
                .collect::<TraceResult<_>>()?,
        )),
        Value::Map(items) => Ok(Argument::Map(
            items
                .iter()
                .map(|(key, item)| Ok((key.clone(), map_argument(tracer, item)?)))
                .collect::<TraceResult<_>>()?,
        )),
    }
}

/// `(all_constant, any_constant)` over the bound tensors and symbolic scalars among `leaves`.
fn constant_state(tracer: &Tracer, leaves: &[Value]) -> (bool, bool) {
    let slots = tracer.slots();
    let mut all_constant = true;
    let mut any_constant = false;
    for leaf in leaves {
        match leaf {
            Value::Tensor(t) => {
                if let Some(slot) = slots.tensor(t) {
                    if slot.constant.is_some() {
                        any_constant = true;
                    } else {
                        all_constant = false;
                    }
                }
            }
            Value::Sym(s) if !s.is_literal() => all_constant = false,
            _ => {}
        }
    }
    (all_constant, any_constant)
}

/// Replaces every bound tensor carrying a constant by that constant.
fn unwrap_constants(tracer: &Tracer, args: &CallArgs) -> TraceResult<CallArgs> {
    args.map_leaves(&mut |leaf| {
        Ok(match leaf {
            Value::Tensor(t) => Value::Tensor(constant_of(tracer, t).unwrap_or_else(|| t.clone())),
            other => other.clone(),
        })
    })
}

fn constant_of(tracer: &Tracer, tensor: &TensorRef) -> Option<TensorRef> {
    tracer.slots().tensor(tensor).and_then(|slot| slot.constant.clone())
}

fn within_constant_limit(out: &Value) -> bool {
    let mut within = true;
    out.for_each_tensor(&mut |t| {
        within &= matches!(t.numel().as_static(), Some(n) if n <= CONSTANT_NUMEL_LIMIT);
    });
    within
}
