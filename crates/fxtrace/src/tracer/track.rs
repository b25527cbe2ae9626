use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::error::{TraceError, TraceResult};
use crate::ir::{Argument, Proxy};
use crate::ops::{aten, Op};
use crate::simulate::ShapeSolver;
use crate::value::{Dim, Literal, SymScalar, TensorRef, Value};

use super::{TensorSlot, Thunk, Tracer};

/// Node name used when a node is created for `op` without an explicit hint.
pub(crate) fn default_node_name(op: Op) -> String {
    if op.overload() == "default" {
        op.name().to_string()
    } else {
        format!("{}_{}", op.name(), op.overload())
    }
}

impl Tracer {
    /// Binds `tensor` to `proxy`, plus lazy nodes for each of its symbolic extents.
    ///
    /// Extents are bound first-wins, so a symbolic size shared by several tensors is read from
    /// the first tensor that exposed it.
    pub fn track_tensor(&self, tensor: &TensorRef, proxy: Proxy, constant: Option<TensorRef>) {
        for (i, dim) in tensor.sizes().into_iter().enumerate() {
            self.bind_extent(dim, aten::SYM_SIZE, proxy, Some(i));
        }
        for (i, dim) in tensor.strides().into_iter().enumerate() {
            self.bind_extent(dim, aten::SYM_STRIDE, proxy, Some(i));
        }
        self.bind_extent(tensor.numel(), aten::SYM_NUMEL, proxy, None);
        self.bind_extent(tensor.storage_offset(), aten::SYM_STORAGE_OFFSET, proxy, None);
        self.slots_mut()
            .bind_tensor(tensor, TensorSlot::new(proxy, constant));
    }

    fn bind_extent(&self, dim: Dim, op: Op, tensor: Proxy, index: Option<usize>) {
        let Dim::Sym(scalar) = dim else {
            return;
        };
        if scalar.is_literal() || self.slots().sym(&scalar).is_some() {
            return;
        }
        let weak = self.weak();
        let value = scalar.rewrap();
        let thunk = Thunk::new(move || {
            let tracer = upgrade(&weak)?;
            let mut args = vec![Argument::from(tensor)];
            if let Some(index) = index {
                args.push(Argument::Literal(Literal::Int(index as i64)));
            }
            let proxy = tracer.create_proxy(op, args, BTreeMap::new(), &default_node_name(op));
            tracer.set_meta(proxy, &Value::Sym(value));
            Ok(proxy)
        });
        self.slots_mut().bind_sym(&scalar, Rc::new(thunk));
    }

    /// Binds a symbolic scalar that already has a node.
    pub fn track_sym(&self, scalar: &SymScalar, proxy: Proxy) {
        self.slots_mut()
            .bind_sym(scalar, Rc::new(Thunk::ready(proxy)));
    }

    /// Walks `value` and the node behind `proxy` in lockstep, binding every trackable leaf.
    ///
    /// Sequence and mapping elements are reached through `getitem` nodes; plain data passes
    /// through untouched. `constant` mirrors `value` when a constant was captured for it.
    pub fn track_tensor_tree(
        &self,
        value: &Value,
        proxy: Proxy,
        constant: Option<&Value>,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<()> {
        if let Some(solver) = solver {
            let bindings = solver.compute_unbacked_bindings(value);
            if !bindings.is_empty() {
                self.graph_mut().node_mut(proxy.node()).meta.unbacked_bindings = bindings;
            }
        }
        self.wrap_with_proxy(value, proxy, constant)
    }

    fn wrap_with_proxy(
        &self,
        value: &Value,
        proxy: Proxy,
        constant: Option<&Value>,
    ) -> TraceResult<()> {
        match value {
            Value::Tensor(t) => {
                let constant = match constant {
                    Some(Value::Tensor(c)) => Some(c.clone()),
                    Some(other) if !other.is_none() => {
                        return Err(TraceError::unexpected("tensor constant", other.type_name()));
                    }
                    _ => None,
                };
                self.track_tensor(t, proxy, constant);
                self.set_meta(proxy, value);
            }
            Value::Sym(s) => {
                self.set_meta(proxy, value);
                self.track_sym(s, proxy);
            }
            Value::Opaque(o) => {
                self.slots_mut().bind_opaque(o, proxy);
                self.set_meta(proxy, value);
            }
            Value::Seq(items) => {
                self.set_meta(proxy, value);
                for (idx, item) in items.iter().enumerate() {
                    if !is_trackable(item) {
                        continue;
                    }
                    let element = self.getitem(proxy, Literal::Int(idx as i64));
                    let item_constant = constant.and_then(|c| c.as_seq()).and_then(|c| c.get(idx));
                    self.wrap_with_proxy(item, element, item_constant)?;
                }
            }
            Value::Map(items) => {
                self.set_meta(proxy, value);
                for (key, item) in items {
                    if !is_trackable(item) {
                        continue;
                    }
                    let element = self.getitem(proxy, Literal::Str(key.clone()));
                    let item_constant = constant.and_then(|c| c.as_map()).and_then(|c| c.get(key));
                    self.wrap_with_proxy(item, element, item_constant)?;
                }
            }
            Value::Literal(_) => {}
        }
        Ok(())
    }

    /// `getitem` node selecting one element of the value behind `proxy`.
    pub fn getitem(&self, proxy: Proxy, index: Literal) -> Proxy {
        self.create_proxy(
            aten::GETITEM,
            vec![Argument::from(proxy), Argument::Literal(index)],
            BTreeMap::new(),
            "getitem",
        )
    }
}

fn is_trackable(value: &Value) -> bool {
    match value {
        Value::Literal(_) => false,
        Value::Seq(items) => items.iter().any(is_trackable),
        Value::Map(items) => items.values().any(is_trackable),
        _ => true,
    }
}

pub(crate) fn upgrade(weak: &Weak<Tracer>) -> TraceResult<Rc<Tracer>> {
    weak.upgrade().ok_or_else(|| {
        TraceError::tracking("tracer was dropped before a deferred node was materialised")
    })
}
