use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{TraceError, TraceResult};
use crate::ir::Proxy;
use crate::value::{OpaqueId, OpaqueRef, SymNodeId, SymScalar, TensorId, TensorRef, Value};

use super::Thunk;

/// What to do when a value that already has a slot is bound again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwritePolicy {
    LastWins,
    FirstWins,
}

/// Slot of a tracked tensor: its proxy plus the constant captured for it, if any.
#[derive(Clone, Debug)]
pub struct TensorSlot {
    pub proxy: Proxy,
    pub constant: Option<TensorRef>,
}

impl TensorSlot {
    pub fn new(proxy: Proxy, constant: Option<TensorRef>) -> Self {
        TensorSlot { proxy, constant }
    }
}

/// Owned slot passed to [`SlotRegistry::bind`].
#[derive(Clone, Debug)]
pub enum Slot {
    Tensor(TensorSlot),
    Sym(Rc<Thunk<Proxy>>),
    Opaque(Proxy),
}

/// Borrowed view of a bound slot handed to lookup transforms.
#[derive(Debug)]
pub enum SlotRef<'a> {
    Tensor(&'a TensorSlot),
    Sym(&'a Rc<Thunk<Proxy>>),
    Opaque(Proxy),
}

/// Identity-keyed association between live runtime values and graph nodes.
///
/// Tensors and opaque handles are keyed on their own identity. Symbolic scalars are keyed on the
/// underlying symbolic node, since every metadata read hands out a fresh wrapper.
#[derive(Default, Debug)]
pub struct SlotRegistry {
    tensors: HashMap<TensorId, TensorSlot>,
    symbols: HashMap<SymNodeId, Rc<Thunk<Proxy>>>,
    opaques: HashMap<OpaqueId, Proxy>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy_for(value: &Value) -> Option<OverwritePolicy> {
        match value {
            Value::Tensor(_) | Value::Opaque(_) => Some(OverwritePolicy::LastWins),
            Value::Sym(_) => Some(OverwritePolicy::FirstWins),
            _ => None,
        }
    }

    /// Installs `slot` for `value`. Returns whether the table changed.
    pub fn bind(&mut self, value: &Value, slot: Slot) -> TraceResult<bool> {
        match (value, slot) {
            (Value::Tensor(t), Slot::Tensor(slot)) => Ok(self.bind_tensor(t, slot)),
            (Value::Sym(s), Slot::Sym(thunk)) => Ok(self.bind_sym(s, thunk)),
            (Value::Opaque(o), Slot::Opaque(proxy)) => Ok(self.bind_opaque(o, proxy)),
            (value, slot) => Err(TraceError::tracking(format!(
                "cannot bind a {} slot to a value of type {}",
                match slot {
                    Slot::Tensor(_) => "tensor",
                    Slot::Sym(_) => "symbolic",
                    Slot::Opaque(_) => "opaque",
                },
                value.type_name()
            ))),
        }
    }

    pub fn bind_tensor(&mut self, tensor: &TensorRef, slot: TensorSlot) -> bool {
        self.tensors.insert(tensor.id(), slot);
        true
    }

    pub fn bind_sym(&mut self, scalar: &SymScalar, thunk: Rc<Thunk<Proxy>>) -> bool {
        match self.symbols.entry(scalar.node_id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(thunk);
                true
            }
        }
    }

    pub fn bind_opaque(&mut self, object: &OpaqueRef, proxy: Proxy) -> bool {
        self.opaques.insert(object.id(), proxy);
        true
    }

    /// Applies `transform` to the slot of `value`.
    ///
    /// Falls back to `default` when nothing is bound; with no default a miss is a
    /// [`TraceError::Tracking`], as is asking for a value kind that never has slots.
    pub fn lookup<R>(
        &self,
        value: &Value,
        default: Option<R>,
        transform: impl FnOnce(SlotRef<'_>) -> R,
    ) -> TraceResult<R> {
        let slot = match value {
            Value::Tensor(t) => self.tensors.get(&t.id()).map(SlotRef::Tensor),
            Value::Sym(s) => self.symbols.get(&s.node_id()).map(SlotRef::Sym),
            Value::Opaque(o) => self.opaques.get(&o.id()).copied().map(SlotRef::Opaque),
            _ => None,
        };
        match (slot, default) {
            (Some(slot), _) => Ok(transform(slot)),
            (None, Some(default)) => Ok(default),
            (None, None) => Err(TraceError::tracking(format!(
                "{} is not tracked by this tracer",
                describe(value)
            ))),
        }
    }

    pub fn is_bound(&self, value: &Value) -> bool {
        match value {
            Value::Tensor(t) => self.tensors.contains_key(&t.id()),
            Value::Sym(s) => self.symbols.contains_key(&s.node_id()),
            Value::Opaque(o) => self.opaques.contains_key(&o.id()),
            _ => false,
        }
    }

    pub fn tensor(&self, tensor: &TensorRef) -> Option<&TensorSlot> {
        self.tensors.get(&tensor.id())
    }

    pub fn sym(&self, scalar: &SymScalar) -> Option<Rc<Thunk<Proxy>>> {
        self.symbols.get(&scalar.node_id()).cloned()
    }

    pub fn opaque(&self, object: &OpaqueRef) -> Option<Proxy> {
        self.opaques.get(&object.id()).copied()
    }

    pub fn len(&self) -> usize {
        self.tensors.len() + self.symbols.len() + self.opaques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Tensor(t) => format!("{t:?}"),
        Value::Sym(s) => format!("{s:?}"),
        Value::Opaque(o) => format!("{o:?}"),
        other => format!("value of type {}", other.type_name()),
    }
}
