use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::dispatch::Dispatcher;
use crate::error::TraceResult;
use crate::value::{CallArgs, SymOp, Value};

use super::Op;

/// Expansion registered in a [`DecompositionTable`].
pub type Decomposition = Rc<dyn Fn(&Dispatcher<'_>, &CallArgs) -> TraceResult<Value>>;

/// Operator → expansion map consulted (read-only) by the recording layer.
///
/// Tables are passed to a session explicitly and installed for the duration of a trace through a
/// scoped guard on the dispatch context; there is no process-wide table.
#[derive(Clone, Default)]
pub struct DecompositionTable {
    entries: HashMap<Op, Decomposition>,
}

impl DecompositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, op: Op, f: F) -> Option<Decomposition>
    where
        F: Fn(&Dispatcher<'_>, &CallArgs) -> TraceResult<Value> + 'static,
    {
        self.entries.insert(op, Rc::new(f))
    }

    pub fn with<F>(mut self, op: Op, f: F) -> Self
    where
        F: Fn(&Dispatcher<'_>, &CallArgs) -> TraceResult<Value> + 'static,
    {
        self.insert(op, f);
        self
    }

    /// Registers `f` unless `op` already has an expansion.
    pub fn insert_default<F>(&mut self, op: Op, f: F)
    where
        F: Fn(&Dispatcher<'_>, &CallArgs) -> TraceResult<Value> + 'static,
    {
        self.entries.entry(op).or_insert_with(|| Rc::new(f));
    }

    pub fn get(&self, op: Op) -> Option<Decomposition> {
        self.entries.get(&op).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for DecompositionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops = self.entries.keys().map(|op| op.qualified_name()).collect::<Vec<_>>();
        ops.sort();
        f.debug_struct("DecompositionTable").field("ops", &ops).finish()
    }
}

/// `numel` as the product of the sizes, computed through the symbolic dispatch layer.
pub fn sym_numel(d: &Dispatcher<'_>, args: &CallArgs) -> TraceResult<Value> {
    let tensor = args.tensor(0)?;
    tensor
        .sizes()
        .into_iter()
        .try_fold(Value::from(1i64), |acc, dim| {
            d.sym_binary(SymOp::Mul, &acc, &Value::from(dim))
        })
}
