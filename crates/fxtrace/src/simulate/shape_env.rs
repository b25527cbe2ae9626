use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::value::{Dim, KeyEntry, KeyPath, Literal, SymKind, SymScalar, Symbol, Value};

use super::ShapeSolver;

#[derive(Default)]
struct ShapeEnvState {
    next_backed: usize,
    next_unbacked: usize,
    /// Duck sizing: inputs with equal concrete extents share one symbol.
    by_hint: HashMap<i64, SymScalar>,
    hints: BTreeMap<String, i64>,
    sources: BTreeMap<String, Vec<String>>,
    pending_unbacked: Vec<Symbol>,
}

/// Minimal symbolic-shape solver: allocates symbols, remembers their hints and sources, and
/// tracks unbacked symbols until a kernel result claims them.
///
/// A session hands the solver back with its graph; sub-sessions share the parent's instance,
/// which only ever grows during a trace.
#[derive(Default)]
pub struct ShapeEnv {
    state: RefCell<ShapeEnvState>,
}

impl ShapeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete value a backed symbol was created for.
    pub fn hint(&self, symbol: &str) -> Option<i64> {
        self.state.borrow().hints.get(symbol).copied()
    }

    /// Every source (e.g. `input0.size(1)`) a symbol was allocated or reused for.
    pub fn sources(&self, symbol: &str) -> Vec<String> {
        self.state
            .borrow()
            .sources
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn num_unbacked(&self) -> usize {
        self.state.borrow().next_unbacked
    }
}

impl ShapeSolver for ShapeEnv {
    fn create_symbol(&self, hint: i64, source: &str) -> SymScalar {
        if hint == 0 || hint == 1 {
            return SymScalar::constant(Literal::Int(hint));
        }
        let mut state = self.state.borrow_mut();
        if let Some(existing) = state.by_hint.get(&hint).map(SymScalar::rewrap) {
            if let Some(symbol) = existing.expr().as_symbol() {
                state
                    .sources
                    .entry(symbol.to_string())
                    .or_default()
                    .push(source.to_string());
            }
            return existing;
        }
        let name = format!("s{}", state.next_backed);
        state.next_backed += 1;
        let scalar = SymScalar::symbol(Symbol::new(&name), SymKind::Int, Some(Literal::Int(hint)));
        state.hints.insert(name.clone(), hint);
        state.sources.insert(name, vec![source.to_string()]);
        state.by_hint.insert(hint, scalar.rewrap());
        tracing::debug!(symbol = %scalar, hint, source, "created backed symbol");
        scalar
    }

    fn create_unbacked_int(&self) -> SymScalar {
        let mut state = self.state.borrow_mut();
        let symbol = Symbol::new(format!("u{}", state.next_unbacked));
        state.next_unbacked += 1;
        state.pending_unbacked.push(symbol.clone());
        tracing::debug!(symbol = %symbol, "created unbacked symbol");
        SymScalar::symbol(symbol, SymKind::Int, None)
    }

    fn compute_unbacked_bindings(&self, value: &Value) -> BTreeMap<String, KeyPath> {
        let pending = std::mem::take(&mut self.state.borrow_mut().pending_unbacked);
        let mut bindings = BTreeMap::new();
        if pending.is_empty() {
            return bindings;
        }
        collect_bindings(value, &KeyPath::root(), &pending, &mut bindings);
        for symbol in &pending {
            if !bindings.contains_key(symbol.as_str()) {
                tracing::debug!(
                    symbol = %symbol,
                    "unbacked symbol does not appear in the kernel result"
                );
            }
        }
        bindings
    }
}

fn collect_bindings(
    value: &Value,
    path: &KeyPath,
    pending: &[Symbol],
    out: &mut BTreeMap<String, KeyPath>,
) {
    let mut visit = |scalar: &SymScalar, path: KeyPath| {
        if let Some(symbol) = scalar.expr().as_symbol() {
            if pending.contains(symbol) {
                out.entry(symbol.to_string()).or_insert(path);
            }
        }
    };
    match value {
        Value::Sym(s) => visit(s, path.clone()),
        Value::Tensor(t) => {
            for (i, dim) in t.sizes().iter().enumerate() {
                if let Dim::Sym(s) = dim {
                    visit(s, path.child(KeyEntry::Size(i)));
                }
            }
            for (i, dim) in t.strides().iter().enumerate() {
                if let Dim::Sym(s) = dim {
                    visit(s, path.child(KeyEntry::Stride(i)));
                }
            }
            if let Dim::Sym(s) = t.storage_offset() {
                visit(&s, path.child(KeyEntry::StorageOffset));
            }
        }
        Value::Seq(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_bindings(item, &path.child(KeyEntry::Index(i)), pending, out);
            }
        }
        Value::Map(items) => {
            for (key, item) in items {
                collect_bindings(item, &path.child(KeyEntry::Key(key.clone())), pending, out);
            }
        }
        Value::Opaque(_) | Value::Literal(_) => {}
    }
}

impl std::fmt::Debug for ShapeEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ShapeEnv")
            .field("hints", &state.hints)
            .field("unbacked", &state.next_unbacked)
            .finish()
    }
}
