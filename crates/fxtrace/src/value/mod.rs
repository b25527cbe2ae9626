//! Runtime values observed by the tracer.
//!
//! Everything that flows through an operator call is a [`Value`]: a tagged tree whose leaves are
//! tensors, symbolic scalars, opaque handles, or plain literals. The recording algorithm walks
//! these trees explicitly instead of inspecting types at runtime.

mod opaque;
pub mod symbolic;
mod tensor;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TraceError, TraceResult};

pub use opaque::{OpaqueId, OpaqueRef};
pub use symbolic::{SymExpr, SymKind, SymNodeId, SymOp, SymScalar, Symbol};
pub use tensor::{DType, Dim, TensorData, TensorId, TensorKind, TensorMeta, TensorRef};

/// Plain data that is passed through tracing untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn sym_kind(&self) -> Option<SymKind> {
        match self {
            Literal::Bool(_) => Some(SymKind::Bool),
            Literal::Int(_) => Some(SymKind::Int),
            Literal::Float(_) => Some(SymKind::Float),
            _ => None,
        }
    }

    /// Converts a numeric literal to the representation of `kind`.
    pub fn coerce(&self, kind: SymKind) -> Literal {
        match (kind, self.as_f64()) {
            (SymKind::Bool, Some(v)) => Literal::Bool(v != 0.0),
            (SymKind::Int, Some(v)) => Literal::Int(self.as_i64().unwrap_or(v as i64)),
            (SymKind::Float, Some(v)) => Literal::Float(v),
            (_, None) => self.clone(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Int(v) => Some(*v),
            Literal::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Literal::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => f.write_str("None"),
            Literal::Bool(v) => f.write_str(if *v { "True" } else { "False" }),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Tagged tree of runtime values.
#[derive(Clone, Debug)]
pub enum Value {
    Literal(Literal),
    Tensor(TensorRef),
    Sym(SymScalar),
    Opaque(OpaqueRef),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn none() -> Self {
        Value::Literal(Literal::None)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::Literal(Literal::None))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Literal(Literal::None) => "None".to_string(),
            Value::Literal(Literal::Bool(_)) => "bool".to_string(),
            Value::Literal(Literal::Int(_)) => "int".to_string(),
            Value::Literal(Literal::Float(_)) => "float".to_string(),
            Value::Literal(Literal::Str(_)) => "str".to_string(),
            Value::Tensor(t) => t.kind().type_name().to_string(),
            Value::Sym(s) => match s.kind() {
                SymKind::Int => "SymInt".to_string(),
                SymKind::Float => "SymFloat".to_string(),
                SymKind::Bool => "SymBool".to_string(),
            },
            Value::Opaque(o) => o.type_name().to_string(),
            Value::Seq(_) => "list".to_string(),
            Value::Map(_) => "dict".to_string(),
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorRef> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn expect_tensor(&self) -> TraceResult<TensorRef> {
        self.as_tensor()
            .cloned()
            .ok_or_else(|| TraceError::unexpected("tensor", self.type_name()))
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(items) => Some(items),
            _ => None,
        }
    }

    pub fn expect_tensors(&self) -> TraceResult<Vec<TensorRef>> {
        self.as_seq()
            .ok_or_else(|| TraceError::unexpected("tensor list", self.type_name()))?
            .iter()
            .map(Value::expect_tensor)
            .collect()
    }

    /// Integer view of a literal or a statically known symbolic scalar.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Literal(lit) => lit.as_i64(),
            Value::Sym(s) => s.literal().and_then(|lit| lit.as_i64()),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<Literal> {
        match self {
            Value::Literal(lit) => Some(lit.clone()),
            Value::Sym(s) => s.literal(),
            _ => None,
        }
    }

    /// Visits every tensor leaf in depth-first order.
    pub fn for_each_tensor(&self, f: &mut impl FnMut(&TensorRef)) {
        match self {
            Value::Tensor(t) => f(t),
            Value::Seq(items) => items.iter().for_each(|item| item.for_each_tensor(f)),
            Value::Map(items) => items.values().for_each(|item| item.for_each_tensor(f)),
            _ => {}
        }
    }

    pub fn tensors(&self) -> Vec<TensorRef> {
        let mut out = Vec::new();
        self.for_each_tensor(&mut |t| out.push(t.clone()));
        out
    }

    /// Rebuilds the tree with every leaf replaced by `f(leaf)`.
    pub fn map_leaves(
        &self,
        f: &mut impl FnMut(&Value) -> TraceResult<Value>,
    ) -> TraceResult<Value> {
        match self {
            Value::Seq(items) => Ok(Value::Seq(
                items
                    .iter()
                    .map(|item| item.map_leaves(f))
                    .collect::<TraceResult<_>>()?,
            )),
            Value::Map(items) => Ok(Value::Map(
                items
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.map_leaves(f)?)))
                    .collect::<TraceResult<_>>()?,
            )),
            leaf => f(leaf),
        }
    }

    pub fn flatten(&self) -> (Vec<Value>, TreeSpec) {
        let mut leaves = Vec::new();
        let spec = self.flatten_into(&mut leaves);
        (leaves, spec)
    }

    fn flatten_into(&self, leaves: &mut Vec<Value>) -> TreeSpec {
        match self {
            Value::Seq(items) => {
                TreeSpec::Seq(items.iter().map(|item| item.flatten_into(leaves)).collect())
            }
            Value::Map(items) => TreeSpec::Map(
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.flatten_into(leaves)))
                    .collect(),
            ),
            leaf => {
                leaves.push(leaf.clone());
                TreeSpec::Leaf
            }
        }
    }
}

impl From<Literal> for Value {
    fn from(value: Literal) -> Self {
        Value::Literal(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Literal(Literal::Int(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Literal(Literal::Float(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Literal(Literal::Bool(value))
    }
}

impl From<TensorRef> for Value {
    fn from(value: TensorRef) -> Self {
        Value::Tensor(value)
    }
}

impl From<&TensorRef> for Value {
    fn from(value: &TensorRef) -> Self {
        Value::Tensor(value.clone())
    }
}

impl From<SymScalar> for Value {
    fn from(value: SymScalar) -> Self {
        Value::Sym(value)
    }
}

impl From<OpaqueRef> for Value {
    fn from(value: OpaqueRef) -> Self {
        Value::Opaque(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Seq(value)
    }
}

impl From<Dim> for Value {
    fn from(value: Dim) -> Self {
        match value {
            Dim::Static(v) => Value::Literal(Literal::Int(v)),
            Dim::Sym(s) => Value::Sym(s),
        }
    }
}

/// Shape of a flattened [`Value`] tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeSpec {
    Leaf,
    Seq(Vec<TreeSpec>),
    Map(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::Seq(items) => items.iter().map(TreeSpec::num_leaves).sum(),
            TreeSpec::Map(items) => items.iter().map(|(_, spec)| spec.num_leaves()).sum(),
        }
    }

    pub fn unflatten(&self, leaves: Vec<Value>) -> TraceResult<Value> {
        if leaves.len() != self.num_leaves() {
            return Err(TraceError::tracking(format!(
                "cannot unflatten {} leaves into a tree with {} leaves",
                leaves.len(),
                self.num_leaves()
            )));
        }
        let mut iter = leaves.into_iter();
        Ok(self.build(&mut iter))
    }

    fn build(&self, leaves: &mut impl Iterator<Item = Value>) -> Value {
        match self {
            TreeSpec::Leaf => leaves.next().unwrap_or_else(Value::none),
            TreeSpec::Seq(items) => {
                Value::Seq(items.iter().map(|spec| spec.build(leaves)).collect())
            }
            TreeSpec::Map(items) => Value::Map(
                items
                    .iter()
                    .map(|(key, spec)| (key.clone(), spec.build(leaves)))
                    .collect(),
            ),
        }
    }
}

/// Positional and keyword arguments of one operator call.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>) -> Self {
        CallArgs {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    pub fn arg(&self, index: usize) -> TraceResult<&Value> {
        self.args.get(index).ok_or_else(|| {
            TraceError::unexpected("positional argument", format!("{} arguments", self.args.len()))
        })
    }

    pub fn tensor(&self, index: usize) -> TraceResult<TensorRef> {
        self.arg(index)?.expect_tensor()
    }

    pub fn int(&self, index: usize) -> TraceResult<i64> {
        let value = self.arg(index)?;
        value
            .as_int()
            .ok_or_else(|| TraceError::unexpected("int", value.type_name()))
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Every leaf of the positional and keyword trees, in flattening order.
    pub fn leaves(&self) -> Vec<Value> {
        self.to_value().flatten().0
    }

    pub fn to_value(&self) -> Value {
        Value::Seq(vec![Value::Seq(self.args.clone()), Value::Map(self.kwargs.clone())])
    }

    pub fn map_leaves(
        &self,
        f: &mut impl FnMut(&Value) -> TraceResult<Value>,
    ) -> TraceResult<CallArgs> {
        let args = self
            .args
            .iter()
            .map(|arg| arg.map_leaves(f))
            .collect::<TraceResult<_>>()?;
        let kwargs = self
            .kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.map_leaves(f)?)))
            .collect::<TraceResult<_>>()?;
        Ok(CallArgs { args, kwargs })
    }
}

impl<const N: usize> From<[Value; N]> for CallArgs {
    fn from(args: [Value; N]) -> Self {
        CallArgs::new(args.into())
    }
}

/// One step of the path from an operator result to a symbol it defines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEntry {
    Index(usize),
    Key(String),
    Size(usize),
    Stride(usize),
    StorageOffset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyPath(Vec<KeyEntry>);

impl KeyPath {
    pub fn root() -> Self {
        KeyPath(Vec::new())
    }

    pub fn child(&self, entry: KeyEntry) -> Self {
        let mut entries = self.0.clone();
        entries.push(entry);
        KeyPath(entries)
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.0 {
            match entry {
                KeyEntry::Index(i) => write!(f, "[{i}]")?,
                KeyEntry::Key(k) => write!(f, "[{k:?}]")?,
                KeyEntry::Size(i) => write!(f, ".size({i})")?,
                KeyEntry::Stride(i) => write!(f, ".stride({i})")?,
                KeyEntry::StorageOffset => f.write_str(".storage_offset()")?,
            }
        }
        Ok(())
    }
}
