//! Operator identifiers, tags, decomposition tables, and the kernel boundary.

pub mod aten;
mod decomp;
mod kernel;

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::dispatch::Dispatcher;
use crate::error::TraceResult;
use crate::value::{CallArgs, SymOp, Value};

pub use decomp::{sym_numel, DecompositionTable, Decomposition};
pub use kernel::KernelExecutor;

/// Expansion of an operator into simpler ones, traced through the active layers.
pub type DecompFn = fn(&Dispatcher<'_>, &CallArgs) -> TraceResult<Value>;

/// Properties of an operator that change how it is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTag {
    /// Output depends on tensor contents, not just metadata (e.g. `item`).
    DataDependentOutput,
    /// Output depends on a random generator; never constant-folded.
    NondeterministicSeeded,
    Pointwise,
    DynamicOutputShape,
    /// Host-level function that must stay in pre-dispatch graphs without running.
    SideEffectful,
}

/// Static description of one operator overload.
pub struct OpDef {
    pub namespace: &'static str,
    pub name: &'static str,
    pub overload: &'static str,
    pub tags: &'static [OpTag],
    pub default_decomposition: Option<DecompFn>,
}

/// Copyable handle to an [`OpDef`]. Two handles are equal when they name the same overload.
#[derive(Clone, Copy)]
pub struct Op {
    def: &'static OpDef,
}

impl Op {
    pub const fn new(def: &'static OpDef) -> Self {
        Op { def }
    }

    pub fn namespace(self) -> &'static str {
        self.def.namespace
    }

    pub fn name(self) -> &'static str {
        self.def.name
    }

    pub fn overload(self) -> &'static str {
        self.def.overload
    }

    pub fn qualified_name(self) -> String {
        format!("{}::{}.{}", self.def.namespace, self.def.name, self.def.overload)
    }

    pub fn has_tag(self, tag: OpTag) -> bool {
        self.def.tags.contains(&tag)
    }

    /// In-place operators carry a trailing underscore and are not private (`_foo`).
    pub fn is_inplace(self) -> bool {
        let name = self.def.name;
        name.ends_with('_') && !name.starts_with('_')
    }

    pub fn default_decomposition(self) -> Option<DecompFn> {
        self.def.default_decomposition
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.def.namespace == other.def.namespace
            && self.def.name == other.def.name
            && self.def.overload == other.def.overload
    }
}

impl Eq for Op {}

impl Hash for Op {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.namespace.hash(state);
        self.def.name.hash(state);
        self.def.overload.hash(state);
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

impl Serialize for Op {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.qualified_name())
    }
}

impl SymOp {
    /// Graph target recorded for this scalar operator.
    pub fn op(self) -> Op {
        match self {
            SymOp::Add => aten::SYM_ADD,
            SymOp::Sub => aten::SYM_SUB,
            SymOp::Mul => aten::SYM_MUL,
            SymOp::FloorDiv => aten::SYM_FLOORDIV,
            SymOp::Eq => aten::SYM_EQ,
            SymOp::Lt => aten::SYM_LT,
        }
    }
}
