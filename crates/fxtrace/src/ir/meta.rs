use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::value::{DType, Dim, KeyPath, Literal, SymKind, TensorRef, Value};

/// One entry of the module stack active when a node was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleFrame {
    pub path: String,
    pub type_name: String,
}

/// Annotations attached to every node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<ValueSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_meta: Option<TensorSnapshot>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unbacked_bindings: BTreeMap<String, KeyPath>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub module_stack: Vec<ModuleFrame>,
    /// `(name_count, qualified_name)` of the user-level call that produced this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fn_origin: Option<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_op: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub low_precision_pointwise_barrier: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DimSnapshot {
    Static(i64),
    Sym(String),
}

impl DimSnapshot {
    fn of(dim: &Dim) -> Self {
        match dim.as_static() {
            Some(v) => DimSnapshot::Static(v),
            None => DimSnapshot::Sym(dim.to_string()),
        }
    }
}

impl fmt::Display for DimSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSnapshot::Static(v) => write!(f, "{v}"),
            DimSnapshot::Sym(expr) => f.write_str(expr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorSnapshot {
    pub dtype: DType,
    pub sizes: Vec<DimSnapshot>,
    pub strides: Vec<DimSnapshot>,
    pub storage_offset: DimSnapshot,
    pub simulated: bool,
}

impl TensorSnapshot {
    pub fn of(tensor: &TensorRef) -> Self {
        let meta = tensor.meta();
        TensorSnapshot {
            dtype: meta.dtype(),
            sizes: meta.sizes().iter().map(DimSnapshot::of).collect(),
            strides: meta.strides().iter().map(DimSnapshot::of).collect(),
            storage_offset: DimSnapshot::of(meta.storage_offset()),
            simulated: tensor.is_simulated(),
        }
    }
}

/// Metadata-only copy of a runtime value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSnapshot {
    Tensor(TensorSnapshot),
    Sym { expr: String, sym_kind: SymKind },
    Opaque { type_name: String },
    Literal { value: Literal },
    Seq { items: Vec<ValueSnapshot> },
    Map { items: BTreeMap<String, ValueSnapshot> },
}

impl ValueSnapshot {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Tensor(t) => ValueSnapshot::Tensor(TensorSnapshot::of(t)),
            Value::Sym(s) => ValueSnapshot::Sym {
                expr: s.to_string(),
                sym_kind: s.kind(),
            },
            Value::Opaque(o) => ValueSnapshot::Opaque {
                type_name: o.type_name().to_string(),
            },
            Value::Literal(lit) => ValueSnapshot::Literal { value: lit.clone() },
            Value::Seq(items) => ValueSnapshot::Seq {
                items: items.iter().map(ValueSnapshot::of).collect(),
            },
            Value::Map(items) => ValueSnapshot::Map {
                items: items
                    .iter()
                    .map(|(key, item)| (key.clone(), ValueSnapshot::of(item)))
                    .collect(),
            },
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorSnapshot> {
        match self {
            ValueSnapshot::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn sym_expr(&self) -> Option<&str> {
        match self {
            ValueSnapshot::Sym { expr, .. } => Some(expr),
            _ => None,
        }
    }
}
