//! Symbolic scalars and the expression language they carry.
//!
//! A [`SymScalar`] is a cheap wrapper around a shared [`SymNode`]. Wrappers are recreated every
//! time a size or stride is read, so anything that needs a stable identity (the slot registry in
//! particular) keys on [`SymScalar::node_id`] rather than on the wrapper.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TraceError, TraceResult};

use super::{Literal, Value};

static NEXT_SYM_NODE: AtomicU64 = AtomicU64::new(0);

/// Stable identity of a symbolic variable, shared by every wrapper that reads it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SymNodeId(u64);

impl SymNodeId {
    fn fresh() -> Self {
        SymNodeId(NEXT_SYM_NODE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymKind {
    Int,
    Float,
    Bool,
}

/// Named free variable such as `s0` (backed by an input size) or `u0` (unbacked).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Symbol(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unbacked symbols have no hint and are introduced by data-dependent kernels.
    pub fn is_unbacked(&self) -> bool {
        self.0.starts_with('u')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar-level operators understood by the symbolic dispatch layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Eq,
    Lt,
}

impl SymOp {
    pub fn symbol(self) -> &'static str {
        match self {
            SymOp::Add => "+",
            SymOp::Sub => "-",
            SymOp::Mul => "*",
            SymOp::FloorDiv => "//",
            SymOp::Eq => "==",
            SymOp::Lt => "<",
        }
    }

    fn result_kind(self, lhs: SymKind, rhs: SymKind) -> SymKind {
        match self {
            SymOp::Eq | SymOp::Lt => SymKind::Bool,
            SymOp::FloorDiv => SymKind::Int,
            _ if lhs == SymKind::Float || rhs == SymKind::Float => SymKind::Float,
            _ => SymKind::Int,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymExpr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Symbol(Symbol),
    Binary {
        op: SymOp,
        lhs: Box<SymExpr>,
        rhs: Box<SymExpr>,
    },
}

impl SymExpr {
    pub fn is_number(&self) -> bool {
        matches!(self, SymExpr::Int(_) | SymExpr::Float(_) | SymExpr::Bool(_))
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            SymExpr::Symbol(symbol) => Some(symbol),
            _ => None,
        }
    }

    pub fn free_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            SymExpr::Symbol(symbol) => {
                if !out.contains(symbol) {
                    out.push(symbol.clone());
                }
            }
            SymExpr::Binary { lhs, rhs, .. } => {
                lhs.free_symbols(out);
                rhs.free_symbols(out);
            }
            _ => {}
        }
    }

    fn from_literal(literal: &Literal) -> Option<SymExpr> {
        match literal {
            Literal::Int(v) => Some(SymExpr::Int(*v)),
            Literal::Float(v) => Some(SymExpr::Float(*v)),
            Literal::Bool(v) => Some(SymExpr::Bool(*v)),
            _ => None,
        }
    }

    fn to_literal(&self, kind: SymKind) -> Option<Literal> {
        let literal = match self {
            SymExpr::Int(v) => Literal::Int(*v),
            SymExpr::Float(v) => Literal::Float(*v),
            SymExpr::Bool(v) => Literal::Bool(*v),
            _ => return None,
        };
        Some(literal.coerce(kind))
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, expr: &SymExpr) -> fmt::Result {
            if matches!(expr, SymExpr::Binary { .. }) {
                write!(f, "({expr})")
            } else {
                write!(f, "{expr}")
            }
        }
        match self {
            SymExpr::Int(v) => write!(f, "{v}"),
            SymExpr::Float(v) => write!(f, "{v:?}"),
            SymExpr::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            SymExpr::Symbol(symbol) => write!(f, "{symbol}"),
            SymExpr::Binary { op, lhs, rhs } => {
                operand(f, lhs)?;
                write!(f, " {} ", op.symbol())?;
                operand(f, rhs)
            }
        }
    }
}

/// Shared state behind every wrapper of one symbolic variable.
#[derive(Debug)]
pub struct SymNode {
    id: SymNodeId,
    expr: SymExpr,
    kind: SymKind,
    hint: Option<Literal>,
    constant: Option<Literal>,
}

/// Symbolic int/float/bool observed during tracing.
#[derive(Clone)]
pub struct SymScalar {
    node: Rc<SymNode>,
}

impl SymScalar {
    fn from_node(
        expr: SymExpr,
        kind: SymKind,
        hint: Option<Literal>,
        constant: Option<Literal>,
    ) -> Self {
        SymScalar {
            node: Rc::new(SymNode {
                id: SymNodeId::fresh(),
                expr,
                kind,
                hint,
                constant,
            }),
        }
    }

    /// Creates a free variable; `hint` is the concrete value it stood for when it was introduced.
    pub fn symbol(symbol: Symbol, kind: SymKind, hint: Option<Literal>) -> Self {
        SymScalar::from_node(SymExpr::Symbol(symbol), kind, hint, None)
    }

    /// Wraps a statically known value so it can flow where symbolic scalars are expected.
    pub fn constant(value: Literal) -> Self {
        let kind = value.sym_kind().unwrap_or(SymKind::Int);
        let expr = SymExpr::from_literal(&value).unwrap_or(SymExpr::Int(0));
        SymScalar::from_node(expr, kind, Some(value.clone()), Some(value))
    }

    /// Returns a fresh wrapper over the same node, the way a metadata read would.
    pub fn rewrap(&self) -> Self {
        SymScalar {
            node: Rc::clone(&self.node),
        }
    }

    pub fn node_id(&self) -> SymNodeId {
        self.node.id
    }

    pub fn expr(&self) -> &SymExpr {
        &self.node.expr
    }

    pub fn kind(&self) -> SymKind {
        self.node.kind
    }

    pub fn hint(&self) -> Option<&Literal> {
        self.node.hint.as_ref()
    }

    pub fn constant_value(&self) -> Option<&Literal> {
        self.node.constant.as_ref()
    }

    /// Statically known value, coerced to this scalar's kind.
    pub fn literal(&self) -> Option<Literal> {
        if let Some(constant) = &self.node.constant {
            return Some(constant.clone());
        }
        self.node.expr.to_literal(self.node.kind)
    }

    pub fn is_literal(&self) -> bool {
        self.literal().is_some()
    }

    pub fn int_hint(&self) -> Option<i64> {
        match self.hint() {
            Some(Literal::Int(v)) => Some(*v),
            Some(Literal::Bool(v)) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Debug for SymScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sym({}#{})", self.node.expr, self.node.id.0)
    }
}

impl fmt::Display for SymScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node.expr)
    }
}

enum Operand {
    Known(Literal),
    Sym(SymScalar),
}

impl Operand {
    fn from_value(value: &Value) -> TraceResult<Self> {
        match value {
            Value::Literal(lit @ (Literal::Int(_) | Literal::Float(_) | Literal::Bool(_))) => {
                Ok(Operand::Known(lit.clone()))
            }
            Value::Sym(sym) => Ok(match sym.literal() {
                Some(lit) => Operand::Known(lit),
                None => Operand::Sym(sym.rewrap()),
            }),
            other => Err(TraceError::unexpected("symbolic operand", other.type_name())),
        }
    }

    fn kind(&self) -> SymKind {
        match self {
            Operand::Known(lit) => lit.sym_kind().unwrap_or(SymKind::Int),
            Operand::Sym(sym) => sym.kind(),
        }
    }

    fn expr(&self) -> SymExpr {
        match self {
            Operand::Known(lit) => SymExpr::from_literal(lit).unwrap_or(SymExpr::Int(0)),
            Operand::Sym(sym) => sym.expr().clone(),
        }
    }

    fn hint(&self) -> Option<Literal> {
        match self {
            Operand::Known(lit) => Some(lit.clone()),
            Operand::Sym(sym) => sym.hint().cloned(),
        }
    }
}

/// Evaluates a scalar operator on two concrete values.
pub fn eval_literal(op: SymOp, lhs: &Literal, rhs: &Literal) -> TraceResult<Literal> {
    let kind = op.result_kind(
        lhs.sym_kind().unwrap_or(SymKind::Int),
        rhs.sym_kind().unwrap_or(SymKind::Int),
    );
    if matches!(op, SymOp::Eq | SymOp::Lt) {
        let (a, b) = (lhs.as_f64(), rhs.as_f64());
        return match (a, b) {
            (Some(a), Some(b)) => Ok(Literal::Bool(if op == SymOp::Eq { a == b } else { a < b })),
            _ => Err(TraceError::unexpected("numeric operands", format!("{lhs:?}, {rhs:?}"))),
        };
    }
    match kind {
        SymKind::Float => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(TraceError::unexpected("numeric operands", format!("{lhs:?}, {rhs:?}")));
            };
            Ok(Literal::Float(match op {
                SymOp::Add => a + b,
                SymOp::Sub => a - b,
                SymOp::Mul => a * b,
                _ => unreachable!("float results only come from arithmetic operators"),
            }))
        }
        _ => {
            let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) else {
                if op == SymOp::FloorDiv {
                    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                        if b == 0.0 {
                            return Err(TraceError::unexpected("non-zero divisor", "0"));
                        }
                        return Ok(Literal::Int((a / b).floor() as i64));
                    }
                }
                return Err(TraceError::unexpected("integer operands", format!("{lhs:?}, {rhs:?}")));
            };
            Ok(Literal::Int(match op {
                SymOp::Add => a.wrapping_add(b),
                SymOp::Sub => a.wrapping_sub(b),
                SymOp::Mul => a.wrapping_mul(b),
                SymOp::FloorDiv => {
                    if b == 0 {
                        return Err(TraceError::unexpected("non-zero divisor", "0"));
                    }
                    let quotient = a.checked_div_euclid(b).ok_or_else(|| {
                        TraceError::unexpected("quotient within i64", format!("{a} // {b}"))
                    })?;
                    quotient - i64::from(b < 0 && a.rem_euclid(b) != 0)
                }
                SymOp::Eq | SymOp::Lt => unreachable!("comparisons handled above"),
            }))
        }
    }
}

/// Applies `op` to two scalar values without any tracing.
///
/// Known operands fold to a plain literal; otherwise a new symbolic node is allocated whose hint is
/// derived from the operand hints when all of them are available.
pub fn apply(op: SymOp, lhs: &Value, rhs: &Value) -> TraceResult<Value> {
    let lhs = Operand::from_value(lhs)?;
    let rhs = Operand::from_value(rhs)?;
    if let (Operand::Known(a), Operand::Known(b)) = (&lhs, &rhs) {
        return Ok(Value::Literal(eval_literal(op, a, b)?));
    }
    let kind = op.result_kind(lhs.kind(), rhs.kind());
    let hint = match (lhs.hint(), rhs.hint()) {
        (Some(a), Some(b)) => eval_literal(op, &a, &b).ok(),
        _ => None,
    };
    let expr = SymExpr::Binary {
        op,
        lhs: Box::new(lhs.expr()),
        rhs: Box::new(rhs.expr()),
    };
    Ok(Value::Sym(SymScalar::from_node(expr, kind, hint, None)))
}
