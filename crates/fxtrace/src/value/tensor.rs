use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TraceError, TraceResult};

use super::symbolic::{self, SymOp, SymScalar};
use super::{Literal, Value};

static NEXT_TENSOR: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a runtime tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(u64);

impl TensorId {
    fn fresh() -> Self {
        TensorId(NEXT_TENSOR.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Element types understood by the tracer and the reference kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    I64,
    F16,
    Bf16,
    F32,
}

impl DType {
    pub fn is_floating(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32)
    }

    /// Half-width float types whose pointwise results may need a precision barrier.
    pub fn is_low_precision(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16)
    }

    /// Result type of a binary arithmetic op, following float > int > bool.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        match (self.is_floating(), other.is_floating()) {
            (true, true) => DType::F32,
            (true, false) => self,
            (false, true) => other,
            (false, false) => DType::I64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// A tensor extent: either statically known or a symbolic integer.
#[derive(Clone, Debug)]
pub enum Dim {
    Static(i64),
    Sym(SymScalar),
}

impl Dim {
    pub fn as_static(&self) -> Option<i64> {
        match self {
            Dim::Static(v) => Some(*v),
            Dim::Sym(s) => s.literal().and_then(|lit| lit.as_i64()),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        self.as_static().is_none()
    }

    /// Concrete value this extent stood for when it was introduced, if any.
    pub fn hint(&self) -> Option<i64> {
        match self {
            Dim::Static(v) => Some(*v),
            Dim::Sym(s) => s.int_hint(),
        }
    }

    /// Structural equality: same static value or same symbolic node.
    pub fn same_as(&self, other: &Dim) -> bool {
        match (self, other) {
            (Dim::Sym(a), Dim::Sym(b)) => a.node_id() == b.node_id(),
            _ => match (self.as_static(), other.as_static()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn add(&self, other: &Dim) -> Dim {
        match (self.as_static(), other.as_static()) {
            (Some(0), _) => other.clone(),
            (_, Some(0)) => self.clone(),
            _ => self.combine(SymOp::Add, other),
        }
    }

    pub fn mul(&self, other: &Dim) -> Dim {
        match (self.as_static(), other.as_static()) {
            (Some(1), _) => other.clone(),
            (_, Some(1)) => self.clone(),
            _ => self.combine(SymOp::Mul, other),
        }
    }

    fn combine(&self, op: SymOp, other: &Dim) -> Dim {
        match symbolic::apply(op, &Value::from(self.clone()), &Value::from(other.clone())) {
            Ok(Value::Sym(s)) => Dim::Sym(s),
            Ok(value) => Dim::Static(value.as_int().unwrap_or_default()),
            Err(_) => Dim::Static(0),
        }
    }

    fn reread(&self) -> Dim {
        match self {
            Dim::Static(v) => Dim::Static(*v),
            Dim::Sym(s) => Dim::Sym(s.rewrap()),
        }
    }
}

impl PartialEq for Dim {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{v}"),
            Dim::Sym(s) => write!(f, "{s}"),
        }
    }
}

/// Shape, layout, and dtype of a tensor. Never carries data.
#[derive(Clone, Debug)]
pub struct TensorMeta {
    dtype: DType,
    sizes: Vec<Dim>,
    strides: Vec<Dim>,
    storage_offset: Dim,
    numel: Dim,
}

impl TensorMeta {
    pub fn new(dtype: DType, sizes: Vec<Dim>, strides: Vec<Dim>, storage_offset: Dim) -> Self {
        let numel = sizes.iter().fold(Dim::Static(1), |acc, dim| acc.mul(dim));
        TensorMeta {
            dtype,
            sizes,
            strides,
            storage_offset,
            numel,
        }
    }

    /// Row-major layout with zero storage offset.
    pub fn contiguous(dtype: DType, sizes: Vec<Dim>) -> Self {
        let mut strides = vec![Dim::Static(1); sizes.len()];
        for i in (0..sizes.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1].mul(&sizes[i + 1]);
        }
        TensorMeta::new(dtype, sizes, strides, Dim::Static(0))
    }

    pub fn with_static_sizes(dtype: DType, sizes: &[i64]) -> Self {
        TensorMeta::contiguous(dtype, sizes.iter().copied().map(Dim::Static).collect())
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        TensorMeta {
            dtype,
            ..self.clone()
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[Dim] {
        &self.sizes
    }

    pub fn strides(&self) -> &[Dim] {
        &self.strides
    }

    pub fn storage_offset(&self) -> &Dim {
        &self.storage_offset
    }

    pub fn numel(&self) -> &Dim {
        &self.numel
    }

    /// Sizes as plain integers, when none of them is symbolic.
    pub fn static_sizes(&self) -> Option<Vec<i64>> {
        self.sizes.iter().map(Dim::as_static).collect()
    }
}

/// Host storage for concrete tensors.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    I64(Arc<[i64]>),
    Bool(Arc<[bool]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            TensorData::F32(v) => v.get(index).map(|x| *x as f64),
            TensorData::I64(v) => v.get(index).map(|x| *x as f64),
            TensorData::Bool(v) => v.get(index).map(|x| if *x { 1.0 } else { 0.0 }),
        }
    }

    pub fn literal_at(&self, index: usize) -> Option<Literal> {
        match self {
            TensorData::F32(v) => v.get(index).map(|x| Literal::Float(*x as f64)),
            TensorData::I64(v) => v.get(index).map(|x| Literal::Int(*x)),
            TensorData::Bool(v) => v.get(index).map(|x| Literal::Bool(*x)),
        }
    }
}

/// What kind of tensor object a value is, as seen by the bail-out check.
#[derive(Clone, Debug)]
pub enum TensorKind {
    Plain,
    Parameter,
    /// A wrapper type the recording layer does not understand on its own.
    Subclass { type_name: Arc<str>, inner: TensorRef },
}

impl TensorKind {
    pub fn type_name(&self) -> &str {
        match self {
            TensorKind::Plain => "Tensor",
            TensorKind::Parameter => "Parameter",
            TensorKind::Subclass { type_name, .. } => type_name,
        }
    }

    pub fn is_directly_supported(&self) -> bool {
        matches!(self, TensorKind::Plain | TensorKind::Parameter)
    }
}

struct TensorInner {
    id: TensorId,
    meta: TensorMeta,
    data: RefCell<Option<TensorData>>,
    simulated: bool,
    kind: TensorKind,
}

/// Shared handle to a runtime tensor. Clones alias the same tensor.
#[derive(Clone)]
pub struct TensorRef(Rc<TensorInner>);

impl TensorRef {
    fn build(
        meta: TensorMeta,
        data: Option<TensorData>,
        simulated: bool,
        kind: TensorKind,
    ) -> Self {
        TensorRef(Rc::new(TensorInner {
            id: TensorId::fresh(),
            meta,
            data: RefCell::new(data),
            simulated,
            kind,
        }))
    }

    /// Creates a concrete tensor; `data` must hold one element per logical element.
    pub fn concrete(meta: TensorMeta, data: TensorData) -> TraceResult<Self> {
        if let Some(numel) = meta.numel().as_static() {
            if data.len() as i64 != numel {
                return Err(TraceError::unexpected(
                    "storage matching the tensor shape",
                    format!("{} elements for numel {numel}", data.len()),
                ));
            }
        }
        Ok(TensorRef::build(meta, Some(data), false, TensorKind::Plain))
    }

    pub fn from_f32(sizes: &[i64], values: Vec<f32>) -> TraceResult<Self> {
        TensorRef::concrete(
            TensorMeta::with_static_sizes(DType::F32, sizes),
            TensorData::F32(values.into()),
        )
    }

    pub fn from_i64(sizes: &[i64], values: Vec<i64>) -> TraceResult<Self> {
        TensorRef::concrete(
            TensorMeta::with_static_sizes(DType::I64, sizes),
            TensorData::I64(values.into()),
        )
    }

    pub fn from_bool(sizes: &[i64], values: Vec<bool>) -> TraceResult<Self> {
        TensorRef::concrete(
            TensorMeta::with_static_sizes(DType::Bool, sizes),
            TensorData::Bool(values.into()),
        )
    }

    /// Data-less placeholder with the given metadata.
    pub fn simulated(meta: TensorMeta) -> Self {
        TensorRef::build(meta, None, true, TensorKind::Plain)
    }

    /// Concrete parameter tensor, e.g. a module weight.
    pub fn parameter(meta: TensorMeta, data: TensorData) -> TraceResult<Self> {
        let plain = TensorRef::concrete(meta, data)?;
        Ok(TensorRef::build(
            plain.meta().clone(),
            plain.data(),
            false,
            TensorKind::Parameter,
        ))
    }

    /// Wraps `inner` in a tensor subclass named `type_name`.
    pub fn subclass(type_name: &str, inner: TensorRef) -> Self {
        TensorRef::build(
            inner.meta().clone(),
            None,
            inner.is_simulated(),
            TensorKind::Subclass {
                type_name: Arc::from(type_name),
                inner,
            },
        )
    }

    pub fn id(&self) -> TensorId {
        self.0.id
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.0.meta
    }

    pub fn kind(&self) -> &TensorKind {
        &self.0.kind
    }

    pub fn dtype(&self) -> DType {
        self.0.meta.dtype()
    }

    pub fn rank(&self) -> usize {
        self.0.meta.rank()
    }

    /// Reads one size. Symbolic sizes come back in a fresh wrapper over the same node.
    pub fn size(&self, dim: usize) -> Option<Dim> {
        self.0.meta.sizes().get(dim).map(Dim::reread)
    }

    pub fn sizes(&self) -> Vec<Dim> {
        self.0.meta.sizes().iter().map(Dim::reread).collect()
    }

    pub fn strides(&self) -> Vec<Dim> {
        self.0.meta.strides().iter().map(Dim::reread).collect()
    }

    pub fn numel(&self) -> Dim {
        self.0.meta.numel().reread()
    }

    pub fn storage_offset(&self) -> Dim {
        self.0.meta.storage_offset().reread()
    }

    pub fn is_simulated(&self) -> bool {
        self.0.simulated
    }

    pub fn data(&self) -> Option<TensorData> {
        self.0.data.borrow().clone()
    }

    /// Replaces the storage of this tensor; used by in-place kernels.
    pub fn replace_data(&self, data: TensorData) -> TraceResult<()> {
        if self.0.simulated {
            return Err(TraceError::unexpected("concrete tensor", "simulated tensor"));
        }
        *self.0.data.borrow_mut() = Some(data);
        Ok(())
    }

    /// Independent copy with a new identity.
    pub fn deep_clone(&self) -> Self {
        TensorRef::build(
            self.0.meta.clone(),
            self.data(),
            self.0.simulated,
            self.0.kind.clone(),
        )
    }

    pub fn same(&self, other: &TensorRef) -> bool {
        self.id() == other.id()
    }

    /// Single element of a concrete one-element tensor.
    pub fn item(&self) -> TraceResult<Literal> {
        let data = self
            .data()
            .ok_or_else(|| TraceError::unexpected("concrete tensor", "simulated tensor"))?;
        if data.len() != 1 {
            return Err(TraceError::unexpected(
                "one-element tensor",
                format!("{} elements", data.len()),
            ));
        }
        data.literal_at(0)
            .ok_or_else(|| TraceError::unexpected("one-element tensor", "empty storage"))
    }
}

impl fmt::Debug for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes = self
            .0
            .meta
            .sizes()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{}#{}[{}]:{}{}",
            self.0.kind.type_name(),
            self.0.id.0,
            sizes,
            self.dtype(),
            if self.0.simulated { " (simulated)" } else { "" }
        )
    }
}
