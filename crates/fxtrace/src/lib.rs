pub mod annotate;
pub mod dispatch;
pub mod error;
pub mod ir;
pub mod module;
pub mod ops;
pub mod session;
pub mod simulate;
pub mod tracer;
pub mod value;
mod env;

pub use dispatch::{DispatchContext, Dispatcher};
pub use error::{TraceError, TraceResult};
pub use ir::{Argument, Graph, Node, NodeKind, Proxy};
pub use module::{AccessPathView, Module, ModuleStackTracer};
pub use ops::{DecompositionTable, KernelExecutor, Op, OpTag};
pub use session::{BailOutPolicy, Discipline, TraceConfig, TraceSession, TracedGraph};
pub use simulate::{ShapeEnv, ShapeSolver, SimulationContext, ValueSimulator};
pub use value::{CallArgs, DType, Dim, Literal, SymScalar, TensorRef, Value};
