//! Simulated execution: data-less tensors and the symbolic-shape solver behind them.
//!
//! The simulation slot of the dispatch stack routes calls to [`KernelExecutor::execute_meta`]
//! after converting any real tensor arguments it is allowed to convert. Sessions using the
//! simulated disciplines install one [`SimulationContext`] for the whole trace; isolated
//! sub-sessions reuse their parent's.
//!
//! [`KernelExecutor::execute_meta`]: crate::ops::KernelExecutor::execute_meta

mod meta;
mod shape_env;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::dispatch::DispatchContext;
use crate::error::{TraceError, TraceResult};
use crate::ops::{aten, Op, OpTag};
use crate::value::{CallArgs, KeyPath, SymScalar, TensorId, TensorRef, Value};

pub use meta::MetaSimulator;
pub use shape_env::ShapeEnv;

/// Fabricates data-less stand-ins for real tensors.
pub trait ValueSimulator {
    /// Returns a simulated tensor with the metadata of `tensor`. With a solver, extents become
    /// symbols whose sources are rooted at `source` (e.g. `input0.size(1)`).
    fn simulate(
        &self,
        tensor: &TensorRef,
        source: &str,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<TensorRef>;
}

/// Allocates symbols and reports which of them a kernel result defines.
pub trait ShapeSolver {
    /// Backed symbol standing for the concrete value `hint`.
    fn create_symbol(&self, hint: i64, source: &str) -> SymScalar;

    /// Fresh symbol with no hint, for sizes that depend on tensor contents.
    fn create_unbacked_int(&self) -> SymScalar;

    /// Maps every unbacked symbol allocated since the last call to where it appears in `value`.
    fn compute_unbacked_bindings(&self, value: &Value) -> BTreeMap<String, KeyPath>;
}

/// Simulation state shared by a session and its isolated sub-sessions.
pub struct SimulationContext {
    simulator: Rc<dyn ValueSimulator>,
    shape_env: Option<Rc<ShapeEnv>>,
    allow_non_simulated: bool,
    memo: RefCell<HashMap<TensorId, TensorRef>>,
}

impl SimulationContext {
    pub fn new(simulator: Rc<dyn ValueSimulator>, shape_env: Option<Rc<ShapeEnv>>) -> Self {
        SimulationContext {
            simulator,
            shape_env,
            allow_non_simulated: false,
            memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_meta_simulator(shape_env: Option<Rc<ShapeEnv>>) -> Self {
        SimulationContext::new(Rc::new(MetaSimulator), shape_env)
    }

    pub fn allow_non_simulated_inputs(mut self, allow: bool) -> Self {
        self.allow_non_simulated = allow;
        self
    }

    pub fn shape_env(&self) -> Option<Rc<ShapeEnv>> {
        self.shape_env.clone()
    }

    pub fn solver(&self) -> Option<&dyn ShapeSolver> {
        self.shape_env.as_deref().map(|env| env as &dyn ShapeSolver)
    }

    /// Simulated counterpart of `tensor`; converting the same tensor twice yields the same result.
    pub fn from_tensor(
        &self,
        tensor: &TensorRef,
        source: &str,
        symbolic: bool,
    ) -> TraceResult<TensorRef> {
        if tensor.is_simulated() {
            return Ok(tensor.clone());
        }
        if let Some(existing) = self.memo.borrow().get(&tensor.id()) {
            return Ok(existing.clone());
        }
        let solver = if symbolic { self.solver() } else { None };
        let simulated = self.simulator.simulate(tensor, source, solver)?;
        self.memo.borrow_mut().insert(tensor.id(), simulated.clone());
        Ok(simulated)
    }

    /// Runs `op` on simulated values through the kernel executor's metadata path.
    ///
    /// Operators whose output extents depend on tensor contents need a solver to name them.
    pub(crate) fn dispatch(
        &self,
        cx: &DispatchContext,
        op: Op,
        args: &CallArgs,
    ) -> TraceResult<Value> {
        let converts =
            op == aten::LIFT_FRESH || op == aten::LIFT_FRESH_COPY || self.allow_non_simulated;
        let args = args.map_leaves(&mut |leaf| match leaf {
            Value::Tensor(t) if !t.is_simulated() => {
                if !converts {
                    return Err(TraceError::NonSimulatedInput {
                        op: op.qualified_name(),
                    });
                }
                Ok(Value::Tensor(self.from_tensor(t, "constant", false)?))
            }
            other => Ok(other.clone()),
        })?;
        let solver = if cx.dispatcher_extension_active() {
            self.solver()
        } else {
            None
        };
        if solver.is_none() && op.has_tag(OpTag::DynamicOutputShape) {
            return Err(TraceError::DataDependent {
                op: op.qualified_name(),
            });
        }
        cx.kernels().execute_meta(op, &args, solver)
    }
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("symbolic", &self.shape_env.is_some())
            .field("allow_non_simulated", &self.allow_non_simulated)
            .field("converted", &self.memo.borrow().len())
            .finish()
    }
}
