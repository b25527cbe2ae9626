//! Interception layers wrapped around every operator call.
//!
//! ```text
//!   Dispatcher::call
//!     └─ function layers (metadata, pre-dispatch)     top-down, each suspended while it runs
//!         └─ DispatchContext::dispatch
//!             ├─ user dispatch layers                 top-down, each suspended while it runs
//!             ├─ recording slot                       RecordingLayer, suspended while it runs
//!             ├─ simulation slot                      SimulationContext -> execute_meta
//!             └─ kernel executor                      execute
//! ```
//!
//! Symbolic-scalar arithmetic takes a separate path through [`DispatchContext::sym_dispatch`],
//! which consults the innermost [`SymRecordingLayer`].
//!
//! All state lives in an explicit [`DispatchContext`]; there is no process-wide mode stack. Layers
//! are installed through the guards in [`guards`], which restore whatever they displaced on drop.

mod dispatcher;
pub mod guards;
mod layers;
mod proxy_mode;
mod record;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::annotate::CallSites;
use crate::error::{TraceError, TraceResult};
use crate::ops::{aten, DecompositionTable, KernelExecutor, Op};
use crate::session::ActiveSession;
use crate::simulate::SimulationContext;
use crate::value::{symbolic, CallArgs, SymOp, Value};

pub use dispatcher::Dispatcher;
pub use guards::{FlagGuard, SlotGuard, StackGuard, SuspendGuard};
pub use layers::{MetadataLayer, PreDispatchLayer};
pub use proxy_mode::{RecordingLayer, RecordingOptions, RecordingScope, SymRecordingLayer};

/// Outcome of a layer that may decline a call.
#[derive(Debug)]
pub enum Dispatched {
    Handled(Value),
    /// The layer does not understand some tensor types among the arguments.
    NotImplemented(Vec<String>),
}

/// Layer that sees calls before they are lowered to the dispatch stack.
pub trait FunctionLayer {
    fn name(&self) -> &str;

    /// Handles `op`. Forwarding is done by calling [`DispatchContext::call`] again.
    fn call(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value>;
}

/// User-provided interception layer sitting above the recording slot.
pub trait DispatchLayer {
    fn name(&self) -> &str;

    /// Handles `op`. Forwarding is done by calling [`DispatchContext::dispatch`] again.
    fn dispatch(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value>;
}

/// Handles calls the recording layer declined because of a tensor subclass.
pub trait SubclassHandler {
    /// Type name of the subclass this handler understands.
    fn type_name(&self) -> &str;

    fn dispatch(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value>;
}

/// Explicit interception context threaded through a trace.
pub struct DispatchContext {
    kernels: Rc<dyn KernelExecutor>,
    function_layers: RefCell<Vec<Rc<dyn FunctionLayer>>>,
    dispatch_layers: RefCell<Vec<Rc<dyn DispatchLayer>>>,
    recording: RefCell<Option<Rc<RecordingLayer>>>,
    simulation: RefCell<Option<Rc<SimulationContext>>>,
    sym_layers: RefCell<Vec<Rc<SymRecordingLayer>>>,
    decompositions: RefCell<Rc<DecompositionTable>>,
    dispatcher_extension: Cell<bool>,
    autocast_cache: Cell<bool>,
    grad_enabled: Cell<bool>,
    subclass_handlers: RefCell<HashMap<String, Rc<dyn SubclassHandler>>>,
    session: RefCell<Option<Rc<ActiveSession>>>,
    call_sites: Rc<CallSites>,
}

impl DispatchContext {
    pub fn new(kernels: Rc<dyn KernelExecutor>) -> Self {
        DispatchContext {
            kernels,
            function_layers: RefCell::new(Vec::new()),
            dispatch_layers: RefCell::new(Vec::new()),
            recording: RefCell::new(None),
            simulation: RefCell::new(None),
            sym_layers: RefCell::new(Vec::new()),
            decompositions: RefCell::new(Rc::new(DecompositionTable::new())),
            dispatcher_extension: Cell::new(false),
            autocast_cache: Cell::new(true),
            grad_enabled: Cell::new(true),
            subclass_handlers: RefCell::new(HashMap::new()),
            session: RefCell::new(None),
            call_sites: Rc::default(),
        }
    }

    pub fn kernels(&self) -> &dyn KernelExecutor {
        self.kernels.as_ref()
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self)
    }

    /// Entry point for an operator call: function layers first, then the dispatch stack.
    pub fn call(&self, op: Op, args: &CallArgs) -> TraceResult<Value> {
        if let Some((layer, _suspended)) = SuspendGuard::take_top(&self.function_layers) {
            return layer.call(self, op, args);
        }
        if op == aten::SET_GRAD_ENABLED {
            let enabled = match args.arg(0)?.as_literal() {
                Some(lit) => lit.as_i64().map(|v| v != 0),
                None => None,
            }
            .ok_or_else(|| TraceError::unexpected("bool", args.args[0].type_name()))?;
            self.grad_enabled.set(enabled);
            return Ok(Value::none());
        }
        self.dispatch(op, args)
    }

    /// Lowers a call through user layers, the recording slot, simulation, and the kernels.
    pub fn dispatch(&self, op: Op, args: &CallArgs) -> TraceResult<Value> {
        if let Some((layer, _suspended)) = SuspendGuard::take_top(&self.dispatch_layers) {
            return layer.dispatch(self, op, args);
        }
        let recording = self.recording.borrow().clone();
        if let Some(layer) = recording {
            let outcome = {
                let _suspended = self.suspend_recording();
                layer.dispatch(self, op, args)?
            };
            return match outcome {
                Dispatched::Handled(value) => Ok(value),
                Dispatched::NotImplemented(types) => self.dispatch_subclass(op, args, types),
            };
        }
        let simulation = self.simulation.borrow().clone();
        if let Some(simulation) = simulation {
            return simulation.dispatch(self, op, args);
        }
        self.kernels.execute(op, args)
    }

    fn dispatch_subclass(&self, op: Op, args: &CallArgs, types: Vec<String>) -> TraceResult<Value> {
        let handler = types
            .iter()
            .find_map(|name| self.subclass_handlers.borrow().get(name).cloned());
        match handler {
            Some(handler) => {
                tracing::debug!(
                    op = %op,
                    subclass = handler.type_name(),
                    "delegating to subclass handler"
                );
                handler.dispatch(self, op, args)
            }
            None => Err(TraceError::UnrecognizedInput {
                op: op.qualified_name(),
                types,
            }),
        }
    }

    /// Applies a symbolic-scalar operator through the innermost symbolic layer, if any.
    pub fn sym_dispatch(&self, op: SymOp, lhs: &Value, rhs: &Value) -> TraceResult<Value> {
        if let Some((layer, _suspended)) = SuspendGuard::take_top(&self.sym_layers) {
            return layer.handle(op, lhs, rhs);
        }
        symbolic::apply(op, lhs, rhs)
    }

    pub fn push_function_layer(
        &self,
        layer: Rc<dyn FunctionLayer>,
    ) -> StackGuard<'_, Rc<dyn FunctionLayer>> {
        StackGuard::push(&self.function_layers, layer)
    }

    pub fn push_dispatch_layer(
        &self,
        layer: Rc<dyn DispatchLayer>,
    ) -> StackGuard<'_, Rc<dyn DispatchLayer>> {
        StackGuard::push(&self.dispatch_layers, layer)
    }

    pub fn push_sym_layer(
        &self,
        layer: Rc<SymRecordingLayer>,
    ) -> StackGuard<'_, Rc<SymRecordingLayer>> {
        StackGuard::push(&self.sym_layers, layer)
    }

    pub fn recording(&self) -> Option<Rc<RecordingLayer>> {
        self.recording.borrow().clone()
    }

    pub(crate) fn install_recording(
        &self,
        layer: Option<Rc<RecordingLayer>>,
    ) -> SlotGuard<'_, Option<Rc<RecordingLayer>>> {
        SlotGuard::replace(&self.recording, layer)
    }

    /// Empties the recording slot until the guard is dropped.
    pub fn suspend_recording(&self) -> SlotGuard<'_, Option<Rc<RecordingLayer>>> {
        SlotGuard::replace(&self.recording, None)
    }

    pub fn simulation(&self) -> Option<Rc<SimulationContext>> {
        self.simulation.borrow().clone()
    }

    pub fn install_simulation(
        &self,
        simulation: Option<Rc<SimulationContext>>,
    ) -> SlotGuard<'_, Option<Rc<SimulationContext>>> {
        SlotGuard::replace(&self.simulation, simulation)
    }

    /// Runs calls on real data until the guard is dropped.
    pub fn suspend_simulation(&self) -> SlotGuard<'_, Option<Rc<SimulationContext>>> {
        SlotGuard::replace(&self.simulation, None)
    }

    pub fn decompositions(&self) -> Rc<DecompositionTable> {
        self.decompositions.borrow().clone()
    }

    pub fn install_decompositions(
        &self,
        table: Rc<DecompositionTable>,
    ) -> SlotGuard<'_, Rc<DecompositionTable>> {
        SlotGuard::replace(&self.decompositions, table)
    }

    /// Enables symbolic-shape aware kernels for the lifetime of the guard.
    pub fn enable_dispatcher_extension(&self) -> FlagGuard<'_, bool> {
        FlagGuard::set(&self.dispatcher_extension, true)
    }

    pub fn dispatcher_extension_active(&self) -> bool {
        self.dispatcher_extension.get()
    }

    pub fn disable_autocast_cache(&self) -> FlagGuard<'_, bool> {
        FlagGuard::set(&self.autocast_cache, false)
    }

    pub fn autocast_cache_enabled(&self) -> bool {
        self.autocast_cache.get()
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled.get()
    }

    pub fn register_subclass_handler(&self, handler: Rc<dyn SubclassHandler>) {
        self.subclass_handlers
            .borrow_mut()
            .insert(handler.type_name().to_string(), handler);
    }

    pub(crate) fn session(&self) -> Option<Rc<ActiveSession>> {
        self.session.borrow().clone()
    }

    pub(crate) fn install_session(
        &self,
        session: Option<Rc<ActiveSession>>,
    ) -> SlotGuard<'_, Option<Rc<ActiveSession>>> {
        SlotGuard::replace(&self.session, session)
    }

    /// Hides the installed function and symbolic layers from a nested session until dropped.
    pub(crate) fn isolate_layers(&self) -> LayerIsolation<'_> {
        LayerIsolation {
            _function: SlotGuard::replace(&self.function_layers, Vec::new()),
            _sym: SlotGuard::replace(&self.sym_layers, Vec::new()),
        }
    }

    /// Source locations of the dispatcher calls in progress.
    pub fn call_sites(&self) -> &Rc<CallSites> {
        &self.call_sites
    }

    /// Number of function layers currently installed.
    pub fn function_depth(&self) -> usize {
        self.function_layers.borrow().len()
    }

    pub fn sym_depth(&self) -> usize {
        self.sym_layers.borrow().len()
    }
}

/// Outer function and symbolic layer stacks, reinstated when dropped.
#[must_use = "the outer layers are reinstated as soon as the guard is dropped"]
pub struct LayerIsolation<'a> {
    _function: SlotGuard<'a, Vec<Rc<dyn FunctionLayer>>>,
    _sym: SlotGuard<'a, Vec<Rc<SymRecordingLayer>>>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("kernels", &self.kernels.name())
            .field("function_layers", &self.function_layers.borrow().len())
            .field("dispatch_layers", &self.dispatch_layers.borrow().len())
            .field("recording", &self.recording.borrow().is_some())
            .field("simulation", &self.simulation.borrow().is_some())
            .field("sym_layers", &self.sym_layers.borrow().len())
            .finish()
    }
}
