//! Trace orchestration: one [`TraceSession`] per traced function.
//!
//! A session owns a [`DispatchContext`] and, for every call to [`TraceSession::trace`], builds a
//! fresh [`Tracer`], installs the interception layers around the user function in a fixed order,
//! and hands back the finished graph together with the shape solver (if any). Everything else is
//! torn down by the scope guards, on success and on error alike.

mod config;

use std::rc::Rc;

use crate::annotate::{DebugMetadataCollector, DefaultCollector};
use crate::dispatch::{
    DispatchContext, Dispatcher, MetadataLayer, PreDispatchLayer, RecordingLayer, SubclassHandler,
    SymRecordingLayer,
};
use crate::error::{TraceError, TraceResult};
use crate::ir::{Argument, Graph};
use crate::module::{AccessPathView, Module, ModuleStackTracer};
use crate::ops::{aten, sym_numel, DecompositionTable, KernelExecutor};
use crate::simulate::{ShapeEnv, SimulationContext};
use crate::tracer::Tracer;
use crate::value::{Literal, Value};

pub use config::{BailOutPolicy, Discipline, TraceConfig};

/// Result of a successful trace.
#[derive(Debug)]
pub struct TracedGraph {
    pub graph: Graph,
    /// Solver that allocated the graph's symbols; only set for the symbolic discipline.
    pub shape_env: Option<Rc<ShapeEnv>>,
    /// What the traced function returned.
    pub output: Value,
}

/// Per-trace state reachable from the dispatch context while a trace runs.
pub(crate) struct ActiveSession {
    config: TraceConfig,
    decompositions: Rc<DecompositionTable>,
    simulation: Option<Rc<SimulationContext>>,
    module_root: Option<Rc<Module>>,
    collectors: Vec<Rc<dyn DebugMetadataCollector>>,
    module_tracer: Option<Rc<ModuleStackTracer>>,
}

impl ActiveSession {
    pub(crate) fn module_tracer(&self) -> Option<Rc<ModuleStackTracer>> {
        self.module_tracer.clone()
    }

    pub(crate) fn root_view(&self) -> TraceResult<AccessPathView> {
        if let Some(module_tracer) = &self.module_tracer {
            return Ok(module_tracer.root_view());
        }
        self.module_root
            .as_ref()
            .map(|root| AccessPathView::detached(Rc::clone(root)))
            .ok_or_else(|| {
                TraceError::Config("no module root is registered with this session".to_string())
            })
    }
}

/// Everything one run of the orchestrator needs besides the function and its inputs.
struct Plan {
    config: TraceConfig,
    decompositions: Rc<DecompositionTable>,
    simulation: Option<Rc<SimulationContext>>,
    module_root: Option<Rc<Module>>,
    collectors: Vec<Rc<dyn DebugMetadataCollector>>,
}

/// Records functions run against a kernel executor into graphs.
pub struct TraceSession {
    cx: DispatchContext,
    config: TraceConfig,
    decompositions: DecompositionTable,
    shape_env: Option<Rc<ShapeEnv>>,
    module_root: Option<Rc<Module>>,
    collectors: Vec<Rc<dyn DebugMetadataCollector>>,
}

impl TraceSession {
    pub fn new(kernels: Rc<dyn KernelExecutor>, config: TraceConfig) -> Self {
        TraceSession {
            cx: DispatchContext::new(kernels),
            config,
            decompositions: DecompositionTable::new(),
            shape_env: None,
            module_root: None,
            collectors: vec![Rc::new(DefaultCollector::from_env())],
        }
    }

    pub fn with_decompositions(mut self, table: DecompositionTable) -> Self {
        self.decompositions = table;
        self
    }

    /// Solver to use under the symbolic discipline instead of a fresh one.
    pub fn with_shape_env(mut self, shape_env: Rc<ShapeEnv>) -> Self {
        self.shape_env = Some(shape_env);
        self
    }

    pub fn with_module_root(mut self, root: Rc<Module>) -> Self {
        self.module_root = Some(root);
        self
    }

    pub fn with_subclass_handler(self, handler: Rc<dyn SubclassHandler>) -> Self {
        self.cx.register_subclass_handler(handler);
        self
    }

    pub fn with_collector(mut self, collector: Rc<dyn DebugMetadataCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Drops every collector, including the default one.
    pub fn without_collectors(mut self) -> Self {
        self.collectors.clear();
        self
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Context the traces run on; custom dispatch layers can be pushed here.
    pub fn context(&self) -> &DispatchContext {
        &self.cx
    }

    pub fn trace<F>(&self, f: F, args: Vec<Value>) -> TraceResult<TracedGraph>
    where
        F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
    {
        let simulation = simulation_for(&self.config, self.cx.simulation(), self.shape_env.clone());
        let plan = Plan {
            config: self.config.clone(),
            decompositions: Rc::new(self.decompositions.clone()),
            simulation,
            module_root: self.module_root.clone(),
            collectors: self.collectors.clone(),
        };
        run(&self.cx, plan, f, args)
    }

    /// Traces the forward function of the registered module root.
    pub fn trace_module(&self, args: Vec<Value>) -> TraceResult<TracedGraph> {
        if self.module_root.is_none() {
            return Err(TraceError::Config(
                "trace_module requires a module root".to_string(),
            ));
        }
        self.trace(
            |d, args| {
                let root = d.root_module()?;
                root.module().forward(d, &root, args)
            },
            args,
        )
    }
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("config", &self.config)
            .field("decompositions", &self.decompositions)
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

/// Independent trace on the same context, sharing the active session's simulation context.
pub(crate) fn trace_subgraph<F>(
    cx: &DispatchContext,
    f: F,
    args: Vec<Value>,
) -> TraceResult<TracedGraph>
where
    F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
{
    let parent = cx
        .session()
        .ok_or_else(|| TraceError::Config("trace_subgraph called outside of a trace".to_string()))?;
    let plan = Plan {
        config: parent.config.clone().with_discipline(Discipline::Concrete),
        decompositions: Rc::clone(&parent.decompositions),
        simulation: parent.simulation.clone(),
        module_root: parent.module_root.clone(),
        collectors: parent.collectors.clone(),
    };
    tracing::debug!("tracing isolated subgraph");
    let _outer = cx.isolate_layers();
    run(cx, plan, f, args)
}

/// Traces `f` as a fresh session while the enclosing recording layer is suspended.
pub(crate) fn isolated_graph<F>(
    cx: &DispatchContext,
    config: TraceConfig,
    f: F,
    args: Vec<Value>,
) -> TraceResult<TracedGraph>
where
    F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
{
    let _suspended = cx.suspend_recording();
    let _outer = cx.isolate_layers();
    let simulation = simulation_for(&config, cx.simulation(), None);
    let plan = Plan {
        config,
        decompositions: cx.decompositions(),
        simulation,
        module_root: None,
        collectors: vec![Rc::new(DefaultCollector::from_env())],
    };
    run(cx, plan, f, args)
}

/// Simulation context for `config`, reusing `existing` whenever it is good enough.
fn simulation_for(
    config: &TraceConfig,
    existing: Option<Rc<SimulationContext>>,
    shape_env: Option<Rc<ShapeEnv>>,
) -> Option<Rc<SimulationContext>> {
    let fresh = |shape_env: Option<Rc<ShapeEnv>>| {
        Rc::new(
            SimulationContext::with_meta_simulator(shape_env)
                .allow_non_simulated_inputs(config.allow_non_simulated_inputs),
        )
    };
    match config.discipline {
        Discipline::Concrete => existing,
        Discipline::Simulated => existing.or_else(|| Some(fresh(None))),
        Discipline::Symbolic => match existing {
            Some(existing) if existing.shape_env().is_some() => Some(existing),
            _ => Some(fresh(Some(shape_env.unwrap_or_else(|| Rc::new(ShapeEnv::new()))))),
        },
    }
}

fn run<F>(cx: &DispatchContext, plan: Plan, f: F, args: Vec<Value>) -> TraceResult<TracedGraph>
where
    F: FnOnce(&Dispatcher<'_>, &[Value]) -> TraceResult<Value>,
{
    let Plan {
        config,
        decompositions,
        simulation,
        module_root,
        collectors,
    } = plan;
    let discipline = config.discipline;
    tracing::debug!(%discipline, pre_dispatch = config.pre_dispatch, "starting trace");

    let mut table = (*decompositions).clone();
    table.insert_default(aten::SYM_NUMEL, sym_numel);
    let decompositions = Rc::new(table);

    let tracer = Tracer::with_collectors(collectors.clone(), Rc::clone(cx.call_sites()));
    let module_tracer = match (&module_root, config.record_module_stack) {
        (Some(root), true) => Some(ModuleStackTracer::new(Rc::clone(root), Rc::clone(&tracer))),
        _ => None,
    };

    let (leaves, spec) = Value::Seq(args).flatten();
    let leaves = leaves
        .iter()
        .enumerate()
        .map(|(i, leaf)| wrap_input(discipline, simulation.as_deref(), leaf, i))
        .collect::<TraceResult<Vec<_>>>()?;

    let _decompositions = cx.install_decompositions(Rc::clone(&decompositions));
    let _simulation = cx.install_simulation(simulation.clone());
    let _extension = (discipline == Discipline::Symbolic || config.pre_dispatch)
        .then(|| cx.enable_dispatcher_extension());
    let _pre_dispatch = config
        .pre_dispatch
        .then(|| cx.push_function_layer(PreDispatchLayer::new(Rc::clone(&tracer))));
    let sym_layer = SymRecordingLayer::new(Rc::clone(&tracer));
    let _sym = cx.push_sym_layer(Rc::clone(&sym_layer));
    let _metadata = cx.push_function_layer(MetadataLayer::new(Rc::clone(&tracer)));
    let layer = RecordingLayer::new(Rc::clone(&tracer), sym_layer, config.recording_options());
    let _recording = layer.enter(cx);
    let _autocast = cx.disable_autocast_cache();
    let _session = cx.install_session(Some(Rc::new(ActiveSession {
        config: config.clone(),
        decompositions,
        simulation: simulation.clone(),
        module_root,
        collectors,
        module_tracer,
    })));

    {
        let _disabled = layer.disable();
        for (i, leaf) in leaves.iter().enumerate() {
            let proxy = tracer.placeholder(&format!("arg{i}_1"));
            tracer.track_tensor_tree(leaf, proxy, None, None)?;
        }
    }

    let inputs = match spec.unflatten(leaves)? {
        Value::Seq(items) => items,
        other => vec![other],
    };
    let output = f(&Dispatcher::new(cx), &inputs)?;

    let result = output_argument(&tracer, &output)?;
    tracer.output(result);

    let graph = tracer.take_graph();
    tracing::info!(
        %discipline,
        nodes = graph.len(),
        constants = graph.constants().len(),
        "trace complete"
    );
    Ok(TracedGraph {
        graph,
        shape_env: simulation.and_then(|s| s.shape_env()),
        output,
    })
}

/// Placeholder value for input leaf `index` under `discipline`.
fn wrap_input(
    discipline: Discipline,
    simulation: Option<&SimulationContext>,
    leaf: &Value,
    index: usize,
) -> TraceResult<Value> {
    let source = format!("input{index}");
    let Some(simulation) = simulation.filter(|_| discipline.is_simulated()) else {
        return Ok(leaf.clone());
    };
    let symbolic = discipline == Discipline::Symbolic;
    match leaf {
        Value::Tensor(t) => Ok(Value::Tensor(simulation.from_tensor(t, &source, symbolic)?)),
        Value::Literal(Literal::Int(v)) if symbolic => {
            let Some(solver) = simulation.solver() else {
                return Ok(leaf.clone());
            };
            let scalar = solver.create_symbol(*v, &source);
            Ok(match scalar.literal() {
                Some(literal) => Value::Literal(literal),
                None => Value::Sym(scalar),
            })
        }
        other => Ok(other.clone()),
    }
}

/// Graph argument for the function's return value; symbolic scalars force their thunks.
fn output_argument(tracer: &Tracer, value: &Value) -> TraceResult<Argument> {
    match value {
        Value::Tensor(t) => {
            let bound = tracer.slots().tensor(t).map(|slot| slot.proxy);
            Ok(match bound {
                Some(proxy) => Argument::from(proxy),
                None => tracer.intern_tensor(t),
            })
        }
        Value::Sym(s) => {
            if let Some(literal) = s.literal() {
                return Ok(Argument::Literal(literal));
            }
            let thunk = tracer.slots().sym(s).ok_or_else(|| {
                TraceError::tracking(format!("returned {s:?} is not tracked by this tracer"))
            })?;
            Ok(Argument::from(thunk.force()?))
        }
        Value::Opaque(o) => {
            let bound = tracer.slots().opaque(o);
            Ok(match bound {
                Some(proxy) => Argument::from(proxy),
                None => tracer.intern_opaque(o),
            })
        }
        Value::Literal(literal) => Ok(Argument::Literal(literal.clone())),
        Value::Seq(items) => Ok(Argument::Seq(
            items
                .iter()
                .map(|item| output_argument(tracer, item))
                .collect::<TraceResult<_>>()?,
        )),
        Value::Map(items) => Ok(Argument::Map(
            items
                .iter()
                .map(|(key, item)| Ok((key.clone(), output_argument(tracer, item)?)))
                .collect::<TraceResult<_>>()?,
        )),
    }
}
