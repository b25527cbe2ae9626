use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use fxtrace::annotate::{DebugMetadataCollector, DefaultCollector, NodeSite};
use fxtrace::dispatch::{DispatchLayer, SubclassHandler};
use fxtrace::ir::{Node, TensorSnapshot};
use fxtrace::ops::{aten, OpDef};
use fxtrace::value::{KeyEntry, TensorData, TensorKind, TensorMeta};
use fxtrace::{
    Argument, BailOutPolicy, CallArgs, DType, DecompositionTable, Discipline, DispatchContext,
    KernelExecutor, Literal, Op, ShapeSolver, TensorRef, TraceConfig, TraceError, TraceResult,
    TraceSession, Value,
};
use fxtrace_backend_ref_cpu::CpuKernels;

fn session(config: TraceConfig) -> TraceSession {
    TraceSession::new(Rc::new(CpuKernels::with_seed(0)), config)
}

fn vector(values: &[f32]) -> TensorRef {
    TensorRef::from_f32(&[values.len() as i64], values.to_vec()).expect("valid tensor")
}

fn first_input(args: &[Value]) -> TraceResult<TensorRef> {
    args[0].expect_tensor()
}

fn stack_trace_session() -> TraceSession {
    session(TraceConfig::default())
        .without_collectors()
        .with_collector(Rc::new(DefaultCollector::new(true)))
}

fn add_origin(count: usize) -> Option<(String, String)> {
    Some((format!("add_{count}"), "aten::add.Tensor".to_string()))
}

#[test]
fn item_on_traced_real_data_is_rejected() -> Result<()> {
    let x = TensorRef::from_f32(&[], vec![4.0])?;
    let err = session(TraceConfig::default())
        .trace(|d, args| d.item(&first_input(args)?), vec![x.into()])
        .unwrap_err();
    assert!(
        matches!(err, TraceError::DataDependent { ref op } if op == "aten::item.default"),
        "{err}"
    );
    Ok(())
}

#[test]
fn item_is_recorded_when_strictness_is_off() -> Result<()> {
    let x = TensorRef::from_f32(&[], vec![4.0])?;
    let config = TraceConfig {
        error_on_data_dependent_ops: false,
        ..TraceConfig::default()
    };
    let traced = session(config).trace(|d, args| d.item(&first_input(args)?), vec![x.into()])?;
    assert_eq!(traced.graph.calls_to(aten::ITEM).count(), 1);
    assert_eq!(traced.output.as_literal(), Some(Literal::Float(4.0)));
    Ok(())
}

#[test]
fn item_without_a_solver_cannot_be_simulated() -> Result<()> {
    let x = TensorRef::from_i64(&[], vec![2])?;
    let config = TraceConfig::default().with_discipline(Discipline::Simulated);
    let err = session(config)
        .trace(|d, args| d.item(&first_input(args)?), vec![x.into()])
        .unwrap_err();
    assert!(matches!(err, TraceError::DataDependent { .. }), "{err}");
    Ok(())
}

#[test]
fn dynamic_output_shapes_need_a_solver() -> Result<()> {
    let mask = TensorRef::from_bool(&[3], vec![true, false, true])?;
    let config = TraceConfig::default().with_discipline(Discipline::Simulated);
    let err = session(config)
        .trace(|d, args| Ok(d.nonzero(&first_input(args)?)?.into()), vec![mask.into()])
        .unwrap_err();
    assert!(
        matches!(err, TraceError::DataDependent { ref op } if op == "aten::nonzero.default"),
        "{err}"
    );
    Ok(())
}

#[test]
fn arithmetic_on_constants_stays_constant() -> Result<()> {
    let traced = session(TraceConfig::default()).trace(
        |d, _| {
            let two = d.constant(&TensorRef::from_f32(&[], vec![2.0])?)?;
            let three = d.add(&two, 1.0)?;
            d.item(&three)
        },
        Vec::new(),
    )?;
    assert_eq!(traced.output.as_literal(), Some(Literal::Float(3.0)));
    assert_eq!(traced.graph.calls_to(aten::ADD).count(), 1);
    assert_eq!(traced.graph.calls_to(aten::ITEM).count(), 0);
    Ok(())
}

#[test]
fn random_results_are_never_constant() -> Result<()> {
    let err = session(TraceConfig::default())
        .trace(
            |d, _| {
                let two = d.constant(&TensorRef::from_f32(&[], vec![2.0])?)?;
                let noise = d.rand_like(&two)?;
                d.item(&noise)
            },
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, TraceError::DataDependent { .. }), "{err}");
    Ok(())
}

#[test]
fn large_constants_are_not_captured() -> Result<()> {
    let err = session(TraceConfig::default())
        .trace(
            |d, _| {
                let pair = d.constant(&vector(&[1.0, 2.0]))?;
                let sum = d.add(&pair, 1.0)?;
                d.item(&sum)
            },
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, TraceError::DataDependent { .. }), "{err}");
    Ok(())
}

#[test]
fn untracked_tensors_become_graph_constants() -> Result<()> {
    let x = vector(&[1.0, 2.0]);
    let weight = vector(&[3.0, 4.0]);
    let traced = session(TraceConfig::default()).trace(
        move |d, args| Ok(d.mul(&first_input(args)?, &weight)?.into()),
        vec![x.into()],
    )?;
    let mul = traced.graph.calls_to(aten::MUL).next().expect("mul node");
    assert!(matches!(mul.args[1], Argument::Constant(_)));
    assert_eq!(traced.graph.constants().len(), 1);
    assert_eq!(traced.graph.constants()[0].name, "_tensor_constant0");
    Ok(())
}

#[test]
fn in_place_ops_rebind_their_target() -> Result<()> {
    let x = vector(&[1.0, 2.0]);
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let y = d.add(&first_input(args)?, 1.0)?;
            let same = d.mul_(&y, 2.0)?;
            assert!(same.same(&y));
            Ok(y.into())
        },
        vec![x.into()],
    )?;
    let mul = traced.graph.calls_to(aten::MUL_).next().expect("mul_ node");
    let out = traced.graph.output_node().expect("output node");
    assert_eq!(out.args[0], Argument::Node(mul.id));

    let data = traced.output.expect_tensor()?.data();
    assert_eq!(data, Some(TensorData::F32(vec![4.0, 6.0].into())));
    Ok(())
}

static ALLREDUCE_: OpDef = OpDef {
    namespace: "c10d",
    name: "allreduce_",
    overload: "default",
    tags: &[],
    default_decomposition: None,
};

static SCALED: OpDef = OpDef {
    namespace: "test",
    name: "scaled",
    overload: "default",
    tags: &[],
    default_decomposition: None,
};

/// Reference kernels plus an in-place collective and an op returning a mapping.
struct ExtendedKernels(CpuKernels);

impl ExtendedKernels {
    fn scaled(&self, x: TensorRef) -> TraceResult<Value> {
        let mut out = BTreeMap::new();
        for (key, factor) in [("double", 2.0), ("half", 0.5)] {
            let args = CallArgs::from([Value::from(x.clone()), Value::from(factor)]);
            let scaled = self.0.execute(aten::MUL, &args)?;
            out.insert(key.to_string(), scaled);
        }
        Ok(Value::Map(out))
    }
}

impl KernelExecutor for ExtendedKernels {
    fn name(&self) -> &str {
        "ref-cpu+extended"
    }

    fn execute(&self, op: Op, args: &CallArgs) -> TraceResult<Value> {
        if op == Op::new(&ALLREDUCE_) {
            return Ok(Value::none());
        }
        if op == Op::new(&SCALED) {
            return self.scaled(args.tensor(0)?);
        }
        self.0.execute(op, args)
    }

    fn execute_meta(
        &self,
        op: Op,
        args: &CallArgs,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<Value> {
        self.0.execute_meta(op, args, solver)
    }
}

fn extended_session() -> TraceSession {
    TraceSession::new(
        Rc::new(ExtendedKernels(CpuKernels::with_seed(0))),
        TraceConfig::default(),
    )
}

#[test]
fn in_place_list_ops_rebind_every_element() -> Result<()> {
    let traced = extended_session().trace(
        |d, args| {
            let a = args[0].expect_tensor()?;
            let b = args[1].expect_tensor()?;
            let group = Value::Seq(vec![a.clone().into(), b.clone().into()]);
            d.call(Op::new(&ALLREDUCE_), [group])?;
            let a = d.add(&a, 1.0)?;
            let b = d.mul(&b, 2.0)?;
            Ok(Value::Seq(vec![a.into(), b.into()]))
        },
        vec![vector(&[1.0]).into(), vector(&[2.0]).into()],
    )?;
    let graph = &traced.graph;
    let collective = graph
        .calls_to(Op::new(&ALLREDUCE_))
        .next()
        .expect("allreduce_ node");
    let element_source = |target: Op| -> Result<(Argument, Argument)> {
        let user = graph.calls_to(target).next().expect("user node");
        let element = graph.node(user.args[0].as_node().expect("node argument"));
        assert!(element.is_call_to(aten::GETITEM), "{}", element.name);
        let outer = graph.node(element.args[0].as_node().expect("node argument"));
        assert!(outer.is_call_to(aten::GETITEM), "{}", outer.name);
        assert_eq!(outer.args[1], Argument::Literal(Literal::Int(0)));
        Ok((outer.args[0].clone(), element.args[1].clone()))
    };
    assert_eq!(
        element_source(aten::ADD)?,
        (Argument::Node(collective.id), Argument::Literal(Literal::Int(0)))
    );
    assert_eq!(
        element_source(aten::MUL)?,
        (Argument::Node(collective.id), Argument::Literal(Literal::Int(1)))
    );
    Ok(())
}

#[test]
fn constant_mapping_outputs_fold_per_key() -> Result<()> {
    let traced = extended_session().trace(
        |d, _| {
            let x = d.constant(&TensorRef::from_f32(&[], vec![4.0])?)?;
            let scaled = d.call(Op::new(&SCALED), [Value::from(x)])?;
            let half = scaled
                .as_map()
                .and_then(|entries| entries.get("half"))
                .expect("half entry")
                .expect_tensor()?;
            d.item(&half)
        },
        Vec::new(),
    )?;
    assert_eq!(traced.output.as_literal(), Some(Literal::Float(2.0)));
    assert_eq!(traced.graph.calls_to(Op::new(&SCALED)).count(), 1);
    assert_eq!(traced.graph.calls_to(aten::ITEM).count(), 0);
    Ok(())
}

#[test]
fn default_decompositions_are_traced_through() -> Result<()> {
    let x = vector(&[3.0]);
    let traced = session(TraceConfig::default()).trace(
        |d, args| Ok(d.square(&first_input(args)?)?.into()),
        vec![x.into()],
    )?;
    assert_eq!(traced.graph.calls_to(aten::SQUARE).count(), 0);
    let mul = traced.graph.calls_to(aten::MUL).next().expect("mul node");
    assert_eq!(mul.args[0], mul.args[1]);
    assert_eq!(
        mul.meta.fn_origin,
        Some(("square_1".to_string(), "aten::square.default".to_string()))
    );
    assert_eq!(traced.output.expect_tensor()?.item()?, Literal::Float(9.0));
    Ok(())
}

#[test]
fn session_decompositions_take_precedence() -> Result<()> {
    let table = DecompositionTable::new().with(aten::SQUARE, |d, args| {
        let x = args.tensor(0)?;
        Ok(d.add(&x, &x)?.into())
    });
    let config = TraceConfig {
        preserve_node_meta: true,
        ..TraceConfig::default()
    };
    let traced = session(config)
        .with_decompositions(table)
        .trace(|d, args| Ok(d.square(&first_input(args)?)?.into()), vec![vector(&[3.0]).into()])?;
    assert_eq!(traced.graph.calls_to(aten::MUL).count(), 0);
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    assert_eq!(add.meta.original_op.as_deref(), Some("aten::square.default"));
    Ok(())
}

#[test]
fn pre_dispatch_keeps_grad_mode_switches() -> Result<()> {
    let config = TraceConfig {
        pre_dispatch: true,
        ..TraceConfig::default()
    };
    let session = session(config);
    let traced = session.trace(
        |d, args| {
            d.set_grad_enabled(false)?;
            let y = d.add(&first_input(args)?, 1.0)?;
            d.set_grad_enabled(true)?;
            Ok(y.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    let switches = traced
        .graph
        .calls_to(aten::SET_GRAD_ENABLED)
        .map(|node| node.args.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        switches,
        vec![
            vec![Argument::Literal(Literal::Bool(false))],
            vec![Argument::Literal(Literal::Bool(true))],
        ]
    );
    assert!(session.context().grad_enabled());
    Ok(())
}

#[test]
fn grad_mode_switches_vanish_without_pre_dispatch() -> Result<()> {
    let session = session(TraceConfig::default());
    let traced = session.trace(
        |d, args| {
            d.set_grad_enabled(false)?;
            Ok(d.add(&first_input(args)?, 1.0)?.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    assert_eq!(traced.graph.calls_to(aten::SET_GRAD_ENABLED).count(), 0);
    assert!(!session.context().grad_enabled());
    Ok(())
}

#[test]
fn context_is_restored_after_a_failed_trace() -> Result<()> {
    let config = TraceConfig {
        pre_dispatch: true,
        ..TraceConfig::default().with_discipline(Discipline::Symbolic)
    };
    let session = session(config);
    let result = session.trace(
        |d, args| {
            let cx = d.context();
            assert_eq!(cx.function_depth(), 2);
            assert_eq!(cx.sym_depth(), 1);
            assert!(cx.recording().is_some());
            assert!(cx.dispatcher_extension_active());
            assert!(!cx.autocast_cache_enabled());
            d.add(&first_input(args)?, 1.0)?;
            Err(TraceError::Config("user code failed".to_string()))
        },
        vec![vector(&[1.0, 2.0]).into()],
    );
    assert!(matches!(result, Err(TraceError::Config(_))));

    let cx = session.context();
    assert_eq!(cx.function_depth(), 0);
    assert_eq!(cx.sym_depth(), 0);
    assert!(cx.recording().is_none());
    assert!(cx.simulation().is_none());
    assert!(!cx.dispatcher_extension_active());
    assert!(cx.autocast_cache_enabled());
    Ok(())
}

#[test]
fn subgraphs_are_recorded_independently() -> Result<()> {
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let x = first_input(args)?;
            let inner = d.trace_subgraph(
                |d, args| Ok(d.mul(&first_input(args)?, 2.0)?.into()),
                vec![x.clone().into()],
            )?;
            assert_eq!(inner.graph.calls().count(), 1);
            assert_eq!(inner.graph.calls_to(aten::MUL).count(), 1);
            assert!(inner.graph.find("arg0_1").is_some());
            Ok(d.add(&x, 1.0)?.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    assert_eq!(traced.graph.calls_to(aten::MUL).count(), 0);
    assert_eq!(traced.graph.calls_to(aten::ADD).count(), 1);
    Ok(())
}

#[test]
fn isolated_graphs_suspend_the_outer_recording() -> Result<()> {
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let x = first_input(args)?;
            let isolated = d.isolated_graph(
                TraceConfig::default(),
                |d, args| Ok(d.clone(&first_input(args)?)?.into()),
                vec![x.clone().into()],
            )?;
            assert_eq!(isolated.graph.calls_to(aten::CLONE).count(), 1);
            assert!(d.context().recording().is_some());
            Ok(d.sub(&x, 1.0)?.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    assert_eq!(traced.graph.calls_to(aten::CLONE).count(), 0);
    assert_eq!(traced.graph.calls_to(aten::SUB).count(), 1);
    Ok(())
}

#[test]
fn subgraph_side_effects_stay_out_of_the_parent_graph() -> Result<()> {
    let config = TraceConfig {
        pre_dispatch: true,
        ..TraceConfig::default()
    };
    let traced = session(config).trace(
        |d, args| {
            let x = first_input(args)?;
            let inner = d.trace_subgraph(
                |d, args| {
                    d.set_grad_enabled(false)?;
                    Ok(d.mul(&first_input(args)?, 2.0)?.into())
                },
                vec![x.clone().into()],
            )?;
            assert_eq!(inner.graph.calls_to(aten::SET_GRAD_ENABLED).count(), 1);
            assert_eq!(d.context().function_depth(), 2);
            Ok(d.add(&x, 1.0)?.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    assert_eq!(traced.graph.calls_to(aten::SET_GRAD_ENABLED).count(), 0);
    assert_eq!(traced.graph.calls_to(aten::MUL).count(), 0);
    Ok(())
}

#[test]
fn subgraph_calls_do_not_advance_parent_call_counts() -> Result<()> {
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let x = first_input(args)?;
            let inner = d.isolated_graph(
                TraceConfig::default(),
                |d, args| Ok(d.add(&first_input(args)?, 2.0)?.into()),
                vec![x.clone().into()],
            )?;
            let add = inner.graph.calls_to(aten::ADD).next().expect("inner add node");
            assert_eq!(add.meta.fn_origin, add_origin(1));
            d.trace_subgraph(
                |d, args| Ok(d.add(&first_input(args)?, 3.0)?.into()),
                vec![x.clone().into()],
            )?;
            Ok(d.add(&x, 1.0)?.into())
        },
        vec![vector(&[1.0]).into()],
    )?;
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    assert_eq!(add.meta.fn_origin, add_origin(1));
    Ok(())
}

#[test]
fn data_dependent_sizes_get_unbacked_bindings() -> Result<()> {
    let mask = TensorRef::from_i64(&[3], vec![0, 5, 7])?;
    let config = TraceConfig::default().with_discipline(Discipline::Symbolic);
    let traced = session(config).trace(
        |d, args| {
            let indices = d.nonzero(&first_input(args)?)?;
            let first = d.item(&args[1].expect_tensor()?)?;
            Ok(Value::Seq(vec![indices.into(), first]))
        },
        vec![mask.into(), TensorRef::from_i64(&[1], vec![9])?.into()],
    )?;

    let nonzero = traced.graph.calls_to(aten::NONZERO).next().expect("nonzero node");
    let binding = nonzero.meta.unbacked_bindings.get("u0").expect("u0 bound");
    assert_eq!(binding.entries(), &[KeyEntry::Size(0)]);

    let item = traced.graph.calls_to(aten::ITEM).next().expect("item node");
    let binding = item.meta.unbacked_bindings.get("u1").expect("u1 bound");
    assert!(binding.entries().is_empty());
    assert_eq!(item.meta.val.as_ref().and_then(|v| v.sym_expr()), Some("u1"));

    let env = traced.shape_env.expect("solver");
    assert_eq!(env.num_unbacked(), 2);
    Ok(())
}

#[derive(Default)]
struct Unwrap {
    calls: Cell<usize>,
}

impl SubclassHandler for Unwrap {
    fn type_name(&self) -> &str {
        "Wrapped"
    }

    fn dispatch(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value> {
        self.calls.set(self.calls.get() + 1);
        let plain = args.map_leaves(&mut |leaf| {
            Ok(match leaf {
                Value::Tensor(t) => match t.kind() {
                    TensorKind::Subclass { inner, .. } => Value::Tensor(inner.clone()),
                    _ => leaf.clone(),
                },
                other => other.clone(),
            })
        })?;
        cx.dispatch(op, &plain)
    }
}

fn add_to_wrapped(session: &TraceSession) -> TraceResult<fxtrace::TracedGraph> {
    session.trace(
        |d, args| {
            let wrapped = TensorRef::subclass("Wrapped", vector(&[1.0, 1.0]));
            Ok(d.add(&first_input(args)?, &wrapped)?.into())
        },
        vec![vector(&[2.0, 3.0]).into()],
    )
}

#[test]
fn unknown_subclasses_are_delegated_to_their_handler() -> Result<()> {
    let handler = Rc::new(Unwrap::default());
    let session = session(TraceConfig::default()).with_subclass_handler(handler.clone());
    let traced = add_to_wrapped(&session)?;
    assert_eq!(handler.calls.get(), 1);
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    assert!(matches!(add.args[1], Argument::Constant(_)));
    Ok(())
}

#[test]
fn unknown_subclasses_without_a_handler_fail() -> Result<()> {
    let err = add_to_wrapped(&session(TraceConfig::default())).unwrap_err();
    match err {
        TraceError::UnrecognizedInput { op, types } => {
            assert_eq!(op, "aten::add.Tensor");
            assert_eq!(types, vec!["Wrapped".to_string()]);
        }
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn propagate_policy_raises_before_any_handler_runs() -> Result<()> {
    let handler = Rc::new(Unwrap::default());
    let config = TraceConfig {
        bail_out: BailOutPolicy::Propagate,
        ..TraceConfig::default()
    };
    let session = session(config).with_subclass_handler(handler.clone());
    let err = add_to_wrapped(&session).unwrap_err();
    assert!(matches!(err, TraceError::UnrecognizedInput { .. }), "{err}");
    assert_eq!(handler.calls.get(), 0);
    Ok(())
}

#[test]
fn low_precision_pointwise_results_get_a_barrier() -> Result<()> {
    let half = TensorRef::simulated(TensorMeta::with_static_sizes(DType::F16, &[2]));
    let config = TraceConfig {
        emulate_precision_casts: true,
        ..TraceConfig::default().with_discipline(Discipline::Simulated)
    };
    let traced = session(config).trace(
        |d, args| {
            let x = first_input(args)?;
            let y = d.add(&x, 1.0)?;
            let z = d.clone(&y)?;
            Ok(d.mul(&z, 2.0)?.into())
        },
        vec![half.into()],
    )?;
    let barrier = |node: &Node| node.meta.low_precision_pointwise_barrier;
    assert!(traced.graph.calls_to(aten::ADD).all(barrier));
    assert!(traced.graph.calls_to(aten::MUL).all(barrier));
    assert!(!traced.graph.calls_to(aten::CLONE).any(barrier));
    let snapshot = traced.graph.calls_to(aten::ADD).next().and_then(|n| n.meta.tensor_meta.clone());
    assert_eq!(snapshot.map(|t: TensorSnapshot| (t.dtype, t.simulated)), Some((DType::F16, true)));
    Ok(())
}

#[test]
fn full_precision_results_have_no_barrier() -> Result<()> {
    let config = TraceConfig {
        emulate_precision_casts: true,
        ..TraceConfig::default()
    };
    let traced = session(config).trace(
        |d, args| Ok(d.add(&first_input(args)?, 1.0)?.into()),
        vec![vector(&[1.0]).into()],
    )?;
    assert!(traced.graph.calls().all(|node| !node.meta.low_precision_pointwise_barrier));
    Ok(())
}

#[test]
fn simulated_execution_rejects_stray_real_tensors() -> Result<()> {
    let config = TraceConfig::default().with_discipline(Discipline::Simulated);
    let stray = vector(&[1.0, 2.0]);
    let strict_stray = stray.clone();
    let err = session(config.clone())
        .trace(
            move |d, args| Ok(d.add(&first_input(args)?, &strict_stray)?.into()),
            vec![vector(&[0.0, 0.0]).into()],
        )
        .unwrap_err();
    assert!(matches!(err, TraceError::NonSimulatedInput { .. }), "{err}");

    let lenient = TraceConfig {
        allow_non_simulated_inputs: true,
        ..config
    };
    let traced = session(lenient).trace(
        move |d, args| Ok(d.add(&first_input(args)?, &stray)?.into()),
        vec![vector(&[0.0, 0.0]).into()],
    )?;
    assert!(traced.output.expect_tensor()?.is_simulated());
    Ok(())
}

#[test]
fn call_sites_are_recorded_as_stack_traces() -> Result<()> {
    let traced = stack_trace_session().trace(
        |d, args| Ok(d.add(&first_input(args)?, 1.0)?.into()),
        vec![vector(&[1.0]).into()],
    )?;
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    let trace = add.meta.stack_trace.as_deref().expect("stack trace recorded");
    assert!(trace.contains("recording.rs"), "{trace}");
    Ok(())
}

/// Runs a separate trace the first time it sees an `add`, keeping that trace's call site.
#[derive(Default)]
struct NestedTraceLayer {
    nested_site: RefCell<Option<String>>,
}

impl DispatchLayer for NestedTraceLayer {
    fn name(&self) -> &str {
        "nested-trace"
    }

    fn dispatch(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value> {
        if op == aten::ADD && self.nested_site.borrow().is_none() {
            let nested = stack_trace_session().trace(
                |d, args| Ok(d.mul(&first_input(args)?, 2.0)?.into()),
                vec![vector(&[1.0]).into()],
            )?;
            let mul = nested.graph.calls_to(aten::MUL).next().expect("nested mul node");
            *self.nested_site.borrow_mut() = mul.meta.stack_trace.clone();
        }
        cx.dispatch(op, args)
    }
}

#[test]
fn call_sites_belong_to_their_context() -> Result<()> {
    let layer = Rc::new(NestedTraceLayer::default());
    let outer = stack_trace_session();
    let traced = {
        let _layer = outer.context().push_dispatch_layer(layer.clone());
        outer.trace(
            |d, args| Ok(d.add(&first_input(args)?, 1.0)?.into()),
            vec![vector(&[1.0]).into()],
        )?
    };
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    let outer_site = add.meta.stack_trace.clone().expect("outer stack trace");
    let nested_site = layer.nested_site.borrow().clone().expect("nested stack trace");
    assert!(nested_site.contains("recording.rs"), "{nested_site}");
    assert_ne!(nested_site, outer_site);
    assert_eq!(outer.context().call_sites().depth(), 0);
    Ok(())
}

struct Failing;

impl DebugMetadataCollector for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn annotate(&self, _node: &mut Node, _site: &NodeSite<'_>) -> TraceResult<()> {
        Err(TraceError::Config("collector is broken".to_string()))
    }
}

#[test]
fn failing_collectors_do_not_abort_the_trace() -> Result<()> {
    let session = session(TraceConfig::default())
        .without_collectors()
        .with_collector(Rc::new(Failing))
        .with_collector(Rc::new(DefaultCollector::new(false)));
    let traced = session.trace(
        |d, args| Ok(d.add(&first_input(args)?, 1.0)?.into()),
        vec![vector(&[1.0]).into()],
    )?;
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    assert!(add.meta.stack_trace.is_none());
    assert!(add.meta.fn_origin.is_some());
    Ok(())
}
