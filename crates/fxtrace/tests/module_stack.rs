use std::rc::Rc;

use anyhow::Result;
use fxtrace::ir::ModuleFrame;
use fxtrace::ops::aten;
use fxtrace::value::{TensorData, TensorMeta};
use fxtrace::{
    DType, Module, TensorRef, TraceConfig, TraceError, TraceSession, Value,
};
use fxtrace_backend_ref_cpu::CpuKernels;

fn frame(path: &str, type_name: &str) -> ModuleFrame {
    ModuleFrame {
        path: path.to_string(),
        type_name: type_name.to_string(),
    }
}

fn recording_session(root: Rc<Module>) -> TraceSession {
    let config = TraceConfig {
        record_module_stack: true,
        ..TraceConfig::default()
    };
    TraceSession::new(Rc::new(CpuKernels::with_seed(0)), config).with_module_root(root)
}

fn input() -> Value {
    TensorRef::from_f32(&[2], vec![1.0, 2.0])
        .expect("valid tensor")
        .into()
}

/// `Root -> {b: Branch, c: Branch}`, where both branches share one `Leaf` instance at `d`.
fn diamond() -> Result<Rc<Module>> {
    let leaf = Module::builder("Leaf")
        .forward(|d, _, args| Ok(d.mul(&args[0].expect_tensor()?, 2.0)?.into()))
        .build()?;
    let branch = |leaf: &Rc<Module>| {
        Module::builder("Branch")
            .child("d", Rc::clone(leaf))
            .forward(|d, view, args| {
                let leaf = view.get("d")?;
                d.call_module(&leaf, args)
            })
            .build()
    };
    let root = Module::builder("Root")
        .child("b", branch(&leaf)?)
        .child("c", branch(&leaf)?)
        .forward(|d, view, args| {
            let b = view.get("b")?;
            let y = d.call_module(&b, args)?;
            let c = view.get("c")?;
            d.call_module(&c, &[y])
        })
        .build()?;
    Ok(root)
}

#[test]
fn shared_submodule_reports_the_route_it_was_reached_through() -> Result<()> {
    let traced = recording_session(diamond()?).trace_module(vec![input()])?;

    let stacks = traced
        .graph
        .calls_to(aten::MUL)
        .map(|node| node.meta.module_stack.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        stacks,
        vec![
            vec![frame("b", "Branch"), frame("b.d", "Leaf")],
            vec![frame("c", "Branch"), frame("c.d", "Leaf")],
        ]
    );
    Ok(())
}

#[test]
fn module_stack_is_off_unless_requested() -> Result<()> {
    let session = TraceSession::new(Rc::new(CpuKernels::with_seed(0)), TraceConfig::default())
        .with_module_root(diamond()?);
    let traced = session.trace_module(vec![input()])?;
    assert_eq!(traced.graph.calls_to(aten::MUL).count(), 2);
    assert!(traced.graph.calls().all(|node| node.meta.module_stack.is_empty()));
    Ok(())
}

#[test]
fn stray_modules_run_without_a_frame() -> Result<()> {
    let stray = Module::builder("Stray")
        .forward(|d, _, args| Ok(d.add(&args[0].expect_tensor()?, 1.0)?.into()))
        .build()?;
    let root = Module::builder("Root")
        .forward(move |d, _, args| {
            let view = fxtrace::AccessPathView::detached(Rc::clone(&stray));
            d.call_module(&view, args)
        })
        .build()?;
    let traced = recording_session(root).trace_module(vec![input()])?;
    let add = traced.graph.calls_to(aten::ADD).next().expect("add node");
    assert!(add.meta.module_stack.is_empty());
    Ok(())
}

#[test]
fn untracked_views_fall_back_to_the_first_path() -> Result<()> {
    let root = diamond()?;
    let leaf = root
        .child("c")
        .and_then(|c| c.child("d"))
        .cloned()
        .expect("leaf registered");
    let tracer = fxtrace::tracer::Tracer::new();
    let modules = fxtrace::ModuleStackTracer::new(Rc::clone(&root), tracer);

    let detached = fxtrace::AccessPathView::detached(Rc::clone(&leaf));
    assert_eq!(modules.path_of_module(&detached)?, "b.d");

    let through_c = modules.root_view().get("c")?.get("d")?;
    assert_eq!(through_c.path().as_deref(), Some("c.d"));
    assert_eq!(modules.path_of_module(&detached)?, "c.d");
    assert_eq!(modules.path_of_module(&modules.root_view())?, "");

    let outsider = Module::builder("Outsider").build()?;
    let err = modules
        .path_of_module(&fxtrace::AccessPathView::detached(outsider))
        .unwrap_err();
    assert!(matches!(err, TraceError::PathResolution { ref type_name } if type_name == "Outsider"));
    Ok(())
}

#[test]
fn parameters_are_reachable_through_views() -> Result<()> {
    let weight = TensorRef::parameter(
        TensorMeta::with_static_sizes(DType::F32, &[2]),
        TensorData::F32(vec![0.5, 0.5].into()),
    )?;
    let root = Module::builder("Scale")
        .parameter("weight", weight)
        .forward(|d, view, args| {
            Ok(d.mul(&args[0].expect_tensor()?, &view.parameter("weight")?)?.into())
        })
        .build()?;
    let traced = recording_session(root).trace_module(vec![input()])?;
    let mul = traced.graph.calls_to(aten::MUL).next().expect("mul node");
    assert!(matches!(mul.args[1], fxtrace::Argument::Constant(_)));
    let out = traced.output.expect_tensor()?;
    assert_eq!(out.data(), Some(TensorData::F32(vec![0.5, 1.0].into())));
    Ok(())
}

#[test]
fn builder_rejects_invalid_names() -> Result<()> {
    let leaf = Module::builder("Leaf").build()?;
    let dotted = Module::builder("Root").child("a.b", Rc::clone(&leaf)).build();
    assert!(matches!(dotted, Err(TraceError::Config(_))));
    let duplicate = Module::builder("Root")
        .child("a", Rc::clone(&leaf))
        .child("a", leaf)
        .build();
    assert!(matches!(duplicate, Err(TraceError::Config(_))));
    Ok(())
}

#[test]
fn trace_module_requires_a_root() -> Result<()> {
    let session = TraceSession::new(Rc::new(CpuKernels::with_seed(0)), TraceConfig::default());
    let err = session.trace_module(vec![input()]).unwrap_err();
    assert!(matches!(err, TraceError::Config(_)), "{err}");
    Ok(())
}

#[test]
fn named_modules_lists_each_instance_once() -> Result<()> {
    let root = diamond()?;
    let paths = Module::named_modules(&root)
        .into_iter()
        .map(|(path, module)| (path, module.type_name().to_string()))
        .collect::<Vec<_>>();
    assert_eq!(
        paths,
        vec![
            (String::new(), "Root".to_string()),
            ("b".to_string(), "Branch".to_string()),
            ("c".to_string(), "Branch".to_string()),
            ("b.d".to_string(), "Leaf".to_string()),
        ]
    );
    Ok(())
}
