use std::rc::Rc;

use anyhow::Result;
use fxtrace::ir::DimSnapshot;
use fxtrace::ops::aten;
use fxtrace::{
    Argument, Discipline, NodeKind, TensorRef, TraceConfig, TraceSession, Value,
};
use fxtrace_backend_ref_cpu::CpuKernels;

fn session(config: TraceConfig) -> TraceSession {
    TraceSession::new(Rc::new(CpuKernels::with_seed(0)), config)
}

fn output_arg(graph: &fxtrace::Graph) -> Argument {
    graph
        .output_node()
        .map(|node| node.args[0].clone())
        .expect("graph has an output node")
}

#[test]
fn add_then_clone_returns_the_clone() -> Result<()> {
    let x = TensorRef::from_f32(&[2], vec![1.0, 2.0])?;
    let bias = TensorRef::from_f32(&[2], vec![0.0, 0.0])?;
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let x = args[0].expect_tensor()?;
            let y = d.add(&x, 1.0)?;
            let z = d.clone(&y)?;
            Ok(z.into())
        },
        vec![x.into(), bias.into()],
    )?;

    let graph = &traced.graph;
    assert_eq!(graph.placeholders().count(), 2);
    assert_eq!(graph.calls().count(), 2);
    let add = graph.calls_to(aten::ADD).next().expect("add node");
    let clone = graph.calls_to(aten::CLONE).next().expect("clone node");
    assert_eq!(add.args[0], Argument::Node(graph.find("arg0_1").expect("placeholder").id));
    assert_eq!(clone.args, vec![Argument::Node(add.id)]);
    assert_eq!(output_arg(graph), Argument::Node(clone.id));
    assert_eq!(graph.last().map(|node| node.kind), Some(NodeKind::Output));

    let out = traced.output.expect_tensor()?;
    assert_eq!(out.data().and_then(|data| data.get_f64(1)), Some(3.0));
    Ok(())
}

#[test]
fn item_of_a_constant_is_folded() -> Result<()> {
    let traced = session(TraceConfig::default()).trace(
        |d, _| {
            let five = TensorRef::from_i64(&[], vec![5])?;
            let a = d.constant(&five)?;
            d.item(&a)
        },
        Vec::new(),
    )?;

    assert_eq!(traced.output.as_int(), Some(5));
    assert_eq!(traced.graph.calls_to(aten::ITEM).count(), 0);
    assert_eq!(traced.graph.calls_to(aten::LIFT_FRESH_COPY).count(), 1);
    assert_eq!(output_arg(&traced.graph), Argument::Literal(fxtrace::Literal::Int(5)));
    Ok(())
}

#[test]
fn shared_derived_dimension_is_read_once_from_its_first_owner() -> Result<()> {
    let x = TensorRef::from_f32(&[3], vec![1.0; 3])?;
    let y = TensorRef::from_f32(&[4], vec![2.0; 4])?;
    let config = TraceConfig::default().with_discipline(Discipline::Symbolic);
    let traced = session(config).trace(
        |d, args| {
            let x = args[0].expect_tensor()?;
            let y = args[1].expect_tensor()?;
            let joined = d.cat(&[x, y], 0)?;
            let doubled = d.add(&joined, &joined)?;
            let extent = d.size(&doubled, 0)?;
            Ok(Value::Seq(vec![joined.into(), doubled.into(), extent]))
        },
        vec![x.into(), y.into()],
    )?;

    let graph = &traced.graph;
    let cat = graph.calls_to(aten::CAT).next().expect("cat node");
    let add = graph.calls_to(aten::ADD).next().expect("add node");
    let snapshot = cat.meta.tensor_meta.as_ref().expect("cat metadata");
    assert_eq!(snapshot.sizes, vec![DimSnapshot::Sym("s0 + s1".to_string())]);
    assert_eq!(
        add.meta.tensor_meta.as_ref().map(|t| t.sizes.clone()),
        Some(snapshot.sizes.clone())
    );

    let size_nodes = graph.calls_to(aten::SYM_SIZE).collect::<Vec<_>>();
    assert_eq!(size_nodes.len(), 1);
    assert_eq!(size_nodes[0].args[0], Argument::Node(cat.id));
    assert_eq!(
        output_arg(graph),
        Argument::Seq(vec![
            Argument::Node(cat.id),
            Argument::Node(add.id),
            Argument::Node(size_nodes[0].id),
        ])
    );

    let env = traced.shape_env.expect("symbolic traces keep their solver");
    assert_eq!(env.hint("s0"), Some(3));
    assert_eq!(env.hint("s1"), Some(4));
    assert_eq!(env.sources("s0"), vec!["input0.size(0)".to_string()]);
    Ok(())
}

#[test]
fn broadcast_outputs_share_one_extent_query() -> Result<()> {
    let x = TensorRef::from_f32(&[3], vec![1.0; 3])?;
    let y = TensorRef::from_f32(&[4], vec![2.0; 4])?;
    let scale = TensorRef::from_f32(&[1], vec![0.5])?;
    let config = TraceConfig::default().with_discipline(Discipline::Symbolic);
    let traced = session(config).trace(
        |d, args| {
            let x = args[0].expect_tensor()?;
            let y = args[1].expect_tensor()?;
            let scale = args[2].expect_tensor()?;
            let joined = d.cat(&[x, y], 0)?;
            let outs = d.broadcast_tensors(&[joined, scale])?;
            let second = d.size(&outs[1], 0)?;
            let first = d.size(&outs[0], 0)?;
            Ok(Value::Seq(vec![second, first]))
        },
        vec![x.into(), y.into(), scale.into()],
    )?;

    let graph = &traced.graph;
    let cat = graph.calls_to(aten::CAT).next().expect("cat node");
    let broadcast = graph
        .calls_to(aten::BROADCAST_TENSORS)
        .next()
        .expect("broadcast_tensors node");
    let elements = graph.calls_to(aten::GETITEM).collect::<Vec<_>>();
    assert_eq!(elements.len(), 2);
    for element in &elements {
        assert_eq!(element.args[0], Argument::Node(broadcast.id));
        let sizes = element.meta.tensor_meta.as_ref().map(|t| t.sizes.clone());
        assert_eq!(sizes, Some(vec![DimSnapshot::Sym("s0 + s1".to_string())]));
    }

    let size_nodes = graph.calls_to(aten::SYM_SIZE).collect::<Vec<_>>();
    assert_eq!(size_nodes.len(), 1);
    assert_eq!(size_nodes[0].args[0], Argument::Node(cat.id));
    assert_eq!(
        output_arg(graph),
        Argument::Seq(vec![
            Argument::Node(size_nodes[0].id),
            Argument::Node(size_nodes[0].id),
        ])
    );
    Ok(())
}

#[test]
fn numel_is_expanded_into_scalar_arithmetic() -> Result<()> {
    let x = TensorRef::from_f32(&[3, 4], vec![0.0; 12])?;
    let config = TraceConfig::default().with_discipline(Discipline::Symbolic);
    let traced = session(config).trace(
        |d, args| d.numel(&args[0].expect_tensor()?),
        vec![x.into()],
    )?;

    let graph = &traced.graph;
    assert_eq!(graph.calls_to(aten::SYM_NUMEL).count(), 0);
    assert_eq!(graph.calls_to(aten::SYM_SIZE).count(), 2);
    let product = graph.calls_to(aten::SYM_MUL).next().expect("scalar product node");
    assert_eq!(product.meta.val.as_ref().and_then(|v| v.sym_expr()), Some("s0 * s1"));
    assert_eq!(output_arg(graph), Argument::Node(product.id));
    Ok(())
}

#[test]
fn graph_renders_as_text_and_json() -> Result<()> {
    let x = TensorRef::from_f32(&[2], vec![1.0, 2.0])?;
    let traced = session(TraceConfig::default()).trace(
        |d, args| {
            let y = d.add(&args[0].expect_tensor()?, 1.0)?;
            Ok(d.clone(&y)?.into())
        },
        vec![x.into()],
    )?;

    let text = traced.graph.to_string();
    assert!(text.contains("%arg0_1 : placeholder"), "{text}");
    assert!(text.contains("%add = aten::add.Tensor(%arg0_1, 1.0)"), "{text}");
    assert!(text.contains("%clone = aten::clone.default(%add)"), "{text}");
    assert!(text.contains("return %clone"), "{text}");

    let json: serde_json::Value = serde_json::from_str(&traced.graph.to_json_string()?)?;
    let nodes = json["nodes"].as_array().expect("nodes array");
    assert_eq!(nodes.len(), 4);
    assert_eq!(nodes[1]["target"], "aten::add.Tensor");
    assert_eq!(nodes[1]["kind"], "call");
    assert_eq!(nodes[1]["meta"]["tensor_meta"]["dtype"], "f32");
    Ok(())
}
