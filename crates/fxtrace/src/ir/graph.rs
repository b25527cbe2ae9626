use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::ops::Op;
use crate::value::{Literal, OpaqueRef, TensorId, TensorRef};

use super::{NodeId, NodeMeta};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Placeholder,
    Call,
    Output,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Placeholder => "placeholder",
            NodeKind::Call => "call_function",
            NodeKind::Output => "output",
        })
    }
}

/// Index into the constant table of a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ConstantId(u32);

/// Argument tree of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Argument {
    Node(NodeId),
    Literal(Literal),
    Constant(ConstantId),
    Seq(Vec<Argument>),
    Map(BTreeMap<String, Argument>),
}

impl Argument {
    /// Nodes referenced anywhere inside this argument.
    pub fn referenced_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_nodes(&mut out);
        out
    }

    fn collect_nodes(&self, out: &mut Vec<NodeId>) {
        match self {
            Argument::Node(id) => out.push(*id),
            Argument::Seq(items) => items.iter().for_each(|item| item.collect_nodes(out)),
            Argument::Map(items) => items.values().for_each(|item| item.collect_nodes(out)),
            Argument::Literal(_) | Argument::Constant(_) => {}
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Argument::Node(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<Literal> for Argument {
    fn from(value: Literal) -> Self {
        Argument::Literal(value)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub target: Option<Op>,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
    pub meta: NodeMeta,
}

impl Node {
    pub fn is_call_to(&self, op: Op) -> bool {
        self.kind == NodeKind::Call && self.target == Some(op)
    }
}

#[derive(Debug, Clone)]
pub enum ConstantValue {
    Tensor(TensorRef),
    Opaque(OpaqueRef),
}

/// Value interned into the graph because it was used without being tracked.
#[derive(Debug, Clone, Serialize)]
pub struct GraphConstant {
    pub name: String,
    #[serde(skip)]
    pub value: ConstantValue,
}

#[derive(Debug, Default, Serialize)]
pub struct Graph {
    nodes: Vec<Node>,
    constants: Vec<GraphConstant>,
    #[serde(skip)]
    used_names: HashSet<String>,
    #[serde(skip)]
    name_counters: HashMap<String, usize>,
    #[serde(skip)]
    tensor_constants: HashMap<TensorId, ConstantId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn unique_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "_unnamed" } else { base };
        if self.used_names.insert(base.to_string()) {
            return base.to_string();
        }
        let counter = self.name_counters.entry(base.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{base}_{counter}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    fn push(
        &mut self,
        kind: NodeKind,
        target: Option<Op>,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
        name: &str,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let name = self.unique_name(name);
        self.nodes.push(Node {
            id,
            name,
            kind,
            target,
            args,
            kwargs,
            meta: NodeMeta::default(),
        });
        id
    }

    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.push(NodeKind::Placeholder, None, Vec::new(), BTreeMap::new(), name)
    }

    pub fn call(
        &mut self,
        target: Op,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
        name: &str,
    ) -> NodeId {
        self.push(NodeKind::Call, Some(target), args, kwargs, name)
    }

    pub fn output(&mut self, result: Argument) -> NodeId {
        self.push(NodeKind::Output, None, vec![result], BTreeMap::new(), "output")
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn last(&self) -> Option<&Node> {
        self.nodes.last()
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.kind == NodeKind::Placeholder)
    }

    pub fn calls(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.kind == NodeKind::Call)
    }

    pub fn calls_to(&self, op: Op) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |node| node.is_call_to(op))
    }

    pub fn output_node(&self) -> Option<&Node> {
        self.nodes.iter().rev().find(|node| node.kind == NodeKind::Output)
    }

    /// Nodes whose arguments mention `id`.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| {
                node.args
                    .iter()
                    .chain(node.kwargs.values())
                    .any(|arg| arg.referenced_nodes().contains(&id))
            })
            .map(|node| node.id)
            .collect()
    }

    /// Interns an untracked tensor, reusing the slot when the same tensor is interned twice.
    pub fn intern_tensor(&mut self, tensor: &TensorRef) -> ConstantId {
        if let Some(id) = self.tensor_constants.get(&tensor.id()) {
            return *id;
        }
        let count = self
            .constants
            .iter()
            .filter(|c| matches!(c.value, ConstantValue::Tensor(_)))
            .count();
        let id = ConstantId(self.constants.len() as u32);
        self.constants.push(GraphConstant {
            name: format!("_tensor_constant{count}"),
            value: ConstantValue::Tensor(tensor.clone()),
        });
        self.tensor_constants.insert(tensor.id(), id);
        id
    }

    pub fn intern_opaque(&mut self, object: &OpaqueRef) -> ConstantId {
        let count = self
            .constants
            .iter()
            .filter(|c| matches!(c.value, ConstantValue::Opaque(_)))
            .count();
        let id = ConstantId(self.constants.len() as u32);
        self.constants.push(GraphConstant {
            name: format!("_opaque_constant{count}"),
            value: ConstantValue::Opaque(object.clone()),
        });
        id
    }

    pub fn constant(&self, id: ConstantId) -> &GraphConstant {
        &self.constants[id.0 as usize]
    }

    pub fn constants(&self) -> &[GraphConstant] {
        &self.constants
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn fmt_argument(&self, f: &mut fmt::Formatter<'_>, arg: &Argument) -> fmt::Result {
        match arg {
            Argument::Node(id) => write!(f, "%{}", self.node(*id).name),
            Argument::Literal(lit) => write!(f, "{lit}"),
            Argument::Constant(id) => write!(f, "{}", self.constant(*id).name),
            Argument::Seq(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.fmt_argument(f, item)?;
                }
                f.write_str("]")
            }
            Argument::Map(items) => {
                f.write_str("{")?;
                for (i, (key, item)) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: ")?;
                    self.fmt_argument(f, item)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph():")?;
        for node in &self.nodes {
            match node.kind {
                NodeKind::Placeholder => writeln!(f, "    %{} : placeholder", node.name)?,
                NodeKind::Output => {
                    f.write_str("    return ")?;
                    for arg in &node.args {
                        self.fmt_argument(f, arg)?;
                    }
                    writeln!(f)?;
                }
                NodeKind::Call => {
                    let target = node
                        .target
                        .map(|op| op.qualified_name())
                        .unwrap_or_default();
                    write!(f, "    %{} = {}(", node.name, target)?;
                    let mut first = true;
                    for arg in &node.args {
                        if !first {
                            f.write_str(", ")?;
                        }
                        first = false;
                        self.fmt_argument(f, arg)?;
                    }
                    for (key, arg) in &node.kwargs {
                        if !first {
                            f.write_str(", ")?;
                        }
                        first = false;
                        write!(f, "{key}=")?;
                        self.fmt_argument(f, arg)?;
                    }
                    writeln!(f, ")")?;
                }
            }
        }
        Ok(())
    }
}
