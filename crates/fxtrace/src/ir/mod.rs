//! Append-only dataflow graph produced by a trace.
//!
//! ```text
//!   placeholders (arg{i}_1)  ──►  call nodes in creation order  ──►  output
//! ```
//!
//! Nodes are never removed while tracing. Each node carries a [`NodeMeta`] with a snapshot of
//! the runtime value it stands for (metadata only, never data) plus provenance annotations.

mod graph;
mod meta;

use serde::Serialize;

pub use graph::{Argument, ConstantId, ConstantValue, Graph, GraphConstant, Node, NodeKind};
pub use meta::{DimSnapshot, ModuleFrame, NodeMeta, TensorSnapshot, ValueSnapshot};

/// Index of a node inside its [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle standing in for a runtime value while it is being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Proxy {
    node: NodeId,
}

impl Proxy {
    pub fn new(node: NodeId) -> Self {
        Proxy { node }
    }

    pub fn node(self) -> NodeId {
        self.node
    }
}

impl From<Proxy> for Argument {
    fn from(proxy: Proxy) -> Self {
        Argument::Node(proxy.node)
    }
}
