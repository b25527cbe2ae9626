//! Per-trace state: the graph being built, the slot registry, and provenance bookkeeping.
//!
//! A [`Tracer`] is shared (`Rc`) between the session that owns it, the dispatch layers that
//! record into it, and the thunks that lazily materialise symbolic-scalar nodes. Thunks hold a
//! weak handle so a finished trace does not keep itself alive.

mod slots;
mod thunk;
mod track;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use crate::annotate::{self, CallSites, DebugMetadataCollector, NodeSite};
use crate::ir::{Argument, Graph, ModuleFrame, NodeId, Proxy, TensorSnapshot, ValueSnapshot};
use crate::ops::Op;
use crate::value::{OpaqueRef, TensorRef, Value};

pub use slots::{OverwritePolicy, Slot, SlotRef, SlotRegistry, TensorSlot};
pub use thunk::Thunk;
pub(crate) use track::{default_node_name, upgrade};

pub struct Tracer {
    this: Weak<Tracer>,
    graph: RefCell<Graph>,
    slots: RefCell<SlotRegistry>,
    fn_metadata: RefCell<Option<Op>>,
    fn_counts: RefCell<HashMap<Op, usize>>,
    module_stack: RefCell<Vec<ModuleFrame>>,
    original_op: RefCell<Option<Op>>,
    collectors: Vec<Rc<dyn DebugMetadataCollector>>,
    call_sites: Rc<CallSites>,
}

impl Tracer {
    pub fn new() -> Rc<Tracer> {
        Tracer::with_collectors(
            vec![Rc::new(annotate::DefaultCollector::from_env())],
            Rc::default(),
        )
    }

    /// Tracer whose nodes are annotated by `collectors`, reading call sites from `call_sites`.
    pub fn with_collectors(
        collectors: Vec<Rc<dyn DebugMetadataCollector>>,
        call_sites: Rc<CallSites>,
    ) -> Rc<Tracer> {
        Rc::new_cyclic(|this| Tracer {
            this: this.clone(),
            graph: RefCell::new(Graph::new()),
            slots: RefCell::new(SlotRegistry::new()),
            fn_metadata: RefCell::new(None),
            fn_counts: RefCell::new(HashMap::new()),
            module_stack: RefCell::new(Vec::new()),
            original_op: RefCell::new(None),
            collectors,
            call_sites,
        })
    }

    pub(crate) fn weak(&self) -> Weak<Tracer> {
        self.this.clone()
    }

    pub fn graph(&self) -> Ref<'_, Graph> {
        self.graph.borrow()
    }

    pub(crate) fn graph_mut(&self) -> RefMut<'_, Graph> {
        self.graph.borrow_mut()
    }

    pub fn slots(&self) -> Ref<'_, SlotRegistry> {
        self.slots.borrow()
    }

    pub(crate) fn slots_mut(&self) -> RefMut<'_, SlotRegistry> {
        self.slots.borrow_mut()
    }

    /// Moves the finished graph out, leaving an empty one behind.
    pub fn take_graph(&self) -> Graph {
        std::mem::take(&mut *self.graph.borrow_mut())
    }

    /// Records that a user-level call to `op` is in progress.
    pub fn note_fn_call(&self, op: Op) {
        *self.fn_metadata.borrow_mut() = Some(op);
        *self.fn_counts.borrow_mut().entry(op).or_insert(0) += 1;
    }

    pub fn fn_count(&self, op: Op) -> usize {
        self.fn_counts.borrow().get(&op).copied().unwrap_or(0)
    }

    fn fn_origin(&self) -> Option<(String, String)> {
        let op = (*self.fn_metadata.borrow())?;
        Some((format!("{}_{}", op.name(), self.fn_count(op)), op.qualified_name()))
    }

    pub fn module_stack(&self) -> Vec<ModuleFrame> {
        self.module_stack.borrow().clone()
    }

    /// Pushes a module frame for the lifetime of the returned guard.
    pub fn enter_module(&self, frame: ModuleFrame) -> ModuleScope<'_> {
        self.module_stack.borrow_mut().push(frame);
        ModuleScope { tracer: self }
    }

    pub(crate) fn original_op(&self) -> Option<Op> {
        *self.original_op.borrow()
    }

    pub(crate) fn set_original_op(&self, op: Option<Op>) -> Option<Op> {
        std::mem::replace(&mut *self.original_op.borrow_mut(), op)
    }

    pub fn placeholder(&self, name: &str) -> Proxy {
        Proxy::new(self.graph.borrow_mut().placeholder(name))
    }

    pub fn output(&self, result: Argument) -> Proxy {
        Proxy::new(self.graph.borrow_mut().output(result))
    }

    /// Appends a call node and runs the debug-metadata collectors over it.
    pub fn create_proxy(
        &self,
        target: Op,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
        name: &str,
    ) -> Proxy {
        let id = self.graph.borrow_mut().call(target, args, kwargs, name);
        tracing::trace!(node = %self.graph.borrow().node(id).name, op = %target, "recorded node");
        self.annotate(id);
        Proxy::new(id)
    }

    fn annotate(&self, id: NodeId) {
        if self.collectors.is_empty() {
            return;
        }
        let module_stack = self.module_stack();
        let site = NodeSite {
            module_stack: &module_stack,
            fn_origin: self.fn_origin(),
            original_op: self.original_op(),
            call_site: self.call_sites.outermost(),
        };
        let mut graph = self.graph.borrow_mut();
        let node = graph.node_mut(id);
        for collector in &self.collectors {
            if let Err(err) = collector.annotate(node, &site) {
                tracing::warn!(
                    collector = collector.name(),
                    node = %node.name,
                    error = %err,
                    "debug metadata collection failed; continuing without it"
                );
            }
        }
    }

    /// Attaches the metadata snapshot of `value` to the node behind `proxy`.
    pub fn set_meta(&self, proxy: Proxy, value: &Value) {
        let mut graph = self.graph.borrow_mut();
        let meta = &mut graph.node_mut(proxy.node()).meta;
        meta.val = Some(ValueSnapshot::of(value));
        meta.tensor_meta = value.as_tensor().map(TensorSnapshot::of);
    }

    /// Graph argument standing for an untracked tensor.
    pub(crate) fn intern_tensor(&self, tensor: &TensorRef) -> Argument {
        Argument::Constant(self.graph.borrow_mut().intern_tensor(tensor))
    }

    pub(crate) fn intern_opaque(&self, object: &OpaqueRef) -> Argument {
        Argument::Constant(self.graph.borrow_mut().intern_opaque(object))
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("nodes", &self.graph.borrow().len())
            .field("slots", &self.slots.borrow().len())
            .finish()
    }
}

/// Pops the module frame pushed by [`Tracer::enter_module`].
pub struct ModuleScope<'a> {
    tracer: &'a Tracer,
}

impl Drop for ModuleScope<'_> {
    fn drop(&mut self) {
        self.tracer.module_stack.borrow_mut().pop();
    }
}
