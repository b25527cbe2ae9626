//! Debug metadata attached to nodes as they are created.
//!
//! The tracer hands every new call node to each registered [`DebugMetadataCollector`] together
//! with a [`NodeSite`] describing where it came from. Collector failures are logged and never
//! abort the trace.

use std::cell::RefCell;
use std::panic::Location;

use crate::dispatch::StackGuard;
use crate::error::TraceResult;
use crate::ir::{ModuleFrame, Node};
use crate::ops::Op;

/// Provenance of a node at the moment it is created.
#[derive(Debug, Clone)]
pub struct NodeSite<'a> {
    pub module_stack: &'a [ModuleFrame],
    /// `(name_count, qualified operator)` of the user-level call in progress.
    pub fn_origin: Option<(String, String)>,
    pub original_op: Option<Op>,
    pub call_site: Option<&'static Location<'static>>,
}

pub trait DebugMetadataCollector {
    fn name(&self) -> &str;

    fn annotate(&self, node: &mut Node, site: &NodeSite<'_>) -> TraceResult<()>;
}

/// Copies the whole site into the node metadata.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCollector {
    record_stack_traces: bool,
}

impl DefaultCollector {
    pub fn new(record_stack_traces: bool) -> Self {
        DefaultCollector { record_stack_traces }
    }

    /// Stack traces follow `FXTRACE_STACK_TRACES` (on unless set to a false value).
    pub fn from_env() -> Self {
        DefaultCollector::new(crate::env::stack_traces_enabled())
    }
}

impl DebugMetadataCollector for DefaultCollector {
    fn name(&self) -> &str {
        "default"
    }

    fn annotate(&self, node: &mut Node, site: &NodeSite<'_>) -> TraceResult<()> {
        if !site.module_stack.is_empty() {
            node.meta.module_stack = site.module_stack.to_vec();
        }
        node.meta.fn_origin = site.fn_origin.clone();
        node.meta.original_op = site.original_op.map(|op| op.qualified_name());
        if self.record_stack_traces {
            node.meta.stack_trace = site
                .call_site
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        }
        Ok(())
    }
}

/// Source locations of the dispatcher calls in progress, outermost first.
///
/// Owned by the [`DispatchContext`](crate::DispatchContext) and shared with every tracer it
/// drives, so nested calls from decompositions keep reporting the user's call site.
#[derive(Debug, Default)]
pub struct CallSites {
    stack: RefCell<Vec<&'static Location<'static>>>,
}

impl CallSites {
    pub(crate) fn enter(
        &self,
        location: &'static Location<'static>,
    ) -> StackGuard<'_, &'static Location<'static>> {
        StackGuard::push(&self.stack, location)
    }

    pub fn outermost(&self) -> Option<&'static Location<'static>> {
        self.stack.borrow().first().copied()
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}
