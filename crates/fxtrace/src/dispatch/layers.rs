use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::TraceResult;
use crate::ir::Argument;
use crate::ops::{Op, OpTag};
use crate::tracer::Tracer;
use crate::value::{CallArgs, Value};

use super::{DispatchContext, FunctionLayer};

/// Notes every user-level call on the tracer so nodes can be attributed to it.
pub struct MetadataLayer {
    tracer: Rc<Tracer>,
}

impl MetadataLayer {
    pub fn new(tracer: Rc<Tracer>) -> Rc<Self> {
        Rc::new(MetadataLayer { tracer })
    }
}

impl FunctionLayer for MetadataLayer {
    fn name(&self) -> &str {
        "metadata"
    }

    fn call(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value> {
        self.tracer.note_fn_call(op);
        cx.call(op, args)
    }
}

/// Keeps side-effectful host calls in pre-dispatch graphs, then lets them take effect.
pub struct PreDispatchLayer {
    tracer: Rc<Tracer>,
}

impl PreDispatchLayer {
    pub fn new(tracer: Rc<Tracer>) -> Rc<Self> {
        Rc::new(PreDispatchLayer { tracer })
    }
}

impl FunctionLayer for PreDispatchLayer {
    fn name(&self) -> &str {
        "pre_dispatch"
    }

    fn call(&self, cx: &DispatchContext, op: Op, args: &CallArgs) -> TraceResult<Value> {
        if !op.has_tag(OpTag::SideEffectful) {
            return cx.call(op, args);
        }
        let literal_args = args
            .args
            .iter()
            .map(|arg| match arg.as_literal() {
                Some(literal) => Ok(Argument::Literal(literal)),
                None => Err(crate::error::TraceError::unexpected(
                    "literal argument to a side-effectful call",
                    arg.type_name(),
                )),
            })
            .collect::<TraceResult<Vec<_>>>()?;
        let proxy = self
            .tracer
            .create_proxy(op, literal_args, BTreeMap::new(), op.name());
        self.tracer.set_meta(proxy, &Value::none());
        tracing::debug!(op = %op, "recorded side-effectful call");
        cx.call(op, args)
    }
}
