use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_OPAQUE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpaqueId(u64);

struct OpaqueInner {
    id: OpaqueId,
    type_name: String,
    payload: Box<dyn Any>,
}

/// Handle to a host object the tracer threads through the graph without looking inside.
#[derive(Clone)]
pub struct OpaqueRef(Rc<OpaqueInner>);

impl OpaqueRef {
    pub fn new(type_name: &str, payload: impl Any) -> Self {
        OpaqueRef(Rc::new(OpaqueInner {
            id: OpaqueId(NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)),
            type_name: type_name.to_string(),
            payload: Box::new(payload),
        }))
    }

    pub fn id(&self) -> OpaqueId {
        self.0.id
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.type_name, self.0.id.0)
    }
}
