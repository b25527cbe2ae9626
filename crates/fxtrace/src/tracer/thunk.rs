use std::cell::RefCell;
use std::fmt;

use crate::error::{TraceError, TraceResult};

type Compute<T> = Box<dyn FnOnce() -> TraceResult<T>>;

enum ThunkState<T> {
    Pending(Compute<T>),
    Forcing,
    Done(T),
    Poisoned,
}

/// Deferred computation evaluated at most once.
///
/// Symbolic scalars bind a thunk instead of a node so that graph nodes for them are only
/// materialised when something actually consumes the scalar, in dependency order.
pub struct Thunk<T> {
    state: RefCell<ThunkState<T>>,
}

impl<T: Clone> Thunk<T> {
    pub fn new(compute: impl FnOnce() -> TraceResult<T> + 'static) -> Self {
        Thunk {
            state: RefCell::new(ThunkState::Pending(Box::new(compute))),
        }
    }

    /// Thunk that is already evaluated.
    pub fn ready(value: T) -> Self {
        Thunk {
            state: RefCell::new(ThunkState::Done(value)),
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(&*self.state.borrow(), ThunkState::Done(_))
    }

    pub fn force(&self) -> TraceResult<T> {
        let compute = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, ThunkState::Forcing) {
                ThunkState::Done(value) => {
                    *state = ThunkState::Done(value.clone());
                    return Ok(value);
                }
                ThunkState::Pending(compute) => compute,
                ThunkState::Forcing => {
                    return Err(TraceError::tracking("thunk forced while it was being computed"));
                }
                ThunkState::Poisoned => {
                    *state = ThunkState::Poisoned;
                    return Err(TraceError::tracking("thunk forced after its computation failed"));
                }
            }
        };
        // The borrow is released so the computation may force other thunks.
        match compute() {
            Ok(value) => {
                *self.state.borrow_mut() = ThunkState::Done(value.clone());
                Ok(value)
            }
            Err(err) => {
                *self.state.borrow_mut() = ThunkState::Poisoned;
                Err(err)
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Thunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            ThunkState::Pending(_) => f.write_str("Thunk(<pending>)"),
            ThunkState::Forcing => f.write_str("Thunk(<forcing>)"),
            ThunkState::Done(value) => write!(f, "Thunk({value:?})"),
            ThunkState::Poisoned => f.write_str("Thunk(<poisoned>)"),
        }
    }
}
