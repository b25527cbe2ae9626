use crate::error::{TraceError, TraceResult};
use crate::value::{Dim, TensorMeta, TensorRef};

use super::{ShapeSolver, ValueSimulator};

/// Simulator producing contiguous data-less tensors.
///
/// Without a solver the result has the static shape of the input. With one, every extent is
/// replaced by a symbol (or specialised to a literal when the solver decides to).
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaSimulator;

impl ValueSimulator for MetaSimulator {
    fn simulate(
        &self,
        tensor: &TensorRef,
        source: &str,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<TensorRef> {
        if !tensor.kind().is_directly_supported() {
            return Err(TraceError::unexpected(
                "plain tensor or parameter",
                tensor.kind().type_name().to_string(),
            ));
        }
        let sizes = tensor
            .sizes()
            .into_iter()
            .enumerate()
            .map(|(i, dim)| match (solver, dim.as_static()) {
                (Some(solver), Some(hint)) => {
                    let symbol = solver.create_symbol(hint, &format!("{source}.size({i})"));
                    match symbol.literal().and_then(|lit| lit.as_i64()) {
                        Some(v) => Dim::Static(v),
                        None => Dim::Sym(symbol),
                    }
                }
                _ => dim,
            })
            .collect();
        Ok(TensorRef::simulated(TensorMeta::contiguous(tensor.dtype(), sizes)))
    }
}
