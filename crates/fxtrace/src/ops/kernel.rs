use crate::error::TraceResult;
use crate::simulate::ShapeSolver;
use crate::value::{CallArgs, Value};

use super::Op;

/// Executes operators once every dispatch layer has passed a call through.
///
/// `execute` runs on concrete data. `execute_meta` runs on simulated tensors and only
/// propagates metadata; kernels whose output shape depends on data use `solver` to allocate
/// unbacked symbols and fail when none is available.
pub trait KernelExecutor {
    fn name(&self) -> &str;

    fn execute(&self, op: Op, args: &CallArgs) -> TraceResult<Value>;

    fn execute_meta(
        &self,
        op: Op,
        args: &CallArgs,
        solver: Option<&dyn ShapeSolver>,
    ) -> TraceResult<Value>;
}
