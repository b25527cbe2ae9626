pub mod cpu;
mod meta;
mod shape;

pub use cpu::CpuKernels;

use std::rc::Rc;

use fxtrace::KernelExecutor;

/// Shared executor handle, ready to hand to a trace session.
pub fn cpu_kernels() -> Rc<dyn KernelExecutor> {
    Rc::new(CpuKernels::new())
}
