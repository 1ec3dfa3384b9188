//! The compute capability surface the engine depends on.
//!
//! The engine never talks to a device directly. It compiles
//! [`KernelSource`]s, allocates buffers, binds them and dispatches work
//! through a [`ComputeBackend`], so any implementation of this trait can run
//! the simulation:
//!
//! - [`CpuBackend`] - rayon thread pool, one task per work unit
//! - [`WgpuBackend`](crate::gpu::WgpuBackend) - WebGPU compute pipelines
//!
//! # Ordering
//!
//! Dispatches are recorded in call order and executed by [`submit`]. Each
//! dispatch completes before the next one starts, which is the only
//! inter-pass guarantee the engine relies on. Within one dispatch work units
//! run in any order.
//!
//! [`submit`]: ComputeBackend::submit

mod cpu;

pub use cpu::{CpuBackend, CpuBindings, CpuBuffer, CpuKernel, DispatchRecord, LossTrigger};
pub use crate::kernels::{Access, KernelKind, KernelSource};

use crate::error::BackendError;
use crate::layout::MAX_WORKGROUPS_PER_DIMENSION;

/// What a buffer will be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Small block written by the host every frame.
    Uniform,
    /// Large array read and written by kernels.
    Storage,
}

/// Limits a backend imposes on allocations and dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendLimits {
    /// Uniform block sizes must be a multiple of this.
    pub uniform_alignment: u64,
    /// Largest storage buffer a kernel can bind.
    pub max_storage_buffer_size: u64,
    pub max_workgroups_per_dimension: u32,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            uniform_alignment: 256,
            max_storage_buffer_size: 128 << 20,
            max_workgroups_per_dimension: MAX_WORKGROUPS_PER_DIMENSION,
        }
    }
}

/// A device able to run the simulation kernels.
pub trait ComputeBackend {
    /// Compiled kernel.
    type Kernel;
    /// Device buffer.
    type Buffer;
    /// Buffers bound to one kernel.
    type Bindings;
    /// Display surface accepted by [`present_frame`](Self::present_frame).
    type Target;

    /// Short name for logs.
    fn name(&self) -> &str;

    fn limits(&self) -> BackendLimits;

    /// Fails with [`BackendError::Unavailable`] or [`BackendError::Lost`]
    /// when the device cannot accept work.
    fn check_available(&self) -> Result<(), BackendError>;

    fn compile_kernel(&mut self, source: &KernelSource) -> Result<Self::Kernel, BackendError>;

    fn allocate_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: BufferUsage,
    ) -> Result<Self::Buffer, BackendError>;

    /// Queue a host write; it lands before the next submitted dispatch.
    fn write_buffer(
        &mut self,
        buffer: &Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// Bind `buffers` to the kernel's bindings, in binding order.
    fn create_bindings(
        &mut self,
        kernel: &Self::Kernel,
        buffers: &[&Self::Buffer],
    ) -> Result<Self::Bindings, BackendError>;

    /// Record a dispatch of `work_units` invocations.
    fn dispatch(
        &mut self,
        kernel: &Self::Kernel,
        bindings: &Self::Bindings,
        work_units: u32,
    ) -> Result<(), BackendError>;

    /// Execute everything recorded since the last submit.
    fn submit(&mut self) -> Result<(), BackendError>;

    /// Block until all submitted work has finished.
    fn wait_idle(&mut self) -> Result<(), BackendError>;

    /// Copy a buffer back to the host. Submits pending work first.
    fn read_buffer(&mut self, buffer: &Self::Buffer) -> Result<Vec<u8>, BackendError>;

    /// Show the packed RGBA8 `pixels` (`width * height` words) on `target`.
    fn present_frame(
        &mut self,
        pixels: &Self::Buffer,
        size: (u32, u32),
        target: &mut Self::Target,
    ) -> Result<(), BackendError>;

    /// Free a buffer. Dropping it has the same effect on most backends.
    fn release_buffer(&mut self, buffer: Self::Buffer) {
        drop(buffer);
    }
}
