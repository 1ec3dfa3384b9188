//! CPU reference backend.
//!
//! Buffers are arrays of `AtomicU32` words so many work units can touch one
//! buffer through a shared reference, exactly like invocations on a GPU.
//! Kernels are the scalar functions from [`agent`](crate::agent),
//! [`field`](crate::field) and [`layout`](crate::layout), fanned out over a
//! rayon pool one work unit per task.
//!
//! Commands are queued and run in order on [`submit`](ComputeBackend::submit);
//! each dispatch finishes before the next one starts.
//!
//! # Testing hooks
//!
//! - [`CpuBackend::with_limits`] shrinks limits to provoke allocation errors
//! - [`CpuBackend::loss_trigger`] simulates device loss mid-run
//! - [`CpuBackend::dispatch_log`] records every executed dispatch

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use rayon::prelude::*;

use super::{BackendLimits, BufferUsage, ComputeBackend};
use crate::agent::{cell_index, seed_agent, update_agent, Agent};
use crate::error::BackendError;
use crate::field::update_cell;
use crate::kernels::{KernelKind, KernelSource};
use crate::layout::{dispatch_grid, shade_cell, unpack_rgba8, DispatchGrid};
use crate::params::SimParams;

const AGENT_WORDS: usize = std::mem::size_of::<Agent>() / 4;

/// Word-addressed buffer shared between work units.
pub struct CpuBuffer {
    label: String,
    usage: BufferUsage,
    words: Box<[AtomicU32]>,
}

impl CpuBuffer {
    fn new(label: &str, size: u64, usage: BufferUsage) -> Self {
        let len = size.div_ceil(4) as usize;
        Self {
            label: label.to_string(),
            usage,
            words: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    fn load(&self, i: usize) -> u32 {
        self.words[i].load(Ordering::Relaxed)
    }

    fn store(&self, i: usize, v: u32) {
        self.words[i].store(v, Ordering::Relaxed)
    }

    fn load_f32(&self, i: usize) -> f32 {
        f32::from_bits(self.load(i))
    }

    fn store_f32(&self, i: usize, v: f32) {
        self.store(i, v.to_bits())
    }

    /// Add to the f32 stored at `i`; concurrent adds all land.
    fn atomic_add_f32(&self, i: usize, amount: f32) {
        let word = &self.words[i];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            let updated = (f32::from_bits(old) + amount).to_bits();
            match word.compare_exchange_weak(old, updated, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }
    }

    fn load_agent(&self, i: usize) -> Agent {
        let base = i * AGENT_WORDS;
        let mut words = [0u32; AGENT_WORDS];
        for (k, w) in words.iter_mut().enumerate() {
            *w = self.load(base + k);
        }
        bytemuck::cast(words)
    }

    fn store_agent(&self, i: usize, agent: &Agent) {
        let words: [u32; AGENT_WORDS] = bytemuck::cast(*agent);
        let base = i * AGENT_WORDS;
        for (k, w) in words.iter().enumerate() {
            self.store(base + k, *w);
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|w| w.load(Ordering::Relaxed).to_le_bytes())
            .collect()
    }

    fn ensure_words(&self, needed: usize) -> Result<(), BackendError> {
        if self.words.len() < needed {
            return Err(BackendError::Binding(format!(
                "buffer '{}' holds {} words but the dispatch needs {}",
                self.label,
                self.words.len(),
                needed
            )));
        }
        Ok(())
    }
}

/// A "compiled" kernel: which native routine to run.
#[derive(Clone, Debug)]
pub struct CpuKernel {
    kind: KernelKind,
    label: &'static str,
    workgroup_size: u32,
}

pub struct CpuBindings {
    kind: KernelKind,
    buffers: Vec<Arc<CpuBuffer>>,
}

/// One executed dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: KernelKind,
    pub work_units: u32,
    pub grid: DispatchGrid,
}

enum Command {
    Write {
        buffer: Arc<CpuBuffer>,
        offset: usize,
        words: Vec<u32>,
    },
    Dispatch {
        kind: KernelKind,
        buffers: Vec<Arc<CpuBuffer>>,
        workgroup_size: u32,
        record: DispatchRecord,
    },
}

/// Handle that marks a [`CpuBackend`] as lost.
#[derive(Clone, Debug)]
pub struct LossTrigger(Arc<AtomicBool>);

impl LossTrigger {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Rayon-backed implementation of [`ComputeBackend`].
pub struct CpuBackend {
    pool: rayon::ThreadPool,
    limits: BackendLimits,
    pending: Vec<Command>,
    lost: Arc<AtomicBool>,
    log: Vec<DispatchRecord>,
    submissions: u64,
}

impl CpuBackend {
    /// Backend on a pool sized to the machine.
    pub fn new() -> Result<Self, BackendError> {
        Self::with_threads(0)
    }

    /// Backend on a pool of `threads` workers (0 = one per core).
    pub fn with_threads(threads: usize) -> Result<Self, BackendError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("slime-cpu-{}", i))
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            pool,
            limits: BackendLimits::default(),
            pending: Vec::new(),
            lost: Arc::new(AtomicBool::new(false)),
            log: Vec::new(),
            submissions: 0,
        })
    }

    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn loss_trigger(&self) -> LossTrigger {
        LossTrigger(self.lost.clone())
    }

    /// Every dispatch executed so far, oldest first.
    pub fn dispatch_log(&self) -> &[DispatchRecord] {
        &self.log
    }

    pub fn clear_dispatch_log(&mut self) {
        self.log.clear();
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    fn check_lost(&self) -> Result<(), BackendError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(BackendError::Lost("CPU backend marked lost".into()))
        } else {
            Ok(())
        }
    }

    fn execute(
        &self,
        kind: KernelKind,
        buffers: &[Arc<CpuBuffer>],
        grid: DispatchGrid,
        workgroup_size: u32,
    ) -> Result<(), BackendError> {
        let params = SimParams::from_bytes(&buffers[0].to_bytes())
            .ok_or_else(|| BackendError::Dispatch("parameter block too small".into()))?;
        let invocations = grid.invocations(workgroup_size) as u32;
        let agents = params.n_agents as usize;
        let cells = params.cell_count() as usize;

        match kind {
            KernelKind::InitAgents => {
                let out = &buffers[1];
                out.ensure_words(agents * AGENT_WORDS)?;
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        if (i as usize) < agents {
                            let agent = seed_agent(i, params.seed, params.width, params.height);
                            out.store_agent(i as usize, &agent);
                        }
                    })
                });
            }
            KernelKind::ClearField => {
                let trail = &buffers[1];
                trail.ensure_words(cells)?;
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        if (i as usize) < cells {
                            trail.store_f32(i as usize, 0.0);
                        }
                    })
                });
            }
            KernelKind::UpdateField => {
                let (input, output) = (&buffers[1], &buffers[2]);
                if Arc::ptr_eq(input, output) {
                    return Err(BackendError::Binding(
                        "field pass would read and write the same generation".into(),
                    ));
                }
                input.ensure_words(cells)?;
                output.ensure_words(cells)?;
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        let i = i as usize;
                        if i < cells {
                            output.store_f32(i, update_cell(i, &params, |j| input.load_f32(j)));
                        }
                    })
                });
            }
            KernelKind::UpdateAgents => {
                let (agent_buf, trail) = (&buffers[1], &buffers[2]);
                agent_buf.ensure_words(agents * AGENT_WORDS)?;
                trail.ensure_words(cells)?;
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        if (i as usize) < agents {
                            let agent = agent_buf.load_agent(i as usize);
                            let (moved, _) = update_agent(&agent, i, &params, |j| trail.load_f32(j));
                            agent_buf.store_agent(i as usize, &moved);
                        }
                    })
                });
            }
            KernelKind::DepositTrail => {
                let (agent_buf, trail) = (&buffers[1], &buffers[2]);
                agent_buf.ensure_words(agents * AGENT_WORDS)?;
                trail.ensure_words(cells)?;
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        if (i as usize) < agents {
                            let agent = agent_buf.load_agent(i as usize);
                            let cell = cell_index(agent.pos(), params.width, params.height);
                            trail.atomic_add_f32(cell, params.deposition);
                        }
                    })
                });
            }
            KernelKind::RenderField => {
                let (trail, pixels) = (&buffers[1], &buffers[2]);
                trail.ensure_words(cells)?;
                pixels.ensure_words(cells)?;
                let color = [params.color[0], params.color[1], params.color[2]];
                let mode = if params.tone_map == 1 {
                    crate::ToneMap::Reinhard
                } else {
                    crate::ToneMap::Linear
                };
                self.pool.install(|| {
                    (0..invocations).into_par_iter().for_each(|i| {
                        let i = i as usize;
                        if i < cells {
                            pixels.store(i, shade_cell(trail.load_f32(i), color, mode, params.exposure));
                        }
                    })
                });
            }
        }
        Ok(())
    }
}

impl ComputeBackend for CpuBackend {
    type Kernel = CpuKernel;
    type Buffer = Arc<CpuBuffer>;
    type Bindings = CpuBindings;
    type Target = RgbaImage;

    fn name(&self) -> &str {
        "cpu"
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn check_available(&self) -> Result<(), BackendError> {
        self.check_lost()
    }

    fn compile_kernel(&mut self, source: &KernelSource) -> Result<CpuKernel, BackendError> {
        self.check_lost()?;
        Ok(CpuKernel {
            kind: source.kind,
            label: source.label,
            workgroup_size: source.workgroup_size,
        })
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: BufferUsage,
    ) -> Result<Arc<CpuBuffer>, BackendError> {
        self.check_lost()?;
        if usage == BufferUsage::Storage && size > self.limits.max_storage_buffer_size {
            return Err(BackendError::Allocation {
                label: label.to_string(),
                size,
                limit: self.limits.max_storage_buffer_size,
            });
        }
        Ok(Arc::new(CpuBuffer::new(label, size, usage)))
    }

    fn write_buffer(
        &mut self,
        buffer: &Arc<CpuBuffer>,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(BackendError::Dispatch(format!(
                "write to '{}' is not word aligned",
                buffer.label
            )));
        }
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        buffer.ensure_words(offset as usize / 4 + words.len())?;
        self.pending.push(Command::Write {
            buffer: buffer.clone(),
            offset: offset as usize / 4,
            words,
        });
        Ok(())
    }

    fn create_bindings(
        &mut self,
        kernel: &CpuKernel,
        buffers: &[&Arc<CpuBuffer>],
    ) -> Result<CpuBindings, BackendError> {
        self.check_lost()?;
        let expected = kernel.kind.bindings();
        if buffers.len() != expected.len() {
            return Err(BackendError::Binding(format!(
                "kernel '{}' takes {} bindings, got {}",
                kernel.label,
                expected.len(),
                buffers.len()
            )));
        }
        if buffers[0].usage != BufferUsage::Uniform {
            return Err(BackendError::Binding(format!(
                "binding 0 of '{}' must be a uniform buffer",
                kernel.label
            )));
        }
        Ok(CpuBindings {
            kind: kernel.kind,
            buffers: buffers.iter().map(|b| Arc::clone(b)).collect(),
        })
    }

    fn dispatch(
        &mut self,
        kernel: &CpuKernel,
        bindings: &CpuBindings,
        work_units: u32,
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        if bindings.kind != kernel.kind {
            return Err(BackendError::Binding(format!(
                "bindings for {:?} used with kernel '{}'",
                bindings.kind, kernel.label
            )));
        }
        let grid = dispatch_grid(
            work_units,
            kernel.workgroup_size,
            self.limits.max_workgroups_per_dimension,
        );
        self.pending.push(Command::Dispatch {
            kind: kernel.kind,
            buffers: bindings.buffers.clone(),
            workgroup_size: kernel.workgroup_size,
            record: DispatchRecord {
                kernel: kernel.kind,
                work_units,
                grid,
            },
        });
        Ok(())
    }

    fn submit(&mut self) -> Result<(), BackendError> {
        self.check_lost()?;
        for command in std::mem::take(&mut self.pending) {
            match command {
                Command::Write { buffer, offset, words } => {
                    for (k, w) in words.into_iter().enumerate() {
                        buffer.store(offset + k, w);
                    }
                }
                Command::Dispatch {
                    kind,
                    buffers,
                    workgroup_size,
                    record,
                } => {
                    log::trace!(
                        "cpu dispatch {:?}: {} units, grid {}x{}",
                        kind,
                        record.work_units,
                        record.grid.x,
                        record.grid.y
                    );
                    self.execute(kind, &buffers, record.grid, workgroup_size)?;
                    self.log.push(record);
                }
            }
        }
        self.submissions += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        // submit() runs to completion, so only queued work is outstanding.
        if self.pending.is_empty() {
            self.check_lost()
        } else {
            self.submit()
        }
    }

    fn read_buffer(&mut self, buffer: &Arc<CpuBuffer>) -> Result<Vec<u8>, BackendError> {
        self.wait_idle()?;
        Ok(buffer.to_bytes())
    }

    fn present_frame(
        &mut self,
        pixels: &Arc<CpuBuffer>,
        size: (u32, u32),
        target: &mut RgbaImage,
    ) -> Result<(), BackendError> {
        self.wait_idle()?;
        let (w, h) = size;
        let count = (w * h) as usize;
        if pixels.len_words() < count {
            return Err(BackendError::Present(format!(
                "pixel buffer holds {} words, frame needs {}",
                pixels.len_words(),
                count
            )));
        }
        if target.dimensions() != size {
            *target = RgbaImage::new(w, h);
        }
        for (i, px) in target.pixels_mut().enumerate() {
            px.0 = unpack_rgba8(pixels.load(i));
        }
        Ok(())
    }
}
