//! The simulation engine: lifecycle, per-frame orchestration and generation
//! bookkeeping.
//!
//! ```text
//! Uninitialized ──init──▶ Initializing ──▶ Ready ──destroy──▶ Destroyed
//!        │                     │ (failure)     │ (backend lost)     ▲
//!        └─────────────────────┴───────────────┴────────────────────┘
//! ```
//!
//! Each [`Engine::update`] uploads a fresh parameter block, runs the field
//! pass from the current generation into the next one, swaps the two, then
//! runs the agent pass against the newly current generation (sense and move,
//! then deposit). [`Engine::render`] samples whatever generation is current.
//! Bind groups for both ring parities are created once at init, so a frame
//! never allocates.
//!
//! # Example
//!
//! ```ignore
//! use slime::prelude::*;
//!
//! let backend = CpuBackend::new()?;
//! let mut engine = Engine::new(backend, Config::default()).with_seed(42);
//! engine.init()?;
//!
//! let mut frame = image::RgbaImage::new(1, 1);
//! for _ in 0..100 {
//!     engine.tick(&mut frame)?;
//! }
//! frame.save("slime.png")?;
//! ```

use crate::agent::Agent;
use crate::backend::{BufferUsage, ComputeBackend, KernelKind, KernelSource};
use crate::config::Config;
use crate::error::EngineError;
use crate::field::{FieldRing, Slot};
use crate::layout::{dispatch_grid, DispatchGrid, WORKGROUP_SIZE};
use crate::params::{SimParams, UniformBlock};
use crate::time::Clock;

/// Lifecycle state of an [`Engine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal.
    Destroyed,
}

/// What [`Engine::tick`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced,
    Paused,
}

/// What [`Engine::apply_config`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    /// Only live parameters changed; picked up by the next update.
    Live,
    /// Store sizes changed; everything was torn down and re-initialized.
    Reallocated,
}

/// Work sizing of the most recent frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStats {
    /// Updates completed since init.
    pub frame: u32,
    pub field_units: u32,
    pub agent_units: u32,
    pub field_grid: DispatchGrid,
    pub agent_grid: DispatchGrid,
}

struct Kernels<B: ComputeBackend> {
    init_agents: B::Kernel,
    clear_field: B::Kernel,
    update_field: B::Kernel,
    update_agents: B::Kernel,
    deposit_trail: B::Kernel,
    render_field: B::Kernel,
}

/// Bindings indexed by the slot they read (field pass) or target.
struct Bindings<B: ComputeBackend> {
    init_agents: B::Bindings,
    clear_field: B::Bindings,
    update_field: [B::Bindings; 2],
    update_agents: [B::Bindings; 2],
    deposit_trail: [B::Bindings; 2],
    render_field: [B::Bindings; 2],
}

/// Everything allocated by init. Dropping it frees the backend objects.
struct Resources<B: ComputeBackend> {
    kernels: Kernels<B>,
    bindings: Bindings<B>,
    params: B::Buffer,
    agents: B::Buffer,
    field: FieldRing<B::Buffer>,
    pixels: B::Buffer,
    size: (u32, u32),
    n_agents: u32,
}

impl<B: ComputeBackend> Resources<B> {
    fn cell_count(&self) -> u32 {
        self.size.0 * self.size.1
    }
}

/// A slime simulation running on backend `B`.
pub struct Engine<B: ComputeBackend> {
    backend: B,
    config: Config,
    seed: u32,
    state: EngineState,
    resources: Option<Resources<B>>,
    frame: u32,
    clock: Clock,
    paused: bool,
}

impl<B: ComputeBackend> Engine<B> {
    /// Wrap `backend` with a config. Nothing is allocated until [`init`](Self::init).
    ///
    /// The config is sanitized; the seed defaults to the wall clock.
    pub fn new(backend: B, config: Config) -> Self {
        Self {
            backend,
            config: config.sanitized(),
            seed: wall_clock_seed(),
            state: EngineState::Uninitialized,
            resources: None,
            frame: 0,
            clock: Clock::new(),
            paused: false,
        }
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Drive the uniform timestamp from `clock` (e.g. [`Clock::fixed`]).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Generation the next read will see, if initialized.
    pub fn current_slot(&self) -> Option<Slot> {
        self.resources.as_ref().map(|r| r.field.current_slot())
    }

    /// Allocate the stores, compile every kernel, seed the agents and clear
    /// field generation B.
    ///
    /// On failure nothing stays allocated. Capability and loss errors
    /// destroy the engine; a config that cannot be allocated leaves it
    /// `Uninitialized` so a smaller config can be tried.
    pub fn init(&mut self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Destroyed => return Err(EngineError::Destroyed),
            EngineState::Initializing => return Err(EngineError::NotReady(self.state)),
            EngineState::Ready => {
                let released = self.release();
                self.check(released)?;
            }
            EngineState::Uninitialized => {}
        }

        self.state = EngineState::Initializing;
        log::info!(
            "initializing on {}: {} agents, {}x{} field, seed {}",
            self.backend.name(),
            self.config.n_agents,
            self.config.width(),
            self.config.height(),
            self.seed
        );

        match self.build() {
            Ok(resources) => {
                self.resources = Some(resources);
                self.frame = 0;
                self.clock.reset();
                if self.paused {
                    self.clock.pause();
                }
                self.state = EngineState::Ready;
                log::info!("engine ready");
                Ok(())
            }
            Err(err) => {
                if err.is_terminal() {
                    log::error!("init failed: {}", err);
                    self.state = EngineState::Destroyed;
                } else {
                    log::warn!("init rejected: {}", err);
                    self.state = EngineState::Uninitialized;
                }
                Err(err)
            }
        }
    }

    fn build(&mut self) -> Result<Resources<B>, EngineError> {
        self.backend.check_available()?;

        let limits = self.backend.limits();
        let (width, height) = self.config.size;
        let n_agents = self.config.n_agents;
        let cells = self.config.cell_count().ok_or_else(|| {
            EngineError::ConfigInvalid(format!("{}x{} field overflows a cell index", width, height))
        })?;
        let field_bytes = u64::from(cells) * 4;
        let agent_bytes = u64::from(n_agents) * std::mem::size_of::<Agent>() as u64;
        for (what, bytes) in [("field", field_bytes), ("agent", agent_bytes)] {
            if bytes > limits.max_storage_buffer_size {
                return Err(EngineError::ConfigInvalid(format!(
                    "{} store needs {} bytes, backend allows {}",
                    what, bytes, limits.max_storage_buffer_size
                )));
            }
        }

        let b = &mut self.backend;
        let kernels = Kernels::<B> {
            init_agents: b.compile_kernel(&KernelSource::new(KernelKind::InitAgents))?,
            clear_field: b.compile_kernel(&KernelSource::new(KernelKind::ClearField))?,
            update_field: b.compile_kernel(&KernelSource::new(KernelKind::UpdateField))?,
            update_agents: b.compile_kernel(&KernelSource::new(KernelKind::UpdateAgents))?,
            deposit_trail: b.compile_kernel(&KernelSource::new(KernelKind::DepositTrail))?,
            render_field: b.compile_kernel(&KernelSource::new(KernelKind::RenderField))?,
        };

        let params = b.allocate_buffer(
            "params",
            UniformBlock::size_for(limits.uniform_alignment),
            BufferUsage::Uniform,
        )?;
        let agents = b.allocate_buffer("agents", agent_bytes, BufferUsage::Storage)?;
        let field_a = b.allocate_buffer("field_a", field_bytes, BufferUsage::Storage)?;
        let field_b = b.allocate_buffer("field_b", field_bytes, BufferUsage::Storage)?;
        let pixels = b.allocate_buffer("pixels", field_bytes, BufferUsage::Storage)?;

        let k = &kernels;
        let (fa, fb) = (&field_a, &field_b);
        let bindings = Bindings::<B> {
            init_agents: b.create_bindings(&k.init_agents, &[&params, &agents])?,
            clear_field: b.create_bindings(&k.clear_field, &[&params, fb])?,
            update_field: [
                b.create_bindings(&k.update_field, &[&params, fa, fb])?,
                b.create_bindings(&k.update_field, &[&params, fb, fa])?,
            ],
            update_agents: [
                b.create_bindings(&k.update_agents, &[&params, &agents, fa])?,
                b.create_bindings(&k.update_agents, &[&params, &agents, fb])?,
            ],
            deposit_trail: [
                b.create_bindings(&k.deposit_trail, &[&params, &agents, fa])?,
                b.create_bindings(&k.deposit_trail, &[&params, &agents, fb])?,
            ],
            render_field: [
                b.create_bindings(&k.render_field, &[&params, fa, &pixels])?,
                b.create_bindings(&k.render_field, &[&params, fb, &pixels])?,
            ],
        };

        let initial = SimParams::from_config(&self.config, self.seed, 0, 0.0);
        let block = UniformBlock::new(&initial, limits.uniform_alignment);
        b.write_buffer(&params, 0, block.as_bytes())?;
        b.dispatch(&k.init_agents, &bindings.init_agents, n_agents)?;
        b.dispatch(&k.clear_field, &bindings.clear_field, cells)?;
        b.submit()?;

        Ok(Resources {
            kernels,
            bindings,
            params,
            agents,
            field: FieldRing::new(field_a, field_b, Slot::B),
            pixels,
            size: (width, height),
            n_agents,
        })
    }

    /// Advance the simulation by one frame.
    pub fn update(&mut self) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let result = self.record_update();
        self.check(result)?;
        self.frame = self.frame.wrapping_add(1);
        Ok(())
    }

    fn record_update(&mut self) -> Result<(), EngineError> {
        let (elapsed, _) = self.clock.tick();
        let alignment = self.backend.limits().uniform_alignment;
        let Some(res) = self.resources.as_mut() else {
            return Err(EngineError::NotReady(self.state));
        };

        let params = SimParams::from_config(&self.config, self.seed, self.frame, elapsed);
        let block = UniformBlock::new(&params, alignment);
        self.backend.write_buffer(&res.params, 0, block.as_bytes())?;

        let cells = res.size.0 * res.size.1;
        let roles = res.field.advance_roles();
        log::trace!(
            "frame {}: field pass {:?} -> {:?} over {} cells",
            self.frame,
            roles.read,
            roles.write,
            cells
        );
        self.backend.dispatch(
            &res.kernels.update_field,
            &res.bindings.update_field[roles.read.index()],
            cells,
        )?;
        res.field.swap();

        let current = res.field.current_slot().index();
        self.backend.dispatch(
            &res.kernels.update_agents,
            &res.bindings.update_agents[current],
            res.n_agents,
        )?;
        self.backend.dispatch(
            &res.kernels.deposit_trail,
            &res.bindings.deposit_trail[current],
            res.n_agents,
        )?;
        self.backend.submit()?;
        Ok(())
    }

    /// Draw the current generation into `target` with the current tint and
    /// tone mapping.
    pub fn render(&mut self, target: &mut B::Target) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let result = self.record_render(target);
        self.check(result)
    }

    fn record_render(&mut self, target: &mut B::Target) -> Result<(), EngineError> {
        let alignment = self.backend.limits().uniform_alignment;
        let Some(res) = self.resources.as_ref() else {
            return Err(EngineError::NotReady(self.state));
        };

        // Tint and tone mapping are live, so shade with the config as it is now.
        let params = SimParams::from_config(&self.config, self.seed, self.frame, self.clock.elapsed());
        let block = UniformBlock::new(&params, alignment);
        self.backend.write_buffer(&res.params, 0, block.as_bytes())?;

        let current = res.field.current_slot().index();
        self.backend.dispatch(
            &res.kernels.render_field,
            &res.bindings.render_field[current],
            res.cell_count(),
        )?;
        self.backend.submit()?;
        self.backend.present_frame(&res.pixels, res.size, target)?;
        Ok(())
    }

    /// One scheduler tick: update then render, unless paused.
    pub fn tick(&mut self, target: &mut B::Target) -> Result<TickOutcome, EngineError> {
        self.ensure_ready()?;
        if self.paused {
            return Ok(TickOutcome::Paused);
        }
        self.update()?;
        self.render(target)?;
        Ok(TickOutcome::Advanced)
    }

    /// Stop or resume scheduling new frames. In-flight work still finishes.
    pub fn set_paused(&mut self, paused: bool) {
        if paused == self.paused {
            return;
        }
        self.paused = paused;
        if paused {
            self.clock.pause();
        } else {
            self.clock.resume();
        }
        log::debug!("engine {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Swap in a new config.
    ///
    /// Live fields take effect on the next update. A change of agent count
    /// or field size quiesces the backend, frees both stores and runs init
    /// again with the new sizes.
    pub fn apply_config(&mut self, config: Config) -> Result<ConfigChange, EngineError> {
        if self.state == EngineState::Destroyed {
            return Err(EngineError::Destroyed);
        }
        let config = config.sanitized();
        let reallocate = self.config.requires_reallocation(&config);
        self.config = config;

        if !reallocate || self.state != EngineState::Ready {
            return Ok(ConfigChange::Live);
        }
        log::info!(
            "reallocating for {} agents on {}x{}",
            self.config.n_agents,
            self.config.width(),
            self.config.height()
        );
        self.init()?;
        Ok(ConfigChange::Reallocated)
    }

    /// Re-seed the agents and clear the field, keeping the current config.
    pub fn restart(&mut self, seed: u32) -> Result<(), EngineError> {
        if self.state == EngineState::Destroyed {
            return Err(EngineError::Destroyed);
        }
        self.seed = seed;
        if self.state == EngineState::Ready {
            self.init()?;
        }
        Ok(())
    }

    /// Copy the agent store back to the host.
    pub fn read_agents(&mut self) -> Result<Vec<Agent>, EngineError> {
        self.ensure_ready()?;
        let result = match self.resources.as_ref() {
            Some(res) => self
                .backend
                .read_buffer(&res.agents)
                .map(|bytes| decode_words(&bytes, res.n_agents as usize * std::mem::size_of::<Agent>()))
                .map_err(EngineError::from),
            None => Err(EngineError::NotReady(self.state)),
        };
        self.check(result)
    }

    /// Copy the current field generation back to the host, row-major.
    pub fn read_field(&mut self) -> Result<Vec<f32>, EngineError> {
        self.ensure_ready()?;
        let result = match self.resources.as_ref() {
            Some(res) => self
                .backend
                .read_buffer(res.field.current())
                .map(|bytes| decode_words(&bytes, res.cell_count() as usize * 4))
                .map_err(EngineError::from),
            None => Err(EngineError::NotReady(self.state)),
        };
        self.check(result)
    }

    pub fn frame_stats(&self) -> FrameStats {
        let max = self.backend.limits().max_workgroups_per_dimension;
        let (field_units, agent_units) = match &self.resources {
            Some(res) => (res.cell_count(), res.n_agents),
            None => (0, 0),
        };
        FrameStats {
            frame: self.frame,
            field_units,
            agent_units,
            field_grid: dispatch_grid(field_units, WORKGROUP_SIZE, max),
            agent_grid: dispatch_grid(agent_units, WORKGROUP_SIZE, max),
        }
    }

    /// Release everything and make the engine permanently unusable.
    ///
    /// Valid from any state; destroying twice is a no-op.
    pub fn destroy(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        if let Err(err) = self.release() {
            log::warn!("backend did not quiesce during destroy: {}", err);
        }
        self.state = EngineState::Destroyed;
        log::info!("engine destroyed after {} frames", self.frame);
    }

    /// Wait for outstanding work, then free the stores.
    fn release(&mut self) -> Result<(), EngineError> {
        let Some(res) = self.resources.take() else {
            return Ok(());
        };
        let idle = self.backend.wait_idle();
        let Resources {
            kernels,
            bindings,
            params,
            agents,
            field,
            pixels,
            ..
        } = res;
        drop(bindings);
        drop(kernels);
        let [field_a, field_b] = field.into_slots();
        for buffer in [params, agents, field_a, field_b, pixels] {
            self.backend.release_buffer(buffer);
        }
        idle.map_err(EngineError::from)
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Destroyed => Err(EngineError::Destroyed),
            state => Err(EngineError::NotReady(state)),
        }
    }

    /// Terminal errors tear the engine down before being returned.
    fn check<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(err) = &result {
            if err.is_terminal() {
                log::error!("engine failed: {}", err);
                self.resources = None;
                self.state = EngineState::Destroyed;
            }
        }
        result
    }
}

impl<B: ComputeBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn decode_words<T: bytemuck::Pod>(bytes: &[u8], len: usize) -> Vec<T> {
    bytemuck::pod_collect_to_vec(&bytes[..len.min(bytes.len())])
}

fn wall_clock_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0)
}
