//! Engine state machine, error propagation and reallocation.

use image::RgbaImage;
use slime::backend::{
    BackendLimits, BufferUsage, ComputeBackend, CpuBackend, KernelKind, KernelSource,
};
use slime::prelude::*;

fn cpu() -> CpuBackend {
    CpuBackend::with_threads(2).unwrap()
}

fn config() -> Config {
    Config::default().with_size(64, 64).with_agents(1000)
}

fn ready_engine() -> Engine<CpuBackend> {
    let mut engine = Engine::new(cpu(), config())
        .with_seed(1)
        .with_clock(Clock::fixed(1.0 / 30.0));
    engine.init().unwrap();
    engine
}

/// A host with no compute device at all.
struct NoDevice;

impl ComputeBackend for NoDevice {
    type Kernel = ();
    type Buffer = ();
    type Bindings = ();
    type Target = ();

    fn name(&self) -> &str {
        "none"
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits::default()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("no adapter".into()))
    }

    fn compile_kernel(&mut self, _: &KernelSource) -> Result<(), BackendError> {
        panic!("compiled a kernel without a device")
    }

    fn allocate_buffer(&mut self, _: &str, _: u64, _: BufferUsage) -> Result<(), BackendError> {
        panic!("allocated without a device")
    }

    fn write_buffer(&mut self, _: &(), _: u64, _: &[u8]) -> Result<(), BackendError> {
        unreachable!()
    }

    fn create_bindings(&mut self, _: &(), _: &[&()]) -> Result<(), BackendError> {
        unreachable!()
    }

    fn dispatch(&mut self, _: &(), _: &(), _: u32) -> Result<(), BackendError> {
        unreachable!()
    }

    fn submit(&mut self) -> Result<(), BackendError> {
        unreachable!()
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn read_buffer(&mut self, _: &()) -> Result<Vec<u8>, BackendError> {
        unreachable!()
    }

    fn present_frame(&mut self, _: &(), _: (u32, u32), _: &mut ()) -> Result<(), BackendError> {
        unreachable!()
    }
}

#[test]
fn missing_device_is_reported_and_terminal() {
    let mut engine = Engine::new(NoDevice, config());
    let err = engine.init().unwrap_err();
    assert_eq!(err, EngineError::CapabilityUnavailable("no adapter".into()));
    assert_eq!(engine.state(), EngineState::Destroyed);
    assert_eq!(engine.update(), Err(EngineError::Destroyed));
}

#[test]
fn lifecycle_runs_through_every_state() {
    let mut engine = Engine::new(cpu(), config()).with_seed(3);
    assert_eq!(engine.state(), EngineState::Uninitialized);

    engine.init().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);

    let mut frame = RgbaImage::new(1, 1);
    for _ in 0..3 {
        assert_eq!(engine.tick(&mut frame).unwrap(), TickOutcome::Advanced);
    }
    assert_eq!(engine.frame(), 3);

    engine.destroy();
    assert_eq!(engine.state(), EngineState::Destroyed);
    assert_eq!(engine.render(&mut frame), Err(EngineError::Destroyed));
    assert_eq!(engine.read_agents(), Err(EngineError::Destroyed));
}

#[test]
fn destroy_before_init_is_allowed() {
    let mut engine = Engine::new(cpu(), config());
    engine.destroy();
    assert_eq!(engine.state(), EngineState::Destroyed);
    assert_eq!(engine.init(), Err(EngineError::Destroyed));
}

#[test]
fn calls_before_init_are_rejected() {
    let mut engine = Engine::new(cpu(), config());
    assert_eq!(
        engine.read_field(),
        Err(EngineError::NotReady(EngineState::Uninitialized))
    );
    let mut frame = RgbaImage::new(1, 1);
    assert_eq!(
        engine.tick(&mut frame),
        Err(EngineError::NotReady(EngineState::Uninitialized))
    );
}

#[test]
fn backend_loss_mid_run_destroys_the_engine() {
    let mut engine = ready_engine();
    engine.update().unwrap();

    engine.backend().loss_trigger().trigger();
    let err = engine.update().unwrap_err();
    assert!(matches!(err, EngineError::BackendLost(_)));
    assert_eq!(engine.state(), EngineState::Destroyed);
    assert_eq!(engine.current_slot(), None);
    assert_eq!(engine.update(), Err(EngineError::Destroyed));
}

#[test]
fn loss_before_init_is_terminal() {
    let backend = cpu();
    backend.loss_trigger().trigger();
    let mut engine = Engine::new(backend, config());
    assert!(matches!(engine.init(), Err(EngineError::BackendLost(_))));
    assert_eq!(engine.state(), EngineState::Destroyed);
}

#[test]
fn unallocatable_config_is_rejected_before_allocation() {
    // 64x64 cells need 16384 bytes per generation.
    let backend = cpu().with_limits(BackendLimits {
        max_storage_buffer_size: 16_000,
        ..BackendLimits::default()
    });
    let mut engine = Engine::new(backend, config());
    assert!(matches!(engine.init(), Err(EngineError::ConfigInvalid(_))));
    assert_eq!(engine.state(), EngineState::Uninitialized);
    assert_eq!(engine.current_slot(), None);
    assert!(engine.backend().dispatch_log().is_empty());

    // 32x32 cells and 1000 agents (16000 bytes) fit.
    engine
        .apply_config(Config::default().with_size(32, 32).with_agents(1000))
        .unwrap();
    engine.init().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn resizing_reallocates_and_resizes_dispatches() {
    let mut engine = ready_engine();
    engine.update().unwrap();
    engine.update().unwrap();

    let bigger = Config::default().with_size(96, 48).with_agents(2500);
    assert_eq!(engine.apply_config(bigger).unwrap(), ConfigChange::Reallocated);
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.frame(), 0);
    assert_eq!(engine.current_slot(), Some(slime::field::Slot::B));

    engine.backend_mut().clear_dispatch_log();
    engine.update().unwrap();
    let log = engine.backend().dispatch_log();
    assert_eq!(log[0].kernel, KernelKind::UpdateField);
    assert_eq!(log[0].work_units, 96 * 48);
    assert_eq!(log[1].work_units, 2500);
    assert_eq!(log[2].work_units, 2500);

    let stats = engine.frame_stats();
    assert_eq!(stats.field_units, 96 * 48);
    assert_eq!(stats.agent_units, 2500);
    assert_eq!(stats.agent_grid.x, 2500u32.div_ceil(64));

    assert_eq!(engine.read_agents().unwrap().len(), 2500);
    assert_eq!(engine.read_field().unwrap().len(), 96 * 48);
    let mut frame = RgbaImage::new(1, 1);
    engine.render(&mut frame).unwrap();
    assert_eq!(frame.dimensions(), (96, 48));
}

#[test]
fn live_changes_keep_running_state() {
    let mut engine = ready_engine();
    engine.update().unwrap();
    let before = engine.read_agents().unwrap();

    let change = engine
        .apply_config(config().with_decay(0.2).with_color(Color::new(1.0, 0.0, 0.0)))
        .unwrap();
    assert_eq!(change, ConfigChange::Live);
    assert_eq!(engine.read_agents().unwrap(), before);
    assert_eq!(engine.frame(), 1);
}

#[test]
fn render_picks_up_live_tint_without_an_update() {
    let mut engine = ready_engine();
    engine.update().unwrap();

    let mut frame = RgbaImage::new(1, 1);
    engine.render(&mut frame).unwrap();
    let lit = frame
        .pixels()
        .position(|p| p.0 != [0, 0, 0, 255])
        .expect("one update lights the visited cells");
    let (x, y) = (lit as u32 % 64, lit as u32 / 64);
    assert_eq!(frame.get_pixel(x, y).0, [12, 59, 130, 255]);

    let red = config().with_color(Color::new(1.0, 0.0, 0.0));
    assert_eq!(engine.apply_config(red).unwrap(), ConfigChange::Live);
    engine.render(&mut frame).unwrap();
    assert_eq!(frame.get_pixel(x, y).0, [255, 0, 0, 255]);
    assert_eq!(engine.frame(), 1);

    let dim = config()
        .with_color(Color::new(1.0, 0.0, 0.0))
        .with_tone_map(ToneMap::Linear, 0.01);
    engine.apply_config(dim).unwrap();
    engine.render(&mut frame).unwrap();
    assert!(frame.get_pixel(x, y).0[0] < 255);
}

#[test]
fn out_of_range_config_is_clamped() {
    let wild = Config::default()
        .with_size(2, 100_000)
        .with_agents(5)
        .with_decay(3.0)
        .with_step_size(f32::NAN);
    let engine = Engine::new(cpu(), wild);
    let c = engine.config();
    assert_eq!(c.size, (Config::MINS.size.0, Config::MAXS.size.1));
    assert_eq!(c.n_agents, Config::MINS.n_agents);
    assert_eq!(c.decay, 1.0);
    assert_eq!(c.step_size, Config::default().step_size);
}

#[test]
fn restart_reseeds_without_resizing() {
    let mut engine = ready_engine();
    for _ in 0..5 {
        engine.update().unwrap();
    }
    engine.restart(99).unwrap();
    assert_eq!(engine.frame(), 0);
    assert!(engine.read_field().unwrap().iter().all(|&v| v == 0.0));

    let mut fresh = Engine::new(cpu(), config()).with_seed(99);
    fresh.init().unwrap();
    assert_eq!(engine.read_agents().unwrap(), fresh.read_agents().unwrap());
}

#[test]
fn pause_suspends_ticks_only() {
    let mut engine = ready_engine();
    let mut frame = RgbaImage::new(1, 1);
    engine.tick(&mut frame).unwrap();

    engine.set_paused(true);
    assert!(engine.is_paused());
    for _ in 0..3 {
        assert_eq!(engine.tick(&mut frame).unwrap(), TickOutcome::Paused);
    }
    assert_eq!(engine.frame(), 1);

    // Explicit updates still run while paused.
    engine.update().unwrap();
    assert_eq!(engine.frame(), 2);

    engine.set_paused(false);
    assert_eq!(engine.tick(&mut frame).unwrap(), TickOutcome::Advanced);
}

#[test]
fn every_kernel_runs_during_init_and_frame() {
    let mut engine = ready_engine();
    let mut frame = RgbaImage::new(1, 1);
    engine.tick(&mut frame).unwrap();

    let kinds: Vec<KernelKind> = engine.backend().dispatch_log().iter().map(|r| r.kernel).collect();
    assert_eq!(
        kinds,
        vec![
            KernelKind::InitAgents,
            KernelKind::ClearField,
            KernelKind::UpdateField,
            KernelKind::UpdateAgents,
            KernelKind::DepositTrail,
            KernelKind::RenderField,
        ]
    );
}
