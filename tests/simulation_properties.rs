//! Behavioural properties of the simulation, checked on the CPU backend.

use std::sync::Arc;

use image::RgbaImage;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use slime::agent::{cell_index, Agent};
use slime::backend::{BufferUsage, ComputeBackend, CpuBackend, CpuBuffer, KernelKind, KernelSource};
use slime::layout::{shade_cell, unpack_rgba8};
use slime::params::{SimParams, UniformBlock};
use slime::prelude::*;
use slime::Vec2;

fn backend() -> CpuBackend {
    CpuBackend::with_threads(4).unwrap()
}

fn engine(config: Config, seed: u32) -> Engine<CpuBackend> {
    let mut engine = Engine::new(backend(), config)
        .with_seed(seed)
        .with_clock(Clock::fixed(1.0 / 60.0));
    engine.init().unwrap();
    engine
}

fn bits(agents: &[Agent]) -> Vec<[u32; 3]> {
    agents
        .iter()
        .map(|a| [a.position[0].to_bits(), a.position[1].to_bits(), a.heading.to_bits()])
        .collect()
}

/// Runs single kernels against hand-built buffers.
struct Bench {
    backend: CpuBackend,
    params: <CpuBackend as ComputeBackend>::Buffer,
}

impl Bench {
    fn new(params: &SimParams) -> Self {
        let mut backend = backend();
        let block = UniformBlock::new(params, 256);
        let buf = backend
            .allocate_buffer("params", block.len(), BufferUsage::Uniform)
            .unwrap();
        backend.write_buffer(&buf, 0, block.as_bytes()).unwrap();
        Self { backend, params: buf }
    }

    fn storage(&mut self, label: &str, bytes: &[u8]) -> Arc<CpuBuffer> {
        let buf = self
            .backend
            .allocate_buffer(label, bytes.len() as u64, BufferUsage::Storage)
            .unwrap();
        self.backend.write_buffer(&buf, 0, bytes).unwrap();
        buf
    }

    fn run(&mut self, kind: KernelKind, buffers: &[&Arc<CpuBuffer>], units: u32) {
        let kernel = self.backend.compile_kernel(&KernelSource::new(kind)).unwrap();
        let mut all = vec![&self.params];
        all.extend_from_slice(buffers);
        let bindings = self.backend.create_bindings(&kernel, &all).unwrap();
        self.backend.dispatch(&kernel, &bindings, units).unwrap();
        self.backend.submit().unwrap();
    }

    fn read_f32(&mut self, buf: &Arc<CpuBuffer>) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(&self.backend.read_buffer(buf).unwrap())
    }
}

#[test]
fn initial_agents_are_bit_identical_for_equal_seeds() {
    let config = Config::default().with_size(128, 96).with_agents(5000);
    let mut a = engine(config.clone(), 1234);
    let mut b = engine(config.clone(), 1234);
    let mut c = engine(config, 1235);

    let first = bits(&a.read_agents().unwrap());
    assert_eq!(first, bits(&b.read_agents().unwrap()));
    assert_ne!(first, bits(&c.read_agents().unwrap()));
}

#[test]
fn runs_are_reproducible_across_thread_counts() {
    let config = Config::default().with_size(64, 64).with_agents(2000);
    let mut a = Engine::new(CpuBackend::with_threads(1).unwrap(), config.clone())
        .with_seed(9)
        .with_clock(Clock::fixed(0.0));
    let mut b = Engine::new(CpuBackend::with_threads(8).unwrap(), config)
        .with_seed(9)
        .with_clock(Clock::fixed(0.0));
    a.init().unwrap();
    b.init().unwrap();
    for _ in 0..10 {
        a.update().unwrap();
        b.update().unwrap();
    }
    assert_eq!(bits(&a.read_agents().unwrap()), bits(&b.read_agents().unwrap()));
    assert_eq!(a.read_field().unwrap(), b.read_field().unwrap());
}

#[test]
fn field_never_goes_negative() {
    let config = Config::default()
        .with_size(48, 48)
        .with_agents(3000)
        .with_decay(0.9)
        .with_deposition(0.3);
    let mut engine = engine(config, 5);
    for _ in 0..25 {
        engine.update().unwrap();
        assert!(engine.read_field().unwrap().iter().all(|&v| v >= 0.0));
    }
}

#[test]
fn agents_stay_inside_the_grid() {
    let config = Config::default()
        .with_size(40, 30)
        .with_agents(4000)
        .with_step_size(5.0);
    let mut engine = engine(config, 77);
    for _ in 0..20 {
        engine.update().unwrap();
    }
    for agent in engine.read_agents().unwrap() {
        assert!((0.0..40.0).contains(&agent.position[0]));
        assert!((0.0..30.0).contains(&agent.position[1]));
        assert!((0.0..std::f32::consts::TAU).contains(&agent.heading));
    }
}

#[test]
fn field_pass_without_deposits_scales_by_decay() {
    let config = Config::default().with_size(16, 16).with_decay(0.5).with_diffusion(0.0);
    let params = SimParams::from_config(&config, 0, 0, 0.0);
    let mut bench = Bench::new(&params);

    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let values: Vec<f32> = (0..256).map(|_| rng.gen_range(0.0..100.0)).collect();
    let a = bench.storage("a", bytemuck::cast_slice(&values));
    let b = bench.storage("b", &[0; 1024]);

    bench.run(KernelKind::UpdateField, &[&a, &b], 256);
    let once = bench.read_f32(&b);
    bench.run(KernelKind::UpdateField, &[&b, &a], 256);
    let twice = bench.read_f32(&a);

    for i in 0..256 {
        assert_eq!(once[i], values[i] * 0.5);
        assert_eq!(twice[i], values[i] * 0.25);
    }
}

#[test]
fn field_pass_with_unit_decay_is_invariant() {
    let config = Config::default().with_size(16, 16).with_decay(1.0).with_diffusion(0.0);
    let params = SimParams::from_config(&config, 0, 0, 0.0);
    let mut bench = Bench::new(&params);

    let values: Vec<f32> = (0..256).map(|i| (i % 17) as f32 * 0.75).collect();
    let a = bench.storage("a", bytemuck::cast_slice(&values));
    let b = bench.storage("b", &[0; 1024]);
    for _ in 0..5 {
        bench.run(KernelKind::UpdateField, &[&a, &b], 256);
        bench.run(KernelKind::UpdateField, &[&b, &a], 256);
    }
    assert_eq!(bench.read_f32(&a), values);
}

#[test]
fn deposits_into_one_cell_add_up() {
    let config = Config::default().with_size(16, 16).with_agents(3).with_deposition(0.25);
    let params = SimParams::from_config(&config, 0, 0, 0.0);
    let mut bench = Bench::new(&params);

    let agents = [
        Agent::new(Vec2::new(4.2, 7.9), 0.0),
        Agent::new(Vec2::new(4.8, 7.1), 1.0),
        Agent::new(Vec2::new(4.5, 7.5), 2.0),
    ];
    let agent_buf = bench.storage("agents", bytemuck::cast_slice(&agents));
    let field = bench.storage("field", &[0; 1024]);
    bench.run(KernelKind::DepositTrail, &[&agent_buf, &field], 3);

    let values = bench.read_f32(&field);
    let cell = cell_index(Vec2::new(4.5, 7.5), 16, 16);
    assert_eq!(values[cell], 0.75);
    assert_eq!(values.iter().sum::<f32>(), 0.75);
}

#[test]
fn many_agents_on_one_cell_are_all_counted() {
    let config = Config::default().with_size(16, 16).with_agents(10_000).with_deposition(1.0);
    let params = SimParams::from_config(&config, 0, 0, 0.0);
    let mut bench = Bench::new(&params);

    let agents = vec![Agent::new(Vec2::new(8.5, 8.5), 0.0); 10_000];
    let agent_buf = bench.storage("agents", bytemuck::cast_slice(&agents));
    let field = bench.storage("field", &[0; 1024]);
    bench.run(KernelKind::DepositTrail, &[&agent_buf, &field], 10_000);

    assert_eq!(bench.read_f32(&field)[8 * 16 + 8], 10_000.0);
}

#[test]
fn single_step_scenario_marks_only_visited_cells() {
    let config = Config::default()
        .with_agents(1000)
        .with_size(64, 64)
        .with_decay(0.7)
        .with_deposition(1.0);
    let mut engine = engine(config.clone(), 42);
    engine.update().unwrap();

    let mut frame = RgbaImage::new(1, 1);
    engine.render(&mut frame).unwrap();
    assert_eq!(frame.dimensions(), (64, 64));

    let mut visits = vec![0u32; 64 * 64];
    for agent in engine.read_agents().unwrap() {
        visits[cell_index(agent.pos(), 64, 64)] += 1;
    }
    let field = engine.read_field().unwrap();
    for (i, (&count, &value)) in visits.iter().zip(&field).enumerate() {
        assert_eq!(value, count as f32 * config.deposition, "cell {}", i);
    }

    let lit = unpack_rgba8(shade_cell(1.0, config.color.0, ToneMap::Linear, 1.0));
    for (i, px) in frame.pixels().enumerate() {
        if visits[i] > 0 {
            assert_eq!(px.0, lit, "visited cell {}", i);
        } else {
            assert_eq!(px.0, [0, 0, 0, 255], "empty cell {}", i);
        }
    }
    assert_eq!(visits.iter().sum::<u32>(), 1000);
}

#[test]
fn trail_persists_and_fades_between_frames() {
    let config = Config::default()
        .with_agents(1000)
        .with_size(64, 64)
        .with_decay(0.5)
        .with_diffusion(0.0)
        .with_deposition(1.0);
    let mut engine = engine(config, 11);
    engine.update().unwrap();
    let total_one: f32 = engine.read_field().unwrap().iter().sum();
    engine.update().unwrap();
    let total_two: f32 = engine.read_field().unwrap().iter().sum();

    assert_eq!(total_one, 1000.0);
    assert_eq!(total_two, 1000.0 * 0.5 + 1000.0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_seeded_agents_fill_the_grid(seed in any::<u32>(), w in 16u32..200, h in 16u32..200) {
        let config = Config::default().with_size(w, h).with_agents(1000);
        let mut engine = engine(config, seed);
        for agent in engine.read_agents().unwrap() {
            prop_assert!(agent.position[0] >= 0.0 && agent.position[0] < w as f32);
            prop_assert!(agent.position[1] >= 0.0 && agent.position[1] < h as f32);
        }
    }
}
