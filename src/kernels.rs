//! Compute kernels and their WGSL sources.
//!
//! Six kernels make up a run:
//!
//! | Kernel | Work unit | Bindings (after params) |
//! |--------|-----------|-------------------------|
//! | `init_agents` | agent | agents (rw) |
//! | `clear_field` | cell | trail (rw) |
//! | `update_field` | cell | trail_in (read), trail_out (rw) |
//! | `update_agents` | agent | agents (rw), trail (read) |
//! | `deposit_trail` | agent | agents (read), trail (atomic rw) |
//! | `render_field` | cell | trail (read), pixels (rw) |
//!
//! The agent pass is `update_agents` followed by `deposit_trail`, so every
//! agent senses the field as it was when the pass began and never sees a
//! deposit made by another agent in the same frame.
//!
//! Binding 0 is always the [`SimParams`] uniform block. Every kernel uses a
//! 2D dispatch grid so counts above the per-dimension workgroup limit still
//! fit (see [`dispatch_grid`](crate::layout::dispatch_grid)).

use crate::agent::Agent;
use crate::layout::WORKGROUP_SIZE;
use crate::params::SimParams;
use crate::GpuStruct;

/// How a kernel accesses one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Uniform,
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    InitAgents,
    ClearField,
    UpdateField,
    UpdateAgents,
    DepositTrail,
    RenderField,
}

impl KernelKind {
    pub const ALL: [KernelKind; 6] = [
        KernelKind::InitAgents,
        KernelKind::ClearField,
        KernelKind::UpdateField,
        KernelKind::UpdateAgents,
        KernelKind::DepositTrail,
        KernelKind::RenderField,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            KernelKind::InitAgents => "init_agents",
            KernelKind::ClearField => "clear_field",
            KernelKind::UpdateField => "update_field",
            KernelKind::UpdateAgents => "update_agents",
            KernelKind::DepositTrail => "deposit_trail",
            KernelKind::RenderField => "render_field",
        }
    }

    /// Binding layout, binding 0 first.
    pub fn bindings(self) -> &'static [Access] {
        use Access::*;
        match self {
            KernelKind::InitAgents => &[Uniform, ReadWrite],
            KernelKind::ClearField => &[Uniform, ReadWrite],
            KernelKind::UpdateField => &[Uniform, ReadOnly, ReadWrite],
            KernelKind::UpdateAgents => &[Uniform, ReadWrite, ReadOnly],
            KernelKind::DepositTrail => &[Uniform, ReadOnly, ReadWrite],
            KernelKind::RenderField => &[Uniform, ReadOnly, ReadWrite],
        }
    }

    /// Whether one work unit is one agent (otherwise one cell).
    pub fn per_agent(self) -> bool {
        matches!(
            self,
            KernelKind::InitAgents | KernelKind::UpdateAgents | KernelKind::DepositTrail
        )
    }

    /// Number of work units this kernel needs for `params`.
    pub fn work_units(self, params: &SimParams) -> u32 {
        if self.per_agent() {
            params.n_agents
        } else {
            params.cell_count()
        }
    }
}

/// Everything a backend needs to build a kernel.
#[derive(Clone, Debug)]
pub struct KernelSource {
    pub kind: KernelKind,
    pub label: &'static str,
    pub entry_point: &'static str,
    pub workgroup_size: u32,
    pub bindings: &'static [Access],
    pub wgsl: String,
}

impl KernelSource {
    pub fn new(kind: KernelKind) -> Self {
        let body = match kind {
            KernelKind::InitAgents => INIT_AGENTS,
            KernelKind::ClearField => CLEAR_FIELD,
            KernelKind::UpdateField => UPDATE_FIELD,
            KernelKind::UpdateAgents => UPDATE_AGENTS,
            KernelKind::DepositTrail => DEPOSIT_TRAIL,
            KernelKind::RenderField => RENDER_FIELD,
        };
        Self {
            kind,
            label: kind.entry_point(),
            entry_point: kind.entry_point(),
            workgroup_size: WORKGROUP_SIZE,
            bindings: kind.bindings(),
            wgsl: generate_wgsl(body),
        }
    }

    /// Sources for every kernel, in init-then-frame order.
    pub fn all() -> Vec<KernelSource> {
        KernelKind::ALL.iter().map(|&k| KernelSource::new(k)).collect()
    }
}

fn generate_wgsl(body: &str) -> String {
    let params_struct = SimParams::WGSL_STRUCT;
    let agent_struct = Agent::WGSL_STRUCT;
    let body = body.replace("WORKGROUP_SIZE_LITERAL", &WORKGROUP_SIZE.to_string());

    format!(
        r#"{params_struct}
{agent_struct}
const WORKGROUP_SIZE: u32 = {WORKGROUP_SIZE}u;
const TAU: f32 = 6.2831855;

@group(0) @binding(0)
var<uniform> params: SimParams;

fn work_index(gid: vec3<u32>, groups: vec3<u32>) -> u32 {{
    return gid.x + gid.y * groups.x * WORKGROUP_SIZE;
}}

fn hash(v: u32) -> u32 {{
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}}

fn unit_float(h: u32) -> f32 {{
    return f32(h >> 8u) / 16777216.0;
}}

fn wrap(v: f32, extent: f32) -> f32 {{
    var r = v - floor(v / extent) * extent;
    if (r >= extent || r < 0.0) {{
        r = 0.0;
    }}
    return r;
}}

fn wrap_position(p: vec2<f32>) -> vec2<f32> {{
    return vec2<f32>(wrap(p.x, f32(params.width)), wrap(p.y, f32(params.height)));
}}

fn cell_index(p: vec2<f32>) -> u32 {{
    let x = min(u32(p.x), params.width - 1u);
    let y = min(u32(p.y), params.height - 1u);
    return y * params.width + x;
}}
{body}"#
    )
}

const INIT_AGENTS: &str = r#"
@group(0) @binding(1)
var<storage, read_write> agents: array<Agent>;

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn init_agents(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    if (i >= params.n_agents) {
        return;
    }

    let h0 = hash(i ^ hash(params.seed));
    let h1 = hash(h0);
    let h2 = hash(h1);
    let pos = vec2<f32>(
        unit_float(h0) * f32(params.width),
        unit_float(h1) * f32(params.height),
    );

    var agent: Agent;
    agent.position = wrap_position(pos);
    agent.heading = wrap(unit_float(h2) * TAU, TAU);
    agent._pad_0 = 0u;
    agents[i] = agent;
}
"#;

const CLEAR_FIELD: &str = r#"
@group(0) @binding(1)
var<storage, read_write> trail: array<f32>;

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn clear_field(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    if (i >= params.width * params.height) {
        return;
    }
    trail[i] = 0.0;
}
"#;

const UPDATE_FIELD: &str = r#"
@group(0) @binding(1)
var<storage, read> trail_in: array<f32>;

@group(0) @binding(2)
var<storage, read_write> trail_out: array<f32>;

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn update_field(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    let w = params.width;
    let h = params.height;
    if (i >= w * h) {
        return;
    }

    let x = i % w;
    let y = i / w;
    let v = trail_in[i];

    var aggregate = v;
    if (params.diffusion > 0.0) {
        var sum = 0.0;
        for (var dy = 0u; dy < 3u; dy++) {
            let row = ((y + h - 1u + dy) % h) * w;
            for (var dx = 0u; dx < 3u; dx++) {
                sum += trail_in[row + (x + w - 1u + dx) % w];
            }
        }
        aggregate = (1.0 - params.diffusion) * v + params.diffusion * (sum / 9.0);
    }

    trail_out[i] = max(params.decay * aggregate, 0.0);
}
"#;

const UPDATE_AGENTS: &str = r#"
@group(0) @binding(1)
var<storage, read_write> agents: array<Agent>;

@group(0) @binding(2)
var<storage, read> trail: array<f32>;

fn sensor(pos: vec2<f32>, angle: f32) -> f32 {
    let p = wrap_position(pos + vec2<f32>(cos(angle), sin(angle)) * params.sensory_offset);
    return trail[cell_index(p)];
}

fn tie_breaker(index: u32) -> u32 {
    return hash(hash(params.seed ^ (params.frame * 0x9E3779B9u)) ^ index);
}

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn update_agents(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    if (i >= params.n_agents) {
        return;
    }

    var agent = agents[i];
    let pos = agent.position;

    let forward = sensor(pos, agent.heading);
    let left = sensor(pos, agent.heading + params.sensory_angle);
    let right = sensor(pos, agent.heading - params.sensory_angle);

    let turn = min(params.turn_rate, params.sensory_angle);
    var direction = 0.0;
    if (left > forward || right > forward) {
        if (left > right) {
            direction = 1.0;
        } else if (right > left) {
            direction = -1.0;
        } else if ((tie_breaker(i) & 1u) == 0u) {
            direction = 1.0;
        } else {
            direction = -1.0;
        }
    }

    let heading = wrap(agent.heading + direction * turn, TAU);
    agent.position = wrap_position(pos + vec2<f32>(cos(heading), sin(heading)) * params.step_size);
    agent.heading = heading;
    agents[i] = agent;
}
"#;

const DEPOSIT_TRAIL: &str = r#"
@group(0) @binding(1)
var<storage, read> agents: array<Agent>;

// f32 bit patterns; the CAS loop makes concurrent deposits into one cell add up.
@group(0) @binding(2)
var<storage, read_write> trail: array<atomic<u32>>;

fn deposit(i: u32, amount: f32) {
    var old = atomicLoad(&trail[i]);
    loop {
        let updated = bitcast<u32>(bitcast<f32>(old) + amount);
        let result = atomicCompareExchangeWeak(&trail[i], old, updated);
        if (result.exchanged) {
            break;
        }
        old = result.old_value;
    }
}

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn deposit_trail(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    if (i >= params.n_agents) {
        return;
    }
    deposit(cell_index(agents[i].position), params.deposition);
}
"#;

const RENDER_FIELD: &str = r#"
@group(0) @binding(1)
var<storage, read> trail: array<f32>;

@group(0) @binding(2)
var<storage, read_write> pixels: array<u32>;

fn tone_map(v: f32) -> f32 {
    let x = max(v * params.exposure, 0.0);
    if (params.tone_map == 1u) {
        return x / (1.0 + x);
    }
    return min(x, 1.0);
}

@compute @workgroup_size(WORKGROUP_SIZE_LITERAL)
fn render_field(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = work_index(gid, groups);
    if (i >= params.width * params.height) {
        return;
    }
    let t = tone_map(trail[i]);
    pixels[i] = pack4x8unorm(vec4<f32>(params.color.rgb * t, 1.0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kernel_declares_its_entry_point() {
        for source in KernelSource::all() {
            assert!(
                source.wgsl.contains(&format!("fn {}(", source.entry_point)),
                "{} missing entry point",
                source.label
            );
            assert!(source.wgsl.contains("@workgroup_size(64)"));
            assert!(!source.wgsl.contains("WORKGROUP_SIZE_LITERAL"));
        }
    }

    #[test]
    fn test_bindings_start_with_uniform() {
        for kind in KernelKind::ALL {
            assert_eq!(kind.bindings()[0], Access::Uniform);
            let declared = KernelSource::new(kind).wgsl.matches("@binding(").count();
            assert_eq!(declared, kind.bindings().len(), "{:?}", kind);
        }
    }

    #[test]
    fn test_work_units() {
        let config = crate::Config::default().with_size(64, 32).with_agents(1000);
        let params = SimParams::from_config(&config, 0, 0, 0.0);
        assert_eq!(KernelKind::InitAgents.work_units(&params), 1000);
        assert_eq!(KernelKind::UpdateAgents.work_units(&params), 1000);
        assert_eq!(KernelKind::DepositTrail.work_units(&params), 1000);
        assert_eq!(KernelKind::UpdateField.work_units(&params), 2048);
        assert_eq!(KernelKind::RenderField.work_units(&params), 2048);
    }
}
