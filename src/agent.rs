//! Agent state and the per-agent update rule.
//!
//! The functions here are the scalar form of the agent kernels. The CPU
//! backend calls them directly; the WGSL in [`kernels`](crate::kernels)
//! performs the same integer hashing and the same float operations in the
//! same order.
//!
//! # Update rule
//!
//! For each agent, per step:
//!
//! 1. Sample the field at three sensors `sensory_offset` cells away: forward
//!    at `heading`, left at `heading + sensory_angle`, right at
//!    `heading - sensory_angle`.
//! 2. Steer: no turn unless a side sensor strictly exceeds the forward one.
//!    Then turn toward the larger side; if both sides are equal, a per-agent
//!    hash of `(seed, frame, index)` picks one. The turn is
//!    `min(turn_rate, sensory_angle)` radians.
//! 3. Move `step_size` along the new heading and wrap toroidally.
//! 4. Deposit into the cell containing the new position (done by the caller,
//!    which owns the shared field).

use std::f32::consts::TAU;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::params::SimParams;
use crate::GpuStruct;

/// One simulated particle. 16 bytes, stored flat in the agent buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct Agent {
    pub position: [f32; 2],
    /// Radians in `[0, 2π)`.
    pub heading: f32,
    pub _pad: [u32; 1],
}

impl Agent {
    pub fn new(position: Vec2, heading: f32) -> Self {
        Self {
            position: position.to_array(),
            heading,
            _pad: [0],
        }
    }

    pub fn pos(&self) -> Vec2 {
        Vec2::from_array(self.position)
    }
}

/// Field samples seen by an agent's three sensors.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Senses {
    pub forward: f32,
    pub left: f32,
    pub right: f32,
}

/// PCG-style integer hash.
pub fn hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Uniform float in `[0, 1)` from the top 24 bits of a hash.
pub fn unit_float(h: u32) -> f32 {
    (h >> 8) as f32 / 16_777_216.0
}

/// Wrap a coordinate into `[0, extent)`.
///
/// `rem_euclid` can round up to exactly `extent` for tiny negative inputs;
/// that case maps to 0.
pub fn wrap(v: f32, extent: f32) -> f32 {
    let r = v.rem_euclid(extent);
    if r >= extent || r < 0.0 {
        0.0
    } else {
        r
    }
}

pub fn wrap_angle(a: f32) -> f32 {
    wrap(a, TAU)
}

pub fn wrap_position(p: Vec2, width: u32, height: u32) -> Vec2 {
    Vec2::new(wrap(p.x, width as f32), wrap(p.y, height as f32))
}

/// Index of the cell containing `p`. `p` must already be wrapped.
pub fn cell_index(p: Vec2, width: u32, height: u32) -> usize {
    let x = (p.x as u32).min(width - 1);
    let y = (p.y as u32).min(height - 1);
    (y * width + x) as usize
}

/// Deterministic initial state of agent `index` for `seed`.
pub fn seed_agent(index: u32, seed: u32, width: u32, height: u32) -> Agent {
    let h0 = hash(index ^ hash(seed));
    let h1 = hash(h0);
    let h2 = hash(h1);
    let position = Vec2::new(
        unit_float(h0) * width as f32,
        unit_float(h1) * height as f32,
    );
    Agent::new(
        wrap_position(position, width, height),
        wrap_angle(unit_float(h2) * TAU),
    )
}

/// Per-frame tie-break bits for agent `index`.
pub fn tie_breaker(seed: u32, frame: u32, index: u32) -> u32 {
    hash(hash(seed ^ frame.wrapping_mul(0x9E37_79B9)) ^ index)
}

fn sensor_position(pos: Vec2, angle: f32, offset: f32, width: u32, height: u32) -> Vec2 {
    wrap_position(pos + Vec2::new(angle.cos(), angle.sin()) * offset, width, height)
}

/// Sample the three sensors through `read`, which returns a cell value.
pub fn sense(agent: &Agent, params: &SimParams, read: impl Fn(usize) -> f32) -> Senses {
    let (w, h) = (params.width, params.height);
    let pos = agent.pos();
    let sample = |angle: f32| {
        read(cell_index(
            sensor_position(pos, angle, params.sensory_offset, w, h),
            w,
            h,
        ))
    };

    Senses {
        forward: sample(agent.heading),
        left: sample(agent.heading + params.sensory_angle),
        right: sample(agent.heading - params.sensory_angle),
    }
}

/// New heading after reacting to `senses`.
pub fn steer(heading: f32, senses: Senses, turn_rate: f32, sensory_angle: f32, tie: u32) -> f32 {
    let turn = turn_rate.min(sensory_angle);
    let Senses { forward, left, right } = senses;

    let direction = if left > forward || right > forward {
        if left > right {
            1.0
        } else if right > left {
            -1.0
        } else if tie & 1 == 0 {
            1.0
        } else {
            -1.0
        }
    } else {
        0.0
    };

    wrap_angle(heading + direction * turn)
}

/// Advance `pos` by `step` along `heading`, wrapping at the edges.
pub fn advance(pos: Vec2, heading: f32, step: f32, width: u32, height: u32) -> Vec2 {
    wrap_position(
        pos + Vec2::new(heading.cos(), heading.sin()) * step,
        width,
        height,
    )
}

/// Run steps 1-3 of the update rule for one agent.
///
/// Returns the moved agent and the cell it should deposit into.
pub fn update_agent(
    agent: &Agent,
    index: u32,
    params: &SimParams,
    read: impl Fn(usize) -> f32,
) -> (Agent, usize) {
    let senses = sense(agent, params, read);
    let heading = steer(
        agent.heading,
        senses,
        params.turn_rate,
        params.sensory_angle,
        tie_breaker(params.seed, params.frame, index),
    );
    let pos = advance(agent.pos(), heading, params.step_size, params.width, params.height);
    let cell = cell_index(pos, params.width, params.height);
    (Agent::new(pos, heading), cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use proptest::prelude::*;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    fn params(width: u32, height: u32) -> SimParams {
        SimParams::from_config(&Config::default().with_size(width, height), 1, 0, 0.0)
    }

    #[test]
    fn test_agent_layout() {
        assert_eq!(std::mem::size_of::<Agent>(), 16);
        assert_eq!(Agent::WGSL_SIZE, 16);
        assert!(Agent::WGSL_STRUCT.contains("position: vec2<f32>,"));
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash(0), hash(0));
        assert_ne!(hash(0), hash(1));
        assert_ne!(hash(1), hash(2));
    }

    #[test]
    fn test_unit_float_range() {
        assert_eq!(unit_float(0), 0.0);
        assert!(unit_float(u32::MAX) < 1.0);
    }

    #[test]
    fn test_wrap_edges() {
        assert_eq!(wrap(0.0, 64.0), 0.0);
        assert_eq!(wrap(64.0, 64.0), 0.0);
        assert_eq!(wrap(65.5, 64.0), 1.5);
        assert_eq!(wrap(-1.0, 64.0), 63.0);
        // Would round up to the extent without the guard.
        let w = wrap(-1e-9, 64.0);
        assert!((0.0..64.0).contains(&w));
    }

    #[test]
    fn test_cell_index() {
        assert_eq!(cell_index(Vec2::new(0.2, 0.7), 64, 64), 0);
        assert_eq!(cell_index(Vec2::new(3.9, 2.0), 64, 64), 2 * 64 + 3);
        assert_eq!(cell_index(Vec2::new(63.99, 63.99), 64, 64), 64 * 64 - 1);
    }

    #[test]
    fn test_seed_agent_is_deterministic_and_in_bounds() {
        for i in 0..1000 {
            let a = seed_agent(i, 42, 64, 48);
            assert_eq!(a, seed_agent(i, 42, 64, 48));
            assert!((0.0..64.0).contains(&a.position[0]));
            assert!((0.0..48.0).contains(&a.position[1]));
            assert!((0.0..TAU).contains(&a.heading));
        }
        assert_ne!(seed_agent(0, 42, 64, 48), seed_agent(0, 43, 64, 48));
    }

    #[test]
    fn test_steer_prefers_forward_on_ties() {
        let flat = Senses { forward: 1.0, left: 1.0, right: 1.0 };
        assert_eq!(steer(1.0, flat, FRAC_PI_4, FRAC_PI_4, 0), 1.0);

        let forward_best = Senses { forward: 2.0, left: 1.0, right: 1.5 };
        assert_eq!(steer(1.0, forward_best, FRAC_PI_4, FRAC_PI_4, 0), 1.0);
    }

    #[test]
    fn test_steer_turns_toward_stronger_side() {
        let left = Senses { forward: 0.0, left: 1.0, right: 0.5 };
        assert!((steer(1.0, left, 0.25, FRAC_PI_4, 0) - 1.25).abs() < 1e-6);

        let right = Senses { forward: 0.0, left: 0.5, right: 1.0 };
        assert!((steer(1.0, right, 0.25, FRAC_PI_4, 0) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_steer_equal_sides_uses_tie_breaker() {
        let sides = Senses { forward: 0.0, left: 1.0, right: 1.0 };
        assert!((steer(1.0, sides, 0.25, FRAC_PI_4, 0) - 1.25).abs() < 1e-6);
        assert!((steer(1.0, sides, 0.25, FRAC_PI_4, 1) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_turn_is_capped_by_sensory_angle() {
        let left = Senses { forward: 0.0, left: 1.0, right: 0.0 };
        let h = steer(0.0, left, FRAC_PI_2, PI / 8.0, 0);
        assert!((h - PI / 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_sense_reads_sensor_cells() {
        let p = params(64, 64);
        // Heading +x, offset 5: forward sensor at (15, 10).
        let agent = Agent::new(Vec2::new(10.5, 10.5), 0.0);
        let target = cell_index(Vec2::new(15.5, 10.5), 64, 64);
        let senses = sense(&agent, &p, |i| if i == target { 3.0 } else { 0.0 });
        assert_eq!(senses.forward, 3.0);
        assert_eq!(senses.left, 0.0);
        assert_eq!(senses.right, 0.0);
    }

    #[test]
    fn test_update_agent_wraps_across_edge() {
        let mut p = params(64, 64);
        p.step_size = 2.0;
        let agent = Agent::new(Vec2::new(63.5, 5.5), 0.0);
        let (moved, cell) = update_agent(&agent, 0, &p, |_| 0.0);
        assert!((moved.position[0] - 1.5).abs() < 1e-4);
        assert_eq!(cell, cell_index(moved.pos(), 64, 64));
    }

    proptest! {
        #[test]
        fn prop_advance_stays_in_bounds(
            x in 0.0f32..400.0,
            y in 0.0f32..300.0,
            heading in -10.0f32..10.0,
            step in 0.0f32..1000.0,
        ) {
            let p = advance(Vec2::new(x, y), heading, step, 400, 300);
            prop_assert!(p.x >= 0.0 && p.x < 400.0);
            prop_assert!(p.y >= 0.0 && p.y < 300.0);
            prop_assert!(cell_index(p, 400, 300) < 400 * 300);
        }

        #[test]
        fn prop_wrap_in_range(v in -1.0e6f32..1.0e6, extent in 1u32..5000) {
            let w = wrap(v, extent as f32);
            prop_assert!(w >= 0.0 && w < extent as f32);
        }

        #[test]
        fn prop_steer_turns_at_most_turn_rate(
            heading in 0.0f32..TAU,
            f in 0.0f32..10.0,
            l in 0.0f32..10.0,
            r in 0.0f32..10.0,
            turn in 0.1f32..1.5,
            tie in any::<u32>(),
        ) {
            let senses = Senses { forward: f, left: l, right: r };
            let h = steer(heading, senses, turn, FRAC_PI_2, tie);
            let delta = (h - heading).rem_euclid(TAU);
            let delta = delta.min(TAU - delta);
            prop_assert!(delta <= turn + 1e-4);
            if f >= l && f >= r {
                prop_assert_eq!(h, wrap_angle(heading));
            }
        }
    }
}
