//! The per-frame uniform parameter block.
//!
//! Every kernel binds the same block at binding 0. It packs the live subset
//! of [`Config`] plus the frame counter, a timestamp and the seed. The byte
//! image uploaded to the backend is padded to the backend's uniform
//! alignment so the block length is always a multiple of it.

use bytemuck::{Pod, Zeroable};

use crate::config::Config;
use crate::layout::pad_to_alignment;
use crate::GpuStruct;

/// Uniform data shared by all kernels.
///
/// Layout (80 bytes): fifteen 4-byte scalars, one pad word, then the tint as
/// a `vec4<f32>` on a 16-byte boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable, GpuStruct)]
pub struct SimParams {
    pub width: u32,
    pub height: u32,
    pub n_agents: u32,
    pub frame: u32,
    /// Seconds since init.
    pub time: f32,
    pub seed: u32,
    pub sensory_angle: f32,
    pub sensory_offset: f32,
    pub decay: f32,
    pub diffusion: f32,
    pub turn_rate: f32,
    pub deposition: f32,
    pub step_size: f32,
    pub tone_map: u32,
    pub exposure: f32,
    pub _pad: [u32; 1],
    /// RGB tint, alpha unused.
    pub color: [f32; 4],
}

impl SimParams {
    /// Pack a sanitized config with the frame bookkeeping.
    pub fn from_config(config: &Config, seed: u32, frame: u32, time: f32) -> Self {
        let [r, g, b] = config.color.0;
        Self {
            width: config.width(),
            height: config.height(),
            n_agents: config.n_agents,
            frame,
            time,
            seed,
            sensory_angle: config.sensory_angle,
            sensory_offset: config.sensory_offset,
            decay: config.decay,
            diffusion: config.diffusion,
            turn_rate: config.turn_rate,
            deposition: config.deposition,
            step_size: config.step_size,
            tone_map: config.tone_map.gpu_id(),
            exposure: config.exposure,
            _pad: [0],
            color: [r, g, b, 1.0],
        }
    }

    pub fn cell_count(&self) -> u32 {
        self.width * self.height
    }

    /// Decode a block previously produced by [`UniformBlock`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..std::mem::size_of::<Self>())?;
        Some(bytemuck::pod_read_unaligned(raw))
    }
}

/// A [`SimParams`] byte image padded to the backend's uniform alignment.
#[derive(Clone, Debug)]
pub struct UniformBlock {
    bytes: Vec<u8>,
    alignment: u64,
}

impl UniformBlock {
    pub fn new(params: &SimParams, alignment: u64) -> Self {
        Self {
            bytes: pad_to_alignment(bytemuck::bytes_of(params), alignment),
            alignment,
        }
    }

    /// Size of a block for this alignment, used to allocate the buffer once.
    pub fn size_for(alignment: u64) -> u64 {
        crate::layout::align_to(std::mem::size_of::<SimParams>() as u64, alignment)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}
