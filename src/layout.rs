//! Numeric layout helpers shared by the engine and every backend.
//!
//! - Alignment padding for uniform blocks
//! - Dispatch sizing (work units → workgroup grid)
//! - Color packing and tone mapping for the render pass

use crate::config::ToneMap;

/// Threads per workgroup for every kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// Maximum workgroups along one dispatch dimension (WebGPU default limit).
pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

/// Round `len` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero.
pub fn align_to(len: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    len.div_ceil(alignment) * alignment
}

/// Copy `bytes` into a zero-padded block whose length is a multiple of `alignment`.
///
/// An empty input still produces one full block, because a zero-sized
/// uniform binding is invalid.
pub fn pad_to_alignment(bytes: &[u8], alignment: u64) -> Vec<u8> {
    let len = align_to(bytes.len().max(1) as u64, alignment) as usize;
    let mut block = vec![0u8; len];
    block[..bytes.len()].copy_from_slice(bytes);
    block
}

/// Workgroup grid for a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DispatchGrid {
    pub x: u32,
    pub y: u32,
}

impl DispatchGrid {
    /// Total workgroups in the grid.
    pub fn workgroups(&self) -> u64 {
        self.x as u64 * self.y as u64
    }

    /// Number of invocations the grid launches.
    pub fn invocations(&self, workgroup_size: u32) -> u64 {
        self.workgroups() * workgroup_size as u64
    }

    /// Flat work-unit index of the invocation at `global_id`.
    ///
    /// Mirrors the index computation in every kernel:
    /// `gid.x + gid.y * num_workgroups.x * WORKGROUP_SIZE`.
    pub fn linear_index(&self, gid_x: u32, gid_y: u32, workgroup_size: u32) -> u64 {
        gid_x as u64 + gid_y as u64 * self.x as u64 * workgroup_size as u64
    }
}

/// Size a dispatch covering `work_units` invocations.
///
/// Grids that would exceed `max_per_dimension` workgroups fold into a
/// second dimension; kernels bounds-check the flat index, so the surplus
/// invocations in the last row exit immediately.
pub fn dispatch_grid(work_units: u32, workgroup_size: u32, max_per_dimension: u32) -> DispatchGrid {
    let groups = work_units.div_ceil(workgroup_size);
    if groups == 0 {
        return DispatchGrid { x: 0, y: 0 };
    }
    if groups <= max_per_dimension {
        return DispatchGrid { x: groups, y: 1 };
    }
    let y = groups.div_ceil(max_per_dimension);
    let x = groups.div_ceil(y);
    DispatchGrid { x, y }
}

/// Map a unit float to a byte, clamping out-of-range values.
pub fn unit_to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Pack RGBA bytes into one little-endian `u32` (`unpack4x8unorm` order).
pub fn pack_rgba8(rgba: [u8; 4]) -> u32 {
    u32::from_le_bytes(rgba)
}

pub fn unpack_rgba8(packed: u32) -> [u8; 4] {
    packed.to_le_bytes()
}

/// Map a field value to a display intensity in `0.0..=1.0`.
pub fn tone_map(value: f32, tone_map: ToneMap, exposure: f32) -> f32 {
    let v = (value * exposure).max(0.0);
    match tone_map {
        ToneMap::Linear => v.min(1.0),
        ToneMap::Reinhard => v / (1.0 + v),
    }
}

/// Shade one cell: `color * intensity` with opaque alpha, packed as RGBA8.
pub fn shade_cell(value: f32, color: [f32; 3], mode: ToneMap, exposure: f32) -> u32 {
    let t = tone_map(value, mode, exposure);
    pack_rgba8([
        unit_to_u8(color[0] * t),
        unit_to_u8(color[1] * t),
        unit_to_u8(color[2] * t),
        255,
    ])
}
