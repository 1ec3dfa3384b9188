//! Full-screen blit of the packed pixel buffer onto a window surface.
//!
//! The render kernel leaves one RGBA8 word per cell in a storage buffer. A
//! single oversized triangle covers the viewport and the fragment stage
//! looks up the cell under each fragment, so the field is stretched to the
//! window without an intermediate texture.

use bytemuck::{Pod, Zeroable};

/// Vertex + fragment source for the blit pipeline.
pub const BLIT_WGSL: &str = r#"
struct BlitParams {
    grid: vec2<u32>,
    viewport: vec2<u32>,
};

@group(0) @binding(0) var<uniform> blit: BlitParams;
@group(0) @binding(1) var<storage, read> pixels: array<u32>;

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    let x = f32((vi << 1u) & 2u) * 2.0 - 1.0;
    let y = f32(vi & 2u) * 2.0 - 1.0;
    return vec4<f32>(x, y, 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let uv = frag.xy / vec2<f32>(max(blit.viewport, vec2<u32>(1u)));
    let cell = min(vec2<u32>(uv * vec2<f32>(blit.grid)), blit.grid - vec2<u32>(1u));
    return unpack4x8unorm(pixels[cell.y * blit.grid.x + cell.x]);
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BlitParams {
    grid: [u32; 2],
    viewport: [u32; 2],
}

/// One cached value, rebuilt only when its key changes.
#[derive(Debug)]
pub(crate) struct KeyedCache<K, V> {
    entry: Option<(K, V)>,
}

impl<K: PartialEq, V> KeyedCache<K, V> {
    pub(crate) fn new() -> Self {
        Self { entry: None }
    }

    pub(crate) fn get_or_insert_with(&mut self, key: K, build: impl FnOnce() -> V) -> &V {
        match self.entry.take() {
            Some((k, value)) if k == key => &self.entry.insert((k, value)).1,
            _ => &self.entry.insert((key, build())).1,
        }
    }
}

pub(crate) struct Blit {
    pipeline: wgpu::RenderPipeline,
    params: wgpu::Buffer,
    /// Bind group for the pixel buffer drawn last; the engine keeps one
    /// pixel buffer per allocation.
    bind_group: KeyedCache<wgpu::Buffer, wgpu::BindGroup>,
}

impl Blit {
    pub(crate) fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_WGSL.into()),
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: None,
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blit Params"),
            size: std::mem::size_of::<BlitParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            pipeline,
            params,
            bind_group: KeyedCache::new(),
        }
    }

    /// Record a draw of `pixels` (a `grid`-sized word array) into `view`.
    pub(crate) fn draw(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        pixels: &wgpu::Buffer,
        grid: (u32, u32),
        viewport: (u32, u32),
    ) {
        let params = BlitParams {
            grid: [grid.0, grid.1],
            viewport: [viewport.0, viewport.1],
        };
        queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));

        let (pipeline, uniform) = (&self.pipeline, &self.params);
        let bind_group = self.bind_group.get_or_insert_with(pixels.clone(), || {
            log::debug!("building blit bind group");
            let layout = pipeline.get_bind_group_layout(0);
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Blit Bind Group"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: uniform.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: pixels.as_entire_binding() },
                ],
            })
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Blit Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cache_builds_once_per_key() {
        let builds = Cell::new(0);
        let mut cache = KeyedCache::new();
        let mut get = |key: u32| {
            *cache.get_or_insert_with(key, || {
                builds.set(builds.get() + 1);
                key * 10
            })
        };

        assert_eq!(get(1), 10);
        assert_eq!(get(1), 10);
        assert_eq!(get(1), 10);
        assert_eq!(builds.get(), 1);

        // A reallocated pixel buffer gets a fresh bind group.
        assert_eq!(get(2), 20);
        assert_eq!(builds.get(), 2);
        assert_eq!(get(2), 20);
        assert_eq!(builds.get(), 2);
    }
}
