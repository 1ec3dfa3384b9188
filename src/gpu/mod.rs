//! WebGPU implementation of [`ComputeBackend`].
//!
//! Each kernel becomes one compute pipeline with an auto-derived layout.
//! Dispatches are recorded into a single command encoder, one compute pass
//! per dispatch, and handed to the queue on [`submit`](ComputeBackend::submit).
//! Host writes go through `Queue::write_buffer`, which the queue orders ahead
//! of the next submitted command buffer.
//!
//! The backend runs either headless (frames are read back into an
//! [`RgbaImage`]) or attached to a window (frames are blitted to its
//! surface).

mod blit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use image::RgbaImage;
use winit::window::Window;

pub use blit::BLIT_WGSL;
use blit::Blit;

use crate::backend::{BackendLimits, BufferUsage, ComputeBackend, KernelKind, KernelSource};
use crate::error::BackendError;
use crate::layout::{dispatch_grid, unpack_rgba8};

/// Where a rendered frame goes.
pub enum FrameTarget {
    /// Read the frame back into host memory.
    Image(RgbaImage),
    /// Draw to the surface of the window the backend was created for.
    Surface,
}

impl FrameTarget {
    /// The read-back image, if this is an image target.
    pub fn image(&self) -> Option<&RgbaImage> {
        match self {
            FrameTarget::Image(img) => Some(img),
            FrameTarget::Surface => None,
        }
    }
}

pub struct WgpuKernel {
    kind: KernelKind,
    label: &'static str,
    workgroup_size: u32,
    pipeline: wgpu::ComputePipeline,
}

pub struct WgpuBuffer {
    label: String,
    size: u64,
    buffer: wgpu::Buffer,
}

impl WgpuBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

pub struct WgpuBindings {
    kind: KernelKind,
    bind_group: wgpu::BindGroup,
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    blit: Blit,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    limits: BackendLimits,
    encoder: Option<wgpu::CommandEncoder>,
    lost: Arc<AtomicBool>,
    surface: Option<SurfaceState>,
}

impl WgpuBackend {
    /// Backend without a presentation surface.
    pub fn headless() -> Result<Self, BackendError> {
        pollster::block_on(Self::new_async(None))
    }

    /// Backend presenting to `window`.
    pub fn for_window(window: Arc<Window>) -> Result<Self, BackendError> {
        pollster::block_on(Self::new_async(Some(window)))
    }

    async fn new_async(window: Option<Arc<Window>>) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = match &window {
            Some(window) => Some(instance.create_surface(window.clone())?),
            None => None,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::Unavailable("no compatible GPU adapter".into()))?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        log::info!(
            "using adapter {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.backend
        );

        let required_limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            max_compute_workgroups_per_dimension: adapter_limits
                .max_compute_workgroups_per_dimension,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Slime Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: required_limits.clone(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::SeqCst);
        });
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("uncaptured wgpu error: {}", err);
        }));

        let surface = match (surface, &window) {
            (Some(surface), Some(window)) => {
                let size = window.inner_size();
                let caps = surface.get_capabilities(&adapter);
                // Pixels are already display-encoded, so skip the sRGB conversion.
                let format = caps
                    .formats
                    .iter()
                    .find(|f| !f.is_srgb())
                    .copied()
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| BackendError::Unavailable("surface has no formats".into()))?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: size.width.max(1),
                    height: size.height.max(1),
                    present_mode: wgpu::PresentMode::AutoVsync,
                    alpha_mode: caps
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &config);
                let blit = Blit::new(&device, format);
                Some(SurfaceState { surface, config, blit })
            }
            _ => None,
        };

        let limits = BackendLimits {
            uniform_alignment: required_limits.min_uniform_buffer_offset_alignment as u64,
            max_storage_buffer_size: (required_limits.max_storage_buffer_binding_size as u64)
                .min(required_limits.max_buffer_size),
            max_workgroups_per_dimension: required_limits.max_compute_workgroups_per_dimension,
        };

        Ok(Self {
            device,
            queue,
            adapter_info,
            limits,
            encoder: None,
            lost,
            surface,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Reconfigure the window surface after a resize.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Some(state) = &mut self.surface {
            state.config.width = width;
            state.config.height = height;
            state.surface.configure(&self.device, &state.config);
        }
    }

    fn check_lost(&self) -> Result<(), BackendError> {
        if self.lost.load(Ordering::SeqCst) {
            Err(BackendError::Lost("GPU device lost".into()))
        } else {
            Ok(())
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Slime Encoder"),
            })
        })
    }

    fn present_to_surface(&mut self, pixels: &WgpuBuffer, size: (u32, u32)) -> Result<(), BackendError> {
        let Some(state) = &mut self.surface else {
            return Err(BackendError::Present("backend has no window surface".into()));
        };

        let output = match state.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                state.surface.configure(&self.device, &state.config);
                log::debug!("surface reconfigured, frame skipped");
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                log::warn!("surface timeout, frame skipped");
                return Ok(());
            }
            Err(e) => return Err(BackendError::Present(e.to_string())),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Blit Encoder"),
            })
        });
        state.blit.draw(
            &self.device,
            &self.queue,
            &mut encoder,
            &view,
            &pixels.buffer,
            size,
            (state.config.width, state.config.height),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

impl ComputeBackend for WgpuBackend {
    type Kernel = WgpuKernel;
    type Buffer = WgpuBuffer;
    type Bindings = WgpuBindings;
    type Target = FrameTarget;

    fn name(&self) -> &str {
        &self.adapter_info.name
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn check_available(&self) -> Result<(), BackendError> {
        self.check_lost()
    }

    fn compile_kernel(&mut self, source: &KernelSource) -> Result<WgpuKernel, BackendError> {
        self.check_lost()?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.label),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.as_str().into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(source.label),
            layout: None,
            module: &module,
            entry_point: Some(source.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Compile {
                label: source.label.to_string(),
                message: err.to_string(),
            });
        }
        log::debug!("compiled kernel {}", source.label);
        Ok(WgpuKernel {
            kind: source.kind,
            label: source.label,
            workgroup_size: source.workgroup_size,
            pipeline,
        })
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: BufferUsage,
    ) -> Result<WgpuBuffer, BackendError> {
        self.check_lost()?;
        if usage == BufferUsage::Storage && size > self.limits.max_storage_buffer_size {
            return Err(BackendError::Allocation {
                label: label.to_string(),
                size,
                limit: self.limits.max_storage_buffer_size,
            });
        }
        let usage = match usage {
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            BufferUsage::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(BackendError::Allocation {
                label: label.to_string(),
                size,
                limit: self.limits.max_storage_buffer_size,
            });
        }
        Ok(WgpuBuffer {
            label: label.to_string(),
            size,
            buffer,
        })
    }

    fn write_buffer(
        &mut self,
        buffer: &WgpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        if offset % 4 != 0 || data.len() % 4 != 0 || offset + data.len() as u64 > buffer.size {
            return Err(BackendError::Dispatch(format!(
                "invalid write of {} bytes at {} into '{}'",
                data.len(),
                offset,
                buffer.label
            )));
        }
        self.queue.write_buffer(&buffer.buffer, offset, data);
        Ok(())
    }

    fn create_bindings(
        &mut self,
        kernel: &WgpuKernel,
        buffers: &[&WgpuBuffer],
    ) -> Result<WgpuBindings, BackendError> {
        self.check_lost()?;
        if buffers.len() != kernel.kind.bindings().len() {
            return Err(BackendError::Binding(format!(
                "kernel '{}' takes {} bindings, got {}",
                kernel.label,
                kernel.kind.bindings().len(),
                buffers.len()
            )));
        }
        let layout = kernel.pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.buffer.as_entire_binding(),
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label),
            layout: &layout,
            entries: &entries,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Binding(err.to_string()));
        }
        Ok(WgpuBindings {
            kind: kernel.kind,
            bind_group,
        })
    }

    fn dispatch(
        &mut self,
        kernel: &WgpuKernel,
        bindings: &WgpuBindings,
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
        let encoder = self.encoder();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bindings.bind_group, &[]);
        pass.dispatch_workgroups(grid.x, grid.y, 1);
        Ok(())
    }

    fn submit(&mut self) -> Result<(), BackendError> {
        self.check_lost()?;
        match self.encoder.take() {
            Some(encoder) => {
                self.queue.submit(std::iter::once(encoder.finish()));
            }
            None => {
                // Flushes pending queue writes.
                self.queue.submit(std::iter::empty());
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        self.submit()?;
        let _ = self.device.poll(wgpu::Maintain::Wait);
        self.check_lost()
    }

    fn read_buffer(&mut self, buffer: &WgpuBuffer) -> Result<Vec<u8>, BackendError> {
        self.check_lost()?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: buffer.size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.encoder()
            .copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, buffer.size);
        self.submit()?;

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        self.check_lost()?;

        rx.recv()
            .map_err(|_| BackendError::Readback(format!("mapping '{}' never completed", buffer.label)))??;
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn present_frame(
        &mut self,
        pixels: &WgpuBuffer,
        size: (u32, u32),
        target: &mut FrameTarget,
    ) -> Result<(), BackendError> {
        self.check_lost()?;
        let (w, h) = size;
        if pixels.size < u64::from(w) * u64::from(h) * 4 {
            return Err(BackendError::Present(format!(
                "pixel buffer '{}' is smaller than a {}x{} frame",
                pixels.label, w, h
            )));
        }
        match target {
            FrameTarget::Surface => self.present_to_surface(pixels, size),
            FrameTarget::Image(image) => {
                let bytes = self.read_buffer(pixels)?;
                if image.dimensions() != size {
                    *image = RgbaImage::new(w, h);
                }
                for (px, word) in image.pixels_mut().zip(bytes.chunks_exact(4)) {
                    px.0 = unpack_rgba8(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
                }
                Ok(())
            }
        }
    }
}
