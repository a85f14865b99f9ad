//! Window display backend using winit and wgpu.
//!
//! The event loop is pumped manually instead of handed control, so the
//! viewer keeps a plain blocking loop: each `show` or `poll_key` call runs
//! pending window events for a bounded time and returns.

use super::{DisplayError, DisplaySurface};
use crate::frame::{DisplayImage, QuadVertex, RawFrame};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use wgpu::util::DeviceExt;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::Key;
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowAttributes, WindowId};

const VERTEX_ENTRY: &str = "vs_main";
const FRAGMENT_ENTRY: &str = "fs_main";

const FRAME_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@group(0) @binding(0) var t_frame: texture_2d<f32>;
@group(0) @binding(1) var s_frame: sampler;

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_frame, s_frame, in.tex_coords);
}
"#;

/// Texture holding the last uploaded image, recreated when the size changes.
struct FrameTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

/// GPU state for drawing frames into one window.
pub struct WindowRenderer {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    render_pipeline: wgpu::RenderPipeline,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    frame_texture: Option<FrameTexture>,
}

impl WindowRenderer {
    pub fn new(window: Arc<Window>) -> Result<Self, DisplayError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| DisplayError::Gpu(format!("failed to create surface: {e}")))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| DisplayError::Gpu(format!("failed to find GPU adapter: {e:?}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("rawview device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| DisplayError::Gpu(format!("failed to create device: {e}")))?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        // Raw sample values are shown as stored, so skip the sRGB encode.
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or_else(|| DisplayError::Gpu("surface reports no formats".to_string()))?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoNoVsync,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Frame Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(FRAME_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Frame Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Frame Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some(VERTEX_ENTRY),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some(FRAGMENT_ENTRY),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            // Triangle list, counter-clockwise, no culling.
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Frame Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Frame Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        // Nearest keeps individual sensor pixels visible when the window is scaled.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Frame Sampler"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            surface,
            device,
            queue,
            config,
            render_pipeline,
            vertex_buffer,
            index_buffer,
            bind_group_layout,
            sampler,
            frame_texture: None,
        })
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Uploads `image` into the frame texture.
    pub fn upload(&mut self, image: &DisplayImage) {
        let needs_new = match &self.frame_texture {
            Some(t) => t.width != image.width || t.height != image.height,
            None => true,
        };
        if needs_new {
            self.frame_texture = Some(self.create_frame_texture(image.width, image.height));
        }
        let Some(target) = &self.frame_texture else {
            return;
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &image.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.width * 4),
                rows_per_image: Some(image.height),
            },
            wgpu::Extent3d {
                width: image.width,
                height: image.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_frame_texture(&self, width: u32, height: u32) -> FrameTexture {
        tracing::debug!("Allocating {}x{} frame texture", width, height);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let texture_view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        FrameTexture {
            texture,
            bind_group,
            width,
            height,
        }
    }

    /// Draws the last uploaded frame. Does nothing before the first upload.
    pub fn render(&mut self) -> Result<(), DisplayError> {
        let Some(frame_texture) = &self.frame_texture else {
            return Ok(());
        };

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                tracing::debug!("Surface lost or outdated, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                tracing::debug!("Surface texture timed out, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(DisplayError::Gpu(e.to_string())),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Render Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Frame Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&self.render_pipeline);
            render_pass.set_bind_group(0, &frame_texture.bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }
}

/// Event handler state shared with the pumped event loop.
struct WindowApp {
    title: String,
    window: Option<Arc<Window>>,
    renderer: Option<WindowRenderer>,
    pending: Option<DisplayImage>,
    keys: VecDeque<char>,
    error: Option<DisplayError>,
}

impl WindowApp {
    fn new(title: String) -> Self {
        Self {
            title,
            window: None,
            renderer: None,
            pending: None,
            keys: VecDeque::new(),
            error: None,
        }
    }

    /// Creates the window sized to `image` if it does not exist yet.
    fn ensure_window(&mut self, event_loop: &ActiveEventLoop, image: &DisplayImage) -> Result<(), DisplayError> {
        if self.renderer.is_some() {
            return Ok(());
        }

        let attrs = WindowAttributes::default()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(image.width.max(1), image.height.max(1)));
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .map_err(|e| DisplayError::Window(e.to_string()))?,
        );
        let renderer = WindowRenderer::new(window.clone())?;
        tracing::info!("Window '{}' created at {}x{}", self.title, image.width, image.height);

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn present_pending(&mut self, event_loop: &ActiveEventLoop) -> Result<(), DisplayError> {
        let Some(image) = self.pending.take() else {
            return Ok(());
        };
        self.ensure_window(event_loop, &image)?;
        if let Some(renderer) = &mut self.renderer {
            renderer.upload(&image);
            renderer.render()?;
        }
        Ok(())
    }

    fn record_error(&mut self, error: DisplayError) {
        tracing::error!("Display error: {}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

impl ApplicationHandler for WindowApp {
    fn resumed(&mut self, _event_loop: &ActiveEventLoop) {
        // The window is created lazily by the first frame.
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Close requested for '{}'; press 'q' to quit", self.title);
            }
            WindowEvent::Resized(size) => {
                if let Some(renderer) = &mut self.renderer {
                    renderer.resize(size);
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.render() {
                        self.record_error(e);
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state != ElementState::Pressed {
                    return;
                }
                if let Key::Character(text) = &event.logical_key {
                    if let Some(c) = text.chars().next() {
                        self.keys.push_back(c);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(e) = self.present_pending(event_loop) {
            self.record_error(e);
        }
    }
}

/// A titled window that shows frames and collects key presses.
///
/// Dropping it destroys the window and the GPU resources behind it.
pub struct WindowDisplay {
    event_loop: EventLoop<()>,
    app: WindowApp,
}

impl WindowDisplay {
    /// Connects to the windowing system. The window itself appears on the first `show`.
    pub fn new(title: impl Into<String>) -> Result<Self, DisplayError> {
        let event_loop = EventLoop::new().map_err(|e| DisplayError::EventLoop(e.to_string()))?;
        Ok(Self {
            event_loop,
            app: WindowApp::new(title.into()),
        })
    }

    /// Dispatches window events for at most `timeout`.
    fn pump(&mut self, timeout: Duration) -> Result<(), DisplayError> {
        match self.event_loop.pump_app_events(Some(timeout), &mut self.app) {
            PumpStatus::Continue => {}
            PumpStatus::Exit(code) => {
                return Err(DisplayError::EventLoop(format!("event loop exited with code {code}")));
            }
        }
        match self.app.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl DisplaySurface for WindowDisplay {
    fn show(&mut self, frame: &RawFrame) -> Result<(), DisplayError> {
        self.app.pending = Some(frame.to_display_rgba());
        self.pump(Duration::ZERO)
    }

    fn poll_key(&mut self, timeout: Duration) -> Result<Option<char>, DisplayError> {
        if let Some(key) = self.app.keys.pop_front() {
            return Ok(Some(key));
        }
        self.pump(timeout)?;
        Ok(self.app.keys.pop_front())
    }
}

impl Drop for WindowDisplay {
    fn drop(&mut self) {
        // Surface before window.
        self.app.renderer = None;
        if self.app.window.take().is_some() {
            tracing::debug!("Window '{}' destroyed", self.app.title);
        }
    }
}
