//! [`GraphicsDevice`] on top of `wgpu`.
//!
//! wgpu has no bound state, so this backend keeps the GL-style state itself and records
//! every clear, draw and blit into a command list, stamped with the target and viewport
//! bound at the time. [`finish_frame`](GraphicsDevice::finish_frame) replays the list:
//! consecutive commands on the same target share one render pass and the per-draw
//! matrices of the whole frame go up in a single instance buffer.
//!
//! Clears are drawn as viewport-sized triangles so that they respect the viewport the
//! way a scissored GL clear does. A clear covering the whole target at the start of a
//! pass becomes the pass's load op instead.

use std::{collections::HashMap, iter, mem, sync::Arc};

use anyhow::{Context, anyhow, bail};
use instant::Duration;
use log::{debug, info, trace, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

use super::{
    BufferId, BufferKind, Color, DrawUniforms, FramebufferId, GraphicsDevice, IdAllocator,
    IndexFormat, ProgramId, RenderTarget, RenderbufferId, TextureDescriptor, TextureFormat,
    TextureId, VertexLayout, Viewport,
    pipeline::{self, DepthMode, PipelineDesc},
    surface::{self, Negotiated, SurfacePreferences, SurfaceSupport},
};

const HEADLESS_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// Programs every [`WgpuDevice`] can build from the shaders shipped with the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuiltinPrograms {
    /// Writes light-space depth into the red channel. Needs positions only.
    pub shadow_depth: ProgramId,
    /// Lambert shading with a shadow-map lookup. Needs positions and normals.
    pub lit: ProgramId,
}

struct Storage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
}

impl Storage {
    fn new(
        device: &wgpu::Device,
        label: &str,
        format: TextureFormat,
        usage: wgpu::TextureUsages,
        (width, height): (u32, u32),
        sample_count: u32,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            size: (width, height),
        }
    }
}

struct TextureEntry {
    desc: TextureDescriptor,
    sampler: wgpu::Sampler,
    storage: Option<Storage>,
}

struct RenderbufferEntry {
    label: String,
    storage: Option<Storage>,
}

#[derive(Clone, Copy, Debug, Default)]
struct FramebufferEntry {
    color: Option<TextureId>,
    depth: Option<RenderbufferId>,
}

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
}

struct Program {
    label: String,
    module: wgpu::ShaderModule,
    samples_texture: bool,
    required_locations: Vec<u32>,
}

enum Output {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    /// Stand-in for a window; also what [`GraphicsDevice::read_pixels`] reads.
    Offscreen { color: Storage },
}

#[derive(Default)]
struct Bound {
    target: RenderTarget,
    viewport: Viewport,
    program: Option<ProgramId>,
    vertex: Option<(BufferId, VertexLayout)>,
    index: Option<(BufferId, IndexFormat)>,
    texture: Option<TextureId>,
    uniforms: DrawUniforms,
}

enum Op {
    Clear {
        color: Option<Color>,
        depth: Option<f32>,
        instance: u32,
    },
    Draw {
        program: ProgramId,
        vertex: BufferId,
        layout: VertexLayout,
        index: BufferId,
        format: IndexFormat,
        count: u32,
        texture: Option<TextureId>,
        instance: u32,
    },
    Blit {
        texture: TextureId,
    },
}

struct Command {
    target: RenderTarget,
    viewport: Viewport,
    op: Op,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PipelineKind {
    Mesh { program: ProgramId, layout: VertexLayout },
    Blit,
    Clear { color: bool, depth: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    kind: PipelineKind,
    format: TextureFormat,
    depth: bool,
    samples: u32,
}

/// A render target resolved to views for one frame.
struct Attachments {
    view: wgpu::TextureView,
    resolve: Option<wgpu::TextureView>,
    depth: Option<wgpu::TextureView>,
    /// The texture being rendered into, if it is one of ours.
    color_texture: Option<TextureId>,
    format: TextureFormat,
    size: (u32, u32),
    samples: u32,
}

enum Call {
    Fullscreen,
    Indexed {
        vertex: wgpu::Buffer,
        index: wgpu::Buffer,
        format: IndexFormat,
        count: u32,
    },
}

struct Prepared {
    viewport: Viewport,
    pipeline: wgpu::RenderPipeline,
    bind_group: Option<wgpu::BindGroup>,
    instance: Option<u32>,
    call: Call,
}

/// See the [module documentation](self).
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    output: Output,
    format: TextureFormat,
    sample_count: u32,
    depth: Storage,
    msaa: Option<Storage>,
    negotiated: Option<Negotiated>,

    ids: IdAllocator,
    buffers: HashMap<BufferId, BufferEntry>,
    textures: HashMap<TextureId, TextureEntry>,
    renderbuffers: HashMap<RenderbufferId, RenderbufferEntry>,
    framebuffers: HashMap<FramebufferId, FramebufferEntry>,
    programs: HashMap<ProgramId, Program>,

    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    plain_layout: wgpu::PipelineLayout,
    textured_layout: wgpu::PipelineLayout,
    texture_layout: wgpu::BindGroupLayout,
    blit_module: wgpu::ShaderModule,
    clear_module: wgpu::ShaderModule,
    fallback: wgpu::BindGroup,

    bound: Bound,
    commands: Vec<Command>,
    instances: Vec<DrawUniforms>,
}

async fn request_device(adapter: &wgpu::Adapter) -> anyhow::Result<(wgpu::Device, wgpu::Queue)> {
    info!("using adapter {:?}", adapter.get_info());
    adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("scenic-bridge device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            ..Default::default()
        })
        .await
        .context("failed to open the graphics device")
}

fn new_instance() -> wgpu::Instance {
    // BackendBit::PRIMARY => Vulkan + Metal + DX12 + Browser WebGPU
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    })
}

impl WgpuDevice {
    /// Opens a device that presents to `window`, configured as close to `prefs` as the
    /// adapter allows. See [`negotiated`](Self::negotiated) for what was given up.
    pub async fn new(window: Arc<Window>, prefs: &SurfacePreferences) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let instance = new_instance();
        let surface = instance
            .create_surface(window)
            .context("failed to create a surface for the window")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no graphics adapter can present to this window")?;
        let (device, queue) = request_device(&adapter).await?;

        let caps = surface.get_capabilities(&adapter);
        let candidate = surface::preferred_format(prefs, &caps.formats)
            .or_else(|| caps.formats.first().copied())
            .unwrap_or(TextureFormat::Rgba8UnormSrgb);
        let support = SurfaceSupport {
            formats: caps.formats.clone(),
            sample_counts: adapter
                .get_texture_format_features(candidate)
                .flags
                .supported_sample_counts(),
            immediate_present: caps.present_modes.contains(&wgpu::PresentMode::Immediate),
        };
        let negotiated = surface::negotiate(prefs, &support);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: negotiated.format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if negotiated.vsync {
                wgpu::PresentMode::Fifo
            } else {
                wgpu::PresentMode::Immediate
            },
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        info!(
            "surface {}x{} {:?}, {} samples, vsync {}",
            config.width,
            config.height,
            negotiated.format,
            negotiated.sample_count,
            negotiated.vsync
        );

        let format = negotiated.format;
        let sample_count = negotiated.sample_count;
        Ok(Self::from_parts(
            device,
            queue,
            Output::Window { surface, config },
            format,
            sample_count,
            Some(negotiated),
        ))
    }

    /// Opens a device without a window. The default render target is an
    /// `Rgba8UnormSrgb` texture that [`read_pixels`](GraphicsDevice::read_pixels) reads.
    pub async fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        let instance = new_instance();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("no graphics adapter available")?;
        let (device, queue) = request_device(&adapter).await?;
        let color = Storage::new(
            &device,
            "headless colour",
            HEADLESS_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            (width.max(1), height.max(1)),
            1,
        );
        Ok(Self::from_parts(
            device,
            queue,
            Output::Offscreen { color },
            HEADLESS_FORMAT,
            1,
            None,
        ))
    }

    fn from_parts(
        device: wgpu::Device,
        queue: wgpu::Queue,
        output: Output,
        format: TextureFormat,
        sample_count: u32,
        negotiated: Option<Negotiated>,
    ) -> Self {
        let size = match &output {
            Output::Window { config, .. } => (config.width, config.height),
            Output::Offscreen { color } => color.size,
        };
        let (depth, msaa) = default_attachments(&device, format, sample_count, size);

        let texture_layout = pipeline::texture_layout(&device);
        let plain_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Plain Pipeline Layout"),
            bind_group_layouts: &[],
            immediate_size: 0,
        });
        let textured_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Textured Pipeline Layout"),
            bind_group_layouts: &[&texture_layout],
            immediate_size: 0,
        });
        let blit_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/blit.wgsl").into()),
        });
        let clear_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Clear Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/clear.wgsl").into()),
        });
        let fallback = white_bind_group(&device, &queue, &texture_layout);

        Self {
            device,
            queue,
            output,
            format,
            sample_count,
            depth,
            msaa,
            negotiated,
            ids: IdAllocator::default(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            renderbuffers: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            plain_layout,
            textured_layout,
            texture_layout,
            blit_module,
            clear_module,
            fallback,
            bound: Bound::default(),
            commands: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Compiles a WGSL program.
    ///
    /// The vertex stage reads mesh attributes from locations below 4 and the three
    /// [`DrawUniforms`] matrices from locations 4 to 15, one `vec4` per column. A
    /// program that samples a texture declares it at `@group(0) @binding(0)` with its
    /// sampler at binding 1. Draws whose mesh lacks one of `required_locations` are
    /// skipped.
    pub fn create_program(
        &mut self,
        label: &str,
        wgsl: &str,
        samples_texture: bool,
        required_locations: &[u32],
    ) -> ProgramId {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        });
        let id = ProgramId(self.ids.next());
        self.programs.insert(
            id,
            Program {
                label: label.to_string(),
                module,
                samples_texture,
                required_locations: required_locations.to_vec(),
            },
        );
        debug!("created program {} '{}'", id, label);
        id
    }

    pub fn builtin_programs(&mut self) -> BuiltinPrograms {
        BuiltinPrograms {
            shadow_depth: self.create_program(
                "shadow depth",
                include_str!("shaders/shadow_depth.wgsl"),
                false,
                &[0],
            ),
            lit: self.create_program("lit", include_str!("shaders/lit.wgsl"), true, &[0, 1]),
        }
    }

    /// The surface configuration that was settled on, `None` for headless devices.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    fn reconfigure(&mut self) {
        if let Output::Window { surface, config } = &self.output {
            surface.configure(&self.device, config);
        }
    }

    fn attachments(
        &self,
        target: RenderTarget,
        frame_view: &wgpu::TextureView,
    ) -> anyhow::Result<Attachments> {
        match target {
            RenderTarget::Default => {
                let (view, resolve) = match &self.msaa {
                    Some(msaa) => (msaa.view.clone(), Some(frame_view.clone())),
                    None => (frame_view.clone(), None),
                };
                Ok(Attachments {
                    view,
                    resolve,
                    depth: Some(self.depth.view.clone()),
                    color_texture: None,
                    format: self.format,
                    size: self.surface_size(),
                    samples: self.sample_count,
                })
            }
            RenderTarget::Framebuffer(fb) => {
                let entry = self
                    .framebuffers
                    .get(&fb)
                    .ok_or_else(|| anyhow!("{} was deleted", fb))?;
                let color_id = entry
                    .color
                    .ok_or_else(|| anyhow!("{} has no colour attachment", fb))?;
                let (format, color) = self
                    .textures
                    .get(&color_id)
                    .and_then(|t| t.storage.as_ref().map(|s| (t.desc.format, s)))
                    .ok_or_else(|| anyhow!("colour attachment {} has no storage", color_id))?;
                let depth = match entry.depth {
                    None => None,
                    Some(rb) => {
                        let depth = self
                            .renderbuffers
                            .get(&rb)
                            .and_then(|r| r.storage.as_ref())
                            .ok_or_else(|| anyhow!("depth attachment {} has no storage", rb))?;
                        if depth.size != color.size {
                            bail!(
                                "attachment sizes differ: colour {:?}, depth {:?}",
                                color.size,
                                depth.size
                            );
                        }
                        Some(depth.view.clone())
                    }
                };
                Ok(Attachments {
                    view: color.view.clone(),
                    resolve: None,
                    depth,
                    color_texture: Some(color_id),
                    format,
                    size: color.size,
                    samples: 1,
                })
            }
        }
    }

    fn pipeline(&mut self, key: &PipelineKey) -> Option<wgpu::RenderPipeline> {
        if let Some(pipeline) = self.pipelines.get(key) {
            return Some(pipeline.clone());
        }
        let depth_test = if key.depth { DepthMode::Test } else { DepthMode::None };
        let pipeline = match &key.kind {
            PipelineKind::Mesh { program, layout } => {
                let Some(program) = self.programs.get(program) else {
                    warn!("draw with deleted program {}", program);
                    return None;
                };
                let attributes = layout.wgpu_attributes();
                let buffers = [
                    wgpu::VertexBufferLayout {
                        array_stride: layout.stride,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    },
                    DrawUniforms::desc(),
                ];
                pipeline::mk_render_pipeline(
                    &self.device,
                    &PipelineDesc {
                        label: &program.label,
                        layout: if program.samples_texture {
                            &self.textured_layout
                        } else {
                            &self.plain_layout
                        },
                        module: &program.module,
                        color_format: key.format,
                        write_color: true,
                        depth: depth_test,
                        cull: Some(wgpu::Face::Back),
                        samples: key.samples,
                        vertex_layouts: &buffers,
                    },
                )
            }
            PipelineKind::Blit => pipeline::mk_render_pipeline(
                &self.device,
                &PipelineDesc {
                    label: "blit",
                    layout: &self.textured_layout,
                    module: &self.blit_module,
                    color_format: key.format,
                    write_color: true,
                    depth: if key.depth {
                        DepthMode::Overwrite { write: false }
                    } else {
                        DepthMode::None
                    },
                    cull: None,
                    samples: key.samples,
                    vertex_layouts: &[],
                },
            ),
            PipelineKind::Clear { color, depth } => pipeline::mk_render_pipeline(
                &self.device,
                &PipelineDesc {
                    label: "clear",
                    layout: &self.plain_layout,
                    module: &self.clear_module,
                    color_format: key.format,
                    write_color: *color,
                    depth: if key.depth {
                        DepthMode::Overwrite { write: *depth }
                    } else {
                        DepthMode::None
                    },
                    cull: None,
                    samples: key.samples,
                    vertex_layouts: &[DrawUniforms::desc()],
                },
            ),
        };
        trace!("built pipeline {:?}", key);
        self.pipelines.insert(key.clone(), pipeline.clone());
        Some(pipeline)
    }

    fn bind_group(
        &self,
        texture: Option<TextureId>,
        attachments: &Attachments,
        cache: &mut HashMap<TextureId, wgpu::BindGroup>,
    ) -> wgpu::BindGroup {
        let Some(id) = texture else {
            return self.fallback.clone();
        };
        if attachments.color_texture == Some(id) {
            warn!("{} is sampled while being rendered into, sampling white instead", id);
            return self.fallback.clone();
        }
        if let Some(group) = cache.get(&id) {
            return group.clone();
        }
        let Some((entry, storage)) = self
            .textures
            .get(&id)
            .and_then(|t| t.storage.as_ref().map(|s| (t, s)))
        else {
            warn!("{} has no storage, sampling white instead", id);
            return self.fallback.clone();
        };
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&entry.desc.label),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&storage.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&entry.sampler),
                },
            ],
        });
        cache.insert(id, group.clone());
        group
    }

    fn prepare(
        &mut self,
        command: &Command,
        attachments: &Attachments,
        cache: &mut HashMap<TextureId, wgpu::BindGroup>,
    ) -> Option<Prepared> {
        let Some(viewport) = clamp_viewport(command.viewport, attachments.size) else {
            trace!("skipping command outside {:?}", command.target);
            return None;
        };
        let key = |kind| PipelineKey {
            kind,
            format: attachments.format,
            depth: attachments.depth.is_some(),
            samples: attachments.samples,
        };
        match &command.op {
            Op::Clear { color, depth, instance } => {
                let write_depth = depth.is_some() && attachments.depth.is_some();
                if color.is_none() && !write_depth {
                    return None;
                }
                let pipeline = self.pipeline(&key(PipelineKind::Clear {
                    color: color.is_some(),
                    depth: write_depth,
                }))?;
                Some(Prepared {
                    viewport,
                    pipeline,
                    bind_group: None,
                    instance: Some(*instance),
                    call: Call::Fullscreen,
                })
            }
            Op::Draw {
                program,
                vertex,
                layout,
                index,
                format,
                count,
                texture,
                instance,
            } => {
                let (Some(vertex), Some(index)) =
                    (self.buffers.get(vertex), self.buffers.get(index))
                else {
                    warn!("draw with a deleted buffer skipped");
                    return None;
                };
                let index_size = match format {
                    IndexFormat::Uint16 => 2,
                    IndexFormat::Uint32 => 4,
                };
                if *count as u64 * index_size > index.size {
                    warn!(
                        "draw of {} indices overruns a {} byte index buffer, skipped",
                        count, index.size
                    );
                    return None;
                }
                let (vertex, index) = (vertex.buffer.clone(), index.buffer.clone());
                let samples_texture = self.programs.get(program).is_some_and(|p| p.samples_texture);
                let pipeline = self.pipeline(&key(PipelineKind::Mesh {
                    program: *program,
                    layout: layout.clone(),
                }))?;
                let bind_group =
                    samples_texture.then(|| self.bind_group(*texture, attachments, cache));
                Some(Prepared {
                    viewport,
                    pipeline,
                    bind_group,
                    instance: Some(*instance),
                    call: Call::Indexed {
                        vertex,
                        index,
                        format: *format,
                        count: *count,
                    },
                })
            }
            Op::Blit { texture } => {
                if attachments.color_texture == Some(*texture) {
                    warn!("blit of {} into itself skipped", texture);
                    return None;
                }
                if self.textures.get(texture).is_none_or(|t| t.storage.is_none()) {
                    warn!("blit of {} without storage skipped", texture);
                    return None;
                }
                let pipeline = self.pipeline(&key(PipelineKind::Blit))?;
                let bind_group = Some(self.bind_group(Some(*texture), attachments, cache));
                Some(Prepared {
                    viewport,
                    pipeline,
                    bind_group,
                    instance: None,
                    call: Call::Fullscreen,
                })
            }
        }
    }

    fn encode_segment(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        commands: &[Command],
        frame_view: &wgpu::TextureView,
        instances: Option<&wgpu::Buffer>,
        cache: &mut HashMap<TextureId, wgpu::BindGroup>,
    ) {
        let Some(first) = commands.first() else {
            return;
        };
        let attachments = match self.attachments(first.target, frame_view) {
            Ok(attachments) => attachments,
            Err(e) => {
                warn!("skipping {} commands on {:?}: {:#}", commands.len(), first.target, e);
                return;
            }
        };

        let mut color_load = wgpu::LoadOp::Load;
        let mut depth_load = wgpu::LoadOp::Load;
        let mut rest = commands;
        if let Op::Clear { color, depth, .. } = &first.op {
            if covers(first.viewport, attachments.size) {
                if let Some(color) = color {
                    color_load = wgpu::LoadOp::Clear(*color);
                }
                if let Some(depth) = depth {
                    depth_load = wgpu::LoadOp::Clear(*depth);
                }
                rest = &commands[1..];
            }
        }

        let prepared: Vec<Prepared> = rest
            .iter()
            .filter_map(|command| self.prepare(command, &attachments, cache))
            .collect();
        if prepared.is_empty() && rest.len() == commands.len() {
            return;
        }

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Scene Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &attachments.view,
                resolve_target: attachments.resolve.as_ref(),
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: attachments.depth.as_ref().map(|view| {
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        for p in &prepared {
            let vp = p.viewport;
            render_pass.set_viewport(
                vp.x as f32,
                vp.y as f32,
                vp.width as f32,
                vp.height as f32,
                0.0,
                1.0,
            );
            render_pass.set_pipeline(&p.pipeline);
            if let Some(bind_group) = &p.bind_group {
                render_pass.set_bind_group(0, bind_group, &[]);
            }
            let instance = p.instance.map_or(0..1, |i| i..i + 1);
            match &p.call {
                Call::Fullscreen => {
                    if p.instance.is_some() {
                        let Some(instances) = instances else {
                            continue;
                        };
                        render_pass.set_vertex_buffer(0, instances.slice(..));
                    }
                    render_pass.draw(0..3, instance);
                }
                Call::Indexed {
                    vertex,
                    index,
                    format,
                    count,
                } => {
                    let Some(instances) = instances else {
                        continue;
                    };
                    render_pass.set_vertex_buffer(0, vertex.slice(..));
                    render_pass.set_vertex_buffer(1, instances.slice(..));
                    render_pass.set_index_buffer(index.slice(..), *format);
                    render_pass.draw_indexed(0..*count, 0, instance);
                }
            }
        }
    }

    async fn read_back(&self, texture: &Storage) -> anyhow::Result<Vec<u8>> {
        let (width, height) = texture.size;
        let u32_size = std::mem::size_of::<u32>() as u32;
        let unpadded = u32_size * width;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &output_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(iter::once(encoder.finish()));

        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        let buffer_slice = output_buffer.slice(..);
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(Duration::from_secs(3)),
        })?;
        rx.receive()
            .await
            .context("readback was cancelled")?
            .context("failed to map the readback buffer")?;

        let data = buffer_slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        for row in data.chunks(padded as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
        drop(data);
        output_buffer.unmap();
        Ok(pixels)
    }
}

fn default_attachments(
    device: &wgpu::Device,
    format: TextureFormat,
    sample_count: u32,
    size: (u32, u32),
) -> (Storage, Option<Storage>) {
    let depth = Storage::new(
        device,
        "surface depth",
        pipeline::DEPTH_FORMAT,
        wgpu::TextureUsages::RENDER_ATTACHMENT,
        size,
        sample_count,
    );
    let msaa = (sample_count > 1).then(|| {
        Storage::new(
            device,
            "surface multisample",
            format,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
            size,
            sample_count,
        )
    });
    (depth, msaa)
}

fn white_bind_group(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::BindGroup {
    let white = Storage::new(
        device,
        "fallback white",
        TextureFormat::Rgba8Unorm,
        wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        (1, 1),
        1,
    );
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            aspect: wgpu::TextureAspect::All,
            texture: &white.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
        },
        &[255, 255, 255, 255],
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(4),
            rows_per_image: Some(1),
        },
        wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("fallback sampler"),
        ..Default::default()
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("fallback white"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&white.view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&sampler),
            },
        ],
    })
}

/// Cuts `viewport` down to a `width` x `height` target. `None` if nothing is left.
fn clamp_viewport(viewport: Viewport, (width, height): (u32, u32)) -> Option<Viewport> {
    let x = viewport.x.min(width);
    let y = viewport.y.min(height);
    let clamped = Viewport::new(
        x,
        y,
        viewport.width.min(width - x),
        viewport.height.min(height - y),
    );
    (!clamped.is_empty()).then_some(clamped)
}

fn covers(viewport: Viewport, (width, height): (u32, u32)) -> bool {
    viewport.x == 0 && viewport.y == 0 && viewport.width >= width && viewport.height >= height
}

impl GraphicsDevice for WgpuDevice {
    fn create_buffer(
        &mut self,
        kind: BufferKind,
        label: &str,
        data: &[u8],
    ) -> anyhow::Result<BufferId> {
        if data.is_empty() {
            bail!("buffer '{}' has no data", label);
        }
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        };
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: data,
            usage: usage | wgpu::BufferUsages::COPY_DST,
        });
        let id = BufferId(self.ids.next());
        self.buffers.insert(
            id,
            BufferEntry {
                buffer,
                size: data.len() as u64,
            },
        );
        trace!("created {:?} buffer {} '{}' ({} bytes)", kind, id, label, data.len());
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_none() {
            debug!("delete of unknown buffer {}", buffer);
        }
        if self.bound.vertex.as_ref().is_some_and(|(b, _)| *b == buffer) {
            self.bound.vertex = None;
        }
        if self.bound.index.is_some_and(|(b, _)| b == buffer) {
            self.bound.index = None;
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> anyhow::Result<TextureId> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&desc.label),
            address_mode_u: desc.wrap,
            address_mode_v: desc.wrap,
            address_mode_w: desc.wrap,
            mag_filter: desc.filter,
            min_filter: desc.filter,
            ..Default::default()
        });
        let id = TextureId(self.ids.next());
        self.textures.insert(
            id,
            TextureEntry {
                desc: desc.clone(),
                sampler,
                storage: None,
            },
        );
        Ok(id)
    }

    fn texture_storage(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            bail!("cannot allocate {}x{} storage for {} (limit {})", width, height, texture, max);
        }
        let entry = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| anyhow!("storage for unknown texture {}", texture))?;
        entry.storage = Some(Storage::new(
            &self.device,
            &entry.desc.label,
            entry.desc.format,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            (width, height),
            1,
        ));
        debug!("allocated {}x{} {:?} for {}", width, height, entry.desc.format, texture);
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_none() {
            debug!("delete of unknown texture {}", texture);
        }
        if self.bound.texture == Some(texture) {
            self.bound.texture = None;
        }
    }

    fn create_framebuffer(&mut self, label: &str) -> anyhow::Result<FramebufferId> {
        let id = FramebufferId(self.ids.next());
        self.framebuffers.insert(id, FramebufferEntry::default());
        trace!("created framebuffer {} '{}'", id, label);
        Ok(id)
    }

    fn create_renderbuffer(&mut self, label: &str) -> anyhow::Result<RenderbufferId> {
        let id = RenderbufferId(self.ids.next());
        self.renderbuffers.insert(
            id,
            RenderbufferEntry {
                label: label.to_string(),
                storage: None,
            },
        );
        Ok(id)
    }

    fn renderbuffer_storage(
        &mut self,
        renderbuffer: RenderbufferId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            bail!("cannot allocate {}x{} storage for {}", width, height, renderbuffer);
        }
        let entry = self
            .renderbuffers
            .get_mut(&renderbuffer)
            .ok_or_else(|| anyhow!("storage for unknown renderbuffer {}", renderbuffer))?;
        entry.storage = Some(Storage::new(
            &self.device,
            &entry.label,
            pipeline::DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
            (width, height),
            1,
        ));
        Ok(())
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        color: Option<TextureId>,
        depth: Option<RenderbufferId>,
    ) -> anyhow::Result<()> {
        if let Some(color) = color {
            if !self.textures.contains_key(&color) {
                bail!("cannot attach unknown texture {}", color);
            }
        }
        if let Some(depth) = depth {
            if !self.renderbuffers.contains_key(&depth) {
                bail!("cannot attach unknown renderbuffer {}", depth);
            }
        }
        let entry = self
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or_else(|| anyhow!("cannot attach to unknown framebuffer {}", framebuffer))?;
        *entry = FramebufferEntry { color, depth };
        Ok(())
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if self.framebuffers.remove(&framebuffer).is_none() {
            debug!("delete of unknown framebuffer {}", framebuffer);
        }
        if self.bound.target == RenderTarget::Framebuffer(framebuffer) {
            self.bound.target = RenderTarget::Default;
        }
    }

    fn delete_renderbuffer(&mut self, renderbuffer: RenderbufferId) {
        if self.renderbuffers.remove(&renderbuffer).is_none() {
            debug!("delete of unknown renderbuffer {}", renderbuffer);
        }
    }

    fn bind_render_target(&mut self, target: RenderTarget) {
        if let RenderTarget::Framebuffer(fb) = target {
            if !self.framebuffers.contains_key(&fb) {
                warn!("binding unknown framebuffer {}", fb);
            }
        }
        self.bound.target = target;
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.bound.viewport = viewport;
    }

    fn clear(&mut self, color: Option<Color>, depth: Option<f32>) {
        if color.is_none() && depth.is_none() {
            return;
        }
        let mut uniforms = DrawUniforms::default();
        if let Some(c) = color {
            uniforms.model[0] = [c.r as f32, c.g as f32, c.b as f32, c.a as f32];
        }
        uniforms.model[1][0] = depth.unwrap_or(1.0);
        let instance = self.instances.len() as u32;
        self.instances.push(uniforms);
        self.commands.push(Command {
            target: self.bound.target,
            viewport: self.bound.viewport,
            op: Op::Clear { color, depth, instance },
        });
    }

    fn use_program(&mut self, program: ProgramId) {
        if !self.programs.contains_key(&program) {
            warn!("using unknown program {}", program);
        }
        self.bound.program = Some(program);
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferId, layout: &VertexLayout) {
        self.bound.vertex = Some((buffer, layout.clone()));
    }

    fn bind_index_buffer(&mut self, buffer: BufferId, format: IndexFormat) {
        self.bound.index = Some((buffer, format));
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>) {
        if slot != 0 {
            warn!("texture slot {} is not supported, only slot 0", slot);
            return;
        }
        self.bound.texture = texture;
    }

    fn set_draw_uniforms(&mut self, uniforms: &DrawUniforms) {
        self.bound.uniforms = *uniforms;
    }

    fn draw_indexed(&mut self, count: u32) {
        let Some(program) = self.bound.program else {
            warn!("draw without a program skipped");
            return;
        };
        let (Some((vertex, layout)), Some((index, format))) = (&self.bound.vertex, self.bound.index)
        else {
            warn!("draw without vertex or index buffer skipped");
            return;
        };
        if let Some(p) = self.programs.get(&program) {
            let missing: Vec<u32> = p
                .required_locations
                .iter()
                .copied()
                .filter(|l| !layout.attributes.iter().any(|a| a.location == *l))
                .collect();
            if !missing.is_empty() {
                warn!(
                    "'{}' needs vertex locations {:?} the mesh lacks, draw skipped",
                    p.label, missing
                );
                return;
            }
        }
        if count == 0 {
            return;
        }
        let instance = self.instances.len() as u32;
        self.instances.push(self.bound.uniforms);
        self.commands.push(Command {
            target: self.bound.target,
            viewport: self.bound.viewport,
            op: Op::Draw {
                program,
                vertex: *vertex,
                layout: layout.clone(),
                index,
                format,
                count,
                texture: self.bound.texture,
                instance,
            },
        });
    }

    fn blit(&mut self, texture: TextureId) {
        self.commands.push(Command {
            target: self.bound.target,
            viewport: self.bound.viewport,
            op: Op::Blit { texture },
        });
    }

    fn surface_size(&self) -> (u32, u32) {
        match &self.output {
            Output::Window { config, .. } => (config.width, config.height),
            Output::Offscreen { color } => color.size,
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        match &mut self.output {
            Output::Window { surface, config } => {
                config.width = width;
                config.height = height;
                surface.configure(&self.device, config);
            }
            Output::Offscreen { color } => {
                *color = Storage::new(
                    &self.device,
                    "headless colour",
                    HEADLESS_FORMAT,
                    wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC,
                    (width, height),
                    1,
                );
            }
        }
        let (depth, msaa) =
            default_attachments(&self.device, self.format, self.sample_count, (width, height));
        self.depth = depth;
        self.msaa = msaa;
        debug!("surface resized to {}x{}", width, height);
    }

    fn surface_format(&self) -> TextureFormat {
        self.format
    }

    fn finish_frame(&mut self) -> anyhow::Result<()> {
        let commands = mem::take(&mut self.commands);
        let instances = mem::take(&mut self.instances);

        let acquired = match &self.output {
            Output::Window { surface, .. } => Some(surface.get_current_texture()),
            Output::Offscreen { .. } => None,
        };
        let (frame, frame_view) = match acquired {
            Some(Ok(frame)) => {
                let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
                (Some(frame), view)
            }
            // Reconfigure the surface if it's lost or outdated
            Some(Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                warn!("surface lost, dropping a frame of {} commands", commands.len());
                self.reconfigure();
                return Ok(());
            }
            Some(Err(wgpu::SurfaceError::Timeout)) => {
                warn!("timed out waiting for a frame");
                return Ok(());
            }
            Some(Err(e)) => return Err(e).context("failed to acquire a frame"),
            None => match &self.output {
                Output::Offscreen { color } => (None, color.view.clone()),
                Output::Window { .. } => return Ok(()),
            },
        };

        let instance_buffer = (!instances.is_empty()).then(|| {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Draw Uniform Buffer"),
                contents: bytemuck::cast_slice(&instances),
                usage: wgpu::BufferUsages::VERTEX,
            })
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Frame Encoder"),
        });
        let mut bind_groups = HashMap::new();
        let mut start = 0;
        while start < commands.len() {
            let target = commands[start].target;
            let end = commands[start..]
                .iter()
                .position(|c| c.target != target)
                .map_or(commands.len(), |n| start + n);
            self.encode_segment(
                &mut encoder,
                &commands[start..end],
                &frame_view,
                instance_buffer.as_ref(),
                &mut bind_groups,
            );
            start = end;
        }
        self.queue.submit(iter::once(encoder.finish()));
        if let Some(frame) = frame {
            frame.present();
        }
        trace!("frame submitted: {} commands, {} draws", commands.len(), instances.len());
        Ok(())
    }

    /// Blocks on the copy. Must not be called from inside an async runtime.
    fn read_pixels(&mut self) -> anyhow::Result<Vec<u8>> {
        let Output::Offscreen { color } = &self.output else {
            bail!("pixels can only be read back from a headless device");
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("failed to start a runtime for the readback")?;
        runtime.block_on(self.read_back(color))
    }
}
