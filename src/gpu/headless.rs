//! A GPU-less [`GraphicsDevice`].
//!
//! `HeadlessDevice` validates handles, tracks the bound target and viewport and keeps
//! counters for everything that would cost GPU time. It is cheap enough to create one
//! per test. Because the device usually ends up boxed inside a
//! [`RenderContext`](crate::context::RenderContext), observation goes through a
//! [`HeadlessProbe`] that shares its state.

use std::{
    cell::{Ref, RefCell},
    collections::HashMap,
    rc::Rc,
};

use log::{trace, warn};

use super::{
    BufferId, BufferKind, Color, DrawUniforms, FramebufferId, GraphicsDevice, IdAllocator,
    IndexFormat, ProgramId, RenderTarget, RenderbufferId, TextureDescriptor, TextureFormat,
    TextureId, VertexLayout, Viewport,
};

/// One recorded device call. Only state changes and work are recorded, not creation.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCall {
    BindTarget(RenderTarget),
    Viewport(Viewport),
    Clear {
        target: RenderTarget,
        viewport: Viewport,
        color: Option<Color>,
        depth: Option<f32>,
    },
    UseProgram(ProgramId),
    Draw {
        target: RenderTarget,
        viewport: Viewport,
        program: Option<ProgramId>,
        count: u32,
        uniforms: DrawUniforms,
    },
    Blit {
        target: RenderTarget,
        viewport: Viewport,
        texture: TextureId,
    },
}

/// Counters kept by the headless device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub buffers_created: usize,
    pub textures_created: usize,
    pub framebuffers_created: usize,
    pub renderbuffers_created: usize,
    /// Calls to `texture_storage`, including the first allocation.
    pub texture_storage_allocations: usize,
    /// Calls to `renderbuffer_storage`, including the first allocation.
    pub renderbuffer_storage_allocations: usize,
    pub deletions: usize,
    pub clears: usize,
    pub draws: usize,
    pub blits: usize,
    pub frames: usize,
}

#[derive(Debug)]
struct TextureState {
    desc: TextureDescriptor,
    size: Option<(u32, u32)>,
}

#[derive(Debug, Default)]
struct FramebufferState {
    color: Option<TextureId>,
    depth: Option<RenderbufferId>,
}

#[derive(Debug)]
struct HeadlessState {
    ids: IdAllocator,
    surface: (u32, u32),
    format: TextureFormat,
    buffers: HashMap<BufferId, (BufferKind, usize)>,
    textures: HashMap<TextureId, TextureState>,
    framebuffers: HashMap<FramebufferId, FramebufferState>,
    renderbuffers: HashMap<RenderbufferId, Option<(u32, u32)>>,
    programs: HashMap<ProgramId, String>,
    target: RenderTarget,
    viewport: Viewport,
    program: Option<ProgramId>,
    textures_bound: HashMap<u32, TextureId>,
    uniforms: DrawUniforms,
    counters: DeviceCounters,
    calls: Vec<DeviceCall>,
    // index in `calls` where the frame in progress starts
    frame_start: usize,
}

/// Read access to a [`HeadlessDevice`] that outlives moving the device into a context.
#[derive(Clone, Debug)]
pub struct HeadlessProbe {
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessProbe {
    pub fn counters(&self) -> DeviceCounters {
        self.state.borrow().counters.clone()
    }

    /// Calls of the last finished frame followed by those of the frame in progress.
    pub fn calls(&self) -> Ref<'_, Vec<DeviceCall>> {
        Ref::map(self.state.borrow(), |s| &s.calls)
    }

    pub fn clear_calls(&self) {
        let mut s = self.state.borrow_mut();
        s.calls.clear();
        s.frame_start = 0;
    }

    pub fn bound_target(&self) -> RenderTarget {
        self.state.borrow().target
    }

    pub fn viewport(&self) -> Viewport {
        self.state.borrow().viewport
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.state.borrow().textures.get(&texture).and_then(|t| t.size)
    }

    pub fn texture_descriptor(&self, texture: TextureId) -> Option<TextureDescriptor> {
        self.state
            .borrow()
            .textures
            .get(&texture)
            .map(|t| t.desc.clone())
    }

    pub fn renderbuffer_size(&self, renderbuffer: RenderbufferId) -> Option<(u32, u32)> {
        self.state
            .borrow()
            .renderbuffers
            .get(&renderbuffer)
            .copied()
            .flatten()
    }

    /// Handles that were created and not deleted yet.
    pub fn live_handles(&self) -> usize {
        let s = self.state.borrow();
        s.buffers.len() + s.textures.len() + s.framebuffers.len() + s.renderbuffers.len()
    }

    pub fn is_live_texture(&self, texture: TextureId) -> bool {
        self.state.borrow().textures.contains_key(&texture)
    }

    pub fn is_live_framebuffer(&self, framebuffer: FramebufferId) -> bool {
        self.state.borrow().framebuffers.contains_key(&framebuffer)
    }

    pub fn is_live_buffer(&self, buffer: BufferId) -> bool {
        self.state.borrow().buffers.contains_key(&buffer)
    }

    /// Draws recorded so far, in call order.
    pub fn draws(&self) -> Vec<DeviceCall> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| matches!(call, DeviceCall::Draw { .. }))
            .cloned()
            .collect()
    }
}

/// See the [module documentation](self).
#[derive(Debug)]
pub struct HeadlessDevice {
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32) -> Self {
        let state = HeadlessState {
            ids: IdAllocator::default(),
            surface: (width, height),
            format: TextureFormat::Rgba8UnormSrgb,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            renderbuffers: HashMap::new(),
            programs: HashMap::new(),
            target: RenderTarget::Default,
            viewport: Viewport::full(width, height),
            program: None,
            textures_bound: HashMap::new(),
            uniforms: DrawUniforms::default(),
            counters: DeviceCounters::default(),
            calls: Vec::new(),
            frame_start: 0,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: self.state.clone(),
        }
    }

    /// Registers a program. Headless programs carry nothing but their label.
    pub fn create_program(&mut self, label: &str) -> ProgramId {
        let mut s = self.state.borrow_mut();
        let id = ProgramId(s.ids.next());
        s.programs.insert(id, label.to_string());
        id
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn create_buffer(
        &mut self,
        kind: BufferKind,
        label: &str,
        data: &[u8],
    ) -> anyhow::Result<BufferId> {
        let mut s = self.state.borrow_mut();
        let id = BufferId(s.ids.next());
        s.buffers.insert(id, (kind, data.len()));
        s.counters.buffers_created += 1;
        trace!("created {:?} buffer {} '{}' ({} bytes)", kind, id, label, data.len());
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        let mut s = self.state.borrow_mut();
        if s.buffers.remove(&buffer).is_some() {
            s.counters.deletions += 1;
        } else {
            warn!("delete of unknown buffer {}", buffer);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> anyhow::Result<TextureId> {
        let mut s = self.state.borrow_mut();
        let id = TextureId(s.ids.next());
        s.textures.insert(
            id,
            TextureState {
                desc: desc.clone(),
                size: None,
            },
        );
        s.counters.textures_created += 1;
        Ok(id)
    }

    fn texture_storage(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let mut s = self.state.borrow_mut();
        match s.textures.get_mut(&texture) {
            Some(t) => t.size = Some((width, height)),
            None => anyhow::bail!("texture_storage on unknown texture {}", texture),
        }
        s.counters.texture_storage_allocations += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        let mut s = self.state.borrow_mut();
        if s.textures.remove(&texture).is_some() {
            s.counters.deletions += 1;
            s.textures_bound.retain(|_, bound| *bound != texture);
        } else {
            warn!("delete of unknown texture {}", texture);
        }
    }

    fn create_framebuffer(&mut self, _label: &str) -> anyhow::Result<FramebufferId> {
        let mut s = self.state.borrow_mut();
        let id = FramebufferId(s.ids.next());
        s.framebuffers.insert(id, FramebufferState::default());
        s.counters.framebuffers_created += 1;
        Ok(id)
    }

    fn create_renderbuffer(&mut self, _label: &str) -> anyhow::Result<RenderbufferId> {
        let mut s = self.state.borrow_mut();
        let id = RenderbufferId(s.ids.next());
        s.renderbuffers.insert(id, None);
        s.counters.renderbuffers_created += 1;
        Ok(id)
    }

    fn renderbuffer_storage(
        &mut self,
        renderbuffer: RenderbufferId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let mut s = self.state.borrow_mut();
        match s.renderbuffers.get_mut(&renderbuffer) {
            Some(size) => *size = Some((width, height)),
            None => anyhow::bail!("renderbuffer_storage on unknown renderbuffer {}", renderbuffer),
        }
        s.counters.renderbuffer_storage_allocations += 1;
        Ok(())
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        color: Option<TextureId>,
        depth: Option<RenderbufferId>,
    ) -> anyhow::Result<()> {
        let mut s = self.state.borrow_mut();
        if let Some(color) = color {
            anyhow::ensure!(s.textures.contains_key(&color), "attach of unknown texture {}", color);
        }
        if let Some(depth) = depth {
            anyhow::ensure!(
                s.renderbuffers.contains_key(&depth),
                "attach of unknown renderbuffer {}",
                depth
            );
        }
        let fb = s
            .framebuffers
            .get_mut(&framebuffer)
            .ok_or_else(|| anyhow::anyhow!("attach to unknown framebuffer {}", framebuffer))?;
        fb.color = color;
        fb.depth = depth;
        Ok(())
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        let mut s = self.state.borrow_mut();
        if s.framebuffers.remove(&framebuffer).is_some() {
            s.counters.deletions += 1;
            if s.target == RenderTarget::Framebuffer(framebuffer) {
                warn!(
                    "deleted the bound framebuffer {}, falling back to the default target",
                    framebuffer
                );
                s.target = RenderTarget::Default;
            }
        } else {
            warn!("delete of unknown framebuffer {}", framebuffer);
        }
    }

    fn delete_renderbuffer(&mut self, renderbuffer: RenderbufferId) {
        let mut s = self.state.borrow_mut();
        if s.renderbuffers.remove(&renderbuffer).is_some() {
            s.counters.deletions += 1;
        } else {
            warn!("delete of unknown renderbuffer {}", renderbuffer);
        }
    }

    fn bind_render_target(&mut self, target: RenderTarget) {
        let mut s = self.state.borrow_mut();
        if let RenderTarget::Framebuffer(fb) = target {
            if !s.framebuffers.contains_key(&fb) {
                warn!("binding unknown framebuffer {}", fb);
            }
        }
        s.target = target;
        s.calls.push(DeviceCall::BindTarget(target));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let mut s = self.state.borrow_mut();
        s.viewport = viewport;
        s.calls.push(DeviceCall::Viewport(viewport));
    }

    fn clear(&mut self, color: Option<Color>, depth: Option<f32>) {
        let mut s = self.state.borrow_mut();
        s.counters.clears += 1;
        let (target, viewport) = (s.target, s.viewport);
        s.calls.push(DeviceCall::Clear {
            target,
            viewport,
            color,
            depth,
        });
    }

    fn use_program(&mut self, program: ProgramId) {
        let mut s = self.state.borrow_mut();
        if !s.programs.contains_key(&program) {
            warn!("using unknown program {}", program);
        }
        s.program = Some(program);
        s.calls.push(DeviceCall::UseProgram(program));
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferId, _layout: &VertexLayout) {
        if !self.state.borrow().buffers.contains_key(&buffer) {
            warn!("binding unknown vertex buffer {}", buffer);
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferId, _format: IndexFormat) {
        if !self.state.borrow().buffers.contains_key(&buffer) {
            warn!("binding unknown index buffer {}", buffer);
        }
    }

    fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>) {
        let mut s = self.state.borrow_mut();
        match texture {
            Some(texture) => {
                s.textures_bound.insert(slot, texture);
            }
            None => {
                s.textures_bound.remove(&slot);
            }
        }
    }

    fn set_draw_uniforms(&mut self, uniforms: &DrawUniforms) {
        self.state.borrow_mut().uniforms = *uniforms;
    }

    fn draw_indexed(&mut self, count: u32) {
        let mut s = self.state.borrow_mut();
        s.counters.draws += 1;
        let call = DeviceCall::Draw {
            target: s.target,
            viewport: s.viewport,
            program: s.program,
            count,
            uniforms: s.uniforms,
        };
        s.calls.push(call);
    }

    fn blit(&mut self, texture: TextureId) {
        let mut s = self.state.borrow_mut();
        if !s.textures.contains_key(&texture) {
            warn!("blit of unknown texture {}", texture);
        }
        s.counters.blits += 1;
        let (target, viewport) = (s.target, s.viewport);
        s.calls.push(DeviceCall::Blit {
            target,
            viewport,
            texture,
        });
    }

    fn surface_size(&self) -> (u32, u32) {
        self.state.borrow().surface
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.state.borrow_mut().surface = (width, height);
    }

    fn surface_format(&self) -> TextureFormat {
        self.state.borrow().format
    }

    fn finish_frame(&mut self) -> anyhow::Result<()> {
        let mut s = self.state.borrow_mut();
        s.counters.frames += 1;
        // keep one finished frame around for inspection
        let start = s.frame_start;
        s.calls.drain(..start);
        s.frame_start = s.calls.len();
        Ok(())
    }
}
