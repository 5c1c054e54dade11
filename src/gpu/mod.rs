//! The graphics device seam.
//!
//! Everything the engine does to the GPU goes through [`GraphicsDevice`], a small
//! GL-flavoured state machine: handles are created and released explicitly, a render
//! target and a viewport are *bound* and stay bound until somebody rebinds them, and
//! draws read whatever program and buffers are currently bound.
//!
//! Two backends implement it:
//!
//! - [`headless::HeadlessDevice`] keeps the whole state machine on the CPU and counts
//!   allocations, clears and draws. It backs the tests and any tool that wants to drive
//!   the engine without a GPU.
//! - [`wgpu_backend::WgpuDevice`] records one frame worth of commands and replays them
//!   as `wgpu` render passes when the frame is finished.
//!
//! Handles are plain `Copy` ids. The "zero handle" of a GL API is `Option::None` here.

use std::fmt;

pub mod headless;
mod pipeline;
pub mod surface;
pub mod wgpu_backend;

pub use wgpu::{AddressMode, Color, FilterMode, IndexFormat, TextureFormat, VertexFormat};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// A vertex or index buffer.
    BufferId
);
handle!(
    /// A sampled texture, possibly without storage yet.
    TextureId
);
handle!(
    /// A framebuffer object: one colour attachment and one depth attachment.
    FramebufferId
);
handle!(
    /// A depth renderbuffer.
    RenderbufferId
);
handle!(
    /// A compiled shader program.
    ProgramId
);

/// Monotonic id source shared by both backends. Ids start at 1 so that a zeroed id is
/// never valid.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub(crate) fn next(&mut self) -> u32 {
        self.next += 1;
        self.next
    }
}

/// What a draw or clear writes into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    /// The window surface (or the headless stand-in for it).
    #[default]
    Default,
    Framebuffer(FramebufferId),
}

/// A pixel rectangle inside the bound render target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A viewport covering a whole `width` x `height` target.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Shrinks the viewport by `border` pixels on each side. Never goes negative.
    pub fn inset(self, border: u32) -> Self {
        Self {
            x: self.x.saturating_add(border),
            y: self.y.saturating_add(border),
            width: self.width.saturating_sub(border.saturating_mul(2)),
            height: self.height.saturating_sub(border.saturating_mul(2)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// The pair of bound state every pass must hand back untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetState {
    pub target: RenderTarget,
    pub viewport: Viewport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// Sampling setup for a texture. The default is linear filtering with clamp-to-edge
/// wrapping, which is what offscreen targets want.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureDescriptor {
    pub label: String,
    pub format: TextureFormat,
    pub filter: FilterMode,
    pub wrap: AddressMode,
}

impl TextureDescriptor {
    pub fn new(label: impl Into<String>, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            format,
            filter: FilterMode::Linear,
            wrap: AddressMode::ClampToEdge,
        }
    }
}

/// One vertex attribute as the pipeline sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// The layout of an interleaved vertex buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u64,
    pub attributes: Vec<LayoutAttribute>,
}

/// Per-draw matrices. Column-major, ready to be uploaded as they are.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawUniforms {
    pub model: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub light_view_proj: [[f32; 4]; 4],
}

impl Default for DrawUniforms {
    fn default() -> Self {
        let identity = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        Self {
            model: identity,
            view_proj: identity,
            light_view_proj: identity,
        }
    }
}

/// A GL-style immediate state machine.
///
/// All methods are expected to be called from the render thread only. Creation returns
/// `anyhow::Result` because a real device can run out of memory or reject a format;
/// deletion of an unknown handle is a logged no-op so that release paths can be
/// idempotent.
pub trait GraphicsDevice {
    fn create_buffer(
        &mut self,
        kind: BufferKind,
        label: &str,
        data: &[u8],
    ) -> anyhow::Result<BufferId>;
    fn delete_buffer(&mut self, buffer: BufferId);

    /// Creates a texture object without storage. Call [`texture_storage`](Self::texture_storage)
    /// before rendering into or sampling from it.
    fn create_texture(&mut self, desc: &TextureDescriptor) -> anyhow::Result<TextureId>;
    /// (Re)allocates the storage of `texture`. Previous contents are lost.
    fn texture_storage(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, label: &str) -> anyhow::Result<FramebufferId>;
    fn create_renderbuffer(&mut self, label: &str) -> anyhow::Result<RenderbufferId>;
    /// (Re)allocates a depth renderbuffer.
    fn renderbuffer_storage(
        &mut self,
        renderbuffer: RenderbufferId,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()>;
    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        color: Option<TextureId>,
        depth: Option<RenderbufferId>,
    ) -> anyhow::Result<()>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
    fn delete_renderbuffer(&mut self, renderbuffer: RenderbufferId);

    fn bind_render_target(&mut self, target: RenderTarget);
    fn set_viewport(&mut self, viewport: Viewport);
    /// Clears the bound target inside the current viewport.
    fn clear(&mut self, color: Option<Color>, depth: Option<f32>);

    fn use_program(&mut self, program: ProgramId);
    fn bind_vertex_buffer(&mut self, buffer: BufferId, layout: &VertexLayout);
    fn bind_index_buffer(&mut self, buffer: BufferId, format: IndexFormat);
    fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>);
    fn set_draw_uniforms(&mut self, uniforms: &DrawUniforms);
    fn draw_indexed(&mut self, count: u32);
    /// Draws `texture` stretched over the current viewport.
    fn blit(&mut self, texture: TextureId);

    fn surface_size(&self) -> (u32, u32);
    fn resize_surface(&mut self, width: u32, height: u32);
    /// The colour format of the default render target.
    fn surface_format(&self) -> TextureFormat;
    /// Submits everything recorded since the last call.
    fn finish_frame(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tightly packed RGBA8 rows of the default target as of the last finished frame.
    fn read_pixels(&mut self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("this device cannot read back pixels")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inset_shrinks_on_every_side() {
        let vp = Viewport::full(256, 128).inset(2);
        assert_eq!(vp, Viewport::new(2, 2, 252, 124));
    }

    #[test]
    fn inset_saturates_instead_of_wrapping() {
        let vp = Viewport::full(3, 3).inset(2);
        assert_eq!(vp.width, 0);
        assert!(vp.is_empty());
    }

    #[test]
    fn huge_borders_leave_an_empty_viewport() {
        let vp = Viewport::new(10, 20, 640, 480).inset(u32::MAX);
        assert_eq!(vp, Viewport::new(u32::MAX, u32::MAX, 0, 0));
        assert!(vp.is_empty());
        assert!(Viewport::full(640, 480).inset(u32::MAX / 2 + 1).is_empty());
    }

    #[test]
    fn ids_start_at_one() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }
}
