//! Render-to-texture.
//!
//! An [`OffscreenTarget`] owns a framebuffer, a depth renderbuffer and a colour
//! texture. Nothing is allocated until the first [`render_to`](OffscreenTarget::render_to);
//! after that, storage is only reallocated when the requested size changed since the
//! last call.

use log::{debug, warn};

use crate::{
    context::RenderContext,
    data_structures::scene_graph::SceneNode,
    gpu::{
        Color, FramebufferId, GraphicsDevice, RenderTarget, RenderbufferId, TextureDescriptor,
        TextureFormat, TextureId, Viewport,
    },
};

/// The three handles exist together or not at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Handles {
    framebuffer: FramebufferId,
    renderbuffer: RenderbufferId,
    texture: TextureId,
}

#[derive(Debug)]
pub struct OffscreenTarget {
    label: String,
    format: TextureFormat,
    handles: Option<Handles>,
    /// `None` follows the surface size.
    requested: Option<(u32, u32)>,
    allocated: Option<(u32, u32)>,
    border: u32,
    clear_colour: Option<Color>,
}

impl OffscreenTarget {
    pub fn new(label: impl Into<String>, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            format,
            handles: None,
            requested: None,
            allocated: None,
            border: 0,
            clear_colour: None,
        }
    }

    /// Records the size to use from the next [`render_to`](Self::render_to) on.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.requested = Some((width, height));
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.set_size(width, height);
        self
    }

    /// Leaves `border` texels on every edge of the texture unwritten.
    pub fn set_border(&mut self, border: u32) {
        self.border = border;
    }

    /// Overrides the context's clear colour for this target.
    pub fn set_clear_colour(&mut self, colour: Option<Color>) {
        self.clear_colour = colour;
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn border(&self) -> u32 {
        self.border
    }

    pub fn requested_size(&self) -> Option<(u32, u32)> {
        self.requested
    }

    /// The size the storage currently has. `None` before the first render and after
    /// [`release`](Self::release).
    pub fn allocated_size(&self) -> Option<(u32, u32)> {
        self.allocated
    }

    /// The colour texture. Valid until the next size change or release.
    pub fn texture(&self) -> Option<TextureId> {
        self.handles.map(|h| h.texture)
    }

    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.handles.map(|h| h.framebuffer)
    }

    /// The viewport used while rendering into an allocated target.
    pub fn draw_viewport(&self) -> Option<Viewport> {
        self.allocated
            .map(|(width, height)| Viewport::full(width, height).inset(self.border))
    }

    /// Renders `node` into the texture, then rebinds whatever target and viewport were
    /// bound on entry.
    pub fn render_to(
        &mut self,
        ctx: &mut RenderContext,
        node: &dyn SceneNode,
    ) -> anyhow::Result<()> {
        let handles = self.ensure_allocated(ctx)?;
        let Some(viewport) = self.draw_viewport() else {
            anyhow::bail!("offscreen target '{}' has no storage", self.label);
        };
        if viewport.is_empty() {
            warn!(
                "border {} leaves nothing to draw in offscreen target '{}' ({:?})",
                self.border, self.label, self.allocated
            );
        }

        let colour = self.clear_colour.unwrap_or(ctx.clear_colour);
        ctx.with_render_target(RenderTarget::Framebuffer(handles.framebuffer), viewport, |ctx| {
            ctx.clear(Some(colour), Some(1.0));
            node.render(ctx);
        });
        Ok(())
    }

    fn ensure_allocated(&mut self, ctx: &mut RenderContext) -> anyhow::Result<Handles> {
        let size = match self.requested {
            Some(size) => size,
            None => {
                let vp = ctx.surface_viewport();
                (vp.width, vp.height)
            }
        };
        if size.0 == 0 || size.1 == 0 {
            anyhow::bail!("offscreen target '{}' has a zero size {:?}", self.label, size);
        }

        let handles = match self.handles {
            Some(handles) => handles,
            None => {
                let handles = self.create_handles(ctx.device())?;
                self.handles = Some(handles);
                handles
            }
        };

        if self.allocated != Some(size) {
            let device = ctx.device();
            device.texture_storage(handles.texture, size.0, size.1)?;
            device.renderbuffer_storage(handles.renderbuffer, size.0, size.1)?;
            debug!(
                "offscreen target '{}' storage {:?} -> {:?}",
                self.label, self.allocated, size
            );
            self.allocated = Some(size);
        }
        Ok(handles)
    }

    fn create_handles(&self, device: &mut dyn GraphicsDevice) -> anyhow::Result<Handles> {
        let texture = device.create_texture(&TextureDescriptor::new(
            format!("{} Colour", self.label),
            self.format,
        ))?;
        let framebuffer = match device.create_framebuffer(&self.label) {
            Ok(fb) => fb,
            Err(e) => {
                device.delete_texture(texture);
                return Err(e);
            }
        };
        let renderbuffer = match device.create_renderbuffer(&format!("{} Depth", self.label)) {
            Ok(rb) => rb,
            Err(e) => {
                device.delete_framebuffer(framebuffer);
                device.delete_texture(texture);
                return Err(e);
            }
        };
        let handles = Handles {
            framebuffer,
            renderbuffer,
            texture,
        };
        if let Err(e) = device.attach(framebuffer, Some(texture), Some(renderbuffer)) {
            delete_handles(device, handles);
            return Err(e);
        }
        Ok(handles)
    }

    /// Deletes the GPU handles. Safe to call any number of times; the next
    /// [`render_to`](Self::render_to) allocates again.
    pub fn release(&mut self, ctx: &mut RenderContext) {
        if let Some(handles) = self.handles.take() {
            debug!("releasing offscreen target '{}'", self.label);
            delete_handles(ctx.device(), handles);
        }
        self.allocated = None;
    }
}

fn delete_handles(device: &mut dyn GraphicsDevice, handles: Handles) {
    device.delete_framebuffer(handles.framebuffer);
    device.delete_renderbuffer(handles.renderbuffer);
    device.delete_texture(handles.texture);
}

impl Drop for OffscreenTarget {
    fn drop(&mut self) {
        if self.handles.is_some() {
            warn!("offscreen target '{}' dropped without release, its handles leak", self.label);
        }
    }
}
