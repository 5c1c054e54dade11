//! The graphics state shared by every render call.
//!
//! There is exactly one [`RenderContext`] per engine. It owns the graphics device and
//! mirrors the state that matters for composition: the bound render target, the
//! viewport, the current model transform, the active camera and the active shader.
//! Nodes and passes get it passed by `&mut` and must hand it back the way they found
//! it; the `with_*` helpers do the save/install/restore dance for them.

use std::rc::Rc;

use cgmath::{Matrix4, SquareMatrix};

use crate::{
    camera::Camera,
    data_structures::transform::Transform,
    gpu::{Color, DrawUniforms, GraphicsDevice, RenderTarget, TargetState, TextureId, Viewport},
    shader::Shader,
};

/// A depth texture left behind by a shadow pre-pass, read by reference in later passes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowMap {
    pub texture: TextureId,
    pub light_view_proj: Matrix4<f32>,
}

/// Counters reset at the start of every frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draws: usize,
    /// Draws skipped because a mesh had nothing to draw with.
    pub skipped_draws: usize,
    pub passes_run: usize,
    pub failed_passes: usize,
    /// Passes that returned with a different target or viewport and had to be restored.
    pub leaks_repaired: usize,
}

pub struct RenderContext {
    device: Box<dyn GraphicsDevice>,
    state: TargetState,
    pub clear_colour: Color,
    camera: Camera,
    transform: Transform,
    shader: Option<Rc<dyn Shader>>,
    shader_override: Option<Rc<dyn Shader>>,
    shadow_map: Option<ShadowMap>,
    stats: FrameStats,
}

impl RenderContext {
    /// Takes ownership of `device` and binds the default target over the whole surface.
    pub fn new(device: Box<dyn GraphicsDevice>) -> Self {
        let (width, height) = device.surface_size();
        let mut ctx = Self {
            device,
            state: TargetState::default(),
            clear_colour: Color::BLACK,
            camera: Camera::default(),
            transform: Transform::identity(),
            shader: None,
            shader_override: None,
            shadow_map: None,
            stats: FrameStats::default(),
        };
        ctx.camera.set_aspect(Viewport::full(width, height).aspect());
        ctx.restore_target_state(TargetState {
            target: RenderTarget::Default,
            viewport: Viewport::full(width, height),
        });
        ctx
    }

    pub fn device(&mut self) -> &mut dyn GraphicsDevice {
        &mut *self.device
    }

    pub fn device_ref(&self) -> &dyn GraphicsDevice {
        &*self.device
    }

    /* -------------------- target & viewport -------------------- */

    pub fn render_target(&self) -> RenderTarget {
        self.state.target
    }

    pub fn viewport(&self) -> Viewport {
        self.state.viewport
    }

    pub fn target_state(&self) -> TargetState {
        self.state
    }

    pub fn bind_render_target(&mut self, target: RenderTarget) {
        self.state.target = target;
        self.device.bind_render_target(target);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = viewport;
        self.device.set_viewport(viewport);
    }

    /// Rebinds a previously saved target and viewport.
    pub fn restore_target_state(&mut self, state: TargetState) {
        self.bind_render_target(state.target);
        self.set_viewport(state.viewport);
    }

    /// Runs `f` with `target` and `viewport` bound, then rebinds whatever was bound before.
    /// The previous state is restored whatever `f` returns, errors included. A full-surface
    /// viewport on the default target follows a resize that happened inside `f`.
    pub fn with_render_target<R>(
        &mut self,
        target: RenderTarget,
        viewport: Viewport,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let mut saved = self.state;
        let surface = self.surface_viewport();
        self.bind_render_target(target);
        self.set_viewport(viewport);
        let result = f(self);
        if saved.target == RenderTarget::Default && saved.viewport == surface {
            saved.viewport = self.surface_viewport();
        }
        self.restore_target_state(saved);
        result
    }

    /// Clears the bound target inside the current viewport.
    pub fn clear(&mut self, color: Option<Color>, depth: Option<f32>) {
        self.device.clear(color, depth);
    }

    pub fn surface_viewport(&self) -> Viewport {
        let (width, height) = self.device.surface_size();
        Viewport::full(width, height)
    }

    /// Resizes the default target. If it is bound, the viewport follows.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.device.resize_surface(width, height);
        let full = Viewport::full(width, height);
        self.camera.set_aspect(full.aspect());
        if self.state.target == RenderTarget::Default {
            self.set_viewport(full);
        }
    }

    /* -------------------- transform -------------------- */

    /// The model transform currently in effect.
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Composes `local` onto the current transform for the duration of `f`.
    pub fn with_transform<R>(&mut self, local: &Transform, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.transform;
        self.transform = saved.then(local);
        let result = f(self);
        self.transform = saved;
        result
    }

    /* -------------------- camera -------------------- */

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Installs `camera` and returns the one it replaced.
    pub fn set_camera(&mut self, camera: Camera) -> Camera {
        std::mem::replace(&mut self.camera, camera)
    }

    /* -------------------- shaders & textures -------------------- */

    /// Binds `shader` and makes it the active one.
    pub fn use_shader(&mut self, shader: Rc<dyn Shader>) {
        shader.bind(self);
        self.shader = Some(shader);
    }

    /// The shader bound most recently in this frame, if any.
    pub fn active_shader(&self) -> Option<&Rc<dyn Shader>> {
        self.shader.as_ref()
    }

    /// A shader that replaces every mesh's own shader, e.g. a depth-only program.
    pub fn shader_override(&self) -> Option<&Rc<dyn Shader>> {
        self.shader_override.as_ref()
    }

    pub fn with_shader_override<R>(
        &mut self,
        shader: Option<Rc<dyn Shader>>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let saved = std::mem::replace(&mut self.shader_override, shader);
        let result = f(self);
        self.shader_override = saved;
        result
    }

    pub fn bind_texture(&mut self, slot: u32, texture: Option<TextureId>) {
        self.device.bind_texture(slot, texture);
    }

    pub fn shadow_map(&self) -> Option<&ShadowMap> {
        self.shadow_map.as_ref()
    }

    pub fn set_shadow_map(&mut self, shadow_map: Option<ShadowMap>) {
        self.shadow_map = shadow_map;
    }

    /// Matrices for a draw issued right now.
    pub fn draw_uniforms(&self) -> DrawUniforms {
        let light = self
            .shadow_map
            .map(|s| s.light_view_proj)
            .unwrap_or_else(Matrix4::identity);
        DrawUniforms {
            model: self.transform.to_cols_array(),
            view_proj: self.camera.view_proj().into(),
            light_view_proj: light.into(),
        }
    }

    /* -------------------- bookkeeping -------------------- */

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut FrameStats {
        &mut self.stats
    }

    /// Resets per-frame state. The bound target and viewport carry over.
    pub(crate) fn begin_frame(&mut self) {
        self.stats = FrameStats::default();
        self.shader = None;
        self.transform = Transform::identity();
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("state", &self.state)
            .field("clear_colour", &self.clear_colour)
            .field("camera", &self.camera)
            .field("transform", &self.transform)
            .field("shadow_map", &self.shadow_map)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn ctx() -> (RenderContext, crate::gpu::headless::HeadlessProbe) {
        let device = HeadlessDevice::new(320, 240);
        let probe = device.probe();
        (RenderContext::new(Box::new(device)), probe)
    }

    #[test]
    fn starts_on_the_default_target_with_a_full_viewport() {
        let (ctx, probe) = ctx();
        assert_eq!(ctx.render_target(), RenderTarget::Default);
        assert_eq!(ctx.viewport(), Viewport::full(320, 240));
        assert_eq!(probe.viewport(), Viewport::full(320, 240));
    }

    #[test]
    fn with_render_target_restores_even_on_error() {
        let (mut ctx, probe) = ctx();
        let fb = ctx.device().create_framebuffer("fb").unwrap();
        let before = ctx.target_state();
        let result: anyhow::Result<()> =
            ctx.with_render_target(RenderTarget::Framebuffer(fb), Viewport::full(16, 16), |ctx| {
                assert_eq!(ctx.render_target(), RenderTarget::Framebuffer(fb));
                anyhow::bail!("boom")
            });
        assert!(result.is_err());
        assert_eq!(ctx.target_state(), before);
        assert_eq!(probe.bound_target(), RenderTarget::Default);
    }

    #[test]
    fn with_transform_pops_what_it_pushed() {
        let (mut ctx, _) = ctx();
        let local = Transform::from_translation([1.0, 0.0, 0.0]);
        ctx.with_transform(&local, |ctx| {
            ctx.with_transform(&local, |ctx| {
                assert_eq!(ctx.transform().position().x, 2.0);
            });
            assert_eq!(ctx.transform().position().x, 1.0);
        });
        assert_eq!(ctx.transform(), Transform::identity());
    }

    #[test]
    fn resize_moves_the_viewport_only_on_the_default_target() {
        let (mut ctx, _) = ctx();
        ctx.resize(640, 480);
        assert_eq!(ctx.viewport(), Viewport::full(640, 480));

        let fb = ctx.device().create_framebuffer("fb").unwrap();
        ctx.with_render_target(RenderTarget::Framebuffer(fb), Viewport::full(8, 8), |ctx| {
            ctx.resize(100, 100);
            assert_eq!(ctx.viewport(), Viewport::full(8, 8));
        });
        assert_eq!(ctx.render_target(), RenderTarget::Default);
        assert_eq!(ctx.viewport(), Viewport::full(100, 100));
    }

    #[test]
    fn a_custom_default_viewport_survives_a_nested_resize() {
        let (mut ctx, probe) = ctx();
        ctx.resize(640, 480);
        let corner = Viewport::new(0, 0, 320, 240);
        ctx.set_viewport(corner);

        let fb = ctx.device().create_framebuffer("fb").unwrap();
        ctx.with_render_target(RenderTarget::Framebuffer(fb), Viewport::full(8, 8), |ctx| {
            ctx.resize(100, 100);
        });
        assert_eq!(ctx.viewport(), corner);
        assert_eq!(probe.viewport(), corner);

        // an offscreen target nested in another keeps the outer viewport as well
        let outer = ctx.device().create_framebuffer("outer").unwrap();
        let outer_vp = Viewport::full(100, 100);
        ctx.with_render_target(RenderTarget::Framebuffer(outer), outer_vp, |ctx| {
            ctx.with_render_target(RenderTarget::Framebuffer(fb), Viewport::full(8, 8), |ctx| {
                ctx.resize(50, 50);
            });
            assert_eq!(ctx.viewport(), outer_vp);
        });
    }
}
