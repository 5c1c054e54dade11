//! Shadow map pre-pass.
//!
//! Renders the scene from a light's camera into an offscreen target and publishes the
//! result as the context's [`ShadowMap`]. Later passes sample it by handle; nothing is
//! copied. The light camera is only installed for the duration of the pass.

use std::rc::Rc;

use crate::{
    camera::Camera,
    context::{RenderContext, ShadowMap},
    engine::Engine,
    gpu::{Color, TextureFormat},
    offscreen::OffscreenTarget,
    render::{PassStage, RenderPass},
    shader::Shader,
};

/// Depth is written to the red channel, so a float format that can be filtered.
pub const SHADOW_MAP_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

pub struct ShadowPass {
    light: Camera,
    depth_shader: Option<Rc<dyn Shader>>,
    target: OffscreenTarget,
}

impl ShadowPass {
    /// A square shadow map of `resolution` texels seen from `light`.
    pub fn new(light: Camera, resolution: u32) -> Self {
        let mut target =
            OffscreenTarget::new("shadow map", SHADOW_MAP_FORMAT).with_size(resolution, resolution);
        // the far plane
        target.set_clear_colour(Some(Color::WHITE));
        Self {
            light,
            depth_shader: None,
            target,
        }
    }

    /// Draws every mesh with `shader` instead of its own one.
    pub fn with_depth_shader(mut self, shader: Rc<dyn Shader>) -> Self {
        self.depth_shader = Some(shader);
        self
    }

    /// Keeps a texel-wide ring around the map untouched, so clamped lookups outside
    /// the light frustum read "far".
    pub fn with_border(mut self, border: u32) -> Self {
        self.target.set_border(border);
        self
    }

    pub fn light(&self) -> &Camera {
        &self.light
    }

    pub fn set_light(&mut self, light: Camera) {
        self.light = light;
    }

    pub fn set_resolution(&mut self, resolution: u32) {
        self.target.set_size(resolution, resolution);
    }

    pub fn target(&self) -> &OffscreenTarget {
        &self.target
    }
}

impl RenderPass for ShadowPass {
    fn stage(&self) -> PassStage {
        PassStage::Pre
    }

    fn label(&self) -> &str {
        "shadow"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        let (ctx, scene) = engine.context_and_scene();

        let previous = ctx.set_camera(self.light);
        let target = &mut self.target;
        let result = ctx.with_shader_override(self.depth_shader.clone(), |ctx| {
            target.render_to(ctx, scene)
        });
        ctx.set_camera(previous);

        match (result, self.target.texture()) {
            (Ok(()), Some(texture)) => {
                ctx.set_shadow_map(Some(ShadowMap {
                    texture,
                    light_view_proj: self.light.view_proj(),
                }));
                Ok(())
            }
            (Ok(()), None) => {
                ctx.set_shadow_map(None);
                anyhow::bail!("shadow target has no texture after rendering")
            }
            (Err(e), _) => {
                ctx.set_shadow_map(None);
                Err(e)
            }
        }
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        if ctx
            .shadow_map()
            .is_some_and(|map| Some(map.texture) == self.target.texture())
        {
            ctx.set_shadow_map(None);
        }
        self.target.release(ctx);
    }
}
