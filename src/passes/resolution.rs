//! Render at a fraction of the viewport, then stretch the result back over it.

use log::debug;

use crate::{
    context::RenderContext,
    engine::Engine,
    gpu::TextureFormat,
    offscreen::OffscreenTarget,
    render::{PassStage, RenderPass},
};

pub struct ResolutionScalePass {
    scale: f32,
    stage: PassStage,
    target: OffscreenTarget,
}

impl ResolutionScalePass {
    /// `scale` is clamped to `(0, 1]`.
    pub fn new(scale: f32, format: TextureFormat) -> Self {
        Self {
            scale: clamp_scale(scale),
            stage: PassStage::Main,
            target: OffscreenTarget::new("resolution scale", format),
        }
    }

    pub fn with_stage(mut self, stage: PassStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = clamp_scale(scale);
    }

    pub fn target(&self) -> &OffscreenTarget {
        &self.target
    }

    /// The size the scene is rendered at for a `width` x `height` viewport.
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = |v: u32| ((v as f32 * self.scale).round() as u32).max(1);
        (scale(width), scale(height))
    }
}

fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale.min(1.0)
    } else {
        1.0
    }
}

impl RenderPass for ResolutionScalePass {
    fn stage(&self) -> PassStage {
        self.stage
    }

    fn label(&self) -> &str {
        "resolution scale"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        let (ctx, scene) = engine.context_and_scene();
        let viewport = ctx.viewport();
        let (width, height) = self.scaled_size(viewport.width, viewport.height);
        if self.target.requested_size() != Some((width, height)) {
            debug!(
                "resolution scale {} renders {}x{} for a {}x{} viewport",
                self.scale, width, height, viewport.width, viewport.height
            );
            self.target.set_size(width, height);
        }

        self.target.render_to(ctx, scene)?;
        match self.target.texture() {
            Some(texture) => {
                ctx.device().blit(texture);
                Ok(())
            }
            None => anyhow::bail!("resolution scale target has no texture after rendering"),
        }
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.target.release(ctx);
    }
}
