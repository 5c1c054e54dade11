use crate::{data_structures::scene_graph::SceneNode, engine::Engine, render::RenderPass};

/// Draws the engine's scene into the bound target.
///
/// The usual main pass. It does not rebind anything, so it renders wherever the pass
/// before it left the context (normally the surface).
#[derive(Debug, Clone)]
pub struct ScenePass {
    label: String,
    clear: bool,
}

impl ScenePass {
    pub fn new() -> Self {
        Self {
            label: "scene".to_string(),
            clear: true,
        }
    }

    /// Keeps whatever is already in the target, e.g. when layering two scene passes.
    pub fn without_clear(mut self) -> Self {
        self.clear = false;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Default for ScenePass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for ScenePass {
    fn label(&self) -> &str {
        &self.label
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        let (ctx, scene) = engine.context_and_scene();
        if self.clear {
            let colour = ctx.clear_colour;
            ctx.clear(Some(colour), Some(1.0));
        }
        scene.render(ctx);
        Ok(())
    }
}
