//! Render pass composition.
//!
//! A frame is an ordered list of [`RenderPass`]es. Each pass gets the whole
//! [`Engine`] and may bind any target it likes, but it must hand the render target and
//! viewport back exactly as it found them. The driver checks that after every pass and
//! repairs (and reports) any pass that does not.
//!
//! Order is whatever the caller put in the list. The driver never reorders; a pre-pass
//! listed after the main pass simply runs late, with a warning.

use std::fmt;

use log::{error, trace, warn};

use crate::{
    context::RenderContext,
    engine::{Engine, EngineListener},
};

/// Where a pass sits in the frame: `Pre` passes produce inputs (shadow maps), `Main`
/// passes draw the visible frame, `Post` passes work on the result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PassStage {
    Pre,
    #[default]
    Main,
    Post,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassStage::Pre => write!(f, "pre"),
            PassStage::Main => write!(f, "main"),
            PassStage::Post => write!(f, "post"),
        }
    }
}

pub trait RenderPass {
    fn stage(&self) -> PassStage {
        PassStage::Main
    }

    fn label(&self) -> &str {
        "pass"
    }

    /// Runs the pass for one frame.
    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()>;

    /// Deletes the GPU handles the pass owns. Must be idempotent.
    fn release(&mut self, _ctx: &mut RenderContext) {}
}

/// Runs `passes` in order against `engine`.
///
/// `on_render_main_pass` fires once, right before the first `Main` pass.
pub(crate) fn run_passes(
    engine: &mut Engine,
    passes: &mut [Box<dyn RenderPass>],
    listener: &mut dyn EngineListener,
) {
    let mut last_stage = PassStage::Pre;
    let mut main_announced = false;

    for pass in passes.iter_mut() {
        let stage = pass.stage();
        if stage < last_stage {
            warn!(
                "{} pass '{}' runs after a {} pass, check the pass order",
                stage,
                pass.label(),
                last_stage
            );
        }
        last_stage = stage;

        if stage == PassStage::Main && !main_announced {
            main_announced = true;
            listener.on_render_main_pass(engine);
        }

        let entry = engine.context().target_state();
        trace!("running {} pass '{}'", stage, pass.label());
        let result = pass.render(engine);

        let ctx = engine.context_mut();
        ctx.stats_mut().passes_run += 1;
        if let Err(e) = result {
            error!("render pass '{}' failed: {:#}", pass.label(), e);
            ctx.stats_mut().failed_passes += 1;
        }
        let exit = ctx.target_state();
        if exit != entry {
            error!(
                "render pass '{}' leaked state: entered with {:?}, left with {:?}; restoring",
                pass.label(),
                entry,
                exit
            );
            ctx.restore_target_state(entry);
            ctx.stats_mut().leaks_repaired += 1;
        }
    }
}
