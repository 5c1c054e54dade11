//! The engine: one render context, one scene, an ordered list of passes and the
//! physics bridge, driven one frame at a time.
//!
//! A frame is
//! 1. [`EngineListener::on_render_frame`]
//! 2. inline physics step (if a stepper is attached and not threaded)
//! 3. [`PhysicsBridge::synchronize`]
//! 4. every [`RenderPass`] in list order
//! 5. [`GraphicsDevice::finish_frame`](crate::gpu::GraphicsDevice::finish_frame)

use std::mem;

use instant::{Duration, Instant};
use log::{debug, info, warn};

use crate::{
    config::EngineConfig,
    context::{FrameStats, RenderContext},
    data_structures::scene_graph::Group,
    gpu::GraphicsDevice,
    physics::{Clock, PhysicsBridge, PhysicsWorld, SharedStepper},
    render::{self, RenderPass},
};

/// Application hooks.
pub trait EngineListener {
    /// Called once after the graphics device exists. Build the scene and the pass list
    /// here. An error aborts loading and is handed back to whoever called
    /// [`Engine::load`].
    fn on_load_scene(&mut self, engine: &mut Engine) -> anyhow::Result<()>;

    /// Called at the start of every frame, before physics and passes.
    fn on_render_frame(&mut self, _engine: &mut Engine, _dt: Duration) {}

    /// Called right before the first main-stage pass of a frame.
    fn on_render_main_pass(&mut self, _engine: &mut Engine) {}

    /// Called after the surface changed size.
    fn on_surface_changed(&mut self, _engine: &mut Engine, _width: u32, _height: u32) {}
}

pub struct Engine {
    ctx: RenderContext,
    scene: Group,
    passes: Vec<Box<dyn RenderPass>>,
    physics: PhysicsBridge,
    config: EngineConfig,
    last_frame: Option<Instant>,
    loaded: bool,
}

impl Engine {
    pub fn new(device: Box<dyn GraphicsDevice>, config: EngineConfig) -> Self {
        let mut ctx = RenderContext::new(device);
        ctx.clear_colour = config.clear_colour;
        Self {
            ctx,
            scene: Group::new("root"),
            passes: Vec::new(),
            physics: PhysicsBridge::new(),
            config,
            last_frame: None,
            loaded: false,
        }
    }

    /// Lets `listener` build the scene. Only the first call does anything.
    pub fn load(&mut self, listener: &mut dyn EngineListener) -> anyhow::Result<()> {
        if self.loaded {
            warn!("scene already loaded, ignoring load");
            return Ok(());
        }
        listener.on_load_scene(self)?;
        self.loaded = true;
        info!(
            "scene loaded: {} top-level nodes, {} passes, {} bodies",
            self.scene.len(),
            self.passes.len(),
            self.physics.body_count()
        );
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Renders one frame, timing it against the previous call.
    pub fn frame(&mut self, listener: &mut dyn EngineListener) -> anyhow::Result<FrameStats> {
        let now = Instant::now();
        let dt = self
            .last_frame
            .replace(now)
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.frame_with_dt(listener, dt)
    }

    /// Renders one frame with an explicit `dt` for the listener.
    pub fn frame_with_dt(
        &mut self,
        listener: &mut dyn EngineListener,
        dt: Duration,
    ) -> anyhow::Result<FrameStats> {
        self.ctx.begin_frame();
        self.ctx.clear_colour = self.config.clear_colour;

        listener.on_render_frame(self, dt);

        self.physics.step();
        self.physics.synchronize();

        let mut passes = mem::take(&mut self.passes);
        render::run_passes(self, &mut passes, listener);
        // passes added during the frame run from the next frame on
        passes.append(&mut self.passes);
        self.passes = passes;

        self.ctx.device().finish_frame()?;
        Ok(self.ctx.stats().clone())
    }

    /// Resizes the surface and tells the listener. Zero sizes (minimised windows) are
    /// ignored.
    pub fn resize(&mut self, listener: &mut dyn EngineListener, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("ignoring resize to {}x{}", width, height);
            return;
        }
        self.ctx.resize(width, height);
        listener.on_surface_changed(self, width, height);
    }

    /// Releases every GPU handle held by the scene and the passes and stops physics.
    /// Safe to call more than once; also runs on drop.
    pub fn teardown(&mut self) {
        self.physics.detach();
        self.scene.clear(&mut self.ctx);
        for pass in &mut self.passes {
            pass.release(&mut self.ctx);
        }
        self.passes.clear();
        self.ctx.set_shadow_map(None);
        self.loaded = false;
    }

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }

    pub fn scene(&self) -> &Group {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Group {
        &mut self.scene
    }

    /// The context and the scene at once, for passes that render the scene.
    pub fn context_and_scene(&mut self) -> (&mut RenderContext, &Group) {
        (&mut self.ctx, &self.scene)
    }

    /// The device and the scene at once, for building meshes straight into the tree.
    pub fn device_and_scene(&mut self) -> (&mut dyn GraphicsDevice, &mut Group) {
        (self.ctx.device(), &mut self.scene)
    }

    pub fn add_pass(&mut self, pass: Box<dyn RenderPass>) {
        self.passes.push(pass);
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Releases and removes every pass.
    pub fn clear_passes(&mut self) {
        for pass in &mut self.passes {
            pass.release(&mut self.ctx);
        }
        self.passes.clear();
    }

    /// Attaches `stepper` to the bridge using the configured physics mode.
    pub fn attach_physics<W, C>(&mut self, stepper: SharedStepper<W, C>) -> anyhow::Result<()>
    where
        W: PhysicsWorld + 'static,
        C: Clock + 'static,
    {
        self.physics.attach(stepper, &self.config.physics)
    }

    pub fn physics(&self) -> &PhysicsBridge {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut PhysicsBridge {
        &mut self.physics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
