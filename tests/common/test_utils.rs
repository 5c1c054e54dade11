use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex},
};

use instant::{Duration, Instant};
use scenic_bridge::{
    Engine, EngineConfig, EngineListener, RenderContext, SceneNode, Transform,
    data_structures::{geometry::Geometry, mesh::Mesh},
    gpu::{
        ProgramId, RenderTarget, TargetState, Viewport,
        headless::{HeadlessDevice, HeadlessProbe},
    },
    physics::{BodyHandle, Clock, PhysicsWorld},
    render::RenderPass,
    shader::{ProgramShader, Shader},
};

pub(crate) const WIDTH: u32 = 320;
pub(crate) const HEIGHT: u32 = 240;

/// A headless engine plus a probe into its device and two ready-made programs.
pub(crate) struct Harness {
    pub(crate) engine: Engine,
    pub(crate) probe: HeadlessProbe,
    pub(crate) program: ProgramId,
    pub(crate) depth_program: ProgramId,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub(crate) fn with_config(config: EngineConfig) -> Self {
        let mut device = HeadlessDevice::new(WIDTH, HEIGHT);
        let program = device.create_program("flat");
        let depth_program = device.create_program("depth");
        let probe = device.probe();
        Self {
            engine: Engine::new(Box::new(device), config),
            probe,
            program,
            depth_program,
        }
    }

    pub(crate) fn shader(&self) -> Rc<dyn Shader> {
        Rc::new(ProgramShader::new("flat", self.program))
    }

    pub(crate) fn depth_shader(&self) -> Rc<dyn Shader> {
        Rc::new(ProgramShader::new("depth", self.depth_program))
    }

    /// A unit quad drawn with the harness program.
    pub(crate) fn quad(&mut self, label: &str) -> Mesh {
        let shader = self.shader();
        Geometry::quad(1.0, 1.0)
            .into_mesh(self.engine.context_mut().device(), label)
            .expect("quad mesh")
            .with_shader(shader)
    }
}

/// What a [`Probe`] saw when it was rendered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Observation {
    pub(crate) state: TargetState,
    pub(crate) transform: Transform,
}

pub(crate) type Observations = Rc<RefCell<Vec<Observation>>>;

/// A scene node that records the context state every time it is rendered.
pub(crate) struct Probe {
    seen: Observations,
}

impl Probe {
    pub(crate) fn new() -> (Self, Observations) {
        let seen = Observations::default();
        (Self { seen: seen.clone() }, seen)
    }
}

impl SceneNode for Probe {
    fn render(&self, ctx: &mut RenderContext) {
        self.seen.borrow_mut().push(Observation {
            state: ctx.target_state(),
            transform: ctx.transform(),
        });
    }

    fn release(&mut self, _ctx: &mut RenderContext) {}

    fn label(&self) -> &str {
        "probe"
    }
}

/// Binds a framebuffer and a shrunken viewport and never restores them.
pub(crate) struct LeakyPass;

impl RenderPass for LeakyPass {
    fn label(&self) -> &str {
        "leaky"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        let ctx = engine.context_mut();
        let fb = ctx.device().create_framebuffer("leaked")?;
        ctx.bind_render_target(RenderTarget::Framebuffer(fb));
        ctx.set_viewport(Viewport::new(1, 2, 3, 4));
        Ok(())
    }
}

/// Fails halfway through, after binding its own target.
pub(crate) struct FailingPass;

impl RenderPass for FailingPass {
    fn label(&self) -> &str {
        "failing"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        engine.context_mut().set_viewport(Viewport::new(0, 0, 1, 1));
        anyhow::bail!("asset went missing")
    }
}

/// Records the target state at the start of its render.
pub(crate) struct StatePass {
    pub(crate) seen: Rc<RefCell<Vec<TargetState>>>,
}

impl RenderPass for StatePass {
    fn label(&self) -> &str {
        "state"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        self.seen.borrow_mut().push(engine.context().target_state());
        Ok(())
    }
}

type LoadFn = Box<dyn FnMut(&mut Engine) -> anyhow::Result<()>>;

/// Records every hook call in order and runs `load` from `on_load_scene`.
pub(crate) struct RecordingListener {
    pub(crate) hooks: Rc<RefCell<Vec<String>>>,
    load: LoadFn,
}

impl RecordingListener {
    pub(crate) fn new(load: impl FnMut(&mut Engine) -> anyhow::Result<()> + 'static) -> Self {
        Self {
            hooks: Rc::default(),
            load: Box::new(load),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(|_| Ok(()))
    }

    pub(crate) fn hooks(&self) -> Vec<String> {
        self.hooks.borrow().clone()
    }
}

impl EngineListener for RecordingListener {
    fn on_load_scene(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        self.hooks.borrow_mut().push("load".to_string());
        (self.load)(engine)
    }

    fn on_render_frame(&mut self, _engine: &mut Engine, _dt: Duration) {
        self.hooks.borrow_mut().push("frame".to_string());
    }

    fn on_render_main_pass(&mut self, _engine: &mut Engine) {
        self.hooks.borrow_mut().push("main".to_string());
    }

    fn on_surface_changed(&mut self, _engine: &mut Engine, width: u32, height: u32) {
        self.hooks.borrow_mut().push(format!("surface {}x{}", width, height));
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub(crate) struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// Every body falls one unit per step. Every pose it reports is a pure translation
/// with equal components, so a torn read is easy to spot.
#[derive(Debug, Default)]
pub(crate) struct FallingWorld {
    pub(crate) steps: u32,
    poses: Vec<Option<Transform>>,
}

impl PhysicsWorld for FallingWorld {
    type Shape = ();

    fn add_body(&mut self, _shape: (), _mass: f32) -> BodyHandle {
        self.poses.push(Some(Transform::identity()));
        BodyHandle(self.poses.len() as u64 - 1)
    }

    fn remove_body(&mut self, body: BodyHandle) {
        if let Some(pose) = self.poses.get_mut(body.0 as usize) {
            *pose = None;
        }
    }

    fn step_simulation(
        &mut self,
        _time_step: f32,
        _max_sub_steps: u32,
        _fixed_time_step: f32,
    ) -> u32 {
        self.steps += 1;
        for pose in self.poses.iter_mut().flatten() {
            let v = pose.position().y - 1.0;
            *pose = Transform::from_translation([v, v, v]);
        }
        1
    }

    fn transform(&self, body: BodyHandle) -> Option<Transform> {
        self.poses.get(body.0 as usize).copied().flatten()
    }

    fn set_transform(&mut self, body: BodyHandle, transform: Transform) {
        if let Some(Some(pose)) = self.poses.get_mut(body.0 as usize) {
            *pose = transform;
        }
    }
}

pub(crate) fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}
