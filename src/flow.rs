//! The winit runner.
//!
//! [`run`] owns the event loop. On the first `resumed` it opens the window and a
//! [`WgpuDevice`] for it, builds the listener and loads the scene; after that every
//! `RedrawRequested` renders one [`Engine::frame`] and asks for the next redraw.

use std::sync::Arc;

use log::{error, info, warn};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

use crate::{
    config::EngineConfig,
    engine::{Engine, EngineListener},
    gpu::wgpu_backend::WgpuDevice,
};

/// Builds the application once the device exists, so it can compile its programs.
pub type ListenerFactory =
    Box<dyn FnOnce(&mut WgpuDevice) -> anyhow::Result<Box<dyn EngineListener>>>;

struct Running {
    window: Arc<Window>,
    engine: Engine,
    listener: Box<dyn EngineListener>,
}

struct App {
    async_runtime: tokio::runtime::Runtime,
    config: EngineConfig,
    factory: Option<ListenerFactory>,
    state: Option<Running>,
    // The first error that stopped the loop, handed back by `run`.
    error: Option<anyhow::Error>,
}

impl App {
    fn new(factory: ListenerFactory, config: EngineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            async_runtime: tokio::runtime::Runtime::new()?,
            config,
            factory: Some(factory),
            state: None,
            error: None,
        })
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<Running> {
        let Some(factory) = self.factory.take() else {
            anyhow::bail!("the application was already started");
        };
        let window_attributes = Window::default_attributes().with_title(self.config.title.clone());
        let window = Arc::new(event_loop.create_window(window_attributes)?);

        let mut device = self
            .async_runtime
            .block_on(WgpuDevice::new(window.clone(), &self.config.surface))?;
        let mut listener = factory(&mut device)?;

        let mut engine = Engine::new(Box::new(device), self.config.clone());
        engine.load(&mut *listener)?;
        Ok(Running {
            window,
            engine,
            listener,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{:#}", e);
        self.error.get_or_insert(e);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.state = Some(running);
            }
            Err(e) => self.fail(event_loop, e.context("failed to start")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };

        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                state.engine.resize(&mut *state.listener, size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                match state.engine.frame(&mut *state.listener) {
                    Ok(stats) => {
                        if stats.failed_passes > 0 || stats.leaks_repaired > 0 {
                            warn!(
                                "frame finished with {} failed passes and {} repaired leaks",
                                stats.failed_passes, stats.leaks_repaired
                            );
                        }
                    }
                    Err(e) => {
                        error!("unable to render: {:#}", e);
                    }
                }
                state.window.request_redraw();
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.engine.teardown();
            info!("engine torn down");
        }
    }
}

/// Opens a window and runs the engine until the window is closed.
///
/// Returns the error that stopped the loop early, if any (no adapter, a failing
/// `on_load_scene`).
pub fn run<F>(factory: F, config: EngineConfig) -> anyhow::Result<()>
where
    F: FnOnce(&mut WgpuDevice) -> anyhow::Result<Box<dyn EngineListener>> + 'static,
{
    if let Err(e) = env_logger::try_init() {
        println!("Warning: Could not initialize logger: {}", e);
    };

    let event_loop = EventLoop::new()?;
    let mut app = App::new(Box::new(factory), config)?;
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
