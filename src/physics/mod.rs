//! The bridge between a rigid-body simulation and the scene graph.
//!
//! The simulation itself lives behind [`PhysicsWorld`]. A [`PhysicsStepper`] advances
//! it in fixed steps and publishes each body's pose into a [`BodySync`]; the
//! [`PhysicsBridge`] snapshots every `BodySync` once per frame and
//! [`PhysicsBody`] nodes render from that snapshot.
//!
//! ```text
//! stepper (inline or own thread)      render thread
//!   world.step_simulation
//!   BodySync::write_live   ──lock──►  PhysicsBridge::synchronize  (live -> buffered)
//!                                     passes: PhysicsBody::render (reads buffered)
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use crate::{
    config::{PhysicsConfig, StepMode},
    data_structures::transform::Transform,
};

pub mod body;
pub mod stepper;

pub use body::{BodyRegistry, BodySync, PhysicsBody};
pub use stepper::{
    Clock, PhysicsStepper, PhysicsThread, SharedStepper, StepPhysics, StepStats, SystemClock,
};

/// A body inside a [`PhysicsWorld`]. Minted by the world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub u64);

/// The rigid-body simulation the engine drives. Collision detection, constraint solving
/// and integration all happen behind this trait.
pub trait PhysicsWorld: Send {
    type Shape;

    fn add_body(&mut self, shape: Self::Shape, mass: f32) -> BodyHandle;
    fn remove_body(&mut self, body: BodyHandle);
    /// Advances the simulation. Returns the number of sub-steps taken.
    fn step_simulation(&mut self, time_step: f32, max_sub_steps: u32, fixed_time_step: f32) -> u32;
    fn transform(&self, body: BodyHandle) -> Option<Transform>;
    fn set_transform(&mut self, body: BodyHandle, transform: Transform);
}

/// Owns the stepping side of the engine: which stepper runs, on which thread, and which
/// bodies get synchronized every frame.
#[derive(Default)]
pub struct PhysicsBridge {
    stepper: Option<Arc<Mutex<dyn StepPhysics>>>,
    registry: BodyRegistry,
    thread: Option<PhysicsThread>,
}

impl PhysicsBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands a stepper to the bridge and starts it. With [`StepMode::Threaded`] it is
    /// stepped on its own thread from now on; otherwise [`step`](Self::step) drives it.
    ///
    /// The caller keeps its own `SharedStepper` clone to add and remove bodies.
    pub fn attach<W, C>(
        &mut self,
        stepper: SharedStepper<W, C>,
        config: &PhysicsConfig,
    ) -> anyhow::Result<()>
    where
        W: PhysicsWorld + 'static,
        C: Clock + 'static,
    {
        self.detach();
        let stepper: Arc<Mutex<dyn StepPhysics>> = stepper;
        {
            let mut guard = stepper.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry = guard.registry();
            guard.start();
        }
        if let StepMode::Threaded { interval } = config.mode {
            self.thread = Some(PhysicsThread::spawn(stepper.clone(), interval)?);
        }
        debug!("physics attached, {:?}", config.mode);
        self.stepper = Some(stepper);
        Ok(())
    }

    /// Stops and forgets the current stepper. The world itself is owned by the caller's
    /// `SharedStepper` and survives.
    pub fn detach(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.shutdown();
        }
        if let Some(stepper) = self.stepper.take() {
            stepper.lock().unwrap_or_else(PoisonError::into_inner).stop();
        }
        self.registry = BodyRegistry::default();
    }

    pub fn is_attached(&self) -> bool {
        self.stepper.is_some()
    }

    pub fn is_threaded(&self) -> bool {
        self.thread.is_some()
    }

    /// Steps an inline stepper. Does nothing when stepping runs on a thread.
    pub fn step(&mut self) -> u32 {
        if self.thread.is_some() {
            return 0;
        }
        match &self.stepper {
            Some(stepper) => stepper.lock().unwrap_or_else(PoisonError::into_inner).step(),
            None => 0,
        }
    }

    /// Copies every body's live pose into its buffered slot.
    pub fn synchronize(&self) {
        self.registry.synchronize_all();
    }

    pub fn start(&self) {
        self.with_stepper(|s| s.start());
    }

    pub fn stop(&self) {
        self.with_stepper(|s| s.stop());
    }

    pub fn is_running(&self) -> bool {
        self.with_stepper(|s| s.is_running()).unwrap_or(false)
    }

    pub fn stats(&self) -> Option<StepStats> {
        self.with_stepper(|s| s.stats())
    }

    pub fn body_count(&self) -> usize {
        self.registry.len()
    }

    fn with_stepper<R>(&self, f: impl FnOnce(&mut dyn StepPhysics) -> R) -> Option<R> {
        let Some(stepper) = &self.stepper else {
            warn!("no physics stepper attached");
            return None;
        };
        let mut guard = stepper.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut *guard))
    }
}

impl Drop for PhysicsBridge {
    fn drop(&mut self) {
        self.detach();
    }
}
