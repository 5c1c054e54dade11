//! Fixed-timestep stepping.
//!
//! [`PhysicsStepper`] turns wall-clock time into whole fixed steps of the world. Time
//! that does not fill a step is carried into the next call. Time beyond
//! `max_sub_steps` steps is dropped: after a stall the simulation runs behind real time
//! instead of spending an unbounded amount of CPU catching up.
//!
//! The stepper can be driven inline once per frame or from a [`PhysicsThread`].

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use instant::{Duration, Instant};
use log::{debug, error, trace, warn};

use crate::{
    config::PhysicsConfig,
    data_structures::transform::Transform,
    physics::{
        BodyHandle, PhysicsWorld,
        body::{BodyRegistry, BodySync},
    },
};

/// Source of "now". Swappable so stepping can be tested without sleeping.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepStats {
    pub total_steps: u64,
    /// Simulation time thrown away because a call needed more than `max_sub_steps`.
    pub dropped: Duration,
    /// Steps taken by the most recent call.
    pub last_steps: u32,
}

/// The object-safe face of a stepper, used by the bridge and the physics thread.
pub trait StepPhysics: Send {
    /// Advances the world by the wall time elapsed since the previous call.
    fn step(&mut self) -> u32;
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn stats(&self) -> StepStats;
    fn registry(&self) -> BodyRegistry;
}

pub struct PhysicsStepper<W: PhysicsWorld, C: Clock = SystemClock> {
    world: W,
    bodies: Vec<(BodyHandle, Arc<BodySync>)>,
    registry: BodyRegistry,
    fixed_timestep: Duration,
    max_sub_steps: u32,
    accumulator: Duration,
    last: Option<Instant>,
    running: bool,
    stats: StepStats,
    clock: C,
}

/// A stepper shared between the render thread and a [`PhysicsThread`].
pub type SharedStepper<W, C = SystemClock> = Arc<Mutex<PhysicsStepper<W, C>>>;

impl<W: PhysicsWorld> PhysicsStepper<W> {
    pub fn new(world: W, config: &PhysicsConfig) -> Self {
        Self::with_clock(world, config, SystemClock)
    }
}

impl<W: PhysicsWorld, C: Clock> PhysicsStepper<W, C> {
    /// A stopped stepper. Call [`start`](StepPhysics::start) to begin stepping.
    pub fn with_clock(world: W, config: &PhysicsConfig, clock: C) -> Self {
        let config = config.validated();
        Self {
            world,
            bodies: Vec::new(),
            registry: BodyRegistry::default(),
            fixed_timestep: config.fixed_timestep,
            max_sub_steps: config.max_sub_steps,
            accumulator: Duration::ZERO,
            last: None,
            running: false,
            stats: StepStats::default(),
            clock,
        }
    }

    pub fn into_shared(self) -> SharedStepper<W, C> {
        Arc::new(Mutex::new(self))
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn fixed_timestep(&self) -> Duration {
        self.fixed_timestep
    }

    pub fn max_sub_steps(&self) -> u32 {
        self.max_sub_steps
    }

    /// Adds a body to the world at `pose` and returns its render-side handle.
    pub fn add_body(&mut self, shape: W::Shape, mass: f32, pose: Transform) -> Arc<BodySync> {
        let handle = self.world.add_body(shape, mass);
        self.world.set_transform(handle, pose);
        let sync = Arc::new(BodySync::new(pose));
        self.bodies.push((handle, sync.clone()));
        self.registry.register(sync.clone());
        debug!("added body {:?} (mass {})", handle, mass);
        sync
    }

    /// Removes a body from the world. Its `BodySync` keeps the last pose.
    pub fn remove_body(&mut self, sync: &Arc<BodySync>) -> bool {
        let Some(index) = self.bodies.iter().position(|(_, b)| Arc::ptr_eq(b, sync)) else {
            warn!("remove of a body this stepper does not own");
            return false;
        };
        let (handle, sync) = self.bodies.remove(index);
        self.world.remove_body(handle);
        self.registry.unregister(&sync);
        true
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Advances by an explicit `elapsed` instead of reading the clock. Does nothing
    /// while stopped.
    pub fn advance(&mut self, elapsed: Duration) -> u32 {
        if !self.running {
            return 0;
        }
        for (handle, sync) in &self.bodies {
            if let Some(pose) = sync.take_teleport() {
                self.world.set_transform(*handle, pose);
            }
        }

        self.accumulator += elapsed;
        let fixed = self.fixed_timestep;
        let fixed_nanos = fixed.as_nanos();
        let wanted = self.accumulator.as_nanos() / fixed_nanos;
        let steps = wanted.min(self.max_sub_steps as u128) as u32;

        let fixed_secs = fixed.as_secs_f32();
        for _ in 0..steps {
            self.world.step_simulation(fixed_secs, 1, fixed_secs);
        }

        // the sub-step remainder is carried, whole steps beyond the clamp are thrown away
        let carried = Duration::from_nanos((self.accumulator.as_nanos() % fixed_nanos) as u64);
        let dropped = self.accumulator - fixed * steps - carried;
        self.accumulator = carried;
        if !dropped.is_zero() {
            self.stats.dropped += dropped;
            debug!(
                "physics fell behind: wanted {} steps, took {}, dropped {:?}",
                wanted, steps, dropped
            );
        }

        if steps > 0 {
            for (handle, sync) in &self.bodies {
                match self.world.transform(*handle) {
                    Some(pose) => sync.write_live(pose),
                    None => warn!("world lost body {:?}", handle),
                }
            }
        }
        self.stats.total_steps += steps as u64;
        self.stats.last_steps = steps;
        trace!("stepped {} times, {:?} carried", steps, self.accumulator);
        steps
    }
}

impl<W: PhysicsWorld, C: Clock> StepPhysics for PhysicsStepper<W, C> {
    fn step(&mut self) -> u32 {
        if !self.running {
            return 0;
        }
        let now = self.clock.now();
        let elapsed = match self.last.replace(now) {
            Some(previous) => now.saturating_duration_since(previous),
            None => Duration::ZERO,
        };
        self.advance(elapsed)
    }

    /// Starts measuring from now, so nothing is caught up for the time spent stopped.
    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.last = Some(self.clock.now());
        self.accumulator = Duration::ZERO;
        debug!("physics started");
    }

    fn stop(&mut self) {
        if self.running {
            debug!("physics stopped");
        }
        self.running = false;
        self.last = None;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stats(&self) -> StepStats {
        self.stats
    }

    fn registry(&self) -> BodyRegistry {
        self.registry.clone()
    }
}

/// Steps a shared stepper on a dedicated thread until shut down.
#[derive(Debug)]
pub struct PhysicsThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PhysicsThread {
    /// Calls `step` every `interval`. The stepper lock is only held for the step.
    pub fn spawn(stepper: Arc<Mutex<dyn StepPhysics>>, interval: Duration) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new().name("physics".to_string()).spawn(move || {
                debug!("physics thread up, interval {:?}", interval);
                while !stop.load(Ordering::Acquire) {
                    stepper.lock().unwrap_or_else(PoisonError::into_inner).step();
                    thread::sleep(interval);
                }
                debug!("physics thread down");
            })?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and joins the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("physics thread panicked");
            }
        }
    }
}

impl Drop for PhysicsThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingWorld {
        steps: u32,
        poses: Vec<Transform>,
    }

    impl PhysicsWorld for CountingWorld {
        type Shape = ();

        fn add_body(&mut self, _shape: (), _mass: f32) -> BodyHandle {
            self.poses.push(Transform::identity());
            BodyHandle(self.poses.len() as u64 - 1)
        }

        fn remove_body(&mut self, _body: BodyHandle) {}

        fn step_simulation(
            &mut self,
            _time_step: f32,
            _max_sub_steps: u32,
            _fixed_time_step: f32,
        ) -> u32 {
            self.steps += 1;
            for pose in &mut self.poses {
                let y = pose.position().y - 1.0;
                pose.set_position([0.0, y, 0.0]);
            }
            1
        }

        fn transform(&self, body: BodyHandle) -> Option<Transform> {
            self.poses.get(body.0 as usize).copied()
        }

        fn set_transform(&mut self, body: BodyHandle, transform: Transform) {
            if let Some(pose) = self.poses.get_mut(body.0 as usize) {
                *pose = transform;
            }
        }
    }

    fn stepper() -> PhysicsStepper<CountingWorld> {
        let mut stepper = PhysicsStepper::new(CountingWorld::default(), &PhysicsConfig::default());
        stepper.start();
        stepper
    }

    #[test]
    fn remainder_is_carried() {
        let mut stepper = stepper();
        let fixed = stepper.fixed_timestep();
        assert_eq!(stepper.advance(fixed / 2), 0);
        assert_eq!(stepper.advance(fixed - fixed / 2), 1);
        assert_eq!(stepper.world().steps, 1);
    }

    #[test]
    fn excess_is_dropped_not_caught_up() {
        let mut stepper = stepper();
        let fixed = stepper.fixed_timestep();
        assert_eq!(stepper.advance(fixed * 25), 10);
        assert_eq!(stepper.stats().dropped, fixed * 15);
        assert_eq!(stepper.advance(Duration::ZERO), 0);
    }

    #[test]
    fn stopped_stepper_ignores_time() {
        let mut stepper = stepper();
        stepper.stop();
        assert_eq!(stepper.advance(Duration::from_secs(1)), 0);
        assert_eq!(stepper.stats().total_steps, 0);
    }

    #[test]
    fn live_pose_is_published_after_steps() {
        let mut stepper = stepper();
        let body = stepper.add_body((), 1.0, Transform::identity());
        stepper.advance(stepper.fixed_timestep() * 3);
        body.synchronize();
        assert_eq!(body.position().y, -3.0);
    }

    #[test]
    fn teleport_reaches_the_world_before_the_step() {
        let mut stepper = stepper();
        let body = stepper.add_body((), 1.0, Transform::identity());
        body.set_position([0.0, 10.0, 0.0]);
        stepper.advance(stepper.fixed_timestep());
        body.synchronize();
        assert_eq!(body.position().y, 9.0);
    }

    #[test]
    fn removed_bodies_leave_the_registry() {
        let mut stepper = stepper();
        let registry = stepper.registry();
        let body = stepper.add_body((), 1.0, Transform::identity());
        assert_eq!(registry.len(), 1);
        assert!(stepper.remove_body(&body));
        assert!(!stepper.remove_body(&body));
        assert!(registry.is_empty());
    }
}
