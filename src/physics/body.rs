//! Per-body transform hand-off between the stepping loop and the render loop.
//!
//! Each body has two slots. The stepper writes `live` after every committed step;
//! [`BodySync::synchronize`] copies `live` into `buffered` once per frame; rendering
//! only ever reads `buffered`. Both slots sit behind one short-lived mutex per body, so
//! a copy never observes half a step and syncing one body never waits on another.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cgmath::Vector3;
use log::trace;

use crate::{
    context::RenderContext,
    data_structures::{
        scene_graph::{Group, NodeId, SceneNode},
        transform::Transform,
    },
};

#[derive(Debug)]
struct BodyState {
    live: Transform,
    buffered: Transform,
    /// A pose set from outside that the world has not seen yet.
    teleport: Option<Transform>,
}

#[derive(Debug)]
pub struct BodySync {
    state: Mutex<BodyState>,
}

impl BodySync {
    pub fn new(initial: Transform) -> Self {
        Self {
            state: Mutex::new(BodyState {
                live: initial,
                buffered: initial,
                teleport: None,
            }),
        }
    }

    // A panic while holding the lock cannot leave a half-written Transform behind,
    // so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, BodyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies the live pose into the buffered slot. Call once per frame, before any pass
    /// renders the body.
    pub fn synchronize(&self) {
        let mut state = self.lock();
        state.buffered = state.live;
    }

    /// The pose rendering uses this frame.
    pub fn buffered(&self) -> Transform {
        self.lock().buffered
    }

    /// The buffered position.
    pub fn position(&self) -> Vector3<f32> {
        self.buffered().position()
    }

    /// Moves the body, keeping its orientation. Takes effect in the world before the
    /// next step and in rendering after the next [`synchronize`](Self::synchronize).
    pub fn set_position(&self, position: impl Into<Vector3<f32>>) {
        let mut state = self.lock();
        let pose = state.live.with_position(position);
        state.live = pose;
        state.teleport = Some(pose);
    }

    /// Replaces the whole pose, see [`set_position`](Self::set_position).
    pub fn set_transform(&self, transform: Transform) {
        let mut state = self.lock();
        state.live = transform;
        state.teleport = Some(transform);
    }

    /// Publishes a pose from the world. A pending teleport wins, so a pose set from
    /// outside is never overwritten by a step that started before it.
    pub(crate) fn write_live(&self, transform: Transform) {
        let mut state = self.lock();
        if state.teleport.is_none() {
            state.live = transform;
        } else {
            trace!("skipping live write, a teleport is pending");
        }
    }

    pub(crate) fn take_teleport(&self) -> Option<Transform> {
        self.lock().teleport.take()
    }
}

/// The bodies a bridge synchronizes each frame. Shared between the stepper, which
/// registers bodies, and the bridge, which only reads the list.
#[derive(Clone, Debug, Default)]
pub struct BodyRegistry {
    bodies: Arc<Mutex<Vec<Arc<BodySync>>>>,
}

impl BodyRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<BodySync>>> {
        self.bodies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, body: Arc<BodySync>) {
        self.lock().push(body);
    }

    pub(crate) fn unregister(&self, body: &Arc<BodySync>) {
        self.lock().retain(|b| !Arc::ptr_eq(b, body));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Synchronizes every registered body. The list lock is only held to clone the
    /// list, so stepping is never blocked for more than one body at a time.
    pub fn synchronize_all(&self) {
        let bodies = self.lock().clone();
        for body in &bodies {
            body.synchronize();
        }
    }
}

/// A scene node whose transform comes from the simulation.
///
/// Renders its children under the body's buffered pose. Every pass in a frame sees the
/// same pose.
pub struct PhysicsBody {
    sync: Arc<BodySync>,
    group: Group,
}

impl PhysicsBody {
    pub fn new(label: impl Into<String>, sync: Arc<BodySync>) -> Self {
        Self {
            sync,
            group: Group::new(label),
        }
    }

    pub fn sync(&self) -> &Arc<BodySync> {
        &self.sync
    }

    pub fn add_child(&mut self, child: Box<dyn SceneNode>) -> NodeId {
        self.group.add_child(child)
    }

    pub fn with_child(mut self, child: impl SceneNode + 'static) -> Self {
        self.group.add_child(Box::new(child));
        self
    }

    pub fn remove_child(&mut self, id: NodeId) -> Option<Box<dyn SceneNode>> {
        self.group.remove_child(id)
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
    }
}

impl SceneNode for PhysicsBody {
    fn render(&self, ctx: &mut RenderContext) {
        let pose = self.sync.buffered();
        ctx.with_transform(&pose, |ctx| self.group.render(ctx));
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        self.group.release(ctx);
    }

    fn label(&self) -> &str {
        self.group.label()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn buffered_only_changes_on_synchronize() {
        let body = BodySync::new(Transform::identity());
        body.write_live(Transform::from_translation([1.0, 0.0, 0.0]));
        assert_eq!(body.position(), Vector3::new(0.0, 0.0, 0.0));
        body.synchronize();
        assert_eq!(body.position(), Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn teleport_beats_a_stale_step() {
        let body = BodySync::new(Transform::identity());
        body.set_position([5.0, 0.0, 0.0]);
        body.write_live(Transform::from_translation([1.0, 0.0, 0.0]));
        body.synchronize();
        assert_eq!(body.position().x, 5.0);
        assert_eq!(body.take_teleport().map(|t| t.position().x), Some(5.0));
        assert_eq!(body.take_teleport(), None);
    }

    #[test]
    fn synchronize_never_tears() {
        let a = Transform::from_translation([1.0, 1.0, 1.0]);
        let b = Transform::from_scale([2.0, 3.0, 4.0]).with_position([-1.0, -2.0, -3.0]);
        let body = Arc::new(BodySync::new(a));

        let writer = {
            let body = body.clone();
            thread::spawn(move || {
                for i in 0..20_000 {
                    body.write_live(if i % 2 == 0 { b } else { a });
                }
            })
        };
        for _ in 0..20_000 {
            body.synchronize();
            let seen = body.buffered();
            assert!(seen == a || seen == b, "torn transform {:?}", seen);
        }
        writer.join().unwrap();
    }

    #[test]
    fn registry_syncs_every_body() {
        let registry = BodyRegistry::default();
        let bodies: Vec<_> = (0..3)
            .map(|_| Arc::new(BodySync::new(Transform::identity())))
            .collect();
        for body in &bodies {
            registry.register(body.clone());
            body.write_live(Transform::from_translation([0.0, 2.0, 0.0]));
        }
        registry.unregister(&bodies[2]);
        registry.synchronize_all();
        assert_eq!(bodies[0].position().y, 2.0);
        assert_eq!(bodies[1].position().y, 2.0);
        assert_eq!(bodies[2].position().y, 0.0);
    }
}
