mod common;

use std::{cell::RefCell, rc::Rc, thread};

use instant::{Duration, Instant};
use scenic_bridge::{
    EngineConfig, PhysicsConfig, StepMode, Transform,
    passes::ScenePass,
    physics::{PhysicsBody, PhysicsStepper, SystemClock},
};

use crate::common::test_utils::{FallingWorld, Harness, ManualClock, Probe, RecordingListener};

fn manual_stepper(
    clock: &ManualClock,
) -> scenic_bridge::physics::SharedStepper<FallingWorld, ManualClock> {
    PhysicsStepper::with_clock(FallingWorld::default(), &PhysicsConfig::default(), clock.clone())
        .into_shared()
}

#[test]
fn a_long_stall_is_clamped_to_max_sub_steps() {
    let mut harness = Harness::new();
    let clock = ManualClock::new();
    let stepper = manual_stepper(&clock);
    let body = stepper.lock().unwrap().add_body((), 1.0, Transform::identity());
    harness.engine.attach_physics(stepper.clone()).unwrap();
    let fixed = PhysicsConfig::default().fixed_timestep;

    clock.advance(fixed * 25);
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(stepper.lock().unwrap().world().steps, 10);
    let stats = harness.engine.physics().stats().unwrap();
    assert_eq!(stats.last_steps, 10);
    assert_eq!(stats.dropped, fixed * 15);
    assert_eq!(body.position().y, -10.0);

    // nothing is caught up later
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stepper.lock().unwrap().world().steps, 10);
}

#[test]
fn bodies_render_the_pose_synchronized_this_frame() {
    let mut harness = Harness::new();
    let clock = ManualClock::new();
    let stepper = manual_stepper(&clock);
    let body = stepper.lock().unwrap().add_body((), 1.0, Transform::identity());
    let (probe_node, observed) = Probe::new();
    harness
        .engine
        .scene_mut()
        .add_child(Box::new(PhysicsBody::new("faller", body.clone()).with_child(probe_node)));
    harness.engine.add_pass(Box::new(ScenePass::new()));
    harness.engine.attach_physics(stepper).unwrap();

    clock.advance(PhysicsConfig::default().fixed_timestep * 3);
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(observed.borrow()[0].transform.position().y, -3.0);
    assert_eq!(harness.engine.physics().body_count(), 1);
}

#[test]
fn a_teleport_is_seen_by_the_world_and_the_renderer() {
    let mut harness = Harness::new();
    let clock = ManualClock::new();
    let stepper = manual_stepper(&clock);
    let body = stepper.lock().unwrap().add_body((), 1.0, Transform::identity());
    harness.engine.attach_physics(stepper).unwrap();

    body.set_position([5.0, 5.0, 5.0]);
    // not stepped yet: the teleport still shows up after synchronize
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(body.position().y, 5.0);

    clock.advance(PhysicsConfig::default().fixed_timestep);
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(body.position().y, 4.0);
}

#[test]
fn stopping_twice_and_restarting_catches_nothing_up() {
    let mut harness = Harness::new();
    let clock = ManualClock::new();
    let stepper = manual_stepper(&clock);
    harness.engine.attach_physics(stepper.clone()).unwrap();
    assert!(harness.engine.physics().is_running());

    harness.engine.physics().stop();
    harness.engine.physics().stop();
    assert!(!harness.engine.physics().is_running());

    clock.advance(Duration::from_secs(1));
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stepper.lock().unwrap().world().steps, 0);

    harness.engine.physics().start();
    harness.engine.physics().start();
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stepper.lock().unwrap().world().steps, 0);

    clock.advance(PhysicsConfig::default().fixed_timestep);
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stepper.lock().unwrap().world().steps, 1);
}

#[test]
fn teardown_detaches_physics() {
    let mut harness = Harness::new();
    let clock = ManualClock::new();
    let stepper = manual_stepper(&clock);
    harness.engine.attach_physics(stepper.clone()).unwrap();

    harness.engine.teardown();

    assert!(!harness.engine.physics().is_attached());
    clock.advance(Duration::from_secs(1));
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stepper.lock().unwrap().world().steps, 0);
}

#[test]
fn threaded_stepping_never_shows_a_torn_or_split_pose() {
    let config = EngineConfig {
        physics: PhysicsConfig {
            fixed_timestep: Duration::from_millis(1),
            max_sub_steps: 4,
            mode: StepMode::Threaded {
                interval: Duration::from_micros(200),
            },
        },
        ..EngineConfig::default()
    };
    let mut harness = Harness::with_config(config.clone());
    let stepper =
        PhysicsStepper::with_clock(FallingWorld::default(), &config.physics, SystemClock)
            .into_shared();
    let body = stepper.lock().unwrap().add_body((), 1.0, Transform::identity());

    let frames: Rc<RefCell<Vec<Vec<Transform>>>> = Rc::default();
    let (probe_node, observed) = Probe::new();
    harness
        .engine
        .scene_mut()
        .add_child(Box::new(PhysicsBody::new("faller", body.clone()).with_child(probe_node)));
    harness.engine.add_pass(Box::new(ScenePass::new()));
    harness.engine.add_pass(Box::new(ScenePass::new().without_clear()));
    harness.engine.attach_physics(stepper).unwrap();
    assert!(harness.engine.physics().is_threaded());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        observed.borrow_mut().clear();
        harness.engine.frame(&mut RecordingListener::empty()).unwrap();
        frames
            .borrow_mut()
            .push(observed.borrow().iter().map(|o| o.transform).collect());
        if body.position().y < -20.0 || Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_micros(500));
    }
    harness.engine.teardown();

    assert!(body.position().y < -20.0, "physics thread never stepped");
    for seen in frames.borrow().iter() {
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1], "two passes of one frame saw different poses");
        let p = seen[0].position();
        assert!(p.x == p.y && p.y == p.z, "torn pose {:?}", p);
    }
}
