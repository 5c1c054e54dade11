mod common;

use scenic_bridge::{
    Group, SceneNode, Transform, TransformGroup,
    cgmath::{Deg, Point3},
    gpu::headless::DeviceCall,
    passes::ScenePass,
};

use crate::common::test_utils::{Harness, Probe, RecordingListener, approx};

#[test]
fn children_keep_insertion_order_across_removal() {
    let mut group = Group::new("root");
    let a = group.add_child(Box::new(Group::new("a")));
    let b = group.add_child(Box::new(Group::new("b")));
    let _c = group.add_child(Box::new(Group::new("c")));

    assert!(group.remove_child(b).is_some());
    assert!(group.remove_child(b).is_none());
    group.add_child(Box::new(Group::new("d")));

    let labels: Vec<_> = group.iter().map(|(_, node)| node.label().to_string()).collect();
    assert_eq!(labels, vec!["a", "c", "d"]);
    assert_eq!(group.child_as::<Group>(a).map(|g| g.label()), Some("a"));
}

#[test]
fn nested_transforms_compose_parent_first() {
    let mut harness = Harness::new();
    let (probe_node, observed) = Probe::new();
    let inner =
        TransformGroup::new("spin", Transform::from_angle_y(Deg(90.0))).with_child(probe_node);
    let outer = TransformGroup::new("shift", Transform::from_translation([1.0, 0.0, 0.0]))
        .with_child(inner);

    let (ctx, _) = harness.engine.context_and_scene();
    outer.render(ctx);

    let seen = observed.borrow()[0].transform;
    // local +X turns to -Z, then the parent shift applies
    let p = seen.transform_point(Point3::new(1.0, 0.0, 0.0));
    assert!(approx(p.x, 1.0) && approx(p.y, 0.0) && approx(p.z, -1.0), "{:?}", p);
    assert_eq!(harness.engine.context().transform(), Transform::identity());
}

#[test]
fn draws_carry_the_accumulated_model_matrix() {
    let mut harness = Harness::new();
    let quad = harness.quad("quad");
    harness.engine.scene_mut().add_child(Box::new(
        TransformGroup::new("spin", Transform::from_angle_y(Deg(90.0))).with_child(quad),
    ));
    harness.engine.add_pass(Box::new(ScenePass::new()));

    harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    let draws = harness.probe.draws();
    assert_eq!(draws.len(), 1);
    let DeviceCall::Draw { uniforms, program, .. } = &draws[0] else {
        unreachable!()
    };
    assert_eq!(*program, Some(harness.program));
    let model = Transform::try_from_cols_array(uniforms.model).unwrap();
    let p = model.transform_point(Point3::new(1.0, 0.0, 0.0));
    assert!(approx(p.x, 0.0) && approx(p.y, 0.0) && approx(p.z, -1.0), "{:?}", p);
}

#[test]
fn the_shader_override_wins_over_the_mesh_shader() {
    let mut harness = Harness::new();
    let quad = harness.quad("quad");
    harness.engine.scene_mut().add_child(Box::new(quad));
    let depth = harness.depth_shader();

    let (ctx, scene) = harness.engine.context_and_scene();
    ctx.with_shader_override(Some(depth), |ctx| scene.render(ctx));
    scene.render(ctx);

    let programs: Vec<_> = harness
        .probe
        .draws()
        .into_iter()
        .map(|d| match d {
            DeviceCall::Draw { program, .. } => program,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(programs, vec![Some(harness.depth_program), Some(harness.program)]);
}

#[test]
fn siblings_do_not_inherit_each_others_transform() {
    let mut harness = Harness::new();
    let mut group = Group::new("root");
    let (first, first_seen) = Probe::new();
    let (second, second_seen) = Probe::new();
    group.add_child(Box::new(
        TransformGroup::new("one", Transform::from_translation([1.0, 0.0, 0.0])).with_child(first),
    ));
    group.add_child(Box::new(
        TransformGroup::new("two", Transform::from_translation([2.0, 0.0, 0.0])).with_child(second),
    ));

    group.render(harness.engine.context_mut());

    assert_eq!(first_seen.borrow()[0].transform.position().x, 1.0);
    assert_eq!(second_seen.borrow()[0].transform.position().x, 2.0);
}

#[test]
fn released_meshes_are_skipped_and_counted() {
    let mut harness = Harness::new();
    let quad = harness.quad("quad");
    let id = harness.engine.scene_mut().add_child(Box::new(quad));
    harness.engine.add_pass(Box::new(ScenePass::new()));

    let mut removed = harness.engine.scene_mut().remove_child(id).unwrap();
    removed.release(harness.engine.context_mut());
    removed.release(harness.engine.context_mut());
    harness.engine.scene_mut().add_child(removed);

    let stats = harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(stats.draws, 0);
    assert_eq!(stats.skipped_draws, 1);
}
