mod common;

use std::{cell::RefCell, rc::Rc};

use scenic_bridge::{
    Engine, PassStage, RenderPass,
    gpu::{RenderTarget, TargetState, Viewport, headless::DeviceCall},
    offscreen::OffscreenTarget,
    passes::ScenePass,
};

use crate::common::test_utils::{
    FailingPass, HEIGHT, Harness, LeakyPass, Probe, RecordingListener, StatePass, WIDTH,
};

fn surface_state() -> TargetState {
    TargetState {
        target: RenderTarget::Default,
        viewport: Viewport::full(WIDTH, HEIGHT),
    }
}

/// Renders the scene into its own offscreen target, then runs `inner` inside it.
struct NestedPass {
    target: OffscreenTarget,
    inner: Vec<Box<dyn RenderPass>>,
    seen_inside: Rc<RefCell<Vec<TargetState>>>,
}

impl RenderPass for NestedPass {
    fn stage(&self) -> PassStage {
        PassStage::Pre
    }

    fn label(&self) -> &str {
        "nested"
    }

    fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
        {
            let (ctx, scene) = engine.context_and_scene();
            self.target.render_to(ctx, scene)?;
        }
        let Some(fb) = self.target.framebuffer() else {
            anyhow::bail!("no framebuffer");
        };
        let saved = engine.context().target_state();
        engine
            .context_mut()
            .restore_target_state(TargetState {
                target: RenderTarget::Framebuffer(fb),
                viewport: Viewport::full(16, 16),
            });
        self.seen_inside.borrow_mut().push(engine.context().target_state());
        let mut result = Ok(());
        for pass in &mut self.inner {
            let entry = engine.context().target_state();
            result = result.and(pass.render(engine));
            assert_eq!(engine.context().target_state(), entry, "inner pass leaked");
        }
        engine.context_mut().restore_target_state(saved);
        result
    }

    fn release(&mut self, ctx: &mut scenic_bridge::RenderContext) {
        self.target.release(ctx);
    }
}

#[test]
fn passes_see_the_state_the_previous_pass_left() {
    let mut harness = Harness::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let (probe_node, observed) = Probe::new();
    harness.engine.scene_mut().add_child(Box::new(probe_node));
    harness.engine.add_pass(Box::new(ScenePass::new()));
    harness.engine.add_pass(Box::new(StatePass { seen: seen.clone() }));
    harness.engine.add_pass(Box::new(ScenePass::new().without_clear()));

    let mut listener = RecordingListener::empty();
    let stats = harness.engine.frame(&mut listener).unwrap();

    assert_eq!(stats.passes_run, 3);
    assert_eq!(stats.leaks_repaired, 0);
    assert_eq!(*seen.borrow(), vec![surface_state()]);
    let observed = observed.borrow();
    assert_eq!(observed.len(), 2);
    assert!(observed.iter().all(|o| o.state == surface_state()));
    assert_eq!(harness.probe.bound_target(), RenderTarget::Default);
}

#[test]
fn nested_offscreen_passes_restore_each_level() {
    let mut harness = Harness::new();
    let inner_seen = Rc::new(RefCell::new(Vec::new()));
    let seen_inside = Rc::new(RefCell::new(Vec::new()));
    let after = Rc::new(RefCell::new(Vec::new()));
    harness.engine.add_pass(Box::new(NestedPass {
        target: OffscreenTarget::new("outer", scenic_bridge::gpu::TextureFormat::Rgba8Unorm)
            .with_size(64, 64),
        inner: vec![Box::new(StatePass {
            seen: inner_seen.clone(),
        })],
        seen_inside: seen_inside.clone(),
    }));
    harness.engine.add_pass(Box::new(StatePass { seen: after.clone() }));

    let stats = harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(stats.failed_passes, 0);
    assert_eq!(stats.leaks_repaired, 0);
    assert_eq!(*inner_seen.borrow(), *seen_inside.borrow());
    assert!(matches!(inner_seen.borrow()[0].target, RenderTarget::Framebuffer(_)));
    assert_eq!(*after.borrow(), vec![surface_state()]);
    assert_eq!(harness.probe.viewport(), Viewport::full(WIDTH, HEIGHT));
}

#[test]
fn leaked_state_is_repaired_before_the_next_pass() {
    let mut harness = Harness::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    harness.engine.add_pass(Box::new(LeakyPass));
    harness.engine.add_pass(Box::new(StatePass { seen: seen.clone() }));

    let stats = harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(stats.leaks_repaired, 1);
    assert_eq!(stats.failed_passes, 0);
    assert_eq!(*seen.borrow(), vec![surface_state()]);
    assert_eq!(harness.probe.bound_target(), RenderTarget::Default);
    assert_eq!(harness.probe.viewport(), Viewport::full(WIDTH, HEIGHT));
}

#[test]
fn a_failing_pass_does_not_stop_the_frame() {
    let mut harness = Harness::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    harness.engine.add_pass(Box::new(FailingPass));
    harness.engine.add_pass(Box::new(StatePass { seen: seen.clone() }));

    let stats = harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(stats.passes_run, 2);
    assert_eq!(stats.failed_passes, 1);
    // it also left a 1x1 viewport behind
    assert_eq!(stats.leaks_repaired, 1);
    assert_eq!(*seen.borrow(), vec![surface_state()]);
    assert_eq!(harness.probe.counters().frames, 1);
}

struct Tagged {
    tag: &'static str,
    stage: PassStage,
    order: Rc<RefCell<Vec<&'static str>>>,
}

impl RenderPass for Tagged {
    fn stage(&self) -> PassStage {
        self.stage
    }

    fn label(&self) -> &str {
        self.tag
    }

    fn render(&mut self, _engine: &mut Engine) -> anyhow::Result<()> {
        self.order.borrow_mut().push(self.tag);
        Ok(())
    }
}

#[test]
fn passes_run_in_list_order_even_when_stages_disagree() {
    let mut harness = Harness::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    for (tag, stage) in [
        ("post", PassStage::Post),
        ("main", PassStage::Main),
        ("pre", PassStage::Pre),
    ] {
        harness.engine.add_pass(Box::new(Tagged {
            tag,
            stage,
            order: order.clone(),
        }));
    }

    harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(*order.borrow(), vec!["post", "main", "pre", "post", "main", "pre"]);
}

#[test]
fn main_pass_hook_fires_once_before_the_first_main_pass() {
    let mut harness = Harness::new();
    let mut listener = RecordingListener::empty();
    let hooks = listener.hooks.clone();
    let order = Rc::new(RefCell::new(Vec::new()));

    struct Logging(&'static str, PassStage, Rc<RefCell<Vec<String>>>);
    impl RenderPass for Logging {
        fn stage(&self) -> PassStage {
            self.1
        }
        fn render(&mut self, _engine: &mut Engine) -> anyhow::Result<()> {
            self.2.borrow_mut().push(self.0.to_string());
            Ok(())
        }
    }

    harness.engine.add_pass(Box::new(Logging("shadow", PassStage::Pre, hooks.clone())));
    harness.engine.add_pass(Box::new(Logging("scene", PassStage::Main, hooks.clone())));
    harness.engine.add_pass(Box::new(Logging("overlay", PassStage::Main, hooks.clone())));
    harness.engine.add_pass(Box::new(Tagged {
        tag: "post",
        stage: PassStage::Post,
        order,
    }));

    harness.engine.frame(&mut listener).unwrap();

    assert_eq!(listener.hooks(), vec!["frame", "shadow", "main", "scene", "overlay"]);
}

#[test]
fn passes_added_during_a_frame_start_next_frame() {
    let mut harness = Harness::new();
    let seen = Rc::new(RefCell::new(Vec::new()));

    struct Spawner(Option<Box<dyn RenderPass>>);
    impl RenderPass for Spawner {
        fn render(&mut self, engine: &mut Engine) -> anyhow::Result<()> {
            if let Some(pass) = self.0.take() {
                engine.add_pass(pass);
            }
            Ok(())
        }
    }

    harness
        .engine
        .add_pass(Box::new(Spawner(Some(Box::new(StatePass { seen: seen.clone() })))));

    let first = harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(first.passes_run, 1);
    assert!(seen.borrow().is_empty());
    assert_eq!(harness.engine.pass_count(), 2);

    let second = harness.engine.frame(&mut RecordingListener::empty()).unwrap();
    assert_eq!(second.passes_run, 2);
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn scene_pass_clears_then_draws_into_the_surface() {
    let mut harness = Harness::new();
    let quad = harness.quad("quad");
    harness.engine.scene_mut().add_child(Box::new(quad));
    harness.engine.add_pass(Box::new(ScenePass::new()));
    harness.probe.clear_calls();

    let stats = harness.engine.frame(&mut RecordingListener::empty()).unwrap();

    assert_eq!(stats.draws, 1);
    let calls = harness.probe.calls();
    let clear = calls.iter().position(|c| matches!(c, DeviceCall::Clear { .. })).unwrap();
    let draw = calls.iter().position(|c| matches!(c, DeviceCall::Draw { .. })).unwrap();
    assert!(clear < draw);
    assert!(matches!(
        calls[draw],
        DeviceCall::Draw {
            target: RenderTarget::Default,
            count: 6,
            ..
        }
    ));
}
