//! Scene graph and hierarchical scene organization.
//!
//! A scene is a tree of boxed [`SceneNode`]s. Interior nodes ([`Group`],
//! [`TransformGroup`], [`PhysicsBody`](crate::physics::PhysicsBody)) own their children
//! exclusively; leaves ([`Mesh`](crate::data_structures::mesh::Mesh)) issue draws. The
//! tree is traversed depth-first, once per pass, through [`SceneNode::render`].

use std::any::Any;

use log::debug;

use crate::{context::RenderContext, data_structures::transform::Transform};

/// Lets callers get the concrete node back out of a `dyn SceneNode`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub trait SceneNode: AsAny {
    /// Draws this node and its subtree.
    ///
    /// Any state pushed onto `ctx` (transform, target, viewport) must be popped again
    /// before returning.
    fn render(&self, ctx: &mut RenderContext);

    /// Deletes the GPU handles owned by this subtree. Must be idempotent.
    fn release(&mut self, ctx: &mut RenderContext);

    fn label(&self) -> &str {
        "node"
    }
}

/// Identifies a child inside the [`Group`] it was added to. Ids are never reused by the
/// same group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// An ordered list of children. Children render in insertion order.
#[derive(Default)]
pub struct Group {
    label: String,
    next_id: u64,
    children: Vec<(NodeId, Box<dyn SceneNode>)>,
}

impl Group {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_id: 0,
            children: Vec::new(),
        }
    }

    /// Appends `child` after every existing child.
    pub fn add_child(&mut self, child: Box<dyn SceneNode>) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.children.push((id, child));
        id
    }

    /// Builder form of [`add_child`](Self::add_child).
    pub fn with_child(mut self, child: impl SceneNode + 'static) -> Self {
        self.add_child(Box::new(child));
        self
    }

    /// Detaches a child, keeping the order of its siblings. The caller now owns the
    /// subtree and is responsible for releasing it.
    pub fn remove_child(&mut self, id: NodeId) -> Option<Box<dyn SceneNode>> {
        let index = self.children.iter().position(|(child, _)| *child == id)?;
        Some(self.children.remove(index).1)
    }

    pub fn child(&self, id: NodeId) -> Option<&dyn SceneNode> {
        self.children
            .iter()
            .find(|(child, _)| *child == id)
            .map(|(_, node)| node.as_ref())
    }

    pub fn child_mut(&mut self, id: NodeId) -> Option<&mut dyn SceneNode> {
        self.children
            .iter_mut()
            .find(|(child, _)| *child == id)
            .map(|(_, node)| node.as_mut())
    }

    /// The child with `id`, if it exists and is a `T`.
    pub fn child_as<T: SceneNode>(&self, id: NodeId) -> Option<&T> {
        self.child(id)?.as_any().downcast_ref::<T>()
    }

    pub fn child_as_mut<T: SceneNode>(&mut self, id: NodeId) -> Option<&mut T> {
        self.child_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Children in render order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &dyn SceneNode)> {
        self.children.iter().map(|(id, node)| (*id, node.as_ref()))
    }

    /// Releases and drops every child.
    pub fn clear(&mut self, ctx: &mut RenderContext) {
        self.release(ctx);
        self.children.clear();
    }
}

impl SceneNode for Group {
    fn render(&self, ctx: &mut RenderContext) {
        for (_, child) in &self.children {
            child.render(ctx);
        }
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        for (_, child) in &mut self.children {
            child.release(ctx);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// A [`Group`] whose children render under an extra local transform.
#[derive(Default)]
pub struct TransformGroup {
    transform: Transform,
    group: Group,
}

impl TransformGroup {
    pub fn new(label: impl Into<String>, transform: Transform) -> Self {
        Self {
            transform,
            group: Group::new(label),
        }
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut Group {
        &mut self.group
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
}

impl SceneNode for TransformGroup {
    fn render(&self, ctx: &mut RenderContext) {
        ctx.with_transform(&self.transform, |ctx| self.group.render(ctx));
    }

    fn release(&mut self, ctx: &mut RenderContext) {
        debug!("releasing transform group '{}'", self.group.label);
        self.group.release(ctx);
    }

    fn label(&self) -> &str {
        self.group.label()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use cgmath::{Deg, InnerSpace, Point3};

    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    /// Records its label and the model transform it saw.
    struct Probe {
        label: &'static str,
        log: Rc<RefCell<Vec<(&'static str, Transform)>>>,
    }

    impl SceneNode for Probe {
        fn render(&self, ctx: &mut RenderContext) {
            self.log.borrow_mut().push((self.label, ctx.transform()));
        }

        fn release(&mut self, _ctx: &mut RenderContext) {}
    }

    fn ctx() -> RenderContext {
        RenderContext::new(Box::new(HeadlessDevice::new(4, 4)))
    }

    #[test]
    fn removal_keeps_sibling_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group = Group::new("root");
        let ids: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|label| group.add_child(Box::new(Probe { label, log: log.clone() })))
            .collect();
        assert!(group.remove_child(ids[1]).is_some());
        assert!(group.remove_child(ids[1]).is_none());

        group.render(&mut ctx());
        let order: Vec<_> = log.borrow().iter().map(|(l, _)| *l).collect();
        assert_eq!(order, ["a", "c"]);
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut group = Group::new("root");
        let a = group.add_child(Box::new(Probe { label: "a", log: log.clone() }));
        group.remove_child(a);
        let b = group.add_child(Box::new(Probe { label: "b", log }));
        assert_ne!(a, b);
        assert!(group.child(a).is_none());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn transform_group_pops_its_transform() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = Group::new("root")
            .with_child(
                TransformGroup::new("rotated", Transform::from_angle_y(Deg(90.0)))
                    .with_child(Probe { label: "inner", log: log.clone() }),
            )
            .with_child(Probe { label: "outer", log: log.clone() });

        let mut ctx = ctx();
        root.render(&mut ctx);
        let log = log.borrow();
        let p = log[0].1.transform_point([1.0, 0.0, 0.0]);
        assert!((p - Point3::new(0.0, 0.0, -1.0)).magnitude() < 1e-5);
        assert_eq!(log[1].1, Transform::identity());
        assert_eq!(ctx.transform(), Transform::identity());
    }

    #[test]
    fn children_can_be_downcast() {
        let mut group = Group::new("root");
        let id = group.add_child(Box::new(TransformGroup::default()));
        let tg = group.child_as_mut::<TransformGroup>(id).unwrap();
        tg.set_transform(Transform::from_translation([1.0, 2.0, 3.0]));
        assert!(group.child_as::<Group>(id).is_none());
        assert_eq!(
            group.child_as::<TransformGroup>(id).unwrap().transform().position().z,
            3.0
        );
    }
}
