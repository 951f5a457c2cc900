//! The things a layer draws: an arena of nodes carrying renderables,
//! cameras and instances.

use glam::{Mat4, Quat, Vec3};

use crate::camera::Camera;
use crate::context::RenderContext;
use crate::error::Result;
use crate::lod::{Level, Lod};
use crate::renderable::Renderable;

/// Placement of a thing in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
    /// Levels the instance is visible at, inclusive.
    pub level_range: (Level, Level),
    /// Bounding sphere radius in model space.
    pub radius: f32,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: Vec3::ONE,
            level_range: (Level::MIN, Level::MAX),
            radius: 1.0,
        }
    }
}

impl Instance {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn with_levels(mut self, coarsest: Level, finest: Level) -> Self {
        self.level_range = (coarsest, finest);
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn model_transform(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.orientation, self.position)
    }

    /// World-to-eye transform of a camera placed here. Positions scale by
    /// `2^level`.
    pub fn view_transform(&self, level: Level) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position * level.scale()).inverse()
    }

    /// True when nothing of the instance is visible at `lod`.
    pub fn cull(&self, lod: &Lod) -> bool {
        let (coarsest, finest) = self.level_range;
        if lod.level < coarsest || lod.level > finest {
            return true;
        }

        let center = lod.model.transform_point3(self.position);
        let radius = self.radius * self.scale.abs().max_element();
        !lod.frustum.intersects_sphere(center, radius)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThingId(usize);

/// Locates one unit inside the scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitRef {
    pub thing: ThingId,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct Thing {
    name: String,
    parent: Option<ThingId>,
    children: Vec<ThingId>,
    pub renderables: Vec<Renderable>,
    pub cameras: Vec<Camera>,
    pub instances: Vec<Instance>,
}

impl Thing {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ThingId> {
        self.parent
    }

    pub fn children(&self) -> &[ThingId] {
        &self.children
    }
}

#[derive(Debug, Default)]
pub struct Scene {
    things: Vec<Thing>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, name: impl Into<String>) -> ThingId {
        let id = ThingId(self.things.len());
        self.things.push(Thing {
            name: name.into(),
            ..Thing::default()
        });
        id
    }

    pub fn add_child(&mut self, parent: ThingId, name: impl Into<String>) -> ThingId {
        let id = self.add_root(name);
        self.things[id.0].parent = Some(parent);
        self.things[parent.0].children.push(id);
        id
    }

    pub fn thing(&self, id: ThingId) -> &Thing {
        &self.things[id.0]
    }

    pub fn thing_mut(&mut self, id: ThingId) -> &mut Thing {
        &mut self.things[id.0]
    }

    pub fn add_renderable(&mut self, id: ThingId, renderable: Renderable) -> UnitRef {
        let renderables = &mut self.things[id.0].renderables;
        renderables.push(renderable);
        UnitRef {
            thing: id,
            index: renderables.len() - 1,
        }
    }

    pub fn add_camera(&mut self, id: ThingId, camera: Camera) -> UnitRef {
        let cameras = &mut self.things[id.0].cameras;
        cameras.push(camera);
        UnitRef {
            thing: id,
            index: cameras.len() - 1,
        }
    }

    /// Renderables below `id` inherit the new instance and go stale.
    pub fn add_instance(&mut self, id: ThingId, instance: Instance) {
        self.things[id.0].instances.push(instance);
        for thing in self.descendants_preorder(id) {
            for renderable in &mut self.things[thing.0].renderables {
                renderable.invalidate();
            }
        }
    }

    pub fn renderable(&self, unit: UnitRef) -> &Renderable {
        &self.things[unit.thing.0].renderables[unit.index]
    }

    /// Refreshes a renderable with the instances it currently inherits.
    /// Needed after editing level ranges through `thing_mut`.
    pub fn refresh(&mut self, unit: UnitRef, ctx: &mut dyn RenderContext) -> Result<()> {
        let instances = self.gather_instances(unit.thing);
        self.renderable_mut(unit).refresh(&instances, ctx)
    }

    pub fn renderable_mut(&mut self, unit: UnitRef) -> &mut Renderable {
        &mut self.things[unit.thing.0].renderables[unit.index]
    }

    pub fn camera(&self, unit: UnitRef) -> &Camera {
        &self.things[unit.thing.0].cameras[unit.index]
    }

    pub fn camera_mut(&mut self, unit: UnitRef) -> &mut Camera {
        &mut self.things[unit.thing.0].cameras[unit.index]
    }

    /// `id` followed by its subtree, depth first.
    pub fn descendants_preorder(&self, id: ThingId) -> Vec<ThingId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            order.push(next);
            stack.extend(self.things[next.0].children.iter().rev());
        }
        order
    }

    pub fn gather_renderables(&self, id: ThingId) -> Vec<UnitRef> {
        self.descendants_preorder(id)
            .into_iter()
            .flat_map(|thing| {
                (0..self.things[thing.0].renderables.len()).map(move |index| UnitRef { thing, index })
            })
            .collect()
    }

    pub fn gather_cameras(&self, id: ThingId) -> Vec<UnitRef> {
        self.descendants_preorder(id)
            .into_iter()
            .flat_map(|thing| {
                (0..self.things[thing.0].cameras.len()).map(move |index| UnitRef { thing, index })
            })
            .collect()
    }

    /// Instances of `id`, or of its nearest ancestor that has any.
    pub fn gather_instances(&self, id: ThingId) -> Vec<Instance> {
        let mut current = Some(id);
        while let Some(thing) = current {
            let thing = &self.things[thing.0];
            if !thing.instances.is_empty() {
                return thing.instances.clone();
            }
            current = thing.parent;
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HostContext;
    use crate::lod::Frustum;
    use vulkanalia::vk;

    #[test]
    fn preorder_visits_parents_first() {
        let mut scene = Scene::new();
        let root = scene.add_root("root");
        let a = scene.add_child(root, "a");
        let b = scene.add_child(root, "b");
        let a1 = scene.add_child(a, "a1");
        assert_eq!(scene.descendants_preorder(root), vec![root, a, a1, b]);
        assert_eq!(scene.descendants_preorder(a), vec![a, a1]);
        assert_eq!(scene.thing(a1).parent(), Some(a));
        assert_eq!(scene.thing(root).children(), &[a, b]);
    }

    #[test]
    fn instances_are_inherited() {
        let mut scene = Scene::new();
        let root = scene.add_root("root");
        let child = scene.add_child(root, "child");
        assert!(scene.gather_instances(child).is_empty());

        scene.add_instance(root, Instance::at(Vec3::X));
        assert_eq!(scene.gather_instances(child), vec![Instance::at(Vec3::X)]);

        scene.add_instance(child, Instance::at(Vec3::Y));
        assert_eq!(scene.gather_instances(child), vec![Instance::at(Vec3::Y)]);
    }

    #[test]
    fn new_instances_invalidate_the_subtree() {
        let mut scene = Scene::new();
        let root = scene.add_root("root");
        let child = scene.add_child(root, "child");
        let other = scene.add_root("other");
        let below = scene.add_renderable(child, Renderable::default());
        let beside = scene.add_renderable(other, Renderable::default());

        let mut ctx = HostContext::new(vk::Extent2D { width: 4, height: 4 });
        scene.refresh(below, &mut ctx).unwrap();
        scene.refresh(beside, &mut ctx).unwrap();
        assert!(!scene.renderable(below).is_stale());

        scene.add_instance(root, Instance::default().with_levels(Level(-2), Level(-1)));
        assert!(scene.renderable(below).is_stale());
        assert!(!scene.renderable(beside).is_stale());

        scene.refresh(below, &mut ctx).unwrap();
        assert_eq!(scene.renderable(below).level_range(), (Level(-2), Level(-1)));
    }

    #[test]
    fn instances_outside_their_levels_are_culled() {
        let instance = Instance::default().with_levels(Level(-1), Level(-1));
        assert!(instance.cull(&Lod::unbounded(Level::DEFAULT)));
        assert!(!instance.cull(&Lod::unbounded(Level(-1))));
    }

    #[test]
    fn instances_outside_the_frustum_are_culled() {
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let mut lod = Lod::new(Level::DEFAULT, Mat4::IDENTITY, projection);
        assert!(!Instance::at(Vec3::new(0.0, 0.0, -5.0)).cull(&lod));
        assert!(Instance::at(Vec3::new(0.0, 0.0, 5.0)).cull(&lod));

        lod.model = Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0));
        assert!(!Instance::at(Vec3::new(0.0, 0.0, 5.0)).cull(&lod));
        lod.frustum = Frustum::INFINITE;
        assert!(!Instance::at(Vec3::splat(1e6)).cull(&lod));
    }

    #[test]
    fn view_inverts_the_model() {
        let instance = Instance::at(Vec3::new(1.0, 2.0, 3.0));
        let eye = instance.view_transform(Level::DEFAULT).transform_point3(instance.position);
        assert!(eye.abs_diff_eq(Vec3::ZERO, 1e-5));
    }
}
