//! Compiles a scene subtree into pipeline subscribers and records them.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use vulkanalia::vk;

use crate::camera::Camera;
use crate::context::{PipelineId, RenderContext};
use crate::error::Result;
use crate::lod::{Level, Lod};
use crate::pipeline::PipelineSubscriber;
use crate::rate::Rate;
use crate::recorder::{CommandRecorder, RenderPassInfo};
use crate::scene::{Instance, Scene, ThingId, UnitRef};
use crate::traits::{Trait, TraitTag};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Style: u32 {
        /// Draws grouped per pipeline; order across pipelines is unspecified.
        const BATCHED = 1;
        /// Draws in scene order without depth testing.
        const HIERARCHICAL = 2;
        /// Every level a camera observes, not only the default one.
        const MULTILEVEL = 4;
        /// Instances drawn far to near.
        const SORTED = 8;
    }
}

impl Default for Style {
    fn default() -> Self {
        Style::BATCHED
    }
}

/// A subscriber together with the pipeline that recorded it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerSubscriber {
    pub pipeline: PipelineId,
    pub subscriber: PipelineSubscriber,
}

#[derive(Clone, Debug)]
struct LevelRecord {
    level: Level,
    pipelines: Vec<PipelineId>,
    /// Subscribers emitted at this level.
    count: usize,
}

#[derive(Clone, Debug)]
struct PassRecord {
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    levels: Vec<LevelRecord>,
}

/// One instance of a renderable that survived culling.
struct Visible {
    renderable: UnitRef,
    lod: Lod,
}

#[derive(Debug)]
pub struct Layer {
    owner: ThingId,
    style: Style,
    passes: Vec<PassRecord>,
    /// Negated, so iteration runs from the finest level down.
    relevant_levels: BTreeSet<i32>,
    relevant_pipelines: BTreeSet<PipelineId>,
    subscribers: Vec<LayerSubscriber>,
    /// Subscriber index of each pipeline where this layer's draws begin.
    /// Other layers may share a pipeline and fill it before or after us.
    starts: HashMap<PipelineId, usize>,
}

impl Layer {
    pub fn new(owner: ThingId, style: Style) -> Self {
        Self {
            owner,
            style,
            passes: Vec::new(),
            relevant_levels: BTreeSet::new(),
            relevant_pipelines: BTreeSet::new(),
            subscribers: Vec::new(),
            starts: HashMap::new(),
        }
    }

    pub fn owner(&self) -> ThingId {
        self.owner
    }

    pub fn style(&self) -> Style {
        self.style
    }

    fn hierarchical(&self) -> bool {
        self.style.contains(Style::HIERARCHICAL)
    }

    pub fn relevant_levels(&self) -> impl Iterator<Item = Level> + '_ {
        self.relevant_levels.iter().map(|negated| Level(-negated))
    }

    pub fn relevant_pipelines(&self) -> &BTreeSet<PipelineId> {
        &self.relevant_pipelines
    }

    /// Subscribers in draw order. Filled in hierarchical mode only.
    pub fn subscribers(&self) -> &[LayerSubscriber] {
        &self.subscribers
    }

    /// Subscribers emitted per level, in draw order.
    pub fn level_counts(&self) -> Vec<(Level, usize)> {
        self.passes
            .iter()
            .flat_map(|pass| pass.levels.iter().map(|l| (l.level, l.count)))
            .collect()
    }

    /// Pushes the uniforms of everything visible from the owner's cameras.
    /// Pipelines drawn by this layer are added to `relevant`. Returns
    /// whether anything will be drawn.
    ///
    /// Pipelines must have been reset beforehand.
    pub fn generate(
        &mut self,
        scene: &mut Scene,
        ctx: &mut dyn RenderContext,
        relevant: &mut BTreeSet<PipelineId>,
    ) -> Result<bool> {
        self.passes.clear();
        self.relevant_levels.clear();
        self.relevant_pipelines.clear();
        self.subscribers.clear();
        self.starts.clear();

        for unit in scene.gather_renderables(self.owner) {
            if scene.renderable(unit).is_stale() {
                scene.refresh(unit, ctx)?;
            }
        }

        let extent = ctx.window_extent();
        let cameras = scene.gather_cameras(self.owner);
        for camera in &cameras {
            scene.camera_mut(*camera).compile(extent);
        }

        if cameras.is_empty() {
            let mut camera = Camera::default();
            camera.compile(extent);
            self.compile_camera(scene, ctx, &camera, &[])?;
        } else {
            for unit in cameras {
                let camera = scene.camera(unit).clone();
                let instances = scene.gather_instances(unit.thing);
                self.compile_camera(scene, ctx, &camera, &instances)?;
            }
        }

        relevant.extend(self.relevant_pipelines.iter().copied());
        Ok(!self.relevant_pipelines.is_empty())
    }

    fn compile_camera(
        &mut self,
        scene: &mut Scene,
        ctx: &mut dyn RenderContext,
        camera: &Camera,
        instances: &[Instance],
    ) -> Result<()> {
        let mut pass = PassRecord {
            viewport: camera.viewport(),
            scissor: camera.scissor(),
            levels: Vec::new(),
        };
        let mut camera_pipelines = BTreeSet::new();

        for level in camera.levels(self.style.contains(Style::MULTILEVEL)) {
            let view = camera.view_transform(instances, level);
            let lod = camera.lod(level, view);

            let mut pipelines = BTreeSet::new();
            let count = self.compile_level(scene, ctx, &lod, &mut pipelines)?;
            if pipelines.is_empty() {
                continue;
            }

            let level_uniforms = [
                Trait::mat4(TraitTag::ViewTransform, view),
                Trait::mat4(TraitTag::ViewProjectTransform, camera.matrix() * view),
                Trait::int(TraitTag::Level, level.0),
            ];
            for id in &pipelines {
                let pipeline = ctx.pipeline_mut(*id);
                for value in &level_uniforms {
                    pipeline.set_uniform(value);
                }
                pipeline.push_uniforms(Rate::PerLevel, true);
            }

            self.relevant_levels.insert(-level.0);
            camera_pipelines.extend(pipelines.iter().copied());
            pass.levels.push(LevelRecord {
                level,
                pipelines: pipelines.into_iter().collect(),
                count,
            });
        }

        let camera_uniforms = camera.uniforms();
        for id in &camera_pipelines {
            let pipeline = ctx.pipeline_mut(*id);
            for value in &camera_uniforms {
                pipeline.set_uniform(value);
            }
            pipeline.push_uniforms(Rate::PerCamera, true);
        }

        self.relevant_pipelines.extend(camera_pipelines);
        self.passes.push(pass);
        Ok(())
    }

    /// Culls every renderable of the subtree at `lod` and pushes the
    /// survivors. Returns the number of subscribers emitted.
    fn compile_level(
        &mut self,
        scene: &mut Scene,
        ctx: &mut dyn RenderContext,
        lod: &Lod,
        pipelines: &mut BTreeSet<PipelineId>,
    ) -> Result<usize> {
        let mut groups: Vec<Vec<Visible>> = Vec::new();
        for renderable in scene.gather_renderables(self.owner) {
            if !scene.renderable(renderable).observes(lod.level) {
                continue;
            }
            let instances = scene.gather_instances(renderable.thing);
            let group = visible_instances(&instances, lod)
                .map(|lod| Visible { renderable, lod })
                .collect::<Vec<_>>();
            if !group.is_empty() {
                groups.push(group);
            }
        }

        if self.style.contains(Style::SORTED) {
            let eye = lod.view_inverted.w_axis.truncate();
            let mut flat = groups.into_iter().flatten().collect::<Vec<_>>();
            flat.sort_by(|a, b| {
                let da = a.lod.model.w_axis.truncate().distance_squared(eye);
                let db = b.lod.model.w_axis.truncate().distance_squared(eye);
                db.total_cmp(&da)
            });
            groups = flat.into_iter().map(|v| vec![v]).collect();
        }

        let mut count = 0;
        for group in groups {
            let mut last = None;
            for visible in group {
                let id = self.push_instance(scene, ctx, &visible)?;
                pipelines.insert(id);
                last = Some(id);
                count += 1;
            }
            if let Some(id) = last {
                ctx.pipeline_mut(id).push_uniforms(Rate::PerRenderable, true);
            }
        }
        Ok(count)
    }

    fn push_instance(
        &mut self,
        scene: &mut Scene,
        ctx: &mut dyn RenderContext,
        visible: &Visible,
    ) -> Result<PipelineId> {
        let renderable = scene.renderable_mut(visible.renderable);
        let id = renderable.get_pipeline(&visible.lod, self.style, ctx)?;
        let geometry = renderable.geometry(&visible.lod, ctx)?;
        let textures = renderable.textures(&visible.lod, ctx)?;
        let uniforms = renderable.uniforms();

        let hierarchical = self.hierarchical();
        let pipeline = ctx.pipeline_mut(id);
        self.starts
            .entry(id)
            .or_insert_with(|| pipeline.subscribers().len());
        pipeline.set_geometry(geometry);
        for slot in 0..pipeline.texture_count() {
            pipeline.set_texture(slot, textures.get(slot).cloned());
        }
        for value in &uniforms {
            pipeline.set_uniform(value);
        }
        pipeline.set_uniform(&Trait::mat4(TraitTag::Transformation, visible.lod.model));

        let subscriber = pipeline.push_uniforms(Rate::PerInstance, !hierarchical);
        if hierarchical && let Some(subscriber) = subscriber {
            self.subscribers.push(LayerSubscriber {
                pipeline: id,
                subscriber,
            });
        }
        Ok(id)
    }

    /// Records one render pass drawing everything generated last.
    pub fn render(&self, rec: &mut dyn CommandRecorder, ctx: &dyn RenderContext, info: &RenderPassInfo) {
        rec.begin_render_pass(info);

        let mut resume = self.starts.clone();
        let mut cursor = 0;
        let level_total: usize = self.passes.iter().map(|p| p.levels.len()).sum();
        let mut levels_done = 0;

        for pass in &self.passes {
            rec.set_viewport(pass.viewport);
            rec.set_scissor(pass.scissor);

            for level in &pass.levels {
                if self.hierarchical() {
                    let end = (cursor + level.count).min(self.subscribers.len());
                    for entry in &self.subscribers[cursor..end] {
                        ctx.pipeline(entry.pipeline)
                            .render_subscriber(rec, &entry.subscriber);
                    }
                    cursor = end;
                } else {
                    for id in &level.pipelines {
                        let start = resume.get(id).copied().unwrap_or_default();
                        let next = ctx.pipeline(*id).render_level(rec, start);
                        resume.insert(*id, next);
                    }
                }

                levels_done += 1;
                if levels_done < level_total {
                    rec.clear_depth(pass.scissor, info.clear_depth);
                }
            }
        }

        rec.end_render_pass();
    }
}

/// Level-of-detail of each visible instance, with its model applied.
/// Without instances only the default level is visible.
fn visible_instances<'a>(instances: &'a [Instance], lod: &'a Lod) -> Box<dyn Iterator<Item = Lod> + 'a> {
    if instances.is_empty() {
        return Box::new((lod.level == Level::DEFAULT).then_some(*lod).into_iter());
    }
    Box::new(instances.iter().filter(|i| !i.cull(lod)).map(|instance| Lod {
        model: instance.model_transform() * lod.model,
        ..*lod
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    #[test]
    fn default_style_is_batched() {
        assert_eq!(Style::default(), Style::BATCHED);
        assert!(!(Style::HIERARCHICAL | Style::MULTILEVEL).contains(Style::SORTED));
    }

    #[test]
    fn null_instances_show_only_at_the_default_level() {
        assert_eq!(visible_instances(&[], &Lod::unbounded(Level::DEFAULT)).count(), 1);
        assert_eq!(visible_instances(&[], &Lod::unbounded(Level(-1))).count(), 0);
    }

    #[test]
    fn visible_instances_carry_their_model() {
        let instances = [
            Instance::at(Vec3::X),
            Instance::at(Vec3::Y).with_levels(Level(-3), Level(-2)),
        ];
        let visible = visible_instances(&instances, &Lod::unbounded(Level::DEFAULT)).collect::<Vec<_>>();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].model, Mat4::from_translation(Vec3::X));
    }
}
