use std::collections::BTreeSet;
use std::sync::Arc;

use ferris_scene_vk::descriptor::DescriptorItem;
use ferris_scene_vk::pipeline::{Pipeline, PipelineSubscriber};
use ferris_scene_vk::recorder::Command;
use ferris_scene_vk::{
    Camera, CommandLog, Descriptor, HostContext, Instance, Layer, Level, Mesh, Rate,
    RenderContext, RenderPassInfo, Renderable, Scene, Style, Texture, Topology,
};
use glam::Vec3;
use vulkanalia::vk;
use vulkanalia::vk::Handle;

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 640,
    height: 480,
};

fn context() -> HostContext {
    HostContext::new(EXTENT)
}

fn pass() -> RenderPassInfo {
    RenderPassInfo {
        render_pass: vk::RenderPass::null(),
        framebuffer: vk::Framebuffer::null(),
        extent: EXTENT,
        clear_color: [0.0, 0.0, 0.0, 1.0],
        clear_depth: 1.0,
    }
}

fn triangle() -> Arc<Mesh> {
    Arc::new(
        Mesh::new(Topology::Triangles)
            .with_places(&[[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [0.0, 1.0, 0.0]])
            .with_samplers(&[[0.0, 0.0], [1.0, 0.0], [0.5, 1.0]]),
    )
}

fn red_triangle() -> Renderable {
    Renderable::new(vec![
        DescriptorItem::Mesh(triangle()),
        DescriptorItem::Texture(Arc::new(Texture::solid([255, 0, 0, 255]))),
    ])
}

/// A mesh told apart from others by its vertex count.
fn strip(vertices: usize) -> Renderable {
    let places = vec![[0.0f32; 3]; vertices];
    Renderable::new(vec![DescriptorItem::Mesh(Arc::new(
        Mesh::new(Topology::Triangles).with_places(&places),
    ))])
}

fn vertex_counts(log: &CommandLog) -> Vec<u32> {
    log.commands
        .iter()
        .filter_map(|c| match c {
            Command::Draw { vertex_count, .. } => Some(*vertex_count),
            _ => None,
        })
        .collect()
}

/// Dynamic offsets bound to set 1, one entry per bind.
fn dynamic_binds(log: &CommandLog) -> Vec<Vec<u32>> {
    log.commands
        .iter()
        .filter_map(|c| match c {
            Command::BindDescriptorSets {
                first_set: 1,
                dynamic_offsets,
                ..
            } => Some(dynamic_offsets.clone()),
            _ => None,
        })
        .collect()
}

/// The offsets `subscriber` binds: only blocks holding uniforms take part.
fn bound_offsets(pipeline: &Pipeline, subscriber: &PipelineSubscriber) -> Vec<u32> {
    Rate::DYNAMIC
        .iter()
        .zip(subscriber.dynamic_offsets)
        .filter(|(rate, _)| pipeline.dynamic_ubo(**rate).is_some_and(|ubo| ubo.is_populated()))
        .map(|(_, offset)| offset)
        .collect()
}

fn compile(layer: &mut Layer, scene: &mut Scene, ctx: &mut HostContext) -> (bool, BTreeSet<ferris_scene_vk::PipelineId>) {
    let mut relevant = BTreeSet::new();
    let active = layer.generate(scene, ctx, &mut relevant).unwrap();
    (active, relevant)
}

fn record(layer: &Layer, ctx: &HostContext) -> CommandLog {
    let mut log = CommandLog::default();
    layer.render(&mut log, ctx, &pass());
    log
}

#[test]
fn empty_layer_only_clears() {
    let mut scene = Scene::new();
    let owner = scene.add_root("empty");
    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED);

    let (active, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    assert!(!active);
    assert!(relevant.is_empty());

    let log = record(&layer, &ctx);
    assert_eq!(log.pipeline_binds(), 0);
    assert_eq!(log.draws(), 0);
    match log.commands.first() {
        Some(Command::BeginRenderPass {
            clear_color,
            clear_depth,
            ..
        }) => {
            assert_eq!(*clear_color, [0.0, 0.0, 0.0, 1.0]);
            assert_eq!(*clear_depth, 1.0);
        }
        other => panic!("expected a render pass, got {other:?}"),
    }
    assert!(matches!(log.commands.last(), Some(Command::EndRenderPass)));
}

#[test]
fn single_triangle_is_one_draw_of_three_vertices() {
    let mut scene = Scene::new();
    let owner = scene.add_root("triangle");
    scene.add_renderable(owner, red_triangle());
    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED);

    let (active, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    assert!(active);
    assert_eq!(relevant.len(), 1);
    assert_eq!(ctx.store().len(), 1);

    let id = *relevant.iter().next().unwrap();
    assert_eq!(ctx.pipeline(id).subscribers().len(), 1);
    assert_eq!(ctx.pipeline(id).texture_count(), 1);

    let log = record(&layer, &ctx);
    assert_eq!(log.pipeline_binds(), 1);
    let draws = log
        .commands
        .iter()
        .filter_map(|c| match c {
            Command::Draw {
                vertex_count,
                first_vertex,
                ..
            } => Some((*vertex_count, *first_vertex)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(draws, vec![(3, 0)]);
}

#[test]
fn two_instances_share_a_renderable_set() {
    let mut scene = Scene::new();
    let owner = scene.add_root("pair");
    scene.add_renderable(owner, red_triangle());
    scene.add_instance(owner, Instance::at(Vec3::new(-0.5, 0.0, 0.0)));
    scene.add_instance(owner, Instance::at(Vec3::new(0.5, 0.0, 0.0)));
    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED);

    let (_, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    let id = *relevant.iter().next().unwrap();
    let pipeline = ctx.pipeline(id);
    assert_eq!(pipeline.subscribers().len(), 2);
    // The initial empty slot plus the one materialized set.
    assert_eq!(pipeline.sampler_sets().len(), 2);
    assert_eq!(pipeline.geometry_sets().len(), 2);

    let mut log = CommandLog::default();
    assert_eq!(pipeline.render_level(&mut log, 0), 2);
    assert_eq!(log.draws(), 2);
}

#[test]
fn hierarchical_draws_follow_scene_order() {
    let mut scene = Scene::new();
    let owner = scene.add_root("ui");
    let a = scene.add_child(owner, "a");
    let b = scene.add_child(owner, "b");
    let a1 = scene.add_child(a, "a1");
    let hidden = scene.add_child(owner, "hidden");
    scene.add_renderable(b, strip(9));
    scene.add_renderable(a1, strip(6));
    scene.add_renderable(a, strip(3));
    scene.add_renderable(hidden, strip(12));
    scene.add_instance(hidden, Instance::default().with_levels(Level(-3), Level(-2)));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::HIERARCHICAL);
    compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(layer.subscribers().len(), 3);

    let log = record(&layer, &ctx);
    assert_eq!(vertex_counts(&log), vec![3, 6, 9]);
    assert!(!log.commands.iter().any(|c| matches!(c, Command::ClearDepth(_))));
}

#[test]
fn hierarchical_levels_run_from_default_down() {
    let mut scene = Scene::new();
    let owner = scene.add_root("owner");
    scene.add_camera(owner, Camera::default().with_levels(Level(-1), Level::DEFAULT));
    let near = scene.add_child(owner, "near");
    let far = scene.add_child(owner, "far");
    scene.add_renderable(near, strip(3));
    scene.add_instance(near, Instance::default().with_levels(Level::DEFAULT, Level::DEFAULT));
    scene.add_renderable(far, strip(6));
    scene.add_instance(far, Instance::default().with_levels(Level(-1), Level(-1)));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::HIERARCHICAL | Style::MULTILEVEL);
    compile(&mut layer, &mut scene, &mut ctx);

    assert_eq!(
        layer.relevant_levels().collect::<Vec<_>>(),
        vec![Level::DEFAULT, Level(-1)]
    );
    assert_eq!(
        layer.level_counts(),
        vec![(Level::DEFAULT, 1), (Level(-1), 1)]
    );

    let log = record(&layer, &ctx);
    assert_eq!(vertex_counts(&log), vec![3, 6]);
    let clears = log
        .commands
        .iter()
        .filter(|c| matches!(c, Command::ClearDepth(_)))
        .count();
    assert_eq!(clears, 1);
}

#[test]
fn renderables_without_instances_only_show_at_the_default_level() {
    for style in [Style::BATCHED, Style::HIERARCHICAL] {
        let mut scene = Scene::new();
        let owner = scene.add_root("owner");
        scene.add_camera(owner, Camera::default().with_levels(Level(-2), Level::DEFAULT));
        scene.add_renderable(owner, red_triangle());

        let mut ctx = context();
        let mut layer = Layer::new(owner, style | Style::MULTILEVEL);
        compile(&mut layer, &mut scene, &mut ctx);
        assert_eq!(layer.level_counts(), vec![(Level::DEFAULT, 1)]);
        assert_eq!(record(&layer, &ctx).draws(), 1);
    }
}

#[test]
fn batched_levels_resume_where_the_previous_stopped() {
    let mut scene = Scene::new();
    let owner = scene.add_root("owner");
    scene.add_camera(owner, Camera::default().with_levels(Level(-1), Level::DEFAULT));
    scene.add_renderable(owner, red_triangle());
    scene.add_instance(owner, Instance::default());
    scene.add_instance(owner, Instance::at(Vec3::X));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED | Style::MULTILEVEL);
    let (_, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(relevant.len(), 1);
    assert_eq!(layer.level_counts(), vec![(Level::DEFAULT, 2), (Level(-1), 2)]);

    let log = record(&layer, &ctx);
    assert_eq!(log.draws(), 4);
    assert_eq!(log.pipeline_binds(), 2);
}

#[test]
fn a_new_frame_starts_from_scratch() {
    let mut scene = Scene::new();
    let owner = scene.add_root("owner");
    scene.add_renderable(owner, red_triangle());
    scene.add_instance(owner, Instance::default());
    scene.add_instance(owner, Instance::at(Vec3::Y));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED);
    let (_, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    let id = *relevant.iter().next().unwrap();
    let first = record(&layer, &ctx).draws();

    ctx.pipeline_mut(id).reset_uniforms();
    let pipeline = ctx.pipeline(id);
    assert!(pipeline.subscribers().is_empty());
    assert_eq!(pipeline.sampler_sets().len(), 1);
    assert_eq!(pipeline.geometry_sets().len(), 1);

    compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(record(&layer, &ctx).draws(), first);
    assert_eq!(ctx.store().len(), 1);
}

#[test]
fn render_level_stops_at_the_first_level_change() {
    let descriptor = Descriptor::default()
        .with(DescriptorItem::Mesh(triangle()))
        .with(DescriptorItem::Texture(Arc::new(Texture::solid([0, 255, 0, 255]))));
    let ctx = context();
    let mut pipeline =
        Pipeline::from_descriptor(&descriptor, ctx.attachment_formats(), ctx.min_ubo_alignment()).unwrap();
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    for _ in 0..16 {
        pipeline.reset_uniforms();
        for _ in 0..rng.usize(1..4) {
            for _ in 0..rng.usize(1..5) {
                for _ in 0..rng.usize(1..4) {
                    pipeline.push_uniforms(Rate::PerInstance, true);
                }
                pipeline.push_uniforms(Rate::PerRenderable, true);
            }
            pipeline.push_uniforms(Rate::PerLevel, true);
        }
        pipeline.push_uniforms(Rate::PerCamera, true);

        let subscribers = pipeline.subscribers().to_vec();
        let mut log = CommandLog::default();
        let mut k = 0;
        while k < subscribers.len() {
            let j = pipeline.render_level(&mut log, k);
            assert!(j > k);
            let head = &subscribers[k].dynamic_offsets[..2];
            assert!(subscribers[k..j].iter().all(|s| &s.dynamic_offsets[..2] == head));
            if let Some(next) = subscribers.get(j) {
                assert_ne!(&next.dynamic_offsets[..2], head);
            }
            k = j;
        }
        assert_eq!(pipeline.render_level(&mut log, k), k);
        assert_eq!(log.draws(), subscribers.len());
    }
}

#[test]
fn layers_sharing_a_pipeline_draw_their_own_subscribers() {
    let mut scene = Scene::new();
    let first = scene.add_root("first");
    let second = scene.add_root("second");
    scene.add_renderable(first, strip(3));
    scene.add_renderable(second, strip(6));

    let mut ctx = context();
    let mut a = Layer::new(first, Style::BATCHED);
    let mut b = Layer::new(second, Style::BATCHED);
    let mut relevant = BTreeSet::new();
    assert!(a.generate(&mut scene, &mut ctx, &mut relevant).unwrap());
    assert!(b.generate(&mut scene, &mut ctx, &mut relevant).unwrap());
    assert_eq!(ctx.store().len(), 1);

    let id = *relevant.iter().next().unwrap();
    let pipeline = ctx.pipeline(id);
    let subscribers = pipeline.subscribers();
    assert_eq!(subscribers.len(), 2);

    let log_a = record(&a, &ctx);
    assert_eq!(vertex_counts(&log_a), vec![3]);
    assert_eq!(dynamic_binds(&log_a), vec![bound_offsets(pipeline, &subscribers[0])]);

    let log_b = record(&b, &ctx);
    assert_eq!(vertex_counts(&log_b), vec![6]);
    assert_eq!(dynamic_binds(&log_b), vec![bound_offsets(pipeline, &subscribers[1])]);
    assert_ne!(dynamic_binds(&log_a), dynamic_binds(&log_b));
}

#[test]
fn batched_cameras_each_draw_their_own_pass() {
    let mut scene = Scene::new();
    let owner = scene.add_root("owner");
    let left = scene.add_child(owner, "left");
    let right = scene.add_child(owner, "right");
    scene.add_camera(left, Camera::default());
    scene.add_camera(right, Camera::default());
    let quads = scene.add_child(owner, "quads");
    scene.add_renderable(quads, red_triangle());
    scene.add_instance(quads, Instance::default());
    scene.add_instance(quads, Instance::at(Vec3::X));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED);
    let (_, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(relevant.len(), 1);
    assert_eq!(layer.level_counts(), vec![(Level::DEFAULT, 2), (Level::DEFAULT, 2)]);

    let id = *relevant.iter().next().unwrap();
    let pipeline = ctx.pipeline(id);
    assert_eq!(pipeline.subscribers().len(), 4);

    let log = record(&layer, &ctx);
    assert_eq!(log.draws(), 4);
    assert_eq!(log.pipeline_binds(), 2);
    let viewports = log
        .commands
        .iter()
        .filter(|c| matches!(c, Command::SetViewport(_)))
        .count();
    assert_eq!(viewports, 2);

    let expected = pipeline
        .subscribers()
        .iter()
        .map(|s| bound_offsets(pipeline, s))
        .collect::<Vec<_>>();
    assert_eq!(dynamic_binds(&log), expected);
    // The second camera's draws sit on a different level block.
    assert_ne!(
        pipeline.subscribers()[1].dynamic_offsets[1],
        pipeline.subscribers()[2].dynamic_offsets[1]
    );
}

#[test]
fn instances_added_between_frames_are_seen() {
    let mut scene = Scene::new();
    let owner = scene.add_root("owner");
    scene.add_camera(owner, Camera::default().with_levels(Level(-1), Level::DEFAULT));
    let quads = scene.add_child(owner, "quads");
    scene.add_renderable(quads, red_triangle());
    scene.add_instance(quads, Instance::default().with_levels(Level(-1), Level(-1)));

    let mut ctx = context();
    let mut layer = Layer::new(owner, Style::BATCHED | Style::MULTILEVEL);
    let (_, relevant) = compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(layer.level_counts(), vec![(Level(-1), 1)]);

    for id in &relevant {
        ctx.pipeline_mut(*id).reset_uniforms();
    }
    scene.add_instance(quads, Instance::at(Vec3::X).with_levels(Level::DEFAULT, Level::DEFAULT));
    compile(&mut layer, &mut scene, &mut ctx);
    assert_eq!(layer.level_counts(), vec![(Level::DEFAULT, 1), (Level(-1), 1)]);
    assert_eq!(record(&layer, &ctx).draws(), 2);
}
