use std::env;
use std::sync::Arc;

use anyhow::Result;
use ferris_scene_vk::{
    Camera, DescriptorItem, Instance, Mesh, Renderable, Renderer, RendererConfig, Scene, Style,
    Texture, ThingId, Topology,
};
use glam::{vec2, vec3, vec4, Quat, Vec2, Vec3};
use vulkanalia::vk;
use winit::event::{Event, MouseScrollDelta, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

/// Quads per row of the grid.
const COLUMNS: usize = 16;
const SPACING: f32 = 1.25;

struct Demo {
    scene: Scene,
    world: ThingId,
    quads: ThingId,
    overlay: ThingId,
}

fn quad() -> Mesh {
    Mesh::new(Topology::Triangles)
        .with_places(&[
            [-0.5, -0.5, 0.0],
            [0.5, -0.5, 0.0],
            [0.5, 0.5, 0.0],
            [-0.5, 0.5, 0.0],
        ])
        .with_indices(vec![0, 1, 2, 2, 3, 0])
}

fn checkerboard() -> Result<Texture> {
    let red = [255, 40, 40, 255];
    let white = [255, 255, 255, 255];
    let pixels = [red, white, white, red].concat();
    Ok(Texture::from_pixels(2, 2, vk::Format::R8G8B8A8_UNORM, pixels)?)
}

fn grid_position(index: usize, count: usize) -> Vec3 {
    let rows = count.div_ceil(COLUMNS);
    let columns = count.min(COLUMNS);
    let x = (index % COLUMNS) as f32 - (columns as f32 - 1.0) * 0.5;
    let y = (index / COLUMNS) as f32 - (rows as f32 - 1.0) * 0.5;
    vec3(x * SPACING, y * SPACING, 0.0)
}

fn build_scene(quad_count: usize) -> Result<Demo> {
    let mut scene = Scene::new();

    let world = scene.add_root("world");
    let eye = scene.add_child(world, "eye");
    let distance = 4.0 + quad_count.div_ceil(COLUMNS) as f32 * SPACING;
    scene.add_instance(eye, Instance::at(vec3(0.0, 0.0, distance)));
    scene.add_camera(eye, Camera::perspective(60f32.to_radians(), 0.1, 1000.0));

    let quads = scene.add_child(world, "quads");
    scene.add_renderable(
        quads,
        Renderable::new(vec![
            DescriptorItem::Mesh(Arc::new(quad())),
            DescriptorItem::Color(vec4(0.95, 0.55, 0.15, 1.0)),
        ]),
    );
    for i in 0..quad_count {
        scene.add_instance(quads, Instance::at(grid_position(i, quad_count)));
    }

    // Drawn on top, straight in clip space.
    let overlay = scene.add_root("overlay");
    let triangle = Mesh::new(Topology::Triangles)
        .with_places(&[[-1.0, -1.0, 0.0], [-0.6, -1.0, 0.0], [-0.8, -0.6, 0.0]])
        .with_samplers(&[[0.0, 0.0], [1.0, 0.0], [0.5, 1.0]]);
    scene.add_renderable(
        overlay,
        Renderable::new(vec![
            DescriptorItem::Mesh(Arc::new(triangle)),
            DescriptorItem::Texture(Arc::new(checkerboard()?)),
        ]),
    );

    Ok(Demo {
        scene,
        world,
        quads,
        overlay,
    })
}

impl Demo {
    fn animate(&mut self, seconds: f32) {
        for (i, instance) in self.scene.thing_mut(self.quads).instances.iter_mut().enumerate() {
            instance.orientation = Quat::from_rotation_z(seconds + i as f32 * 0.1);
        }
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    // Parse command line arguments for quad count
    let args: Vec<String> = env::args().collect();
    let quad_count = if args.len() > 1 {
        args[1].parse::<usize>().unwrap_or(1)
    } else {
        1
    };

    log::info!("Rendering {quad_count} quads");

    let config = RendererConfig::from_env();
    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title("Ferris Scene VK")
        .with_inner_size(winit::dpi::LogicalSize::new(
            config.initial_extent.0,
            config.initial_extent.1,
        ))
        .build(&event_loop)?;

    let mut demo = build_scene(quad_count)?;
    let mut renderer = Renderer::new(&window, config)?;
    renderer.add_layer(demo.world, Style::BATCHED);
    renderer.add_layer(demo.overlay, Style::HIERARCHICAL);

    let started = std::time::Instant::now();
    let mut scroll = Vec2::ZERO;

    event_loop.run(move |event, target| match event {
        Event::WindowEvent {
            event: WindowEvent::CloseRequested,
            ..
        } => {
            target.exit();
        }
        Event::WindowEvent {
            event: WindowEvent::CursorMoved { position, .. },
            ..
        } => {
            renderer.set_mouse_position(vec2(position.x as f32, position.y as f32));
        }
        Event::WindowEvent {
            event: WindowEvent::MouseWheel { delta, .. },
            ..
        } => {
            scroll += match delta {
                MouseScrollDelta::LineDelta(x, y) => vec2(x, y),
                MouseScrollDelta::PixelDelta(p) => vec2(p.x as f32, p.y as f32) / 120.0,
            };
            renderer.set_mouse_scroll(scroll);
        }
        Event::WindowEvent {
            event: WindowEvent::RedrawRequested,
            ..
        } => {
            demo.animate(started.elapsed().as_secs_f32());
            if let Err(e) = renderer.draw(&mut demo.scene, &window) {
                log::error!("Frame failed: {e}");
                if e.is_fatal() {
                    target.exit();
                }
            }
        }
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;
    Ok(())
}
