use glam::{vec3, Mat4, Vec2, Vec4};
use vulkanalia::vk;
use vulkanalia::vk::HasBuilder;

use crate::lod::{Level, Lod};
use crate::scene::Instance;
use crate::traits::{Trait, TraitTag};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// World space is clip space with Y pointing up. What a layer without
    /// cameras sees.
    Identity,
    /// Right-handed, looking down -Z, `[0, 1]` depth, Y pointing up.
    Perspective { fov: f32, near: f32, far: f32 },
    /// Pixel units with the origin at the top-left corner.
    Orthographic { near: f32, far: f32 },
}

#[derive(Clone, Debug)]
pub struct Camera {
    projection: Projection,
    /// Normalized `(x, y, width, height)` of the window the camera draws to.
    viewport_range: Vec4,
    levels: (Level, Level),

    matrix: Mat4,
    inverted: Mat4,
    resolution: Vec2,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Projection::Identity)
    }
}

impl Camera {
    pub fn new(projection: Projection) -> Self {
        Self {
            projection,
            viewport_range: Vec4::new(0.0, 0.0, 1.0, 1.0),
            levels: (Level::DEFAULT, Level::DEFAULT),
            matrix: Mat4::IDENTITY,
            inverted: Mat4::IDENTITY,
            resolution: Vec2::ONE,
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
        }
    }

    pub fn perspective(fov: f32, near: f32, far: f32) -> Self {
        Self::new(Projection::Perspective { fov, near, far })
    }

    pub fn orthographic(near: f32, far: f32) -> Self {
        Self::new(Projection::Orthographic { near, far })
    }

    /// Observable levels, inclusive on both ends.
    pub fn with_levels(mut self, coarsest: Level, finest: Level) -> Self {
        self.levels = (coarsest.min(finest), coarsest.max(finest));
        self
    }

    pub fn with_viewport_range(mut self, x: f32, y: f32, width: f32, height: f32) -> Self {
        self.viewport_range = Vec4::new(x, y, width, height);
        self
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn matrix(&self) -> Mat4 {
        self.matrix
    }

    pub fn inverted(&self) -> Mat4 {
        self.inverted
    }

    pub fn resolution(&self) -> Vec2 {
        self.resolution
    }

    pub fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    pub fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    pub fn fov(&self) -> f32 {
        match self.projection {
            Projection::Perspective { fov, .. } => fov,
            _ => 0.0,
        }
    }

    /// Rebuilds the projection and the viewport for a window of `extent`.
    pub fn compile(&mut self, extent: vk::Extent2D) {
        let width = extent.width.max(1) as f32;
        let height = extent.height.max(1) as f32;

        // Vulkan's clip space points Y down.
        let flip = Mat4::from_scale(vec3(1.0, -1.0, 1.0));
        self.matrix = match self.projection {
            Projection::Identity => flip,
            Projection::Perspective { fov, near, far } => {
                flip * Mat4::perspective_rh(fov, width / height, near, far)
            }
            Projection::Orthographic { near, far } => {
                Mat4::orthographic_rh(0.0, width, 0.0, height, near, far)
            }
        };
        self.inverted = self.matrix.inverse();
        self.resolution = Vec2::new(width, height);

        let r = self.viewport_range;
        self.viewport = vk::Viewport::builder()
            .x(r.x * width)
            .y(r.y * height)
            .width(r.z * width)
            .height(r.w * height)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();
        self.scissor = vk::Rect2D::builder()
            .offset(vk::Offset2D {
                x: (r.x * width) as i32,
                y: (r.y * height) as i32,
            })
            .extent(vk::Extent2D {
                width: (r.z * width) as u32,
                height: (r.w * height) as u32,
            })
            .build();
    }

    /// Levels to draw, finest first. Only the default level unless
    /// `multilevel`.
    pub fn levels(&self, multilevel: bool) -> Vec<Level> {
        if !multilevel {
            return vec![Level::DEFAULT];
        }
        (self.levels.0 .0..=self.levels.1 .0).rev().map(Level).collect()
    }

    /// View of the first instance the camera is attached to.
    pub fn view_transform(&self, instances: &[Instance], level: Level) -> Mat4 {
        instances
            .first()
            .map_or(Mat4::IDENTITY, |instance| instance.view_transform(level))
    }

    pub fn lod(&self, level: Level, view: Mat4) -> Lod {
        match self.projection {
            Projection::Identity => Lod {
                view,
                view_inverted: view.inverse(),
                ..Lod::unbounded(level)
            },
            _ => Lod::new(level, view, self.matrix),
        }
    }

    pub fn uniforms(&self) -> [Trait; 4] {
        [
            Trait::mat4(TraitTag::ProjectTransform, self.matrix),
            Trait::mat4(TraitTag::InvertedProjectTransform, self.inverted),
            Trait::float(TraitTag::Fov, self.fov()),
            Trait::vec2(TraitTag::Resolution, self.resolution),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn perspective_flips_y() {
        let mut camera = Camera::perspective(1.0, 0.1, 100.0);
        camera.compile(vk::Extent2D { width: 200, height: 100 });

        let up = camera.matrix().project_point3(Vec3::new(0.0, 1.0, -5.0));
        assert!(up.y < 0.0);
        let depth = camera.matrix().project_point3(Vec3::new(0.0, 0.0, -5.0)).z;
        assert!((0.0..=1.0).contains(&depth));
        assert_eq!(camera.resolution(), Vec2::new(200.0, 100.0));
        assert!((camera.matrix() * camera.inverted()).abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn perspective_depth_spans_near_to_far() {
        let mut camera = Camera::perspective(1.0, 0.5, 50.0);
        camera.compile(vk::Extent2D { width: 100, height: 100 });
        let m = camera.matrix();

        assert!(m.project_point3(Vec3::new(0.0, 0.0, -0.5)).z.abs() < 1e-5);
        assert!((m.project_point3(Vec3::new(0.0, 0.0, -50.0)).z - 1.0).abs() < 1e-5);
        let nearer = m.project_point3(Vec3::new(0.0, 0.0, -2.0)).z;
        let farther = m.project_point3(Vec3::new(0.0, 0.0, -20.0)).z;
        assert!(nearer < farther);
        // Behind the eye, w goes negative and the point is clipped.
        assert!((m * Vec3::new(0.0, 0.0, 1.0).extend(1.0)).w < 0.0);
    }

    /// Twice the area Vulkan uses to decide facing, in framebuffer axes
    /// (Y down). Positive means counter-clockwise.
    fn facing(matrix: Mat4, points: [Vec3; 3]) -> f32 {
        let p = points.map(|v| matrix.project_point3(v));
        -(0..3)
            .map(|i| {
                let (a, b) = (p[i], p[(i + 1) % 3]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f32>()
    }

    #[test]
    fn counter_clockwise_triangles_face_the_viewer() {
        let triangle = [
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let mut flat = Camera::default();
        flat.compile(vk::Extent2D { width: 640, height: 480 });
        assert!(facing(flat.matrix(), triangle) > 0.0);
        assert_eq!(flat.matrix().project_point3(Vec3::ZERO), Vec3::ZERO);

        let mut eye = Camera::perspective(1.0, 0.1, 100.0);
        eye.compile(vk::Extent2D { width: 640, height: 480 });
        let pushed = triangle.map(|v| v - Vec3::Z * 5.0);
        assert!(facing(eye.matrix(), pushed) > 0.0);
    }

    #[test]
    fn orthographic_origin_is_top_left() {
        let mut camera = Camera::orthographic(-1.0, 1.0);
        camera.compile(vk::Extent2D { width: 640, height: 480 });
        let corner = camera.matrix().project_point3(Vec3::ZERO);
        assert!((corner.x + 1.0).abs() < 1e-5);
        assert!((corner.y + 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_extents_are_clamped() {
        let mut camera = Camera::perspective(1.0, 0.1, 10.0);
        camera.compile(vk::Extent2D { width: 0, height: 0 });
        assert!(camera.matrix().is_finite());
        assert_eq!(camera.resolution(), Vec2::ONE);
    }

    #[test]
    fn viewport_follows_range() {
        let mut camera = Camera::default().with_viewport_range(0.5, 0.0, 0.5, 1.0);
        camera.compile(vk::Extent2D { width: 800, height: 600 });
        assert_eq!(camera.viewport().x, 400.0);
        assert_eq!(camera.viewport().width, 400.0);
        assert_eq!(camera.scissor().offset.x, 400);
        assert_eq!(camera.scissor().extent.height, 600);
    }

    #[test]
    fn multilevel_goes_finest_first() {
        let camera = Camera::default().with_levels(Level(-2), Level::DEFAULT);
        assert_eq!(camera.levels(true), vec![Level(0), Level(-1), Level(-2)]);
        assert_eq!(camera.levels(false), vec![Level::DEFAULT]);
    }

    #[test]
    fn detached_cameras_view_from_the_origin() {
        let camera = Camera::default();
        assert_eq!(camera.view_transform(&[], Level::DEFAULT), Mat4::IDENTITY);
    }
}
