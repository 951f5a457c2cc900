use glam::{Mat4, Vec3, Vec4};

/// Number of slots in a renderable's per-level cache.
pub const LOD_CACHE_SIZE: usize = 16;

/// Logarithmic size scale. Lower values are coarser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Level(pub i32);

impl Level {
    pub const DEFAULT: Level = Level(0);
    pub const MIN: Level = Level(-8);
    pub const MAX: Level = Level(7);

    /// Absolute slot in a renderable's LOD cache.
    pub fn index(self) -> usize {
        let clamped = self.0.clamp(Self::MIN.0, Self::MAX.0);
        (clamped - Self::MIN.0) as usize
    }

    pub fn coarser(self) -> Level {
        Level(self.0 - 1)
    }

    pub fn finer(self) -> Level {
        Level(self.0 + 1)
    }

    /// World-to-level scale factor, `2^level`.
    pub fn scale(self) -> f32 {
        2f32.powi(self.0)
    }
}

/// Six clip planes, each `(normal, distance)` with normals pointing inwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Contains everything.
    pub const INFINITE: Frustum = Frustum {
        planes: [Vec4::ZERO; 6],
    };

    /// Planes of a view-projection matrix with a `[0, 1]` depth range.
    pub fn from_matrix(m: Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let length = p.truncate().length();
            if length > f32::EPSILON { p / length } else { p }
        });
        Self { planes }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(center) + p.w >= -radius)
    }
}

/// What a renderable is being drawn at: level, view and culling volume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Lod {
    pub level: Level,
    pub view: Mat4,
    pub view_inverted: Mat4,
    pub frustum: Frustum,
    pub model: Mat4,
}

impl Lod {
    pub fn new(level: Level, view: Mat4, projection: Mat4) -> Self {
        Self {
            level,
            view,
            view_inverted: view.inverse(),
            frustum: Frustum::from_matrix(projection * view),
            model: Mat4::IDENTITY,
        }
    }

    /// A level seen without a camera: identity view, nothing culled.
    pub fn unbounded(level: Level) -> Self {
        Self {
            level,
            view: Mat4::IDENTITY,
            view_inverted: Mat4::IDENTITY,
            frustum: Frustum::INFINITE,
            model: Mat4::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_indices_cover_the_cache() {
        assert_eq!(Level::MIN.index(), 0);
        assert_eq!(Level::DEFAULT.index(), 8);
        assert_eq!(Level::MAX.index(), LOD_CACHE_SIZE - 1);
        assert_eq!(Level(-100).index(), 0);
        assert_eq!(Level(100).index(), LOD_CACHE_SIZE - 1);
        assert!(Level::DEFAULT.coarser() < Level::DEFAULT);
    }

    #[test]
    fn infinite_frustum_contains_everything() {
        assert!(Frustum::INFINITE.intersects_sphere(Vec3::splat(1e9), 0.0));
    }

    #[test]
    fn perspective_frustum_culls_behind_the_eye() {
        let projection = Mat4::perspective_lh(1.0, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_matrix(projection);
        assert!(frustum.intersects_sphere(Vec3::new(0.0, 0.0, 10.0), 0.5));
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, -10.0), 0.5));
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, 500.0), 0.5));
        assert!(!frustum.intersects_sphere(Vec3::new(100.0, 0.0, 10.0), 0.5));
    }
}
