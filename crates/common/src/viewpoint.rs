use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::bounds::BoundingVolume;

/// A camera the tileset is streamed for: position, orientation and the
/// projection parameters needed to turn world-space error into pixels.
/// Several viewpoints may be active at once (e.g. culling cameras).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    /// Height of the target viewport in pixels.
    pub viewport_height: f32,
}

impl Default for Viewpoint {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, -30.0),
            forward: Vec3::Z,
            up: Vec3::Y,
            fov_y: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 10_000.0,
            viewport_height: 1080.0,
        }
    }
}

impl Viewpoint {
    pub fn new(position: Vec3, forward: Vec3) -> Self {
        Self {
            position,
            forward: forward.normalize_or(Vec3::Z),
            ..Self::default()
        }
    }

    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        Self::new(position, target - position)
    }

    pub fn with_viewport_height(mut self, pixels: f32) -> Self {
        self.viewport_height = pixels;
        self
    }

    pub fn with_far(mut self, far: f32) -> Self {
        self.far = far;
        self
    }

    pub fn view_matrix(&self) -> Mat4 {
        let up = if self.forward.cross(self.up).length_squared() < 1e-8 {
            self.forward.any_orthonormal_vector()
        } else {
            self.up
        };
        Mat4::look_to_rh(self.position, self.forward, up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// Conservative visibility test against this viewpoint's frustum.
    pub fn can_see(&self, bounds: &BoundingVolume) -> bool {
        self.frustum().intersects(bounds)
    }
}

/// Six inward-facing planes `(n, d)` with `n·p + d >= 0` inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extracts the planes of a `[0, 1]` depth-range view-projection matrix.
    pub fn from_view_projection(m: &Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let len = p.truncate().length();
            if len > 0.0 { p / len } else { p }
        });
        Self { planes }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(center) + p.w >= -radius)
    }

    pub fn intersects(&self, bounds: &BoundingVolume) -> bool {
        self.intersects_sphere(bounds.center(), bounds.bounding_radius())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_viewpoint_matrix_is_finite() {
        let vp = Viewpoint::default().view_projection();
        assert!(vp.is_finite());
    }

    #[test]
    fn sees_what_is_in_front_only() {
        let v = Viewpoint::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0));
        let ahead = BoundingVolume::sphere(Vec3::new(0.0, 0.0, -10.0), 1.0);
        let behind = BoundingVolume::sphere(Vec3::new(0.0, 0.0, 10.0), 1.0);
        assert!(v.can_see(&ahead));
        assert!(!v.can_see(&behind));
    }

    #[test]
    fn large_volume_around_camera_is_visible() {
        let v = Viewpoint::looking_at(Vec3::ZERO, Vec3::X);
        let around = BoundingVolume::aabb(Vec3::new(0.0, 0.0, 50.0), Vec3::splat(100.0));
        assert!(v.can_see(&around));
    }

    #[test]
    fn far_plane_culls_distant_tiles() {
        let v = Viewpoint::looking_at(Vec3::ZERO, Vec3::X).with_far(100.0);
        let far = BoundingVolume::sphere(Vec3::new(500.0, 0.0, 0.0), 1.0);
        assert!(!v.can_see(&far));
    }

    #[test]
    fn looking_straight_down_keeps_a_valid_basis() {
        let v = Viewpoint::looking_at(Vec3::new(0.0, 100.0, 0.0), Vec3::ZERO);
        let ground = BoundingVolume::sphere(Vec3::ZERO, 5.0);
        assert!(v.view_matrix().is_finite());
        assert!(v.can_see(&ground));
    }
}
