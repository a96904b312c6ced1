use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Geometric extent of a tile, in the tile's local frame until transformed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BoundingVolume {
    Sphere { center: Vec3, radius: f32 },
    Aabb { center: Vec3, half_extents: Vec3 },
}

impl BoundingVolume {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere { center, radius }
    }

    pub fn aabb(center: Vec3, half_extents: Vec3) -> Self {
        Self::Aabb {
            center,
            half_extents: half_extents.abs(),
        }
    }

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self::aabb((min + max) * 0.5, (max - min) * 0.5)
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Self::Sphere { center, .. } | Self::Aabb { center, .. } => center,
        }
    }

    /// Radius of the smallest sphere around `center()` containing the volume.
    pub fn bounding_radius(&self) -> f32 {
        match *self {
            Self::Sphere { radius, .. } => radius,
            Self::Aabb { half_extents, .. } => half_extents.length(),
        }
    }

    /// Distance from `point` to the surface of the volume; 0 when inside.
    pub fn distance_to(&self, point: Vec3) -> f32 {
        match *self {
            Self::Sphere { center, radius } => (point.distance(center) - radius).max(0.0),
            Self::Aabb {
                center,
                half_extents,
            } => ((point - center).abs() - half_extents).max(Vec3::ZERO).length(),
        }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        self.distance_to(point) == 0.0
    }

    /// Volume in the frame described by `m`. Boxes stay axis-aligned and grow
    /// to enclose the rotated corners; spheres scale by the largest axis scale.
    pub fn transformed(&self, m: &Mat4) -> Self {
        match *self {
            Self::Sphere { center, radius } => {
                let scale = m
                    .x_axis
                    .truncate()
                    .length()
                    .max(m.y_axis.truncate().length())
                    .max(m.z_axis.truncate().length());
                Self::Sphere {
                    center: m.transform_point3(center),
                    radius: radius * scale,
                }
            }
            Self::Aabb {
                center,
                half_extents,
            } => {
                let mut min = Vec3::splat(f32::INFINITY);
                let mut max = Vec3::splat(f32::NEG_INFINITY);
                for i in 0..8 {
                    let sign = Vec3::new(
                        if i & 1 == 0 { -1.0 } else { 1.0 },
                        if i & 2 == 0 { -1.0 } else { 1.0 },
                        if i & 4 == 0 { -1.0 } else { 1.0 },
                    );
                    let corner = m.transform_point3(center + half_extents * sign);
                    min = min.min(corner);
                    max = max.max(corner);
                }
                Self::from_min_max(min, max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn sphere_distance_is_zero_inside() {
        let s = BoundingVolume::sphere(Vec3::ZERO, 2.0);
        assert_eq!(s.distance_to(Vec3::new(1.0, 0.0, 0.0)), 0.0);
        assert!((s.distance_to(Vec3::new(5.0, 0.0, 0.0)) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn aabb_distance_to_corner_region() {
        let b = BoundingVolume::aabb(Vec3::ZERO, Vec3::ONE);
        assert!(b.contains(Vec3::new(0.5, -0.5, 0.9)));
        let d = b.distance_to(Vec3::new(4.0, 5.0, 0.0));
        assert!((d - 5.0).abs() < 1e-5);
    }

    #[test]
    fn translated_box_moves_center() {
        let b = BoundingVolume::aabb(Vec3::ZERO, Vec3::ONE);
        let t = b.transformed(&Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_eq!(t.center(), Vec3::new(10.0, 0.0, 0.0));
        assert!((t.bounding_radius() - b.bounding_radius()).abs() < 1e-5);
    }

    #[test]
    fn rotated_box_encloses_corners() {
        let b = BoundingVolume::aabb(Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        let r = Mat4::from_quat(Quat::from_rotation_y(std::f32::consts::FRAC_PI_4));
        let t = b.transformed(&r);
        match t {
            BoundingVolume::Aabb { half_extents, .. } => {
                assert!(half_extents.x > 2.0);
                assert!(half_extents.z > 1.0);
            }
            _ => panic!("box should stay a box"),
        }
    }

    #[test]
    fn scaled_sphere_grows_radius() {
        let s = BoundingVolume::sphere(Vec3::ONE, 1.0);
        let t = s.transformed(&Mat4::from_scale(Vec3::new(1.0, 3.0, 2.0)));
        assert!((t.bounding_radius() - 3.0).abs() < 1e-5);
        assert_eq!(t.center(), Vec3::new(1.0, 3.0, 2.0));
    }
}
