use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::Transform;

/// Relative padding applied to merged sphere radii. It scales with the radius
/// only, so rounding in distances between nearby centers stays covered at any
/// distance from the origin.
const MERGE_PADDING: f32 = 1e-5;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        let half = half_extents.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && other.max.cmple(self.max).all()
    }

    pub fn closest_point(&self, point: Vec3) -> Vec3 {
        point.clamp(self.min, self.max)
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    fn hull(points: impl IntoIterator<Item = Vec3>) -> Aabb {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for p in points {
            min = min.min(p);
            max = max.max(p);
        }
        Aabb { min, max }
    }
}

/// A bounding volume in some coordinate frame.
///
/// Volumes are conservative: every operation here may grow a volume but never
/// produces one smaller than the geometry it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bounds {
    Sphere { center: Vec3, radius: f32 },
    Box(Aabb),
}

impl Default for Bounds {
    fn default() -> Self {
        Self::Sphere {
            center: Vec3::ZERO,
            radius: 0.0,
        }
    }
}

impl Bounds {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.abs(),
        }
    }

    pub fn cube(center: Vec3, half_size: f32) -> Self {
        Self::Box(Aabb::from_center_half_extents(center, Vec3::splat(half_size)))
    }

    pub fn center(&self) -> Vec3 {
        match self {
            Self::Sphere { center, .. } => *center,
            Self::Box(aabb) => aabb.center(),
        }
    }

    /// Axis-aligned hull of this volume.
    pub fn aabb(&self) -> Aabb {
        match self {
            Self::Sphere { center, radius } => {
                Aabb::from_center_half_extents(*center, Vec3::splat(*radius))
            }
            Self::Box(aabb) => *aabb,
        }
    }

    /// Map this volume through `transform`.
    pub fn transformed(&self, transform: &Transform) -> Bounds {
        match self {
            Self::Sphere { center, radius } => Self::Sphere {
                center: transform.transform_point(*center),
                radius: radius * transform.max_scale(),
            },
            Self::Box(aabb) => Self::Box(Aabb::hull(
                aabb.corners().map(|c| transform.transform_point(c)),
            )),
        }
    }

    /// Smallest volume of the same family that encloses both inputs.
    /// Two spheres merge into a sphere; anything involving a box merges into
    /// the union of the two hulls.
    pub fn merge(&self, other: &Bounds) -> Bounds {
        match (self, other) {
            (
                Self::Sphere {
                    center: c1,
                    radius: r1,
                },
                Self::Sphere {
                    center: c2,
                    radius: r2,
                },
            ) => {
                let offset = *c2 - *c1;
                let dist = offset.length();
                if dist + r2 <= *r1 {
                    return *self;
                }
                if dist + r1 <= *r2 {
                    return *other;
                }
                let radius = (dist + r1 + r2) * 0.5;
                let center = *c1 + offset * ((radius - r1) / dist);
                // The rounded center may sit slightly off the ideal one; cover
                // both inputs as measured from where it actually landed.
                let radius = radius
                    .max(center.distance(*c1) + r1)
                    .max(center.distance(*c2) + r2);
                Self::Sphere {
                    center,
                    radius: radius * (1.0 + MERGE_PADDING),
                }
            }
            _ => Self::Box(self.aabb().union(&other.aabb())),
        }
    }

    /// True when `other` lies entirely inside `self`. The test is exact: no
    /// tolerance is granted, so a volume that passes really covers the other.
    pub fn encloses(&self, other: &Bounds) -> bool {
        match (self, other) {
            (
                Self::Sphere {
                    center: c1,
                    radius: r1,
                },
                Self::Sphere {
                    center: c2,
                    radius: r2,
                },
            ) => {
                c1.distance(*c2) + r2 <= *r1
            }
            (Self::Sphere { center, radius }, Self::Box(aabb)) => aabb
                .corners()
                .iter()
                .all(|corner| corner.distance(*center) <= *radius),
            (Self::Box(outer), _) => outer.contains(&other.aabb()),
        }
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        match (self, other) {
            (
                Self::Sphere {
                    center: c1,
                    radius: r1,
                },
                Self::Sphere {
                    center: c2,
                    radius: r2,
                },
            ) => c1.distance_squared(*c2) <= (r1 + r2) * (r1 + r2),
            (Self::Sphere { center, radius }, Self::Box(aabb))
            | (Self::Box(aabb), Self::Sphere { center, radius }) => {
                aabb.closest_point(*center).distance_squared(*center) <= radius * radius
            }
            (Self::Box(a), Self::Box(b)) => a.intersects(b),
        }
    }
}
