//! Geometry kernel - points, polygons and circle collision

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// Smallest length treated as non-zero
pub const EPSILON: f64 = 1e-9;

/// 2D point / vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn from_angle(angle: f64) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn length_sq(&self) -> f64 {
        self.x * self.x + self.y * self.y
    }

    pub fn dot(&self, other: Point) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        (*self - other).length()
    }

    /// Unit vector, or zero for degenerate input
    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len > EPSILON && len.is_finite() {
            Self::new(self.x / len, self.y / len)
        } else {
            Self::ZERO
        }
    }

    pub fn angle(&self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn rotate(&self, angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Reflect off a surface with unit normal `n`: v' = v - 2(v.n)n
    pub fn reflect(&self, normal: Point) -> Self {
        *self - normal * (2.0 * self.dot(normal))
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn lerp(&self, other: Point, t: f64) -> Self {
        *self + (other - *self) * t
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Point {
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

/// Separation data for a circle overlapping a polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionResponse {
    /// Unit vector pointing from the polygon toward where the circle must go
    pub normal: Point,
    /// Distance the circle must travel along `normal` to be clear
    pub penetration: f64,
}

/// Iterate the closed edge list of a polygon (last vertex joins the first)
pub fn edges(polygon: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = polygon.len();
    (0..n).map(move |i| (polygon[i], polygon[(i + 1) % n]))
}

/// Ray-casting point-in-polygon test (simple polygons only)
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y) {
            let cross_x = pj.x + (point.y - pj.y) / (pi.y - pj.y) * (pi.x - pj.x);
            if point.x < cross_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Closest point on segment `a`-`b` to `point` (clamped projection)
pub fn closest_point_on_segment(point: Point, a: Point, b: Point) -> Point {
    let ab = b - a;
    let len_sq = ab.length_sq();
    if len_sq < EPSILON {
        return a;
    }
    let t = ((point - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

pub fn distance_to_segment(point: Point, a: Point, b: Point) -> f64 {
    point.distance_to(closest_point_on_segment(point, a, b))
}

/// Circle overlaps polygon if its center is inside or any edge is within radius
pub fn circle_polygon_collision(center: Point, radius: f64, polygon: &[Point]) -> bool {
    if polygon.len() < 2 {
        return false;
    }
    point_in_polygon(center, polygon)
        || edges(polygon).any(|(a, b)| distance_to_segment(center, a, b) < radius)
}

/// Average of the polygon's vertices
pub fn centroid(polygon: &[Point]) -> Point {
    if polygon.is_empty() {
        return Point::ZERO;
    }
    let sum = polygon.iter().fold(Point::ZERO, |acc, p| acc + *p);
    sum * (1.0 / polygon.len() as f64)
}

/// Compute how to push a circle out of a polygon.
///
/// Outside the polygon the deepest-penetrating edge wins. When the center is
/// enclosed the circle is pushed out through the nearest edge, falling back to
/// the direction away from the centroid if that edge gives no usable normal.
pub fn compute_collision_response(
    center: Point,
    radius: f64,
    polygon: &[Point],
) -> Option<CollisionResponse> {
    if polygon.len() < 2 {
        return None;
    }

    if polygon.len() >= 3 && point_in_polygon(center, polygon) {
        let (closest, dist) = edges(polygon)
            .map(|(a, b)| {
                let c = closest_point_on_segment(center, a, b);
                (c, center.distance_to(c))
            })
            .min_by(|lhs, rhs| lhs.1.total_cmp(&rhs.1))?;

        let mut normal = (closest - center).normalize();
        if normal == Point::ZERO {
            normal = (center - centroid(polygon)).normalize();
        }
        if normal == Point::ZERO {
            normal = Point::new(0.0, -1.0);
        }
        return Some(CollisionResponse {
            normal,
            penetration: dist + radius,
        });
    }

    let mut best: Option<CollisionResponse> = None;
    for (a, b) in edges(polygon) {
        let closest = closest_point_on_segment(center, a, b);
        let dist = center.distance_to(closest);
        if dist >= radius {
            continue;
        }

        let mut normal = (center - closest).normalize();
        if normal == Point::ZERO {
            // Center sits exactly on the edge: use the edge perpendicular facing outward
            let edge = (b - a).normalize();
            normal = Point::new(-edge.y, edge.x);
            if normal.dot(center - centroid(polygon)) < 0.0 {
                normal = -normal;
            }
        }

        let penetration = radius - dist;
        if best.map_or(true, |cur| penetration > cur.penetration) {
            best = Some(CollisionResponse { normal, penetration });
        }
    }
    best
}
