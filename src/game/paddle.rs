//! Paddle controller - path-constrained rigid paddle movement

use tracing::warn;

use super::geometry::{
    circle_polygon_collision, closest_point_on_segment, compute_collision_response, Point, EPSILON,
};
use super::world::{PaddlePath, WorldState};

/// Extra push when a paddle shoves the ball out of its polygon
const BALL_PUSH_SLOP: f64 = 1e-3;

/// Arclength parameterization of a paddle path
#[derive(Debug, Clone)]
pub struct PathGeometry {
    points: Vec<Point>,
    /// Arclength at each point, starting at 0
    cumulative: Vec<f64>,
    total: f64,
    closed: bool,
}

impl PathGeometry {
    /// Returns `None` for paths with fewer than two points or zero length
    pub fn new(path: &PaddlePath) -> Option<Self> {
        if path.shape.len() < 2 {
            return None;
        }

        let mut cumulative = Vec::with_capacity(path.shape.len());
        let mut total = 0.0;
        cumulative.push(0.0);
        for pair in path.shape.windows(2) {
            total += pair[0].distance_to(pair[1]);
            cumulative.push(total);
        }

        if !(total > EPSILON) {
            return None;
        }

        Some(Self {
            points: path.shape.clone(),
            cumulative,
            total,
            closed: path.is_closed(),
        })
    }

    pub fn total_length(&self) -> f64 {
        self.total
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wrap onto [0, total) for closed paths, clamp onto [0, total] for open ones
    pub fn normalize_param(&self, s: f64) -> f64 {
        if self.closed {
            s.rem_euclid(self.total)
        } else {
            s.clamp(0.0, self.total)
        }
    }

    /// Arclength parameter of the path point closest to `point`
    pub fn project(&self, point: Point) -> f64 {
        let mut best_dist = f64::INFINITY;
        let mut best_s = 0.0;
        for (i, pair) in self.points.windows(2).enumerate() {
            let closest = closest_point_on_segment(point, pair[0], pair[1]);
            let dist = point.distance_to(closest);
            if dist < best_dist {
                best_dist = dist;
                best_s = self.cumulative[i] + pair[0].distance_to(closest);
            }
        }
        best_s
    }

    /// Path point at arclength `s`
    pub fn point_at(&self, s: f64) -> Point {
        let s = self.normalize_param(s);
        let idx = self
            .cumulative
            .partition_point(|&c| c <= s)
            .clamp(1, self.points.len() - 1);
        let (start, end) = (self.cumulative[idx - 1], self.cumulative[idx]);
        let seg_len = end - start;
        if seg_len < EPSILON {
            return self.points[idx];
        }
        self.points[idx - 1].lerp(self.points[idx], (s - start) / seg_len)
    }

    /// Position as a fraction of the path length in [0, 1]
    pub fn fraction(&self, point: Point) -> f64 {
        self.project(point) / self.total
    }
}

/// Outcome of a paddle move
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaddleStep {
    pub moved: bool,
    /// The paddle ended up overlapping the ball and pushed it away
    pub hit_ball: bool,
}

/// Paddle movement system
pub struct PaddleController;

impl PaddleController {
    /// Slide a paddle `dir * speed` along its path.
    ///
    /// Open paths refuse moves that would put an anchor within half the anchor
    /// spacing of an endpoint; closed paths wrap.
    pub fn move_paddle(world: &mut WorldState, slot: usize, dir: i8, speed: f64) -> PaddleStep {
        if dir == 0 || !speed.is_finite() || speed == 0.0 {
            return PaddleStep::default();
        }

        let Some((path, s1, s2)) = Self::anchor_params(world, slot) else {
            return PaddleStep::default();
        };

        let delta = f64::from(dir.signum()) * speed;
        let (n1, n2) = (s1 + delta, s2 + delta);

        if !path.is_closed() {
            let margin = (s2 - s1).abs() / 2.0;
            let out_of_range = |s: f64| s < margin || s > path.total_length() - margin;
            if out_of_range(n1) || out_of_range(n2) {
                return PaddleStep::default();
            }
        }

        Self::relocate(world, slot, &path, n1, n2)
    }

    /// Place a paddle's anchor midpoint at path parameter `target`, clamped
    /// to the reachable range on open paths.
    pub fn place_paddle(world: &mut WorldState, slot: usize, target: f64) -> PaddleStep {
        if !target.is_finite() {
            return PaddleStep::default();
        }
        let Some((path, s1, s2)) = Self::anchor_params(world, slot) else {
            return PaddleStep::default();
        };

        let mut delta = target - (s1 + s2) / 2.0;
        if !path.is_closed() {
            let margin = (s2 - s1).abs() / 2.0;
            let (low, high) = (s1.min(s2), s1.max(s2));
            let min_delta = margin - low;
            let max_delta = path.total_length() - margin - high;
            if min_delta > max_delta {
                return PaddleStep::default();
            }
            delta = delta.clamp(min_delta, max_delta);
        }

        if delta.abs() < EPSILON {
            return PaddleStep::default();
        }
        Self::relocate(world, slot, &path, s1 + delta, s2 + delta)
    }

    /// Current anchor midpoint as a fraction of the slot's path
    pub fn path_fraction(world: &WorldState, slot: usize) -> Option<f64> {
        let path = PathGeometry::new(world.path(slot)?)?;
        let paddle = world.paddle(slot)?;
        Some(path.fraction(paddle.midpoint()))
    }

    fn anchor_params(world: &WorldState, slot: usize) -> Option<(PathGeometry, f64, f64)> {
        let Some(path) = world.path(slot).and_then(PathGeometry::new) else {
            warn!(slot, "Paddle path missing or degenerate");
            return None;
        };
        let Some(paddle) = world.paddle(slot) else {
            warn!(slot, "Paddle missing for slot");
            return None;
        };
        let s1 = path.project(paddle.anchor1);
        let s2 = path.project(paddle.anchor2);
        Some((path, s1, s2))
    }

    /// Rigidly move the paddle so its anchors sit at path parameters `n1`/`n2`,
    /// then reconcile any overlap with the ball.
    fn relocate(
        world: &mut WorldState,
        slot: usize,
        path: &PathGeometry,
        n1: f64,
        n2: f64,
    ) -> PaddleStep {
        let (p1, p2) = (path.point_at(n1), path.point_at(n2));

        let Some(paddle) = world.paddle_mut(slot) else {
            return PaddleStep::default();
        };
        let old_mid = paddle.midpoint();
        let angle = if p1.distance_to(p2) > EPSILON {
            (p2 - p1).angle()
        } else {
            paddle.orientation()
        };
        let mid = p1.lerp(p2, 0.5);
        paddle.place(mid, angle);

        // Paddle displacement stands in for its velocity
        let displacement = mid - old_mid;
        let shape = paddle.shape.clone();

        let mut step = PaddleStep {
            moved: true,
            hit_ball: false,
        };

        if let Some(ball) = world.ball_mut() {
            if circle_polygon_collision(ball.center, ball.radius, &shape) {
                if let Some(response) =
                    compute_collision_response(ball.center, ball.radius, &shape)
                {
                    ball.center += response.normal * (response.penetration + BALL_PUSH_SLOP);
                    let relative = ball.velocity - displacement;
                    if relative.dot(response.normal) < 0.0 {
                        ball.velocity = relative.reflect(response.normal) + displacement;
                    }
                    step.hit_ball = true;
                }
            }
        }

        step
    }
}
