//! Ball physics - integration, multi-surface collision and anti-stall steering

use rand::Rng;
use tracing::warn;

use super::geometry::{compute_collision_response, point_in_polygon, CollisionResponse, Point};
use super::world::{Obstacle, WorldState};

/// Ball travel per tick used when a caller hands us garbage
pub const DEFAULT_BALL_SPEED: f64 = 1.5;
/// Radius assumed for a ball without a usable one
pub const DEFAULT_BALL_RADIUS: f64 = 2.0;

/// Overlap resolution passes right after integration
const MAX_RESOLVE_PASSES: usize = 5;
/// End-of-tick passes that force a stuck ball clear
const MAX_CORRECTIVE_PASSES: usize = 4;
/// Extra push so a separated ball does not touch the surface it left
const SEPARATION_SLOP: f64 = 1e-3;
/// Max angular jitter when wonky physics is enabled
const WONKY_JITTER_DEG: f64 = 10.0;
/// Max anti-stall rotation per tick
const ANTI_STALL_STEP_DEG: f64 = 0.25;
/// Preferred heading band, modulo 90 degrees
const ANTI_STALL_BAND_DEG: (f64, f64) = (40.0, 50.0);

/// What happened to the ball during one tick
#[derive(Debug, Clone, Default)]
pub struct BallStep {
    /// Paddle slots the ball bounced off this tick, in contact order
    pub touched_paddles: Vec<usize>,
    /// Number of surface contacts resolved
    pub contacts: usize,
}

/// Physics system for the ball
pub struct BallPhysics;

impl BallPhysics {
    /// Advance the ball by one tick at `speed` units per tick.
    ///
    /// Never fails: missing or malformed state is replaced with safe defaults
    /// and logged.
    pub fn move_ball<R: Rng + ?Sized>(
        world: &mut WorldState,
        speed: f64,
        wonky: bool,
        rng: &mut R,
    ) -> BallStep {
        let mut step = BallStep::default();
        let speed = Self::sanitize_speed(speed);
        let (width, height) = (world.meta.width, world.meta.height);
        let fallback_center = world.center();

        let Some(ball) = world.ball().cloned() else {
            warn!(map = %world.meta.name, "No ball in world, skipping ball physics");
            return step;
        };

        let radius = if ball.radius.is_finite() && ball.radius > 0.0 {
            ball.radius
        } else {
            warn!(radius = ball.radius, "Ball radius invalid, using default");
            DEFAULT_BALL_RADIUS
        };
        let mut center = if ball.center.is_finite() {
            ball.center
        } else {
            warn!("Ball center invalid, recentering");
            fallback_center
        };
        let mut velocity = Self::aim(ball.velocity, speed, rng);

        // Polygons already containing the ball are ignored for this tick
        let candidates: Vec<Obstacle<'_>> = world
            .obstacles()
            .into_iter()
            .filter(|o| !point_in_polygon(center, o.shape))
            .collect();

        center += velocity;

        for _ in 0..MAX_RESOLVE_PASSES {
            let contacts: Vec<(Option<usize>, CollisionResponse)> = candidates
                .iter()
                .filter_map(|o| {
                    compute_collision_response(center, radius, o.shape).map(|r| (o.paddle, r))
                })
                .collect();

            if contacts.is_empty() {
                break;
            }

            let total: f64 = contacts.iter().map(|(_, r)| r.penetration).sum();
            let mut separation = Point::ZERO;
            for (paddle, response) in &contacts {
                let weight = if total > 0.0 {
                    response.penetration / total
                } else {
                    1.0 / contacts.len() as f64
                };
                separation += response.normal * ((response.penetration + SEPARATION_SLOP) * weight);

                if velocity.dot(response.normal) < 0.0 {
                    velocity = velocity.reflect(response.normal);
                }
                if let Some(slot) = paddle {
                    if !step.touched_paddles.contains(slot) {
                        step.touched_paddles.push(*slot);
                    }
                }
            }
            step.contacts += contacts.len();
            center += separation;
        }

        for _ in 0..MAX_CORRECTIVE_PASSES {
            let worst = candidates
                .iter()
                .filter_map(|o| compute_collision_response(center, radius, o.shape))
                .max_by(|a, b| a.penetration.total_cmp(&b.penetration));

            let Some(response) = worst else {
                break;
            };
            center += response.normal * (response.penetration + SEPARATION_SLOP);
            if velocity.dot(response.normal) < 0.0 {
                velocity = velocity.reflect(response.normal);
            }
        }

        if wonky {
            let jitter = rng.gen_range(-WONKY_JITTER_DEG..=WONKY_JITTER_DEG);
            velocity = velocity.rotate(jitter.to_radians());
        }

        Self::bounce_off_bounds(&mut center, &mut velocity, radius, width, height);

        velocity = velocity.rotate(Self::anti_stall_nudge(velocity).to_radians());
        velocity = Self::aim(velocity, speed, rng);

        if let Some(ball) = world.ball_mut() {
            ball.center = center;
            ball.radius = radius;
            ball.velocity = velocity;
        }

        step
    }

    /// Put the ball back at `spawn` at rest; it is re-served next tick
    pub fn reset_ball(world: &mut WorldState, spawn: Point) {
        if let Some(ball) = world.ball_mut() {
            ball.center = spawn;
            ball.velocity = Point::ZERO;
        }
    }

    /// Random heading at `speed`
    pub fn random_velocity<R: Rng + ?Sized>(speed: f64, rng: &mut R) -> Point {
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        Point::from_angle(angle) * speed
    }

    /// Rescale to `speed`, serving in a random direction if there is no heading
    fn aim<R: Rng + ?Sized>(velocity: Point, speed: f64, rng: &mut R) -> Point {
        let dir = velocity.normalize();
        if dir == Point::ZERO {
            Self::random_velocity(speed, rng)
        } else {
            dir * speed
        }
    }

    fn sanitize_speed(speed: f64) -> f64 {
        if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            warn!(speed, "Ball speed invalid, using default");
            DEFAULT_BALL_SPEED
        }
    }

    /// Reflect off the map rectangle and clamp the center inside it
    fn bounce_off_bounds(
        center: &mut Point,
        velocity: &mut Point,
        radius: f64,
        width: f64,
        height: f64,
    ) {
        if !(width.is_finite() && height.is_finite())
            || width <= 2.0 * radius
            || height <= 2.0 * radius
        {
            warn!(width, height, "Map bounds invalid, skipping bound bounce");
            return;
        }

        if center.x - radius < 0.0 {
            velocity.x = velocity.x.abs();
        } else if center.x + radius > width {
            velocity.x = -velocity.x.abs();
        }
        if center.y - radius < 0.0 {
            velocity.y = velocity.y.abs();
        } else if center.y + radius > height {
            velocity.y = -velocity.y.abs();
        }

        center.x = center.x.clamp(radius, width - radius);
        center.y = center.y.clamp(radius, height - radius);
    }

    /// Degrees to rotate the heading toward the diagonal band this tick
    fn anti_stall_nudge(velocity: Point) -> f64 {
        if velocity == Point::ZERO {
            return 0.0;
        }
        let (low, high) = ANTI_STALL_BAND_DEG;
        let within = velocity.angle().to_degrees().rem_euclid(90.0);
        if within < low {
            (low - within).min(ANTI_STALL_STEP_DEG)
        } else if within > high {
            -(within - high).min(ANTI_STALL_STEP_DEG)
        } else {
            0.0
        }
    }
}
