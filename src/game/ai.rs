//! AI brain - forward-simulated interception with skill-scaled error

use rand::Rng;
use serde::Serialize;

use super::geometry::{circle_polygon_collision, EPSILON};
use super::paddle::{PaddleController, PathGeometry};
use super::physics::BallPhysics;
use super::world::{GameObject, WorldState};
use crate::util::time::SIMULATION_TPS;

/// Milliseconds between lookahead recomputes
pub const AI_RECOMPUTE_MS: u64 = 1_000;
/// Simulated seconds per lookahead
pub const LOOKAHEAD_SECS: u32 = 5;
/// Gap (as a path fraction) the AI tolerates before moving
pub const DEAD_ZONE: f64 = 0.02;
/// Noise amplitude at skill 1, as a path fraction
const MAX_NOISE: f64 = 0.5;

pub const MIN_SKILL: u8 = 1;
pub const MAX_SKILL: u8 = 10;

/// Per-AI scratch state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiBrain {
    skill: u8,
    /// Last intended path fraction
    intended: Option<f64>,
    /// Simulation time of the next lookahead
    recompute_at: u64,
}

impl AiBrain {
    pub fn new(skill: u8) -> Self {
        Self {
            skill: skill.clamp(MIN_SKILL, MAX_SKILL),
            intended: None,
            recompute_at: 0,
        }
    }

    pub fn skill(&self) -> u8 {
        self.skill
    }

    #[cfg(test)]
    pub fn intended(&self) -> Option<f64> {
        self.intended
    }

    /// Forget the target, e.g. after the world was reloaded
    pub fn reset(&mut self) {
        self.intended = None;
        self.recompute_at = 0;
    }

    /// Half-width of the uniform error added to a predicted crossing
    pub fn noise_amplitude(&self) -> f64 {
        MAX_NOISE * f64::from(MAX_SKILL - self.skill) / f64::from(MAX_SKILL - MIN_SKILL)
    }

    /// Movement direction for this tick.
    ///
    /// Re-predicts the crossing point once per [`AI_RECOMPUTE_MS`]; every
    /// tick steers the paddle toward the held target. The result is negated
    /// while controls are inverted so the applied movement stays correct.
    #[allow(clippy::too_many_arguments)]
    pub fn think<R: Rng + ?Sized>(
        &mut self,
        world: &WorldState,
        slot: usize,
        now: u64,
        ball_speed: f64,
        paddle_speed: f64,
        inverted: bool,
        rng: &mut R,
    ) -> i8 {
        let Some(path) = world.path(slot).and_then(PathGeometry::new) else {
            return 0;
        };
        let closed = path.is_closed();

        if now >= self.recompute_at {
            self.recompute_at = now + AI_RECOMPUTE_MS;
            if let Some(crossing) = Self::predict_crossing(world, slot, ball_speed, rng) {
                let noise = self.noise_amplitude();
                let offset = if noise > 0.0 {
                    rng.gen_range(-noise..=noise)
                } else {
                    0.0
                };
                let target = crossing + offset;
                self.intended = Some(if closed {
                    target.rem_euclid(1.0)
                } else {
                    target.clamp(0.0, 1.0)
                });
            }
        }

        let (Some(intended), Some(current)) =
            (self.intended, PaddleController::path_fraction(world, slot))
        else {
            return 0;
        };

        let step = paddle_speed / path.total_length();
        let dir = Self::steer(current, intended, closed, step);
        if inverted {
            -dir
        } else {
            dir
        }
    }

    /// Direction that closes the gap between two path fractions.
    ///
    /// `step` is one tick of paddle travel as a path fraction. A gap within
    /// half a step counts as arrived, so a step wider than the dead zone
    /// cannot jump back and forth across the target.
    pub fn steer(current: f64, intended: f64, closed: bool, step: f64) -> i8 {
        let mut gap = intended - current;
        if closed {
            if gap > 0.5 {
                gap -= 1.0;
            } else if gap < -0.5 {
                gap += 1.0;
            }
        }

        if gap.abs() <= DEAD_ZONE.max(step / 2.0 + EPSILON) {
            0
        } else if gap > 0.0 {
            1
        } else {
            -1
        }
    }

    /// Simulate ahead until the ball first touches `slot`'s damage area and
    /// return where that happens as a fraction of `slot`'s path.
    ///
    /// Rival paddles track the ball perfectly; the AI's own paddle is left
    /// out so the ball can actually get through.
    pub fn predict_crossing<R: Rng + ?Sized>(
        world: &WorldState,
        slot: usize,
        ball_speed: f64,
        rng: &mut R,
    ) -> Option<f64> {
        let own_path = PathGeometry::new(world.path(slot)?)?;
        let damage = world.damage_area(slot)?.shape.clone();
        let mut sim = Self::lookahead_world(world, slot);

        let rivals: Vec<(usize, PathGeometry)> = sim
            .objects
            .iter()
            .filter_map(|o| match o {
                GameObject::Paddle(p) => Some(p.player_nbr),
                _ => None,
            })
            .filter_map(|rival| {
                let path = PathGeometry::new(sim.path(rival)?)?;
                Some((rival, path))
            })
            .collect();

        for _ in 0..LOOKAHEAD_SECS * SIMULATION_TPS {
            let ball_center = sim.ball()?.center;
            for (rival, path) in &rivals {
                PaddleController::place_paddle(&mut sim, *rival, path.project(ball_center));
            }

            BallPhysics::move_ball(&mut sim, ball_speed, false, rng);

            let ball = sim.ball()?;
            if circle_polygon_collision(ball.center, ball.radius, &damage) {
                return Some(own_path.fraction(ball.center));
            }
        }
        None
    }

    /// Copy of the objects the lookahead needs, nothing live
    fn lookahead_world(world: &WorldState, slot: usize) -> WorldState {
        let objects = world
            .objects
            .iter()
            .filter(|o| match o {
                GameObject::Ball(_) | GameObject::Wall(_) | GameObject::PaddlePath(_) => true,
                GameObject::Paddle(p) => p.player_nbr != slot,
                GameObject::PlayerDamageArea(d) => d.player_nbr == slot,
                GameObject::PowerupSpawn(_) | GameObject::MiniBall(_) => false,
            })
            .cloned()
            .collect();
        WorldState::new(world.meta.clone(), objects)
    }
}
