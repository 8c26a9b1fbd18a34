//! Powerup economy - timed pickups, their effects and fragmentation debris

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::geometry::Point;
use super::physics::BallPhysics;
use super::world::{GameObject, MiniBall, WorldState};

/// How often a spawn is attempted (ms)
pub const SPAWN_INTERVAL_MS: u64 = 3_000;
/// Chance a spawn attempt produces a pickup
pub const SPAWN_PROBABILITY: f64 = 0.5;
/// Cap on simultaneously active powerups. One per kind already keeps the
/// count at `PowerupKind::ALL.len()`, below this.
pub const MAX_ACTIVE: usize = 5;
/// Pickup radius used for collection
pub const POWERUP_RADIUS: f64 = 3.0;
/// How long an uncollected pickup stays on the field (ms)
pub const VISIBLE_LIFETIME_MS: u64 = 15_000;
/// How long a collected effect lasts (ms)
pub const EFFECT_DURATION_MS: u64 = 6_000;
/// Ball speed factor while a speed-up is live
pub const SPEED_MULTIPLIER: f64 = 1.5;
/// Fragments spawned by one fragmentation pickup
pub const FRAGMENT_COUNT: usize = 20;
/// Fragment lifetime (ms)
pub const FRAGMENT_LIFETIME_MS: u64 = 3_000;
/// Fragment radius lies in (FRAGMENT_MIN_RADIUS, FRAGMENT_MAX_RADIUS]
pub const FRAGMENT_MIN_RADIUS: f64 = 0.3;
pub const FRAGMENT_MAX_RADIUS: f64 = 2.0;

/// Pickup types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerupKind {
    /// Send the ball off in a random direction
    Reaim,
    /// Burst of short-lived decoy balls
    Fragmentation,
    /// Faster ball while live
    SpeedUp,
    /// Everyone's controls are reversed while live
    InverseControls,
}

impl PowerupKind {
    pub const ALL: &'static [PowerupKind] = &[
        PowerupKind::Reaim,
        PowerupKind::Fragmentation,
        PowerupKind::SpeedUp,
        PowerupKind::InverseControls,
    ];

    /// Achievement unlocked by collecting this pickup
    pub fn achievement_key(&self) -> &'static str {
        match self {
            PowerupKind::Reaim => "powerup_reaim",
            PowerupKind::Fragmentation => "powerup_fragmentation",
            PowerupKind::SpeedUp => "powerup_speed_up",
            PowerupKind::InverseControls => "powerup_inverse_controls",
        }
    }
}

/// A pickup on the field (`started == false`) or a live effect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePowerup {
    #[serde(rename = "type")]
    pub kind: PowerupKind,
    pub position: Point,
    pub expires_at: u64,
    pub started: bool,
}

impl ActivePowerup {
    fn is_live(&self, now: u64, kind: PowerupKind) -> bool {
        self.started && self.kind == kind && self.expires_at > now
    }
}

/// Per-session powerup state
#[derive(Debug, Clone)]
pub struct PowerupManager {
    enabled: bool,
    next_spawn_at: u64,
    active: Vec<ActivePowerup>,
}

impl PowerupManager {
    pub fn new(enabled: bool, now: u64) -> Self {
        Self {
            enabled,
            next_spawn_at: now + SPAWN_INTERVAL_MS,
            active: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn active(&self) -> &[ActivePowerup] {
        &self.active
    }

    /// Drop every pickup and effect (new round, new map)
    pub fn clear(&mut self, now: u64) {
        self.active.clear();
        self.next_spawn_at = now + SPAWN_INTERVAL_MS;
    }

    /// Factor applied to the session's base ball speed right now
    pub fn speed_multiplier(&self, now: u64) -> f64 {
        if self.active.iter().any(|p| p.is_live(now, PowerupKind::SpeedUp)) {
            SPEED_MULTIPLIER
        } else {
            1.0
        }
    }

    pub fn controls_inverted(&self, now: u64) -> bool {
        self.active
            .iter()
            .any(|p| p.is_live(now, PowerupKind::InverseControls))
    }

    /// Run one tick: expire debris and effects, maybe spawn, collect.
    ///
    /// Returns the kinds collected this tick.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        world: &mut WorldState,
        now: u64,
        rng: &mut R,
    ) -> Vec<PowerupKind> {
        Self::update_fragments(world, now);

        self.active.retain(|p| p.expires_at > now);

        if self.enabled && now >= self.next_spawn_at {
            self.next_spawn_at = now + SPAWN_INTERVAL_MS;
            if rng.gen_bool(SPAWN_PROBABILITY) {
                self.try_spawn(world, now, rng);
            }
        }

        let collected = self.collect(world, now, rng);
        world.powerups = self.active.clone();
        collected
    }

    /// Put a pickup on the field; rejected if its type or position is taken
    pub fn spawn(&mut self, kind: PowerupKind, position: Point, now: u64) -> bool {
        if self.active.len() >= MAX_ACTIVE
            || self
                .active
                .iter()
                .any(|p| p.kind == kind || p.position == position)
        {
            return false;
        }
        self.active.push(ActivePowerup {
            kind,
            position,
            expires_at: now + VISIBLE_LIFETIME_MS,
            started: false,
        });
        true
    }

    fn try_spawn<R: Rng + ?Sized>(&mut self, world: &WorldState, now: u64, rng: &mut R) {
        let free: Vec<Point> = world
            .powerup_spawns()
            .into_iter()
            .filter(|s| !self.active.iter().any(|p| p.position == *s))
            .collect();

        let (Some(position), Some(kind)) = (free.choose(rng), PowerupKind::ALL.choose(rng)) else {
            return;
        };
        self.spawn(*kind, *position, now);
    }

    fn collect<R: Rng + ?Sized>(
        &mut self,
        world: &mut WorldState,
        now: u64,
        rng: &mut R,
    ) -> Vec<PowerupKind> {
        let Some((center, radius)) = world.ball().map(|b| (b.center, b.radius)) else {
            return Vec::new();
        };

        let mut collected = Vec::new();
        for powerup in self.active.iter_mut().filter(|p| !p.started) {
            if center.distance_to(powerup.position) > radius + POWERUP_RADIUS {
                continue;
            }
            powerup.started = true;
            powerup.expires_at = match powerup.kind {
                PowerupKind::Reaim => now,
                _ => now + EFFECT_DURATION_MS,
            };
            collected.push(powerup.kind);
        }

        for kind in &collected {
            Self::apply(*kind, world, now, rng);
        }
        collected
    }

    fn apply<R: Rng + ?Sized>(kind: PowerupKind, world: &mut WorldState, now: u64, rng: &mut R) {
        match kind {
            PowerupKind::Reaim => {
                if let Some(ball) = world.ball_mut() {
                    let speed = ball.velocity.length();
                    if speed > 0.0 {
                        ball.velocity = BallPhysics::random_velocity(speed, rng);
                    }
                }
            }
            PowerupKind::Fragmentation => {
                let Some((center, speed)) = world
                    .ball()
                    .map(|b| (b.center, b.velocity.length().max(1.0)))
                else {
                    return;
                };
                for _ in 0..FRAGMENT_COUNT {
                    let fragment_speed = speed * rng.gen_range(0.5..2.0);
                    let radius = FRAGMENT_MAX_RADIUS
                        - rng.gen_range(0.0..FRAGMENT_MAX_RADIUS - FRAGMENT_MIN_RADIUS);
                    world.objects.push(GameObject::MiniBall(MiniBall {
                        center,
                        radius,
                        velocity: BallPhysics::random_velocity(fragment_speed, rng),
                        expires_at: now + FRAGMENT_LIFETIME_MS,
                    }));
                }
            }
            // Read back through speed_multiplier / controls_inverted
            PowerupKind::SpeedUp | PowerupKind::InverseControls => {}
        }
    }

    /// Remove expired fragments and let the rest drift, bouncing off the bounds
    fn update_fragments(world: &mut WorldState, now: u64) {
        let (width, height) = (world.meta.width, world.meta.height);
        world.objects.retain(|o| match o {
            GameObject::MiniBall(m) => m.expires_at > now,
            _ => true,
        });

        for obj in world.objects.iter_mut() {
            let GameObject::MiniBall(m) = obj else {
                continue;
            };
            m.center += m.velocity;
            if m.center.x < m.radius || m.center.x > width - m.radius {
                m.velocity.x = -m.velocity.x;
            }
            if m.center.y < m.radius || m.center.y > height - m.radius {
                m.velocity.y = -m.velocity.y;
            }
            m.center.x = m.center.x.clamp(0.0, width.max(0.0));
            m.center.y = m.center.y.clamp(0.0, height.max(0.0));
        }
    }
}
