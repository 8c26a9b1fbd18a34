//! World state - the per-match object set that doubles as the network snapshot

use serde::{Deserialize, Serialize};

use super::geometry::{Point, EPSILON};
use super::powerup::ActivePowerup;

/// Map metadata carried in every snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldMeta {
    pub name: String,
    pub author: String,
    pub width: f64,
    pub height: f64,
}

/// The primary ball
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ball {
    pub center: Point,
    pub radius: f64,
    #[serde(default)]
    pub velocity: Point,
}

/// Cosmetic fragment spawned by the fragmentation powerup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiniBall {
    pub center: Point,
    pub radius: f64,
    pub velocity: Point,
    /// Simulation time (ms) after which the fragment is removed
    pub expires_at: u64,
}

/// Rigid paddle polygon constrained to a path through its two anchors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paddle {
    pub player_nbr: usize,
    pub shape: Vec<Point>,
    pub anchor1: Point,
    pub anchor2: Point,
    /// Shape in the paddle's local frame, captured at load time
    #[serde(skip)]
    frame: Option<PaddleFrame>,
}

/// Paddle geometry relative to the anchor midpoint with the anchor axis on +x
#[derive(Debug, Clone)]
struct PaddleFrame {
    local_shape: Vec<Point>,
    half_span: f64,
}

impl Paddle {
    pub fn new(player_nbr: usize, shape: Vec<Point>, anchor1: Point, anchor2: Point) -> Self {
        let mut paddle = Self {
            player_nbr,
            shape,
            anchor1,
            anchor2,
            frame: None,
        };
        paddle.capture_frame();
        paddle
    }

    /// Midpoint between the anchors
    pub fn midpoint(&self) -> Point {
        self.anchor1.lerp(self.anchor2, 0.5)
    }

    pub fn orientation(&self) -> f64 {
        (self.anchor2 - self.anchor1).angle()
    }

    pub fn anchor_span(&self) -> f64 {
        self.anchor1.distance_to(self.anchor2)
    }

    /// Record the current shape as the rigid body all later placements reuse
    pub fn capture_frame(&mut self) {
        let mid = self.midpoint();
        let angle = self.orientation();
        let local_shape = self
            .shape
            .iter()
            .map(|p| (*p - mid).rotate(-angle))
            .collect();
        self.frame = Some(PaddleFrame {
            local_shape,
            half_span: self.anchor_span() / 2.0,
        });
    }

    /// Place the rigid body with its anchor midpoint at `mid` and anchor axis at `angle`
    pub fn place(&mut self, mid: Point, angle: f64) {
        if self.frame.is_none() {
            self.capture_frame();
        }
        let Some(frame) = self.frame.as_ref() else {
            return;
        };

        self.shape = frame
            .local_shape
            .iter()
            .map(|p| mid + p.rotate(angle))
            .collect();
        let axis = Point::from_angle(angle) * frame.half_span;
        self.anchor1 = mid - axis;
        self.anchor2 = mid + axis;
    }
}

/// Polyline a paddle's anchors travel along
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaddlePath {
    pub player_nbr: usize,
    pub shape: Vec<Point>,
}

impl PaddlePath {
    /// A path is closed when its first and last points coincide
    pub fn is_closed(&self) -> bool {
        match (self.shape.first(), self.shape.last()) {
            (Some(first), Some(last)) if self.shape.len() > 2 => {
                first.distance_to(*last) < EPSILON
            }
            _ => false,
        }
    }
}

/// Polygon behind a paddle; ball contact costs that competitor a life
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageArea {
    pub player_nbr: usize,
    pub shape: Vec<Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wall {
    pub shape: Vec<Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerupSpawn {
    pub center: Point,
}

/// Every simulated object, tagged on `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameObject {
    Ball(Ball),
    Paddle(Paddle),
    Wall(Wall),
    PaddlePath(PaddlePath),
    PlayerDamageArea(DamageArea),
    PowerupSpawn(PowerupSpawn),
    #[serde(rename = "miniBall")]
    MiniBall(MiniBall),
}

/// A solid polygon the ball bounces off
#[derive(Debug, Clone, Copy)]
pub struct Obstacle<'a> {
    /// Paddle owner, `None` for walls
    pub paddle: Option<usize>,
    pub shape: &'a [Point],
}

/// Complete simulated state of one match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    pub meta: WorldMeta,
    pub objects: Vec<GameObject>,
    #[serde(default)]
    pub powerups: Vec<ActivePowerup>,
}

impl WorldState {
    pub fn new(meta: WorldMeta, objects: Vec<GameObject>) -> Self {
        Self {
            meta,
            objects,
            powerups: Vec::new(),
        }
    }

    pub fn ball(&self) -> Option<&Ball> {
        self.objects.iter().find_map(|o| match o {
            GameObject::Ball(b) => Some(b),
            _ => None,
        })
    }

    pub fn ball_mut(&mut self) -> Option<&mut Ball> {
        self.objects.iter_mut().find_map(|o| match o {
            GameObject::Ball(b) => Some(b),
            _ => None,
        })
    }

    pub fn paddle(&self, slot: usize) -> Option<&Paddle> {
        self.objects.iter().find_map(|o| match o {
            GameObject::Paddle(p) if p.player_nbr == slot => Some(p),
            _ => None,
        })
    }

    pub fn paddle_mut(&mut self, slot: usize) -> Option<&mut Paddle> {
        self.objects.iter_mut().find_map(|o| match o {
            GameObject::Paddle(p) if p.player_nbr == slot => Some(p),
            _ => None,
        })
    }

    pub fn path(&self, slot: usize) -> Option<&PaddlePath> {
        self.objects.iter().find_map(|o| match o {
            GameObject::PaddlePath(p) if p.player_nbr == slot => Some(p),
            _ => None,
        })
    }

    pub fn damage_area(&self, slot: usize) -> Option<&DamageArea> {
        self.objects.iter().find_map(|o| match o {
            GameObject::PlayerDamageArea(d) if d.player_nbr == slot => Some(d),
            _ => None,
        })
    }

    /// Number of paddle slots in this world
    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| matches!(o, GameObject::Paddle(_)))
            .count()
    }

    /// Walls and paddles, the polygons the ball reflects off
    pub fn obstacles(&self) -> Vec<Obstacle<'_>> {
        self.objects
            .iter()
            .filter_map(|o| match o {
                GameObject::Wall(w) => Some(Obstacle {
                    paddle: None,
                    shape: &w.shape,
                }),
                GameObject::Paddle(p) => Some(Obstacle {
                    paddle: Some(p.player_nbr),
                    shape: &p.shape,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn powerup_spawns(&self) -> Vec<Point> {
        self.objects
            .iter()
            .filter_map(|o| match o {
                GameObject::PowerupSpawn(s) => Some(s.center),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn mini_ball_count(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| matches!(o, GameObject::MiniBall(_)))
            .count()
    }

    /// Map center, used as a fallback spawn
    pub fn center(&self) -> Point {
        Point::new(self.meta.width / 2.0, self.meta.height / 2.0)
    }

    /// Rough center of a competitor's damage area
    #[cfg(test)]
    pub fn damage_center(&self, slot: usize) -> Option<Point> {
        self.damage_area(slot).map(|d| super::geometry::centroid(&d.shape))
    }
}
