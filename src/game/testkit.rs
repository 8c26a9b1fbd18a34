//! Shared fixtures for simulation tests

use std::sync::Mutex;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::store::AchievementSink;

use super::geometry::Point;
use super::map::{MapCatalog, MapContext};
use super::world::{
    Ball, DamageArea, GameObject, Paddle, PaddlePath, PowerupSpawn, Wall, WorldMeta, WorldState,
};

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Point> {
    vec![
        Point::new(x0, y0),
        Point::new(x1, y0),
        Point::new(x1, y1),
        Point::new(x0, y1),
    ]
}

fn meta(size: f64) -> WorldMeta {
    WorldMeta {
        name: "fixture".to_string(),
        author: "tests".to_string(),
        width: size,
        height: size,
    }
}

/// 100x100 arena walled on all sides (inner faces at 5 and 95), ball radius 2
pub fn boxed_world(center: Point, velocity: Point) -> WorldState {
    WorldState::new(
        meta(100.0),
        vec![
            GameObject::Wall(Wall { shape: rect(0.0, 0.0, 100.0, 5.0) }),
            GameObject::Wall(Wall { shape: rect(0.0, 95.0, 100.0, 100.0) }),
            GameObject::Wall(Wall { shape: rect(0.0, 0.0, 5.0, 100.0) }),
            GameObject::Wall(Wall { shape: rect(95.0, 0.0, 100.0, 100.0) }),
            GameObject::Ball(Ball {
                center,
                radius: 2.0,
                velocity,
            }),
        ],
    )
}

pub fn add_spawn_points(world: &mut WorldState) {
    let points = [
        (30.0, 50.0),
        (70.0, 50.0),
        (50.0, 70.0),
        (30.0, 75.0),
        (70.0, 75.0),
        (50.0, 50.0),
    ];
    for (x, y) in points {
        world.objects.push(GameObject::PowerupSpawn(PowerupSpawn {
            center: Point::new(x, y),
        }));
    }
}

/// Single paddle on an open path from (30,150) to (130,150), anchors at x=70/90
pub fn paddle_world() -> WorldState {
    WorldState::new(
        meta(160.0),
        vec![
            GameObject::PaddlePath(PaddlePath {
                player_nbr: 0,
                shape: vec![Point::new(30.0, 150.0), Point::new(130.0, 150.0)],
            }),
            GameObject::Paddle(Paddle::new(
                0,
                rect(70.0, 148.5, 90.0, 151.5),
                Point::new(70.0, 150.0),
                Point::new(90.0, 150.0),
            )),
            GameObject::PlayerDamageArea(DamageArea {
                player_nbr: 0,
                shape: rect(20.0, 155.0, 140.0, 160.0),
            }),
            GameObject::Ball(Ball {
                center: Point::new(80.0, 80.0),
                radius: 2.0,
                velocity: Point::ZERO,
            }),
        ],
    )
}

/// Single paddle riding a closed square loop (20,20)-(80,80)
pub fn closed_path_world() -> WorldState {
    WorldState::new(
        meta(100.0),
        vec![
            GameObject::PaddlePath(PaddlePath {
                player_nbr: 0,
                shape: vec![
                    Point::new(20.0, 20.0),
                    Point::new(80.0, 20.0),
                    Point::new(80.0, 80.0),
                    Point::new(20.0, 80.0),
                    Point::new(20.0, 20.0),
                ],
            }),
            GameObject::Paddle(Paddle::new(
                0,
                rect(40.0, 19.0, 52.0, 21.0),
                Point::new(40.0, 20.0),
                Point::new(52.0, 20.0),
            )),
            GameObject::Ball(Ball {
                center: Point::new(50.0, 50.0),
                radius: 1.0,
                velocity: Point::ZERO,
            }),
        ],
    )
}

/// The built-in classic map loaded for `players` competitors
pub fn classic_world(players: usize) -> WorldState {
    let catalog = MapCatalog::builtin();
    let map = catalog.get("classic").expect("classic map is built in");
    map.load(&MapContext {
        player_count: players,
        difficulty: 5,
        powerups: true,
    })
    .expect("classic map loads")
}

/// Sink that remembers every unlock
#[derive(Debug, Default)]
pub struct RecordingAchievements {
    unlocked: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingAchievements {
    pub fn unlocked(&self) -> Vec<(Uuid, String)> {
        self.unlocked.lock().unwrap().clone()
    }
}

impl AchievementSink for RecordingAchievements {
    fn unlock(&self, user_id: Uuid, key: &str) {
        self.unlocked.lock().unwrap().push((user_id, key.to_string()));
    }
}
