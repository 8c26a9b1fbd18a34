//! Map catalog and loader
//!
//! Map files describe static geometry plus per-object visibility conditions.
//! Loading evaluates the conditions against the session, compacts the player
//! slots to a dense range and produces a fresh [`WorldState`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::geometry::{centroid, Point, EPSILON};
use super::world::{
    Ball, DamageArea, GameObject, Paddle, PaddlePath, PowerupSpawn, Wall, WorldMeta, WorldState,
};

const BUILTIN_MAPS: &[&str] = &[include_str!("../../maps/classic.json")];

#[derive(Debug, Error)]
pub enum MapError {
    #[error("Unknown map: {0}")]
    UnknownMap(String),

    #[error("Map {map} is invalid: {reason}")]
    Invalid { map: String, reason: String },

    #[error("Map {map} has {available} player slots, {requested} needed")]
    NotEnoughSlots {
        map: String,
        available: usize,
        requested: usize,
    },

    #[error("Failed to read map file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse map: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    LargerThan,
    LargerThanOrEqual,
    Equal,
    SmallerThanOrEqual,
    SmallerThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionVariable {
    PlayerCount,
    Difficulty,
    Powerups,
}

/// One visibility gate on a map object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub condition: Comparison,
    pub variable: ConditionVariable,
    pub target: f64,
}

impl Condition {
    pub fn holds(&self, ctx: &MapContext) -> bool {
        let value = match self.variable {
            ConditionVariable::PlayerCount => ctx.player_count as f64,
            ConditionVariable::Difficulty => f64::from(ctx.difficulty),
            ConditionVariable::Powerups => {
                if ctx.powerups {
                    1.0
                } else {
                    0.0
                }
            }
        };
        match self.condition {
            Comparison::LargerThan => value > self.target,
            Comparison::LargerThanOrEqual => value >= self.target,
            Comparison::Equal => (value - self.target).abs() < EPSILON,
            Comparison::SmallerThanOrEqual => value <= self.target,
            Comparison::SmallerThan => value < self.target,
        }
    }
}

/// Session values map conditions are evaluated against
#[derive(Debug, Clone, Copy)]
pub struct MapContext {
    /// Competitors that will actually play (non-spectators)
    pub player_count: usize,
    pub difficulty: u8,
    pub powerups: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapObjectKind {
    Ball,
    Paddle,
    Wall,
    PaddlePath,
    PlayerDamageArea,
    PowerupSpawn,
}

impl MapObjectKind {
    fn is_per_player(self) -> bool {
        matches!(
            self,
            MapObjectKind::Paddle | MapObjectKind::PaddlePath | MapObjectKind::PlayerDamageArea
        )
    }
}

/// Object as written in a map file, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapObject {
    #[serde(rename = "type")]
    pub kind: MapObjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor1: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor2: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_nbr: Option<usize>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMeta {
    pub name: String,
    #[serde(default)]
    pub author: String,
    pub size_x: f64,
    pub size_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDefinition {
    pub meta: MapMeta,
    pub objects: Vec<MapObject>,
}

impl MapDefinition {
    pub fn from_json(json: &str) -> Result<Self, MapError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the initial world for a match
    pub fn load(&self, ctx: &MapContext) -> Result<WorldState, MapError> {
        let name = &self.meta.name;
        if !(self.meta.size_x.is_finite() && self.meta.size_y.is_finite())
            || self.meta.size_x <= 0.0
            || self.meta.size_y <= 0.0
        {
            return Err(self.invalid("map size must be positive"));
        }

        let visible: Vec<&MapObject> = self
            .objects
            .iter()
            .filter(|o| o.conditions.iter().all(|c| c.holds(ctx)))
            .collect();

        let mut numbers: Vec<usize> = visible
            .iter()
            .filter(|o| o.kind.is_per_player())
            .filter_map(|o| o.player_nbr)
            .collect();
        numbers.sort_unstable();
        numbers.dedup();

        if numbers.len() < ctx.player_count {
            return Err(MapError::NotEnoughSlots {
                map: name.clone(),
                available: numbers.len(),
                requested: ctx.player_count,
            });
        }

        // Dense remap preserving relative order; surplus slots are dropped
        let remap: HashMap<usize, usize> = numbers
            .iter()
            .take(ctx.player_count)
            .enumerate()
            .map(|(dense, original)| (*original, dense))
            .collect();

        let mut objects = Vec::with_capacity(visible.len());
        for object in visible {
            if let Some(built) = self.build_object(object, &remap)? {
                objects.push(built);
            }
        }

        let world = WorldState::new(
            WorldMeta {
                name: name.clone(),
                author: self.meta.author.clone(),
                width: self.meta.size_x,
                height: self.meta.size_y,
            },
            objects,
        );
        self.validate(&world, ctx.player_count)?;

        debug!(
            map = %name,
            players = ctx.player_count,
            objects = world.objects.len(),
            "Map loaded"
        );
        Ok(world)
    }

    fn build_object(
        &self,
        object: &MapObject,
        remap: &HashMap<usize, usize>,
    ) -> Result<Option<GameObject>, MapError> {
        let slot = if object.kind.is_per_player() {
            let original = object
                .player_nbr
                .ok_or_else(|| self.invalid(format!("{:?} without playerNbr", object.kind)))?;
            match remap.get(&original) {
                Some(slot) => Some(*slot),
                // Slot not in play this match
                None => return Ok(None),
            }
        } else {
            None
        };

        let built = match object.kind {
            MapObjectKind::Ball => {
                let (center, radius) = object
                    .center
                    .zip(object.radius)
                    .filter(|(c, r)| c.is_finite() && r.is_finite() && *r > 0.0)
                    .ok_or_else(|| self.invalid("ball needs a center and a positive radius"))?;
                GameObject::Ball(Ball {
                    center,
                    radius,
                    velocity: Point::ZERO,
                })
            }
            MapObjectKind::Wall => GameObject::Wall(Wall {
                shape: self.polygon(object, 3)?,
            }),
            MapObjectKind::PowerupSpawn => {
                let center = match (object.center, object.shape.as_deref()) {
                    (Some(center), _) => center,
                    (None, Some(shape)) if !shape.is_empty() => centroid(shape),
                    _ => return Err(self.invalid("powerup spawn needs a center")),
                };
                GameObject::PowerupSpawn(PowerupSpawn { center })
            }
            MapObjectKind::PaddlePath => GameObject::PaddlePath(PaddlePath {
                player_nbr: slot.unwrap_or_default(),
                shape: self.polygon(object, 2)?,
            }),
            MapObjectKind::PlayerDamageArea => GameObject::PlayerDamageArea(DamageArea {
                player_nbr: slot.unwrap_or_default(),
                shape: self.polygon(object, 3)?,
            }),
            MapObjectKind::Paddle => {
                let (anchor1, anchor2) = object
                    .anchor1
                    .zip(object.anchor2)
                    .filter(|(a, b)| a.distance_to(*b) > EPSILON)
                    .ok_or_else(|| self.invalid("paddle needs two distinct anchors"))?;
                GameObject::Paddle(Paddle::new(
                    slot.unwrap_or_default(),
                    self.polygon(object, 3)?,
                    anchor1,
                    anchor2,
                ))
            }
        };
        Ok(Some(built))
    }

    fn polygon(&self, object: &MapObject, min_points: usize) -> Result<Vec<Point>, MapError> {
        match object.shape.as_ref() {
            Some(shape) if shape.len() >= min_points && shape.iter().all(Point::is_finite) => {
                Ok(shape.clone())
            }
            _ => Err(self.invalid(format!(
                "{:?} needs a shape of at least {min_points} points",
                object.kind
            ))),
        }
    }

    fn validate(&self, world: &WorldState, players: usize) -> Result<(), MapError> {
        let balls = world
            .objects
            .iter()
            .filter(|o| matches!(o, GameObject::Ball(_)))
            .count();
        if balls != 1 {
            return Err(self.invalid(format!("expected exactly one ball, found {balls}")));
        }

        for slot in 0..players {
            let paddles = world
                .objects
                .iter()
                .filter(|o| matches!(o, GameObject::Paddle(p) if p.player_nbr == slot))
                .count();
            if paddles != 1 || world.path(slot).is_none() || world.damage_area(slot).is_none() {
                return Err(self.invalid(format!(
                    "player {slot} needs one paddle, a paddle path and a damage area"
                )));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> MapError {
        MapError::Invalid {
            map: self.meta.name.clone(),
            reason: reason.into(),
        }
    }
}

/// Named maps available to sessions
#[derive(Debug, Default)]
pub struct MapCatalog {
    maps: HashMap<String, Arc<MapDefinition>>,
}

impl MapCatalog {
    /// Catalog holding only the maps compiled into the binary
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for json in BUILTIN_MAPS {
            match MapDefinition::from_json(json) {
                Ok(map) => catalog.insert(map),
                Err(e) => warn!(error = %e, "Built-in map failed to parse"),
            }
        }
        catalog
    }

    /// Add every `*.json` map in `dir`; unreadable files are skipped with a warning
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, MapError> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed = std::fs::read_to_string(&path)
                .map_err(MapError::from)
                .and_then(|json| MapDefinition::from_json(&json));
            match parsed {
                Ok(map) => {
                    info!(map = %map.meta.name, path = %path.display(), "Map registered");
                    self.insert(map);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping map file"),
            }
        }
        Ok(loaded)
    }

    pub fn insert(&mut self, map: MapDefinition) {
        self.maps.insert(map.meta.name.clone(), Arc::new(map));
    }

    pub fn get(&self, name: &str) -> Result<Arc<MapDefinition>, MapError> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| MapError::UnknownMap(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    /// Map names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(players: usize) -> MapContext {
        MapContext {
            player_count: players,
            difficulty: 5,
            powerups: true,
        }
    }

    fn classic() -> Arc<MapDefinition> {
        MapCatalog::builtin().get("classic").unwrap()
    }

    fn player_numbers(world: &WorldState) -> Vec<usize> {
        let mut numbers: Vec<usize> = world
            .objects
            .iter()
            .filter_map(|o| match o {
                GameObject::Paddle(p) => Some(p.player_nbr),
                _ => None,
            })
            .collect();
        numbers.sort_unstable();
        numbers
    }

    fn wall_count(world: &WorldState) -> usize {
        world
            .objects
            .iter()
            .filter(|o| matches!(o, GameObject::Wall(_)))
            .count()
    }

    #[test]
    fn test_builtin_catalog_has_classic() {
        let catalog = MapCatalog::builtin();
        assert_eq!(catalog.names(), vec!["classic".to_string()]);
        assert!(matches!(catalog.get("nope"), Err(MapError::UnknownMap(_))));
    }

    #[test]
    fn test_player_count_gate() {
        let map = classic();

        let two = map.load(&ctx(2)).unwrap();
        assert_eq!(player_numbers(&two), vec![0, 1]);
        // Corners plus both side walls
        assert_eq!(wall_count(&two), 6);

        let three = map.load(&ctx(3)).unwrap();
        assert_eq!(player_numbers(&three), vec![0, 1, 2]);
        assert_eq!(wall_count(&three), 5);

        let four = map.load(&ctx(4)).unwrap();
        assert_eq!(player_numbers(&four), vec![0, 1, 2, 3]);
        assert_eq!(wall_count(&four), 4);
    }

    #[test]
    fn test_difficulty_and_powerup_gates() {
        let map = classic();

        let easy = map
            .load(&MapContext {
                player_count: 2,
                difficulty: 3,
                powerups: false,
            })
            .unwrap();
        assert!(easy.powerup_spawns().is_empty());

        let hard = map
            .load(&MapContext {
                player_count: 2,
                difficulty: 8,
                powerups: true,
            })
            .unwrap();
        assert_eq!(hard.powerup_spawns().len(), 6);
        assert_eq!(wall_count(&hard), wall_count(&easy) + 2);
    }

    #[test]
    fn test_sparse_numbers_are_compacted() {
        let json = r#"{
            "meta": { "name": "sparse", "author": "t", "size_x": 100, "size_y": 100 },
            "objects": [
                { "type": "ball", "center": { "x": 50, "y": 50 }, "radius": 1 },
                { "type": "paddle_path", "playerNbr": 7, "shape": [ { "x": 10, "y": 90 }, { "x": 90, "y": 90 } ] },
                { "type": "paddle", "playerNbr": 7,
                  "shape": [ { "x": 40, "y": 89 }, { "x": 60, "y": 89 }, { "x": 60, "y": 91 }, { "x": 40, "y": 91 } ],
                  "anchor1": { "x": 40, "y": 90 }, "anchor2": { "x": 60, "y": 90 } },
                { "type": "player_damage_area", "playerNbr": 7,
                  "shape": [ { "x": 0, "y": 95 }, { "x": 100, "y": 95 }, { "x": 100, "y": 100 }, { "x": 0, "y": 100 } ] },
                { "type": "paddle_path", "playerNbr": 3, "shape": [ { "x": 10, "y": 10 }, { "x": 90, "y": 10 } ] },
                { "type": "paddle", "playerNbr": 3,
                  "shape": [ { "x": 40, "y": 9 }, { "x": 60, "y": 9 }, { "x": 60, "y": 11 }, { "x": 40, "y": 11 } ],
                  "anchor1": { "x": 40, "y": 10 }, "anchor2": { "x": 60, "y": 10 } },
                { "type": "player_damage_area", "playerNbr": 3,
                  "shape": [ { "x": 0, "y": 0 }, { "x": 100, "y": 0 }, { "x": 100, "y": 5 }, { "x": 0, "y": 5 } ] }
            ]
        }"#;
        let map = MapDefinition::from_json(json).unwrap();
        let world = map.load(&ctx(2)).unwrap();

        assert_eq!(player_numbers(&world), vec![0, 1]);
        // Original 3 sorts before 7, so it becomes slot 0
        assert!((world.paddle(0).unwrap().anchor1.y - 10.0).abs() < 1e-9);
        assert!((world.paddle(1).unwrap().anchor1.y - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_too_many_players_is_rejected() {
        let err = classic().load(&ctx(5)).unwrap_err();
        assert!(matches!(
            err,
            MapError::NotEnoughSlots {
                available: 4,
                requested: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_ball_without_radius_is_invalid() {
        let json = r#"{
            "meta": { "name": "broken", "size_x": 10, "size_y": 10 },
            "objects": [ { "type": "ball", "center": { "x": 5, "y": 5 } } ]
        }"#;
        let map = MapDefinition::from_json(json).unwrap();
        assert!(matches!(map.load(&ctx(0)), Err(MapError::Invalid { .. })));
    }

    #[test]
    fn test_condition_comparisons() {
        let c = |condition, target| Condition {
            condition,
            variable: ConditionVariable::PlayerCount,
            target,
        };
        let three = ctx(3);
        assert!(c(Comparison::LargerThan, 2.0).holds(&three));
        assert!(!c(Comparison::LargerThan, 3.0).holds(&three));
        assert!(c(Comparison::LargerThanOrEqual, 3.0).holds(&three));
        assert!(c(Comparison::Equal, 3.0).holds(&three));
        assert!(c(Comparison::SmallerThanOrEqual, 3.0).holds(&three));
        assert!(!c(Comparison::SmallerThan, 3.0).holds(&three));
    }
}
