//! Game session - lobby state machine and per-tick match orchestration
//!
//! A session owns its roster, settings and (while running) its world. It is
//! only ever touched by one caller at a time: the registry hands out the
//! session under its map entry guard, both for inbound commands and for the
//! shared tick.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::AchievementSink;
use crate::util::time::sim_millis;
use crate::ws::protocol::{LobbyControl, LobbyView, MoveTarget, ServerMsg, SettingsUpdate};

use super::bracket::{BracketError, TournamentBracket, BRACKET_SLOTS};
use super::competitor::{
    AiCompetitor, Competitor, CompetitorView, LocalCompetitor, PushChannel, UserCompetitor,
};
use super::geometry::{circle_polygon_collision, Point};
use super::map::{MapCatalog, MapContext, MapError};
use super::paddle::PaddleController;
use super::physics::BallPhysics;
use super::powerup::PowerupManager;
use super::snapshot::{message_frame, Frame, SnapshotBuilder};
use super::world::WorldState;

/// Competitors needed to start
pub const MIN_PLAYERS: usize = 2;
/// Hard roster cap, one full bracket
pub const MAX_ROSTER: usize = BRACKET_SLOTS;

const MAX_LIVES: u32 = 20;
const MAX_SPEED: f64 = 10.0;
const MAX_DIFFICULTY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Running,
}

/// Admin-editable match settings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub map: String,
    pub max_players: usize,
    pub lives: u32,
    /// Ball travel per tick
    pub ball_speed: f64,
    /// Paddle travel per tick along its path
    pub paddle_speed: f64,
    pub powerups: bool,
    pub wonky: bool,
    pub difficulty: u8,
    pub tournament: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            map: "classic".to_string(),
            max_players: 4,
            lives: 3,
            ball_speed: 1.5,
            paddle_speed: 2.0,
            powerups: true,
            wonky: false,
            difficulty: 5,
            tournament: false,
        }
    }
}

impl SessionConfig {
    /// Copy of `self` with `update` applied, or why it cannot be
    fn with_update(
        &self,
        update: &SettingsUpdate,
        maps: &MapCatalog,
    ) -> Result<Self, SessionError> {
        let mut next = self.clone();

        if let Some(map) = &update.map {
            if !maps.contains(map) {
                return Err(SessionError::Map(MapError::UnknownMap(map.clone())));
            }
            next.map = map.clone();
        }
        if let Some(max) = update.max_players {
            if !(MIN_PLAYERS..=MAX_ROSTER).contains(&max) {
                return Err(SessionError::InvalidSetting(format!(
                    "max_players must be between {MIN_PLAYERS} and {MAX_ROSTER}"
                )));
            }
            next.max_players = max;
        }
        if let Some(lives) = update.lives {
            if !(1..=MAX_LIVES).contains(&lives) {
                return Err(SessionError::InvalidSetting(format!(
                    "lives must be between 1 and {MAX_LIVES}"
                )));
            }
            next.lives = lives;
        }
        if let Some(speed) = update.ball_speed {
            next.ball_speed = valid_speed("ball_speed", speed)?;
        }
        if let Some(speed) = update.paddle_speed {
            next.paddle_speed = valid_speed("paddle_speed", speed)?;
        }
        if let Some(difficulty) = update.difficulty {
            if !(1..=MAX_DIFFICULTY).contains(&difficulty) {
                return Err(SessionError::InvalidSetting(format!(
                    "difficulty must be between 1 and {MAX_DIFFICULTY}"
                )));
            }
            next.difficulty = difficulty;
        }
        next.powerups = update.powerups.unwrap_or(next.powerups);
        next.wonky = update.wonky.unwrap_or(next.wonky);
        next.tournament = update.tournament.unwrap_or(next.tournament);
        Ok(next)
    }
}

fn valid_speed(name: &str, speed: f64) -> Result<f64, SessionError> {
    if speed.is_finite() && speed > 0.0 && speed <= MAX_SPEED {
        Ok(speed)
    } else {
        Err(SessionError::InvalidSetting(format!(
            "{name} must be in (0, {MAX_SPEED}]"
        )))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Match is already running")]
    AlreadyRunning,

    #[error("Session is full")]
    Full,

    #[error("User is already in this session")]
    DuplicateUser,

    #[error("User already has a local player")]
    DuplicateLocal,

    #[error("No competitor with player id {0}")]
    NotFound(u32),

    #[error("User is not in this session")]
    NotMember,

    #[error("Only the session admin can do that")]
    NotAdmin,

    #[error("Need at least {need} players, have {have}")]
    NotEnoughPlayers { have: usize, need: usize },

    #[error("Not every player is ready")]
    NotReady,

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Session is closed")]
    Closed,

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Bracket(#[from] BracketError),
}

impl SessionError {
    /// Stable code sent to clients alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::AlreadyRunning => "already_running",
            SessionError::Full => "session_full",
            SessionError::DuplicateUser => "duplicate_user",
            SessionError::DuplicateLocal => "duplicate_local",
            SessionError::NotFound(_) => "not_found",
            SessionError::NotMember => "not_member",
            SessionError::NotAdmin => "not_admin",
            SessionError::NotEnoughPlayers { .. } => "not_enough_players",
            SessionError::NotReady => "not_ready",
            SessionError::InvalidSetting(_) => "invalid_setting",
            SessionError::Closed => "session_closed",
            SessionError::Map(_) => "map_error",
            SessionError::Bracket(_) => "bracket_error",
        }
    }
}

/// What a tick did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Still in the lobby
    Idle,
    Running,
    /// Terminal; the registry drops the session
    Closed,
}

/// Public listing entry
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub admin: Uuid,
    pub status: SessionStatus,
    pub map: String,
    pub players: usize,
    pub max_players: usize,
    pub tournament: bool,
}

pub struct GameSession {
    id: Uuid,
    status: SessionStatus,
    admin: Uuid,
    roster: Vec<Box<dyn Competitor>>,
    config: SessionConfig,
    maps: Arc<MapCatalog>,
    achievements: Arc<dyn AchievementSink>,
    world: Option<WorldState>,
    /// Player id seated in each world slot
    slots: Vec<u32>,
    ball_spawn: Point,
    powerups: PowerupManager,
    bracket: Option<TournamentBracket>,
    rng: ChaCha8Rng,
    tick: u64,
    next_player_id: u32,
    start_requested: bool,
    /// Player whose paddle touched the ball last
    last_hitter: Option<u32>,
    snapshots: SnapshotBuilder,
    closed: bool,
}

impl GameSession {
    /// New lobby with `admin` as its first competitor
    pub fn new(
        id: Uuid,
        admin: Uuid,
        admin_name: impl Into<String>,
        channel: Option<PushChannel>,
        maps: Arc<MapCatalog>,
        achievements: Arc<dyn AchievementSink>,
        seed: u64,
    ) -> Self {
        let mut session = Self {
            id,
            status: SessionStatus::Waiting,
            admin,
            roster: Vec::new(),
            config: SessionConfig::default(),
            maps,
            achievements,
            world: None,
            slots: Vec::new(),
            ball_spawn: Point::ZERO,
            powerups: PowerupManager::new(false, 0),
            bracket: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            tick: 0,
            next_player_id: 1,
            start_requested: false,
            last_hitter: None,
            snapshots: SnapshotBuilder::new(),
            closed: false,
        };
        let player_id = session.allocate_player_id();
        session
            .roster
            .push(Box::new(UserCompetitor::new(player_id, admin, admin_name, channel)));
        info!(session_id = %id, admin = %admin, seed, "Session created");
        session
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.roster.is_empty()
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    pub fn has_user(&self, user_id: Uuid) -> bool {
        self.find_user(user_id).is_some()
    }

    pub fn competitors(&self) -> Vec<CompetitorView> {
        self.roster.iter().map(|c| c.describe()).collect()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            admin: self.admin,
            status: self.status,
            map: self.config.map.clone(),
            players: self.roster.len(),
            max_players: self.config.max_players,
            tournament: self.config.tournament,
        }
    }

    // ----- roster -----

    pub fn add_user(
        &mut self,
        user_id: Uuid,
        name: impl Into<String>,
        channel: PushChannel,
    ) -> Result<u32, SessionError> {
        if self.has_user(user_id) {
            return Err(SessionError::DuplicateUser);
        }
        self.ensure_seat_available()?;

        let player_id = self.allocate_player_id();
        let user = UserCompetitor::new(player_id, user_id, name, Some(channel));
        self.roster.push(Box::new(user));
        info!(session_id = %self.id, user_id = %user_id, player_id, "User joined session");
        self.broadcast_lobby();
        Ok(player_id)
    }

    /// Attach a fresh connection to a user already in the roster
    pub fn reconnect(&mut self, user_id: Uuid, channel: PushChannel) -> Result<u32, SessionError> {
        let index = self.find_user(user_id).ok_or(SessionError::NotMember)?;
        let competitor = &mut self.roster[index];
        competitor.attach(channel);
        let player_id = competitor.profile().player_id;
        info!(session_id = %self.id, user_id = %user_id, player_id, "User reconnected");

        if self.status == SessionStatus::Running {
            self.push_to(user_id, &ServerMsg::GameStarted {
                message: self.id.to_string(),
            });
        }
        self.broadcast_lobby();
        Ok(player_id)
    }

    pub fn add_ai(&mut self, requester: Uuid, skill: u8) -> Result<u32, SessionError> {
        self.ensure_admin(requester)?;
        self.ensure_seat_available()?;

        let player_id = self.allocate_player_id();
        let ai = AiCompetitor::new(player_id, skill);
        debug!(session_id = %self.id, player_id, skill, "AI added");
        self.roster.push(Box::new(ai));
        self.broadcast_lobby();
        Ok(player_id)
    }

    pub fn add_local(&mut self, owner: Uuid, name: Option<String>) -> Result<u32, SessionError> {
        let owner_index = self.find_user(owner).ok_or(SessionError::NotMember)?;
        if self.roster.iter().any(|c| c.owner() == Some(owner)) {
            return Err(SessionError::DuplicateLocal);
        }
        self.ensure_seat_available()?;

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} (local)", self.roster[owner_index].profile().name));
        let player_id = self.allocate_player_id();
        self.roster
            .push(Box::new(LocalCompetitor::new(player_id, owner, name)));
        debug!(session_id = %self.id, owner = %owner, player_id, "Local player added");
        self.broadcast_lobby();
        Ok(player_id)
    }

    /// Remove a competitor. The admin may remove anyone; a user may remove
    /// themselves or their own local player.
    pub fn remove(&mut self, requester: Uuid, player_id: u32) -> Result<(), SessionError> {
        let index = self
            .roster
            .iter()
            .position(|c| c.profile().player_id == player_id)
            .ok_or(SessionError::NotFound(player_id))?;

        let target = &self.roster[index];
        let allowed = requester == self.admin
            || target.user_id() == Some(requester)
            || target.owner() == Some(requester);
        if !allowed {
            return Err(SessionError::NotAdmin);
        }

        self.remove_at(index);
        Ok(())
    }

    /// Remove the user and everything they own
    pub fn leave(&mut self, user_id: Uuid) -> Result<(), SessionError> {
        let index = self.find_user(user_id).ok_or(SessionError::NotMember)?;
        self.remove_at(index);
        Ok(())
    }

    /// Connection dropped: keep the seat, clear the live handle
    pub fn disconnect(&mut self, user_id: Uuid) {
        let Some(index) = self.find_user(user_id) else {
            return;
        };
        self.roster[index].disconnect();
        info!(session_id = %self.id, user_id = %user_id, "User disconnected");
        self.broadcast_lobby();
    }

    /// Connection `channel` closed. A newer connection that already
    /// replaced it is left alone.
    pub fn release(&mut self, user_id: Uuid, channel: &PushChannel) {
        let current = self
            .find_user(user_id)
            .and_then(|i| self.roster[i].push_channel())
            .is_some_and(|c| c.same_channel(channel));
        if current {
            self.disconnect(user_id);
        }
    }

    /// Store a movement intent; last write wins
    pub fn set_direction(
        &mut self,
        user_id: Uuid,
        target: MoveTarget,
        dir: f64,
    ) -> Result<(), SessionError> {
        let competitor = self
            .roster
            .iter_mut()
            .find(|c| match target {
                MoveTarget::User => c.user_id() == Some(user_id),
                MoveTarget::Local => c.owner() == Some(user_id),
            })
            .ok_or(SessionError::NotMember)?;

        competitor.profile_mut().movement_direction = normalize_direction(dir);
        Ok(())
    }

    // ----- lifecycle -----

    pub fn update_settings(
        &mut self,
        requester: Uuid,
        update: &SettingsUpdate,
    ) -> Result<(), SessionError> {
        self.ensure_admin(requester)?;
        if self.status != SessionStatus::Waiting {
            return Err(SessionError::AlreadyRunning);
        }
        let next = self.config.with_update(update, &self.maps)?;
        if next.max_players < self.roster.len() {
            return Err(SessionError::InvalidSetting(
                "max_players is below the current roster size".to_string(),
            ));
        }

        self.config = next;
        debug!(session_id = %self.id, config = ?self.config, "Settings updated");
        self.broadcast_lobby();
        Ok(())
    }

    /// Ask for the match to start on the next tick where everyone is ready
    pub fn request_start(&mut self, requester: Uuid) -> Result<(), SessionError> {
        self.ensure_admin(requester)?;
        if self.status != SessionStatus::Waiting {
            return Err(SessionError::AlreadyRunning);
        }
        let joined = self.joined_count();
        if joined < MIN_PLAYERS {
            return Err(SessionError::NotEnoughPlayers {
                have: joined,
                need: MIN_PLAYERS,
            });
        }
        self.start_requested = true;
        info!(session_id = %self.id, "Start requested");
        Ok(())
    }

    /// At least two joined competitors and every joined one ready
    pub fn ready_to_start(&self) -> bool {
        self.joined_count() >= MIN_PLAYERS
            && self
                .roster
                .iter()
                .filter(|c| c.profile().joined)
                .all(|c| c.is_ready())
    }

    /// Load the map and flip to running. State is untouched on failure.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.status != SessionStatus::Waiting {
            return Err(SessionError::AlreadyRunning);
        }
        let joined = self.joined_count();
        if joined < MIN_PLAYERS {
            return Err(SessionError::NotEnoughPlayers {
                have: joined,
                need: MIN_PLAYERS,
            });
        }
        if !self.ready_to_start() {
            return Err(SessionError::NotReady);
        }

        let ids: Vec<u32> = self.roster.iter().map(|c| c.profile().player_id).collect();
        let (bracket, seated) = if self.config.tournament {
            let bracket = TournamentBracket::seed(&ids)?;
            let seated = bracket
                .current_match()
                .and_then(|(_, m)| Some(vec![m.a?, m.b?]))
                .ok_or(SessionError::NotEnoughPlayers {
                    have: ids.len(),
                    need: MIN_PLAYERS,
                })?;
            (Some(bracket), seated)
        } else {
            (None, ids)
        };
        let world = self.load_world(seated.len())?;

        for competitor in self.roster.iter_mut() {
            let profile = competitor.profile_mut();
            profile.lives = self.config.lives;
            profile.spectator = false;
            profile.movement_direction = 0;
        }
        self.bracket = bracket;
        self.tick = 0;
        self.powerups = PowerupManager::new(self.config.powerups, 0);
        self.seat(world, seated, 0);
        self.status = SessionStatus::Running;
        self.start_requested = false;

        info!(
            session_id = %self.id,
            map = %self.config.map,
            players = self.roster.len(),
            tournament = self.config.tournament,
            "Match started"
        );
        self.broadcast(&ServerMsg::GameStarted {
            message: self.id.to_string(),
        });
        Ok(())
    }

    /// One step of the shared scheduler
    pub fn tick(&mut self) -> TickOutcome {
        if self.is_closed() {
            return TickOutcome::Closed;
        }

        if self.status == SessionStatus::Waiting {
            if !(self.start_requested && self.ready_to_start()) {
                return TickOutcome::Idle;
            }
            if let Err(e) = self.start() {
                warn!(session_id = %self.id, error = %e, "Match failed to start");
                self.start_requested = false;
                self.push_to(self.admin, &ServerMsg::error(e.code(), &e));
                return TickOutcome::Idle;
            }
            // Initial snapshot goes out on the tick that starts the match
            self.push_state();
            return TickOutcome::Running;
        }

        self.tick += 1;
        let now = sim_millis(self.tick);
        self.simulate(now);
        self.settle(now);

        if self.is_closed() {
            TickOutcome::Closed
        } else {
            self.push_state();
            TickOutcome::Running
        }
    }

    /// Movement, ball, AI, powerups, life loss
    fn simulate(&mut self, now: u64) {
        let Some(world) = self.world.as_mut() else {
            warn!(session_id = %self.id, "Running session has no world");
            return;
        };
        let inverted = self.powerups.controls_inverted(now);
        let ball_speed = self.config.ball_speed * self.powerups.speed_multiplier(now);
        let paddle_speed = self.config.paddle_speed;

        for (slot, player_id) in self.slots.iter().enumerate() {
            let competitor = self
                .roster
                .iter()
                .find(|c| c.profile().player_id == *player_id);
            let Some(competitor) = competitor else {
                continue;
            };
            if !competitor.profile().is_active() {
                continue;
            }
            let dir = competitor.profile().movement_direction;
            let dir = if inverted { -dir } else { dir };
            let step = PaddleController::move_paddle(world, slot, dir, paddle_speed);
            if step.hit_ball {
                self.last_hitter = Some(*player_id);
            }
        }

        let ball_step =
            BallPhysics::move_ball(world, ball_speed, self.config.wonky, &mut self.rng);
        if let Some(slot) = ball_step.touched_paddles.last() {
            self.last_hitter = self.slots.get(*slot).copied();
        }

        for competitor in self.roster.iter_mut() {
            if !competitor.profile().is_active() {
                continue;
            }
            let player_id = competitor.profile().player_id;
            let Some(slot) = self.slots.iter().position(|p| *p == player_id) else {
                continue;
            };
            let Some(brain) = competitor.brain_mut() else {
                continue;
            };
            let dir = brain.think(
                world,
                slot,
                now,
                ball_speed,
                paddle_speed,
                inverted,
                &mut self.rng,
            );
            competitor.profile_mut().movement_direction = dir;
        }

        let collected = self.powerups.update(world, now, &mut self.rng);
        if !collected.is_empty() {
            let collector = self.last_hitter.and_then(|id| {
                self.roster
                    .iter()
                    .find(|c| c.profile().player_id == id)
                    .and_then(|c| c.user_id())
            });
            for kind in collected {
                debug!(session_id = %self.id, powerup = ?kind, "Powerup collected");
                if let Some(user_id) = collector {
                    self.achievements.unlock(user_id, kind.achievement_key());
                }
            }
        }

        let scored = world.ball().and_then(|ball| {
            (0..self.slots.len()).find(|slot| {
                world
                    .damage_area(*slot)
                    .is_some_and(|d| circle_polygon_collision(ball.center, ball.radius, &d.shape))
            })
        });
        let Some(slot) = scored else {
            return;
        };

        BallPhysics::reset_ball(world, self.ball_spawn);
        self.last_hitter = None;
        let player_id = self.slots[slot];
        if let Some(competitor) = self
            .roster
            .iter_mut()
            .find(|c| c.profile().player_id == player_id)
        {
            let profile = competitor.profile_mut();
            profile.lives = profile.lives.saturating_sub(1);
            info!(
                session_id = %self.id,
                player_id,
                lives = profile.lives,
                "Life lost"
            );
            if profile.lives == 0 {
                profile.spectator = true;
                profile.movement_direction = 0;
                info!(session_id = %self.id, player_id, "Competitor eliminated");
            }
        }
    }

    /// Apply eliminations and departures: reseat, advance the bracket, or
    /// declare a winner.
    fn settle(&mut self, now: u64) {
        if self.bracket.is_some() {
            self.settle_tournament(now);
        } else {
            self.settle_free_for_all(now);
        }
    }

    fn settle_free_for_all(&mut self, now: u64) {
        let active: Vec<u32> = self
            .roster
            .iter()
            .filter(|c| c.profile().is_active())
            .map(|c| c.profile().player_id)
            .collect();

        if active.len() < MIN_PLAYERS {
            self.finish(active.first().copied());
            return;
        }
        if active == self.slots {
            return;
        }

        match self.load_world(active.len()) {
            Ok(world) => {
                debug!(session_id = %self.id, players = active.len(), "Reloading world");
                self.seat(world, active, now);
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Reload failed, ending match");
                self.finish(None);
            }
        }
    }

    fn settle_tournament(&mut self, now: u64) {
        loop {
            let Some(bracket) = self.bracket.as_ref() else {
                return;
            };
            if bracket.is_finished() {
                let champion = bracket.champion();
                self.finish(champion);
                return;
            }
            let Some((index, m)) = bracket.current_match() else {
                warn!(session_id = %self.id, "Bracket has no playable match");
                self.finish(None);
                return;
            };
            let (Some(a), Some(b)) = (m.a, m.b) else {
                self.finish(None);
                return;
            };

            let in_play = |id: u32| {
                self.roster
                    .iter()
                    .any(|c| c.profile().player_id == id && c.profile().is_active())
            };
            let winner = match (in_play(a), in_play(b)) {
                (true, true) => {
                    if self.slots == [a, b] {
                        return;
                    }
                    self.start_bracket_match(a, b, now);
                    return;
                }
                (true, false) => a,
                (false, true) => b,
                (false, false) => a,
            };
            let loser = m.opponent_of(winner).unwrap_or(b);

            if let Some(bracket) = self.bracket.as_mut() {
                if let Err(e) = bracket.advance(index, winner) {
                    warn!(session_id = %self.id, error = %e, "Bracket advance failed");
                    self.finish(None);
                    return;
                }
            }
            if let Some(competitor) = self.competitor_mut(loser) {
                competitor.profile_mut().spectator = true;
                competitor.profile_mut().movement_direction = 0;
            }
            info!(session_id = %self.id, winner, loser, "Bracket match decided");
        }
    }

    fn start_bracket_match(&mut self, a: u32, b: u32, now: u64) {
        let lives = self.config.lives;
        for id in [a, b] {
            if let Some(competitor) = self.competitor_mut(id) {
                competitor.profile_mut().lives = lives;
                competitor.profile_mut().movement_direction = 0;
            }
        }
        match self.load_world(2) {
            Ok(world) => {
                info!(session_id = %self.id, a, b, "Bracket match loaded");
                self.seat(world, vec![a, b], now);
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Bracket match failed to load");
                self.finish(None);
            }
        }
    }

    fn finish(&mut self, winner: Option<u32>) {
        let name = winner.and_then(|id| {
            self.roster
                .iter()
                .find(|c| c.profile().player_id == id)
                .map(|c| c.profile().name.clone())
        });
        let message = match &name {
            Some(name) => format!("{name} won"),
            None => "Match ended".to_string(),
        };
        let stats = self.snapshots.stats();
        info!(
            session_id = %self.id,
            winner = ?winner,
            ticks = self.tick,
            snapshots = stats.total_snapshots,
            snapshot_bytes = stats.total_bytes,
            "Match finished"
        );
        self.close(message);
    }

    fn close(&mut self, reason: String) {
        if self.closed {
            return;
        }
        self.broadcast(&ServerMsg::GameClosed { message: reason });
        self.closed = true;
    }

    // ----- helpers -----

    fn load_world(&self, players: usize) -> Result<WorldState, SessionError> {
        let map = self.maps.get(&self.config.map)?;
        Ok(map.load(&MapContext {
            player_count: players,
            difficulty: self.config.difficulty,
            powerups: self.config.powerups,
        })?)
    }

    fn seat(&mut self, world: WorldState, slots: Vec<u32>, now: u64) {
        self.ball_spawn = world.ball().map(|b| b.center).unwrap_or_else(|| world.center());
        self.world = Some(world);
        self.slots = slots;
        self.last_hitter = None;
        self.powerups.clear(now);
        for competitor in self.roster.iter_mut() {
            if let Some(brain) = competitor.brain_mut() {
                brain.reset();
            }
        }
    }

    fn competitor_mut(&mut self, player_id: u32) -> Option<&mut Box<dyn Competitor>> {
        self.roster
            .iter_mut()
            .find(|c| c.profile().player_id == player_id)
    }

    fn remove_at(&mut self, index: usize) {
        let removed = self.roster.remove(index);
        let removed_user = removed.user_id();
        if let Some(user_id) = removed_user {
            self.roster.retain(|c| c.owner() != Some(user_id));
        }
        info!(
            session_id = %self.id,
            player_id = removed.profile().player_id,
            kind = ?removed.kind(),
            "Competitor removed"
        );

        if self.status == SessionStatus::Waiting && removed_user == Some(self.admin) {
            self.close("Admin left the session".to_string());
            return;
        }
        if self.status == SessionStatus::Waiting {
            self.broadcast_lobby();
        }
        // Running matches pick up the departure on the next tick
    }

    fn find_user(&self, user_id: Uuid) -> Option<usize> {
        self.roster.iter().position(|c| c.user_id() == Some(user_id))
    }

    fn ensure_admin(&self, requester: Uuid) -> Result<(), SessionError> {
        if requester == self.admin {
            Ok(())
        } else {
            Err(SessionError::NotAdmin)
        }
    }

    fn ensure_seat_available(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if self.status == SessionStatus::Running {
            return Err(SessionError::AlreadyRunning);
        }
        if self.roster.len() >= self.config.max_players.min(MAX_ROSTER) {
            return Err(SessionError::Full);
        }
        Ok(())
    }

    fn allocate_player_id(&mut self) -> u32 {
        let id = self.next_player_id;
        self.next_player_id += 1;
        id
    }

    fn joined_count(&self) -> usize {
        self.roster.iter().filter(|c| c.profile().joined).count()
    }

    // ----- pushes -----

    fn push_state(&mut self) {
        let Some(world) = self.world.as_ref() else {
            return;
        };
        if let Some(frame) = self.snapshots.state_frame(world) {
            self.send_all(&frame);
        }
    }

    fn broadcast(&mut self, msg: &ServerMsg) {
        if let Some(frame) = message_frame(msg) {
            self.send_all(&frame);
        }
    }

    fn push_to(&mut self, user_id: Uuid, msg: &ServerMsg) {
        let Some(frame) = message_frame(msg) else {
            return;
        };
        let Some(index) = self.find_user(user_id) else {
            return;
        };
        let delivered = self.roster[index]
            .push_channel()
            .map(|c| c.send(&frame))
            .unwrap_or(true);
        if !delivered {
            self.roster[index].disconnect();
        }
    }

    /// Send to every connected user; closed channels mark the user disconnected
    fn send_all(&mut self, frame: &Frame) {
        for competitor in self.roster.iter_mut() {
            let Some(channel) = competitor.push_channel() else {
                continue;
            };
            if !channel.send(frame) {
                debug!(
                    session_id = %self.id,
                    player_id = competitor.profile().player_id,
                    "Push channel closed, marking disconnected"
                );
                competitor.disconnect();
            }
        }
    }

    /// Push the lobby view, admin variant to the admin
    pub fn broadcast_lobby(&mut self) {
        let admin_frame = message_frame(&ServerMsg::Lobby {
            view: self.lobby_view(true),
        });
        let member_frame = message_frame(&ServerMsg::Lobby {
            view: self.lobby_view(false),
        });
        let admin = self.admin;

        for competitor in self.roster.iter_mut() {
            let frame = if competitor.user_id() == Some(admin) {
                &admin_frame
            } else {
                &member_frame
            };
            let (Some(frame), Some(channel)) = (frame, competitor.push_channel()) else {
                continue;
            };
            if !channel.send(frame) {
                competitor.disconnect();
            }
        }
    }

    pub fn lobby_view(&self, admin: bool) -> LobbyView {
        let controls = if admin {
            LobbyControl::ADMIN
        } else {
            LobbyControl::MEMBER
        };
        LobbyView {
            session_id: self.id,
            status: self.status,
            admin,
            settings: self.config.clone(),
            competitors: self.competitors(),
            controls: controls.to_vec(),
            bracket: self.bracket.clone(),
        }
    }
}

/// NaN and out-of-range intents collapse to -1, 0 or 1
fn normalize_direction(dir: f64) -> i8 {
    if !dir.is_finite() || dir == 0.0 {
        0
    } else if dir > 0.0 {
        1
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::competitor::CompetitorKind;
    use crate::game::testkit::RecordingAchievements;
    use crate::game::world::GameObject;
    use tokio::sync::mpsc;

    struct Client {
        user_id: Uuid,
        rx: mpsc::Receiver<Frame>,
    }

    impl Client {
        fn new() -> (Self, PushChannel) {
            let (tx, rx) = mpsc::channel(256);
            (
                Self {
                    user_id: Uuid::new_v4(),
                    rx,
                },
                PushChannel::new(tx),
            )
        }

        fn drain(&mut self) -> Vec<serde_json::Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn types(&mut self) -> Vec<String> {
            self.drain()
                .into_iter()
                .map(|v| v["type"].as_str().unwrap().to_string())
                .collect()
        }
    }

    fn session_with_admin() -> (GameSession, Client, Arc<RecordingAchievements>) {
        let (admin, channel) = Client::new();
        let achievements = Arc::new(RecordingAchievements::default());
        let session = GameSession::new(
            Uuid::new_v4(),
            admin.user_id,
            "alice",
            Some(channel),
            Arc::new(MapCatalog::builtin()),
            achievements.clone(),
            42,
        );
        (session, admin, achievements)
    }

    fn lives_of(session: &GameSession, player_id: u32) -> u32 {
        session
            .roster
            .iter()
            .find(|c| c.profile().player_id == player_id)
            .unwrap()
            .profile()
            .lives
    }

    /// Park the ball inside `slot`'s damage area
    fn score_against(session: &mut GameSession, slot: usize) {
        let world = session.world.as_mut().unwrap();
        let spot = world.damage_center(slot).unwrap();
        let ball = world.ball_mut().unwrap();
        ball.center = spot;
        ball.velocity = Point::ZERO;
    }

    #[test]
    fn test_two_ready_players_start_next_tick() {
        let (mut session, mut alice, _) = session_with_admin();
        let (mut bob, channel) = Client::new();
        session.add_user(bob.user_id, "bob", channel).unwrap();
        session.request_start(alice.user_id).unwrap();
        alice.drain();
        bob.drain();

        assert_eq!(session.status(), SessionStatus::Waiting);
        assert_eq!(session.tick(), TickOutcome::Running);
        assert_eq!(session.status(), SessionStatus::Running);

        for client in [&mut alice, &mut bob] {
            let types = client.types();
            assert_eq!(types, vec!["game_started".to_string(), "state".to_string()]);
        }
    }

    #[test]
    fn test_waits_for_disconnected_player_to_leave_or_return() {
        let (mut session, alice, _) = session_with_admin();
        let (bob, channel) = Client::new();
        session.add_user(bob.user_id, "bob", channel).unwrap();
        let (carol, channel) = Client::new();
        session.add_user(carol.user_id, "carol", channel).unwrap();
        session.request_start(alice.user_id).unwrap();

        // Closed receiver: still joined, no longer ready
        drop(carol);
        assert!(!session.ready_to_start());
        assert_eq!(session.tick(), TickOutcome::Idle);
    }

    #[test]
    fn test_roster_rules() {
        let (mut session, alice, _) = session_with_admin();
        let (bob, channel) = Client::new();

        assert!(matches!(
            session.add_ai(bob.user_id, 5),
            Err(SessionError::NotAdmin)
        ));
        session.add_user(bob.user_id, "bob", channel).unwrap();
        let (_, dup) = Client::new();
        assert!(matches!(
            session.add_user(bob.user_id, "bob", dup),
            Err(SessionError::DuplicateUser)
        ));

        session.add_ai(alice.user_id, 3).unwrap();
        session.add_local(bob.user_id, None).unwrap();
        assert!(matches!(session.add_ai(alice.user_id, 3), Err(SessionError::Full)));
        assert_eq!(session.roster_len(), 4);
    }

    #[test]
    fn test_roster_is_frozen_while_running() {
        let (mut session, alice, _) = session_with_admin();
        session.add_ai(alice.user_id, 5).unwrap();
        session.request_start(alice.user_id).unwrap();
        assert_eq!(session.tick(), TickOutcome::Running);

        let (bob, channel) = Client::new();
        assert!(matches!(
            session.add_user(bob.user_id, "bob", channel),
            Err(SessionError::AlreadyRunning)
        ));
        assert!(matches!(
            session.add_ai(alice.user_id, 5),
            Err(SessionError::AlreadyRunning)
        ));
        assert!(matches!(
            session.add_local(alice.user_id, None),
            Err(SessionError::AlreadyRunning)
        ));
        assert_eq!(session.roster_len(), 2);
    }

    #[test]
    fn test_remove_cascades_to_local() {
        let (mut session, alice, _) = session_with_admin();
        let (bob, channel) = Client::new();
        let bob_id = session.add_user(bob.user_id, "bob", channel).unwrap();
        session.add_local(bob.user_id, Some("bobby".to_string())).unwrap();
        assert_eq!(session.roster_len(), 3);

        session.remove(alice.user_id, bob_id).unwrap();
        assert_eq!(session.roster_len(), 1);
        assert!(!session.is_closed());
    }

    #[test]
    fn test_admin_leaving_before_start_closes() {
        let (mut session, alice, _) = session_with_admin();
        let (mut bob, channel) = Client::new();
        session.add_user(bob.user_id, "bob", channel).unwrap();
        bob.drain();

        session.leave(alice.user_id).unwrap();
        assert!(session.is_closed());
        assert_eq!(bob.types(), vec!["game_closed".to_string()]);
        assert_eq!(session.tick(), TickOutcome::Closed);
    }

    #[test]
    fn test_failed_mutations_leave_state_alone() {
        let (mut session, alice, _) = session_with_admin();
        let before = session.config.clone();
        let update = SettingsUpdate {
            lives: Some(5),
            ball_speed: Some(f64::NAN),
            ..Default::default()
        };
        assert!(session.update_settings(alice.user_id, &update).is_err());
        assert_eq!(session.config.lives, before.lives);

        assert!(matches!(
            session.request_start(alice.user_id),
            Err(SessionError::NotEnoughPlayers { have: 1, need: 2 })
        ));
        assert!(matches!(session.start(), Err(SessionError::NotEnoughPlayers { .. })));
        assert_eq!(session.status(), SessionStatus::Waiting);
    }

    #[test]
    fn test_direction_intent_is_normalized() {
        let (mut session, alice, _) = session_with_admin();
        session.add_local(alice.user_id, None).unwrap();

        session.set_direction(alice.user_id, MoveTarget::User, 7.0).unwrap();
        session.set_direction(alice.user_id, MoveTarget::Local, f64::NAN).unwrap();

        let dirs: Vec<i8> = session
            .roster
            .iter()
            .map(|c| c.profile().movement_direction)
            .collect();
        assert_eq!(dirs, vec![1, 0]);
        assert!(session
            .set_direction(Uuid::new_v4(), MoveTarget::User, 1.0)
            .is_err());
    }

    #[test]
    fn test_life_loss_resets_ball() {
        let (mut session, alice, _) = session_with_admin();
        session.add_ai(alice.user_id, 5).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();

        score_against(&mut session, 0);
        let loser = session.slots[0];
        assert_eq!(session.tick(), TickOutcome::Running);

        assert_eq!(lives_of(&session, loser), 2);
        let ball = session.world.as_ref().unwrap().ball().unwrap();
        assert_eq!(ball.center, session.ball_spawn);
    }

    #[test]
    fn test_tournament_elimination_advances_bracket() {
        let (mut session, mut alice, _) = session_with_admin();
        let ai = session.add_ai(alice.user_id, 5).unwrap();
        let update = SettingsUpdate {
            lives: Some(1),
            tournament: Some(true),
            ..Default::default()
        };
        session.update_settings(alice.user_id, &update).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();
        assert!(session.bracket.is_some());
        alice.drain();

        // Alice sits in slot 0
        assert_eq!(session.slots, vec![1, ai]);
        score_against(&mut session, 0);
        assert_eq!(session.tick(), TickOutcome::Closed);

        let alice_profile = session.roster[0].profile();
        assert_eq!(alice_profile.lives, 0);
        assert!(alice_profile.spectator);

        let bracket = session.bracket.as_ref().unwrap();
        assert_eq!(bracket.rounds()[0][0].winner, Some(ai));
        assert_eq!(bracket.champion(), Some(ai));

        let messages = alice.drain();
        let closed = messages.last().unwrap();
        assert_eq!(closed["type"], "game_closed");
        assert_eq!(closed["message"], format!("AI {ai} won"));
    }

    #[test]
    fn test_tournament_plays_next_match() {
        let (mut session, alice, _) = session_with_admin();
        let update = SettingsUpdate {
            lives: Some(1),
            tournament: Some(true),
            max_players: Some(4),
            ..Default::default()
        };
        session.update_settings(alice.user_id, &update).unwrap();
        let b = session.add_ai(alice.user_id, 5).unwrap();
        let c = session.add_ai(alice.user_id, 5).unwrap();
        let d = session.add_ai(alice.user_id, 5).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();
        assert_eq!(session.slots, vec![1, b]);

        score_against(&mut session, 1);
        assert_eq!(session.tick(), TickOutcome::Running);
        assert_eq!(session.slots, vec![c, d]);
        assert_eq!(session.world.as_ref().unwrap().slot_count(), 2);
        assert_eq!(session.bracket.as_ref().unwrap().rounds()[1][0].a, Some(1));
    }

    #[test]
    fn test_free_for_all_reloads_after_elimination() {
        let (mut session, alice, _) = session_with_admin();
        let update = SettingsUpdate {
            lives: Some(1),
            ..Default::default()
        };
        session.update_settings(alice.user_id, &update).unwrap();
        let b = session.add_ai(alice.user_id, 5).unwrap();
        let c = session.add_ai(alice.user_id, 5).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();
        assert_eq!(session.world.as_ref().unwrap().slot_count(), 3);

        score_against(&mut session, 1);
        assert_eq!(session.tick(), TickOutcome::Running);
        assert_eq!(session.slots, vec![1, c]);
        assert_eq!(session.world.as_ref().unwrap().slot_count(), 2);
        let kind = session
            .roster
            .iter()
            .find(|c| c.profile().player_id == b)
            .map(|c| c.kind());
        assert_eq!(kind, Some(CompetitorKind::Ai));
    }

    #[test]
    fn test_eliminated_ai_is_not_steered() {
        let (mut session, alice, _) = session_with_admin();
        let update = SettingsUpdate {
            lives: Some(1),
            ..Default::default()
        };
        session.update_settings(alice.user_id, &update).unwrap();
        session.add_ai(alice.user_id, 10).unwrap();
        let out = session.add_ai(alice.user_id, 10).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();

        score_against(&mut session, 2);
        assert_eq!(session.tick(), TickOutcome::Running);
        assert!(!session.slots.contains(&out));

        for _ in 0..20 {
            assert_eq!(session.tick(), TickOutcome::Running);
        }
        let eliminated = session
            .roster
            .iter_mut()
            .find(|c| c.profile().player_id == out)
            .unwrap();
        assert!(eliminated.profile().spectator);
        assert_eq!(eliminated.profile().movement_direction, 0);
        assert!(eliminated.brain_mut().unwrap().intended().is_none());
    }

    #[test]
    fn test_fragmentation_reaches_snapshot() {
        let (mut session, mut alice, achievements) = session_with_admin();
        session.add_ai(alice.user_id, 5).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();
        alice.drain();

        let ball_center = session.world.as_ref().unwrap().ball().unwrap().center;
        let now = sim_millis(session.tick + 1);
        assert!(session
            .powerups
            .spawn(crate::game::powerup::PowerupKind::Fragmentation, ball_center, now));
        session.last_hitter = Some(1);
        session.tick();
        assert_eq!(
            achievements.unlocked(),
            vec![(alice.user_id, "powerup_fragmentation".to_string())]
        );

        let state = alice
            .drain()
            .into_iter()
            .find(|m| m["type"] == "state")
            .unwrap();
        let minis: Vec<f64> = state["state"]["objects"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|o| o["type"] == "miniBall")
            .map(|o| o["radius"].as_f64().unwrap())
            .collect();
        assert_eq!(minis.len(), 20);
        assert!(minis.iter().all(|r| *r > 0.3 && *r <= 2.0));
        let world = session.world.as_ref().unwrap();
        assert!(world
            .objects
            .iter()
            .any(|o| matches!(o, GameObject::MiniBall(_))));
    }

    #[test]
    fn test_closed_channel_marks_disconnected() {
        let (mut session, alice, _) = session_with_admin();
        let (bob, channel) = Client::new();
        let bob_id = session.add_user(bob.user_id, "bob", channel).unwrap();
        session.request_start(alice.user_id).unwrap();
        session.tick();

        drop(bob);
        session.tick();
        let bob_view = session
            .competitors()
            .into_iter()
            .find(|c| c.player_id == bob_id)
            .unwrap();
        assert!(!bob_view.joined);
        assert_eq!(session.status(), SessionStatus::Running);

        let (_bob_again, channel) = Client::new();
        let bob_uuid = session.roster[1].user_id().unwrap();
        assert_eq!(session.reconnect(bob_uuid, channel).unwrap(), bob_id);
        assert!(session.roster[1].profile().joined);
    }

    #[test]
    fn test_stale_connection_release_keeps_new_one() {
        let (mut session, alice, _) = session_with_admin();
        let (_, old_channel) = Client::new();
        let (_new_client, new_channel) = Client::new();
        session.reconnect(alice.user_id, new_channel.clone()).unwrap();

        session.release(alice.user_id, &old_channel);
        assert!(session.roster[0].is_ready());

        session.release(alice.user_id, &new_channel);
        assert!(!session.roster[0].profile().joined);
    }

    #[test]
    fn test_lobby_views_differ_for_admin() {
        let (mut session, mut alice, _) = session_with_admin();
        let (mut bob, channel) = Client::new();
        session.add_user(bob.user_id, "bob", channel).unwrap();

        let admin_view = alice.drain().pop().unwrap();
        let member_view = bob.drain().pop().unwrap();
        assert_eq!(admin_view["type"], "lobby");
        assert_eq!(admin_view["view"]["admin"], true);
        assert_eq!(member_view["view"]["admin"], false);
        assert_eq!(
            member_view["view"]["controls"],
            serde_json::json!(["add_local", "leave"])
        );
        assert_eq!(admin_view["view"]["competitors"].as_array().unwrap().len(), 2);
    }
}
