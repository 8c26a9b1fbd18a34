//! Session registry - owns every live session and drives them on one timer

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::AchievementSink;
use crate::util::time::{tick_duration, Timer, TICK_MS};

use super::competitor::PushChannel;
use super::map::MapCatalog;
use super::session::{GameSession, SessionError, SessionStatus, SessionSummary, TickOutcome};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Already in session {0}")]
    AlreadyInSession(Uuid),

    #[error("Not in a session")]
    NoSession,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::SessionNotFound(_) => "session_not_found",
            RegistryError::AlreadyInSession(_) => "already_in_session",
            RegistryError::NoSession => "no_session",
            RegistryError::Session(e) => e.code(),
        }
    }
}

/// All live sessions plus the user -> session index
pub struct SessionRegistry {
    sessions: DashMap<Uuid, GameSession>,
    memberships: DashMap<Uuid, Uuid>,
    maps: Arc<MapCatalog>,
    achievements: Arc<dyn AchievementSink>,
}

impl SessionRegistry {
    pub fn new(maps: Arc<MapCatalog>, achievements: Arc<dyn AchievementSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            memberships: DashMap::new(),
            maps,
            achievements,
        }
    }

    pub fn maps(&self) -> &MapCatalog {
        &self.maps
    }

    /// New waiting session with `admin` seated but not yet connected.
    ///
    /// The admin's membership entry stays locked until the session is in
    /// place, so racing creates for one user cannot both succeed.
    pub fn create_session(&self, admin: Uuid, name: &str) -> Result<Uuid, RegistryError> {
        let membership = self.memberships.entry(admin);
        if let Entry::Occupied(current) = &membership {
            let current = *current.get();
            if self.seats(current, admin) {
                return Err(RegistryError::AlreadyInSession(current));
            }
        }

        let id = Uuid::new_v4();
        let seed: u64 = rand::random();
        let session = GameSession::new(
            id,
            admin,
            name,
            None,
            self.maps.clone(),
            self.achievements.clone(),
            seed,
        );
        self.sessions.insert(id, session);
        membership.insert(id);
        Ok(id)
    }

    /// Attach a connection: reconnect if the user already holds a seat,
    /// otherwise join as a new competitor. Returns the player id.
    ///
    /// Locks the user's membership entry, then the session.
    pub fn connect(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        name: &str,
        channel: PushChannel,
    ) -> Result<u32, RegistryError> {
        let membership = self.memberships.entry(user_id);
        if let Entry::Occupied(current) = &membership {
            let current = *current.get();
            if current != session_id && self.seats(current, user_id) {
                return Err(RegistryError::AlreadyInSession(current));
            }
        }

        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        let player_id = if session.has_user(user_id) {
            session.reconnect(user_id, channel)?
        } else {
            session.add_user(user_id, name, channel)?
        };
        drop(session);

        membership.insert(session_id);
        Ok(player_id)
    }

    /// Run `f` against the caller's session under its entry guard
    pub fn with_session<T>(
        &self,
        user_id: Uuid,
        f: impl FnOnce(&mut GameSession) -> Result<T, SessionError>,
    ) -> Result<T, RegistryError> {
        let session_id = self.session_of(user_id).ok_or(RegistryError::NoSession)?;
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        Ok(f(session.value_mut())?)
    }

    pub fn leave(&self, user_id: Uuid) -> Result<(), RegistryError> {
        self.with_session(user_id, |session| session.leave(user_id))?;
        self.memberships.remove(&user_id);
        Ok(())
    }

    /// Connection dropped; the seat is kept for a reconnect
    pub fn disconnect(&self, user_id: Uuid, channel: &PushChannel) {
        let result = self.with_session(user_id, |session| {
            session.release(user_id, channel);
            Ok(())
        });
        if let Err(e) = result {
            debug!(user_id = %user_id, error = %e, "Disconnect for user without session");
        }
    }

    pub fn session_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.memberships.get(&user_id).map(|entry| *entry.value())
    }

    /// Tick every session once and drop the ones that ended
    pub fn tick_all(&self) -> usize {
        let timer = Timer::new();
        let mut closed = Vec::new();
        let mut running = 0;

        for mut entry in self.sessions.iter_mut() {
            match entry.value_mut().tick() {
                TickOutcome::Closed => closed.push(*entry.key()),
                TickOutcome::Running => running += 1,
                TickOutcome::Idle => {}
            }
        }

        for id in &closed {
            if self.sessions.remove(id).is_some() {
                info!(session_id = %id, "Session removed");
            }
        }
        if !closed.is_empty() {
            self.prune_memberships();
        }

        let elapsed = timer.elapsed_micros();
        if elapsed > TICK_MS * 1_000 {
            warn!(
                elapsed_us = elapsed,
                sessions = self.sessions.len(),
                "Tick overran its budget"
            );
        }
        running
    }

    /// Fixed-rate loop shared by every session
    pub async fn run(self: Arc<Self>) {
        info!(tick_ms = TICK_MS, "Session scheduler started");
        let mut ticker = interval(tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.tick_all();
        }
    }

    pub fn list_waiting(&self) -> Vec<SessionSummary> {
        let mut waiting: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.status() == SessionStatus::Waiting && !s.is_closed())
            .map(|s| s.summary())
            .collect();
        waiting.sort_by_key(|s| s.id);
        waiting
    }

    pub fn session_summary(&self, session_id: Uuid) -> Option<SessionSummary> {
        self.sessions
            .get(&session_id)
            .filter(|s| !s.is_closed())
            .map(|s| s.summary())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_competitors(&self) -> usize {
        self.sessions.iter().map(|s| s.roster_len()).sum()
    }

    /// Whether `session_id` is open and still seats the user
    fn seats(&self, session_id: Uuid, user_id: Uuid) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(|s| !s.is_closed() && s.has_user(user_id))
    }

    fn prune_memberships(&self) {
        self.memberships.retain(|user_id, session_id| {
            self.sessions
                .get(session_id)
                .is_some_and(|s| s.has_user(*user_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::snapshot::Frame;
    use crate::game::testkit::RecordingAchievements;
    use tokio::sync::mpsc;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(MapCatalog::builtin()),
            Arc::new(RecordingAchievements::default()),
        )
    }

    fn channel() -> (PushChannel, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        (PushChannel::new(tx), rx)
    }

    #[test]
    fn test_admin_seat_waits_for_connection() {
        let registry = registry();
        let admin = Uuid::new_v4();
        let id = registry.create_session(admin, "alice").unwrap();

        assert_eq!(registry.list_waiting().len(), 1);
        assert_eq!(registry.session_of(admin), Some(id));
        assert_eq!(registry.session_summary(id).unwrap().players, 1);
        assert!(matches!(
            registry.create_session(admin, "alice"),
            Err(RegistryError::AlreadyInSession(existing)) if existing == id
        ));

        let (tx, _rx) = channel();
        assert_eq!(registry.connect(id, admin, "alice", tx).unwrap(), 1);
        assert_eq!(registry.total_competitors(), 1);
    }

    #[test]
    fn test_concurrent_creates_seat_admin_once() {
        let registry = registry();
        let admin = Uuid::new_v4();
        let barrier = std::sync::Barrier::new(8);

        let created: Vec<Result<Uuid, RegistryError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.create_session(admin, "alice")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ids: Vec<Uuid> = created.iter().filter_map(|r| r.as_ref().ok()).copied().collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.active_sessions(), 1);
        assert_eq!(registry.session_of(admin), Some(ids[0]));
        assert!(created.iter().all(|r| match r {
            Ok(_) => true,
            Err(RegistryError::AlreadyInSession(id)) => *id == ids[0],
            Err(_) => false,
        }));
    }

    #[test]
    fn test_connect_elsewhere_while_seated_is_refused() {
        let registry = registry();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let first = registry.create_session(alice, "alice").unwrap();
        let second = registry.create_session(bob, "bob").unwrap();

        let (tx, _rx) = channel();
        assert!(matches!(
            registry.connect(second, alice, "alice", tx),
            Err(RegistryError::AlreadyInSession(id)) if id == first
        ));
        assert_eq!(registry.session_summary(second).unwrap().players, 1);
        assert_eq!(registry.session_of(alice), Some(first));
    }

    #[test]
    fn test_connect_to_unknown_session() {
        let registry = registry();
        let (tx, _rx) = channel();
        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.connect(missing, Uuid::new_v4(), "bob", tx),
            Err(RegistryError::SessionNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_tick_all_starts_and_removes_sessions() {
        let registry = registry();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let id = registry.create_session(alice, "alice").unwrap();
        let (tx_a, _rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.connect(id, alice, "alice", tx_a).unwrap();
        registry.connect(id, bob, "bob", tx_b).unwrap();

        registry
            .with_session(alice, |s| s.request_start(alice))
            .unwrap();
        assert_eq!(registry.tick_all(), 1);
        assert!(registry.list_waiting().is_empty());
        while rx_b.try_recv().is_ok() {}

        // Bob leaves mid-match, alice is the last one standing
        registry.leave(bob).unwrap();
        assert_eq!(registry.session_of(bob), None);
        assert_eq!(registry.tick_all(), 0);
        assert_eq!(registry.active_sessions(), 0);
        assert_eq!(registry.session_of(alice), None);
    }

    #[test]
    fn test_commands_need_membership() {
        let registry = registry();
        let stranger = Uuid::new_v4();
        assert!(matches!(
            registry.with_session(stranger, |s| s.add_ai(stranger, 3)),
            Err(RegistryError::NoSession)
        ));

        let admin = Uuid::new_v4();
        registry.create_session(admin, "alice").unwrap();
        let err = registry
            .with_session(admin, |s| s.request_start(admin))
            .unwrap_err();
        assert_eq!(err.code(), "not_enough_players");
    }

    #[test]
    fn test_admin_leaving_lobby_tears_down() {
        let registry = registry();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let id = registry.create_session(alice, "alice").unwrap();
        let (tx, mut rx) = channel();
        registry.connect(id, bob, "bob", tx).unwrap();
        while rx.try_recv().is_ok() {}

        registry.leave(alice).unwrap();
        registry.tick_all();
        assert_eq!(registry.active_sessions(), 0);
        assert_eq!(registry.session_of(bob), None);

        let frame = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "game_closed");
    }
}
