//! Competitors - remote users, local co-players sharing a connection, and AI

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use super::ai::AiBrain;
use super::snapshot::Frame;

/// Lives each competitor starts a match with
pub const DEFAULT_LIVES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitorKind {
    User,
    Local,
    Ai,
}

/// State every competitor carries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorProfile {
    /// Stable for the lifetime of the session
    pub player_id: u32,
    pub name: String,
    pub title: String,
    /// 0 = eliminated
    pub lives: u32,
    pub movement_direction: i8,
    pub joined: bool,
    pub spectator: bool,
}

impl CompetitorProfile {
    pub fn new(player_id: u32, name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            player_id,
            name: name.into(),
            title: title.into(),
            lives: DEFAULT_LIVES,
            movement_direction: 0,
            joined: true,
            spectator: false,
        }
    }

    /// Still competing for the win
    pub fn is_active(&self) -> bool {
        !self.spectator && self.lives > 0
    }
}

/// Roster entry as shown in the lobby
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorView {
    pub player_id: u32,
    pub kind: CompetitorKind,
    pub name: String,
    pub title: String,
    pub lives: u32,
    pub joined: bool,
    pub spectator: bool,
    pub ready: bool,
}

/// Non-blocking outbound channel to one websocket connection
#[derive(Debug, Clone)]
pub struct PushChannel {
    tx: mpsc::Sender<Frame>,
}

impl PushChannel {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a frame without waiting. A full buffer drops the frame;
    /// returns false only once the connection is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Push buffer full, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Both handles feed the same connection
    pub fn same_channel(&self, other: &PushChannel) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// A roster member. Capabilities beyond the common profile are exposed as
/// narrow accessors that return `None` where they do not apply.
pub trait Competitor: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> CompetitorKind;

    fn profile(&self) -> &CompetitorProfile;

    fn profile_mut(&mut self) -> &mut CompetitorProfile;

    /// Whether this competitor lets the match start
    fn is_ready(&self) -> bool;

    fn describe(&self) -> CompetitorView {
        let profile = self.profile();
        CompetitorView {
            player_id: profile.player_id,
            kind: self.kind(),
            name: profile.name.clone(),
            title: profile.title.clone(),
            lives: profile.lives,
            joined: profile.joined,
            spectator: profile.spectator,
            ready: self.is_ready(),
        }
    }

    /// Platform identity of a remote user
    fn user_id(&self) -> Option<Uuid> {
        None
    }

    /// User whose connection a local competitor shares
    fn owner(&self) -> Option<Uuid> {
        None
    }

    fn push_channel(&self) -> Option<&PushChannel> {
        None
    }

    /// Attach a live connection; false if this competitor cannot receive pushes
    fn attach(&mut self, _channel: PushChannel) -> bool {
        false
    }

    fn disconnect(&mut self) {}

    fn brain_mut(&mut self) -> Option<&mut AiBrain> {
        None
    }
}

/// Remote human with their own connection
#[derive(Debug)]
pub struct UserCompetitor {
    user_id: Uuid,
    profile: CompetitorProfile,
    channel: Option<PushChannel>,
}

impl UserCompetitor {
    /// Without a channel the user holds a seat but is not joined until a
    /// connection attaches
    pub fn new(
        player_id: u32,
        user_id: Uuid,
        name: impl Into<String>,
        channel: Option<PushChannel>,
    ) -> Self {
        let mut profile = CompetitorProfile::new(player_id, name, "Player");
        profile.joined = channel.is_some();
        Self {
            user_id,
            profile,
            channel,
        }
    }
}

impl Competitor for UserCompetitor {
    fn kind(&self) -> CompetitorKind {
        CompetitorKind::User
    }

    fn profile(&self) -> &CompetitorProfile {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut CompetitorProfile {
        &mut self.profile
    }

    fn is_ready(&self) -> bool {
        self.profile.joined && self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn user_id(&self) -> Option<Uuid> {
        Some(self.user_id)
    }

    fn push_channel(&self) -> Option<&PushChannel> {
        self.channel.as_ref()
    }

    fn attach(&mut self, channel: PushChannel) -> bool {
        self.channel = Some(channel);
        self.profile.joined = true;
        true
    }

    fn disconnect(&mut self) {
        self.channel = None;
        self.profile.joined = false;
        self.profile.movement_direction = 0;
    }
}

/// Second human playing on the owner's keyboard
#[derive(Debug)]
pub struct LocalCompetitor {
    owner: Uuid,
    profile: CompetitorProfile,
}

impl LocalCompetitor {
    pub fn new(player_id: u32, owner: Uuid, name: impl Into<String>) -> Self {
        Self {
            owner,
            profile: CompetitorProfile::new(player_id, name, "Local player"),
        }
    }
}

impl Competitor for LocalCompetitor {
    fn kind(&self) -> CompetitorKind {
        CompetitorKind::Local
    }

    fn profile(&self) -> &CompetitorProfile {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut CompetitorProfile {
        &mut self.profile
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn owner(&self) -> Option<Uuid> {
        Some(self.owner)
    }
}

#[derive(Debug)]
pub struct AiCompetitor {
    brain: AiBrain,
    profile: CompetitorProfile,
}

impl AiCompetitor {
    pub fn new(player_id: u32, skill: u8) -> Self {
        let brain = AiBrain::new(skill);
        let name = format!("AI {player_id}");
        let title = format!("Bot level {}", brain.skill());
        Self {
            brain,
            profile: CompetitorProfile::new(player_id, name, title),
        }
    }
}

impl Competitor for AiCompetitor {
    fn kind(&self) -> CompetitorKind {
        CompetitorKind::Ai
    }

    fn profile(&self) -> &CompetitorProfile {
        &self.profile
    }

    fn profile_mut(&mut self) -> &mut CompetitorProfile {
        &mut self.profile
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn brain_mut(&mut self) -> Option<&mut AiBrain> {
        Some(&mut self.brain)
    }
}
