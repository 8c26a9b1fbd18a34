//! Clients for platform services outside the game server

pub mod achievements;

pub use achievements::{achievement_sink, AchievementSink};
