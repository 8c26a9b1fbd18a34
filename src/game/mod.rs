//! Game simulation modules

pub mod ai;
pub mod bracket;
pub mod competitor;
pub mod geometry;
pub mod map;
pub mod paddle;
pub mod physics;
pub mod powerup;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod world;

#[cfg(test)]
mod testkit;

pub use map::MapCatalog;
pub use registry::{RegistryError, SessionRegistry};
