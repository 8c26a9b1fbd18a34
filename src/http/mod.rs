//! HTTP surface: health, catalog, lobby listing and the websocket route

pub mod middleware;
pub mod routes;

pub use routes::build_router;
