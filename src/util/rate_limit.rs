//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Inbound websocket messages per connection per second.
/// Two movers (user + local) pressing keys every tick stay well under this.
pub const INPUT_RATE_LIMIT: u32 = 60;

/// Lobby commands (add_ai, settings, start...) per connection per second
pub const LOBBY_RATE_LIMIT: u32 = 5;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    input_limiter: Arc<Limiter>,
    lobby_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self {
            input_limiter: create_limiter(INPUT_RATE_LIMIT),
            lobby_limiter: create_limiter(LOBBY_RATE_LIMIT),
        }
    }

    /// Check if any inbound message is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }

    /// Check if a lobby command is allowed
    pub fn check_lobby(&self) -> bool {
        self.lobby_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_burst_is_limited() {
        let limiter = ConnectionRateLimiter::new();
        let allowed = (0..20).filter(|_| limiter.check_lobby()).count();
        assert_eq!(allowed, LOBBY_RATE_LIMIT as usize);
    }
}
