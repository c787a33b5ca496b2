use dashmap::DashMap;

use crate::model::Ms;

/// Checkout sessions never outlive a day at the provider.
pub const RETURN_SESSION_TTL_MS: Ms = 86_400_000;

/// Registered sessions above which expired flags are swept on insert.
const SWEEP_THRESHOLD: usize = 10_000;

/// One-time return flags, keyed by checkout session id.
///
/// Registered when a checkout session is created and consumed by the first
/// return. The flag keeps a refreshed or shared return link from replaying
/// a confirmation.
#[derive(Default)]
pub struct ReturnSessions {
    registered: DashMap<String, Ms>,
}

impl ReturnSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, now: Ms) {
        if self.registered.len() >= SWEEP_THRESHOLD {
            self.registered
                .retain(|_, at| now.saturating_sub(*at) < RETURN_SESSION_TTL_MS);
        }
        self.registered.insert(session_id.to_string(), now);
    }

    /// True exactly once per registration, and only within the TTL.
    pub fn consume(&self, session_id: &str, now: Ms) -> bool {
        match self.registered.remove(session_id) {
            Some((_, at)) => now.saturating_sub(at) < RETURN_SESSION_TTL_MS,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}
