// In-memory OAuth state registry.
//
// States are single-use and expire after ten minutes; consuming a state
// removes it so replays fail.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

const STATE_TTL_MINUTES: i64 = 10;

#[derive(Default)]
pub struct OAuthStateRegistry {
    states: DashMap<String, DateTime<Utc>>,
}

impl OAuthStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh state value
    pub fn issue(&self) -> String {
        let state = Uuid::new_v4().simple().to_string();
        self.states.insert(state.clone(), Utc::now());
        state
    }

    /// Consume a state; returns false for unknown, replayed or expired values
    pub fn consume(&self, state: &str) -> bool {
        match self.states.remove(state) {
            Some((_, created_at)) => {
                Utc::now() - created_at < Duration::minutes(STATE_TTL_MINUTES)
            }
            None => false,
        }
    }

    /// Drop expired entries; called opportunistically from issue sites
    pub fn purge_expired(&self) {
        let cutoff = Utc::now() - Duration::minutes(STATE_TTL_MINUTES);
        self.states.retain(|_, created_at| *created_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
