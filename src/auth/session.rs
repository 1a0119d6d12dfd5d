//! Signed-in sessions: token to username, with expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

/// Where the sign-in layer keeps sessions.
pub trait SessionStore: Send + Sync + 'static {
    /// Starts a session for `username` and returns its token.
    fn create(&self, username: &str) -> String;

    /// Username of a live session.
    fn get(&self, token: &str) -> Option<String>;

    /// Ends a session. Unknown tokens are ignored.
    fn remove(&self, token: &str);

    /// Drops expired sessions and returns how many were dropped.
    fn purge(&self) -> usize;
}

struct Session {
    username: String,
    expires_at: Instant,
}

pub struct MemorySessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_at(&self, username: &str, now: Instant) -> String {
        let token = Uuid::new_v4().to_string();
        self.sessions.lock().insert(token.clone(), Session {
            username: username.to_string(),
            expires_at: now + self.ttl,
        });
        debug!(username, "session created");
        token
    }

    pub fn get_at(&self, token: &str, now: Instant) -> Option<String> {
        let mut sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(s) if s.expires_at > now => Some(s.username.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn purge_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, username: &str) -> String {
        self.create_at(username, Instant::now())
    }

    fn get(&self, token: &str) -> Option<String> {
        self.get_at(token, Instant::now())
    }

    fn remove(&self, token: &str) {
        self.sessions.lock().remove(token);
    }

    fn purge(&self) -> usize {
        self.purge_at(Instant::now())
    }
}

/// Purges `sessions` every `every` until cancelled.
pub async fn run_purge_loop(sessions: Arc<dyn SessionStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("session purge loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                let purged = sessions.purge();
                if purged > 0 {
                    debug!(purged, "purged expired sessions");
                }
            }
        }
    }
}
