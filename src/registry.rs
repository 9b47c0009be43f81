use crate::session::ExamSession;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    session: Arc<ExamSession>,
    touched: Instant,
}

/// Live sessions of one host, keyed by an opaque handle. Entries untouched
/// for `idle_ttl` are swept on insert; at capacity the stalest entry goes,
/// completed sessions first.
pub struct SessionRegistry {
    sessions: DashMap<String, Entry>,
    idle_ttl: Duration,
    capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TTL, DEFAULT_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Stores `session` under a fresh handle.
    pub fn insert(&self, session: Arc<ExamSession>) -> String {
        self.sweep();
        if self.sessions.len() >= self.capacity {
            self.evict_one();
        }
        let handle = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            handle.clone(),
            Entry {
                session,
                touched: Instant::now(),
            },
        );
        handle
    }

    /// Looks the session up and refreshes its idle clock.
    pub fn get(&self, handle: &str) -> Option<Arc<ExamSession>> {
        let mut entry = self.sessions.get_mut(handle)?;
        entry.touched = Instant::now();
        Some(entry.session.clone())
    }

    /// Returns the session only when `user_id` owns it.
    pub fn get_owned(&self, handle: &str, user_id: &str) -> Option<Arc<ExamSession>> {
        self.get(handle)
            .filter(|session| session.config().user_id == user_id)
    }

    /// Unmounts and forgets the session.
    pub fn remove(&self, handle: &str) -> Option<Arc<ExamSession>> {
        let (_, entry) = self.sessions.remove(handle)?;
        entry.session.unmount();
        debug!(handle, "session handle released");
        Some(entry.session)
    }

    /// Drops every session idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.idle_ttl;
        self.sessions.retain(|handle, entry| {
            if entry.touched.elapsed() < ttl {
                return true;
            }
            entry.session.unmount();
            debug!(handle = %handle, "idle session expired");
            false
        });
        before.saturating_sub(self.sessions.len())
    }

    fn evict_one(&self) {
        let victim = self
            .sessions
            .iter()
            .min_by_key(|entry| (entry.session.results().is_none(), entry.touched))
            .map(|entry| entry.key().clone());
        if let Some(handle) = victim {
            warn!(handle = %handle, capacity = self.capacity, "session registry full, evicting");
            self.remove(&handle);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::models::ExamMode;
    use crate::session::SessionConfig;
    use crate::store::InMemoryStore;

    fn session(user_id: &str) -> Arc<ExamSession> {
        ExamSession::with_store(
            SessionConfig {
                mode: ExamMode::Training,
                test_id: "t1".into(),
                user_id: user_id.into(),
            },
            Arc::new(InMemoryStore::new()),
            EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn lookups_respect_ownership() {
        let registry = SessionRegistry::default();
        let handle = registry.insert(session("alice"));
        assert!(registry.get_owned(&handle, "alice").is_some());
        assert!(registry.get_owned(&handle, "bob").is_none());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn remove_unmounts() {
        let registry = SessionRegistry::default();
        let handle = registry.insert(session("alice"));
        let removed = registry.remove(&handle).unwrap();
        assert!(!removed.is_mounted());
        assert!(registry.is_empty());
        assert!(registry.remove(&handle).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let registry = SessionRegistry::new(Duration::from_secs(60), 16);
        let idle = session("alice");
        let idle_handle = registry.insert(idle.clone());
        let busy_handle = registry.insert(session("bob"));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(registry.get(&busy_handle).is_some());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(registry.sweep(), 1);
        assert!(registry.get(&idle_handle).is_none());
        assert!(registry.get(&busy_handle).is_some());
        assert!(!idle.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_the_stalest_session() {
        let registry = SessionRegistry::new(Duration::from_secs(3600), 2);
        let first = registry.insert(session("u1"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = registry.insert(session("u2"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let third = registry.insert(session("u3"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&first).is_none());
        assert!(registry.get(&second).is_some());
        assert!(registry.get(&third).is_some());
    }
}
