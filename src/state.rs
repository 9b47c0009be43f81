use crate::cache::{CachedStore, TestCache};
use crate::config::Settings;
use crate::registry::SessionRegistry;
use crate::store::{ExamStore, InMemoryStore};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    /// Direct handle for listing and importing tests.
    pub db: InMemoryStore,
    /// What sessions talk to: `db` behind the test cache.
    pub store: Arc<dyn ExamStore>,
    pub cache: Arc<TestCache>,
    pub registry: Arc<SessionRegistry>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(db: InMemoryStore, settings: Settings) -> Self {
        let cache = Arc::new(TestCache::new(
            settings.test_cache_ttl,
            settings.test_cache_capacity,
        ));
        let store: Arc<dyn ExamStore> = Arc::new(CachedStore::new(db.clone(), cache.clone()));
        let registry = SessionRegistry::new(settings.session_idle_ttl, settings.session_capacity);
        Self {
            db,
            store,
            cache,
            registry: Arc::new(registry),
            settings: Arc::new(settings),
        }
    }

    /// Flips publication and drops the cached copy so new sessions see it.
    pub async fn set_published(&self, test_id: &str, published: bool) -> bool {
        let found = self.db.set_published(test_id, published).await;
        self.cache.invalidate(test_id);
        if found {
            info!(test_id, published, "test publication changed");
            if let Err(err) = self.db.persist().await {
                warn!("failed to persist local state after publish change: {:#}", err);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;

    #[tokio::test]
    async fn unpublishing_reaches_new_sessions_immediately() {
        let state = AppState::new(InMemoryStore::new(), Settings::default());
        state.db.upsert_test(test_with(vec![single("q1", 0)])).await.unwrap();

        assert!(state.store.load_published_test("t1").await.unwrap().is_some());
        assert!(state.set_published("t1", false).await);
        assert!(state.store.load_published_test("t1").await.unwrap().is_none());

        assert!(state.set_published("t1", true).await);
        assert!(state.store.load_published_test("t1").await.unwrap().is_some());
        assert!(!state.set_published("missing", true).await);
    }
}
