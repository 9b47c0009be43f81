use crate::models::{NewSession, AnswerRecord, SessionRecord, SessionResults, Test};
use crate::store::ExamStore;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CAPACITY: usize = 256;

/// Per-instance cache of published tests, bounded by age and entry count.
pub struct TestCache {
    entries: DashMap<String, (Test, Instant)>,
    ttl: Duration,
    capacity: usize,
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl TestCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, test_id: &str) -> Option<Test> {
        let expired = match self.entries.get(test_id) {
            Some(entry) if entry.1.elapsed() < self.ttl => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(test_id);
        }
        None
    }

    pub fn insert(&self, test: Test) {
        if !self.entries.contains_key(&test.id) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().1)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(test.id.clone(), (test, Instant::now()));
    }

    pub fn invalidate(&self, test_id: &str) {
        self.entries.remove(test_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serves `load_published_test` from a [`TestCache`] before asking `inner`.
#[derive(Clone)]
pub struct CachedStore<S> {
    inner: S,
    cache: Arc<TestCache>,
}

impl<S: ExamStore> CachedStore<S> {
    pub fn new(inner: S, cache: Arc<TestCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<TestCache> {
        &self.cache
    }
}

impl<S: ExamStore> ExamStore for CachedStore<S> {
    fn load_published_test(&self, test_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Test>>> {
        if let Some(test) = self.cache.get(test_id) {
            debug!(test_id, "test served from cache");
            return Box::pin(async move { Ok(Some(test)) });
        }
        let cache = self.cache.clone();
        let load = self.inner.load_published_test(test_id);
        Box::pin(async move {
            let test = load.await?;
            if let Some(test) = &test {
                cache.insert(test.clone());
            }
            Ok(test)
        })
    }

    fn create_session(&self, new_session: NewSession) -> BoxFuture<'static, anyhow::Result<SessionRecord>> {
        self.inner.create_session(new_session)
    }

    fn batch_insert_answers(&self, answers: Vec<AnswerRecord>) -> BoxFuture<'static, anyhow::Result<()>> {
        self.inner.batch_insert_answers(answers)
    }

    fn finalize_session(
        &self,
        session_id: &str,
        results: SessionResults,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        self.inner.finalize_session(session_id, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::*;
    use crate::store::InMemoryStore;

    fn named(id: &str) -> Test {
        let mut test = test_with(vec![single("q1", 0)]);
        test.id = id.into();
        test
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TestCache::new(Duration::from_secs(10), 8);
        cache.insert(named("t1"));
        assert!(cache.get("t1").is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.get("t1").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_the_oldest_entry() {
        let cache = TestCache::new(Duration::from_secs(60), 2);
        cache.insert(named("t1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.insert(named("t2"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.insert(named("t3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("t1").is_none());
        assert!(cache.get("t3").is_some());
    }

    #[tokio::test]
    async fn invalidate_drops_the_stale_copy() {
        let store = InMemoryStore::new();
        store.upsert_test(named("t1")).await.unwrap();
        let cached = CachedStore::new(store.clone(), Arc::new(TestCache::default()));

        assert!(cached.load_published_test("t1").await.unwrap().is_some());
        store.set_published("t1", false).await;
        assert!(cached.load_published_test("t1").await.unwrap().is_some());

        cached.cache().invalidate("t1");
        assert!(cached.load_published_test("t1").await.unwrap().is_none());
    }
}
