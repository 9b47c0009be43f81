use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

type Cleanup = Box<dyn FnOnce() + Send>;

/// Liveness of the scope that owns a session. Async work checks
/// [`LifecycleTracker::is_mounted`] before touching state once it resumes.
pub struct LifecycleTracker {
    mounted: AtomicBool,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            mounted: AtomicBool::new(true),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Registers `cleanup` to run once at teardown. After teardown it runs
    /// immediately.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_mounted() {
            cleanups.push(Box::new(cleanup));
            return;
        }
        drop(cleanups);
        cleanup();
    }

    pub fn teardown(&self) {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        let cleanups = std::mem::take(
            &mut *self.cleanups.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for cleanup in cleanups {
            cleanup();
        }
    }
}

impl Drop for LifecycleTracker {
    fn drop(&mut self) {
        self.teardown();
    }
}
