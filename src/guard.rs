use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2000);

type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Drops invocations while an action is in flight or while the cooldown that
/// follows its settlement is still running.
pub struct SubmissionGuard {
    cooldown: Duration,
    in_flight: watch::Sender<bool>,
    last_settled: Mutex<Option<Instant>>,
    on_error: Option<ErrorHandler>,
}

impl Default for SubmissionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl SubmissionGuard {
    pub fn new(cooldown: Duration) -> Self {
        let (in_flight, _) = watch::channel(false);
        Self {
            cooldown,
            in_flight,
            last_settled: Mutex::new(None),
            on_error: None,
        }
    }

    pub fn with_error_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn is_submitting(&self) -> bool {
        *self.in_flight.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.in_flight.subscribe()
    }

    fn cooling_down(&self) -> bool {
        let last = *self.last_settled.lock().unwrap_or_else(PoisonError::into_inner);
        last.is_some_and(|at| at.elapsed() < self.cooldown)
    }

    /// Runs `action` unless gated. Returns `None` when the call was dropped.
    pub async fn run<F, Fut, T, E>(&self, action: F) -> Option<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if self.cooling_down() {
            debug!("submission dropped: cooldown active");
            return None;
        }
        let acquired = self.in_flight.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !acquired {
            debug!("submission dropped: already in flight");
            return None;
        }

        let settle = Settle { guard: self };
        let result = action().await;
        drop(settle);

        if let (Err(err), Some(handler)) = (&result, &self.on_error) {
            handler(&err.to_string());
        }
        Some(result)
    }
}

/// Clears the in-flight flag and starts the cooldown, also when the running
/// future is dropped before completion.
struct Settle<'a> {
    guard: &'a SubmissionGuard,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        *self
            .guard
            .last_settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.guard.in_flight.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_are_dropped() {
        let guard = Arc::new(SubmissionGuard::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let first = {
            let guard = guard.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                guard
                    .run(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(guard.is_submitting());

        let second = guard
            .run(|| async { Ok::<_, String>(()) })
            .await;
        assert!(second.is_none());

        gate.notify_one();
        assert!(first.await.unwrap().is_some());
        assert!(!guard.is_submitting());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_starts_after_settlement() {
        let guard = SubmissionGuard::new(Duration::from_millis(2000));
        assert!(guard.run(|| async { Ok::<_, String>(1) }).await.is_some());
        assert!(guard.run(|| async { Ok::<_, String>(2) }).await.is_none());

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(guard.run(|| async { Ok::<_, String>(3) }).await.is_none());

        tokio::time::sleep(Duration::from_millis(1)).await;
        let accepted = guard.run(|| async { Ok::<_, String>(4) }).await;
        assert_eq!(accepted.unwrap().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_the_error_handler_and_still_cool_down() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let guard = SubmissionGuard::new(Duration::from_millis(500))
            .with_error_handler(move |msg| sink.lock().unwrap().push(msg.to_string()));

        let result = guard.run(|| async { Err::<(), _>("store offline") }).await;
        assert!(result.unwrap().is_err());
        assert_eq!(seen.lock().unwrap().as_slice(), ["store offline"]);
        assert!(guard.run(|| async { Ok::<_, String>(()) }).await.is_none());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(guard.run(|| async { Ok::<_, String>(()) }).await.is_some());
    }

    #[tokio::test]
    async fn observers_see_in_flight_transitions() {
        let guard = SubmissionGuard::new(Duration::ZERO);
        let mut rx = guard.subscribe();
        assert!(!*rx.borrow_and_update());
        guard.run(|| async { Ok::<_, String>(()) }).await;
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow());
    }
}
