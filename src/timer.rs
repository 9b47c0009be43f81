use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Duration, Instant};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// Spawns a task calling `on_tick` once per `period`, first after one full
/// period, until the callback returns [`TickControl::Stop`] or the task is
/// aborted.
pub fn spawn_ticker<F>(period: Duration, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut() -> TickControl + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            if on_tick() == TickControl::Stop {
                break;
            }
        }
    })
}

/// Holds at most one running ticker.
#[derive(Default)]
pub struct TimerSlot {
    handle: Option<AbortHandle>,
}

impl TimerSlot {
    pub fn replace(&mut self, handle: JoinHandle<()>) {
        self.stop();
        self.handle = Some(handle.abort_handle());
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_period_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = spawn_ticker(Duration::from_secs(1), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                TickControl::Stop
            } else {
                TickControl::Continue
            }
        });

        time::sleep(Duration::from_millis(999)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_stop_aborts_the_ticker() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let mut slot = TimerSlot::default();
        slot.replace(spawn_ticker(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            TickControl::Continue
        }));
        assert!(slot.is_running());

        time::sleep(Duration::from_millis(2500)).await;
        slot.stop();
        let seen = ticks.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seen, 2);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!slot.is_running());
    }
}
