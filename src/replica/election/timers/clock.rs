use tokio::time::{Duration, Instant};

/// Clock is the time source for background tasks. Tests swap in a `ManualClock` so they decide
/// when time passes.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_in_deadline_order() {
        let clock = ManualClock::new();
        let woken = Arc::new(AtomicUsize::new(0));

        let mut sleepers = Vec::new();
        for secs in 1..=3 {
            let clock = clock.clone();
            let woken = woken.clone();
            sleepers.push(tokio::spawn(async move {
                clock.sleep(Duration::from_secs(secs)).await;
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }
        tokio::task::yield_now().await;

        for expected in 1..=3 {
            clock.advance(Duration::from_millis(999));
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(woken.load(Ordering::SeqCst), expected - 1);

            clock.advance(Duration::from_millis(1));
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(woken.load(Ordering::SeqCst), expected);
        }

        for sleeper in sleepers {
            sleeper.await.unwrap();
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn past_deadline_returns_immediately() {
        let clock = ManualClock::new();
        let deadline = clock.now();
        clock.advance(Duration::from_secs(1));

        tokio::time::timeout(Duration::from_millis(100), clock.sleep_until(deadline))
            .await
            .expect("Sleeping until the past shouldn't block");
    }
}
