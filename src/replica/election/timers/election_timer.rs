use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::ElectionTimeoutTick;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Each reset produces a new generation. A deadline and its generation always travel together,
/// so a tick for an old deadline can't carry a newer generation.
#[derive(Clone, Copy, Debug)]
struct Deadline {
    generation: u64,
    wake_at: Instant,
}

/// Election timeout for followers and candidates. The background task ends when this handle is
/// dropped.
pub(crate) struct ElectionTimer<C: Clock = RealClock> {
    timer_id: u64,
    deadline: watch::Sender<Deadline>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    timer_id: u64,
    deadline: watch::Receiver<Deadline>,
    actor_client: WeakActorClient,
    clock: C,
    // Not from the paper. If the actor doesn't reset us after a tick (e.g. it's still waiting on
    // votes), it hears from us again after this long.
    refire_interval: Duration,
}

impl ElectionTimer {
    pub(crate) fn spawn(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        Self::spawn_with_clock(min_timeout, max_timeout, actor_client, RealClock)
    }
}

impl<C: Clock> ElectionTimer<C> {
    fn spawn_with_clock(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient, clock: C) -> Self {
        let timeout_range = min_timeout..=max_timeout;
        // Start with a deadline in place, so a new follower doesn't time out right away.
        let first_deadline = Deadline {
            generation: 0,
            wake_at: clock.now() + random_timeout(&timeout_range),
        };
        let (deadline_tx, deadline_rx) = watch::channel(first_deadline);
        let timer_id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);

        let task = ElectionTimerTask {
            timer_id,
            deadline: deadline_rx,
            actor_client,
            clock: clock.clone(),
            refire_interval: min_timeout,
        };
        tokio::spawn(task.run());

        ElectionTimer {
            timer_id,
            deadline: deadline_tx,
            timeout_range,
            clock,
        }
    }

    pub(crate) fn reset_timeout(&self) {
        let generation = self.deadline.borrow().generation + 1;
        self.deadline.send_replace(Deadline {
            generation,
            wake_at: self.clock.now() + random_timeout(&self.timeout_range),
        });
    }

    /// True if `tick` came from this timer and there's been no reset since.
    pub(crate) fn is_current(&self, tick: ElectionTimeoutTick) -> bool {
        tick.timer_id == self.timer_id && tick.generation == self.deadline.borrow().generation
    }
}

fn random_timeout(range: &RangeInclusive<Duration>) -> Duration {
    rand::thread_rng().gen_range(range.clone())
}

impl<C: Clock> ElectionTimerTask<C> {
    async fn run(mut self) {
        loop {
            let deadline = *self.deadline.borrow_and_update();
            let mut wake_at = deadline.wake_at;

            loop {
                tokio::select! {
                    changed = self.deadline.changed() => {
                        match changed {
                            Ok(()) => break,
                            // Handle dropped. We're no longer a follower/candidate of that term.
                            Err(_) => return,
                        }
                    }
                    _ = self.clock.sleep_until(wake_at) => {
                        let tick = ElectionTimeoutTick {
                            timer_id: self.timer_id,
                            generation: deadline.generation,
                        };
                        self.actor_client.election_timeout(tick).await;
                        wake_at = self.clock.now() + self.refire_interval;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock::ManualClock;
    use crate::replica::election::timers::test_utils::TestUtilActor;

    // Min and max are the same. Jitter isn't what's under test.
    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn resets_postpone_timeout() {
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();
        let timer = ElectionTimer::spawn_with_clock(TIMEOUT, TIMEOUT, strong_actor_client.weak(), clock.clone());
        actor.assert_no_event().await;

        // Keep resetting at half the timeout. Nothing fires.
        for _ in 0..4 {
            clock.advance(TIMEOUT / 2);
            timer.reset_timeout();
        }
        actor.assert_no_event().await;

        // Last reset was at T=2. Fires at exactly T=3.
        let one_ns = Duration::from_nanos(1);
        clock.advance(TIMEOUT - one_ns);
        actor.assert_no_event().await;
        clock.advance(one_ns);

        let tick = actor.assert_election_timeout_event().await;
        assert!(timer.is_current(tick));
        assert_eq!(clock.elapsed(), TIMEOUT * 3);
    }

    #[tokio::test]
    async fn tick_is_stale_after_reset() {
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();
        let timer = ElectionTimer::spawn_with_clock(TIMEOUT, TIMEOUT, strong_actor_client.weak(), clock.clone());

        // Timer fires, but e.g. an AppendEntries got processed before the actor got to the tick.
        clock.advance(TIMEOUT);
        let tick = actor.assert_election_timeout_event().await;
        timer.reset_timeout();
        assert!(!timer.is_current(tick));

        // Ticks only ever match the timer that produced them.
        let other_timer =
            ElectionTimer::spawn_with_clock(TIMEOUT, TIMEOUT, strong_actor_client.weak(), ManualClock::new());
        assert!(!other_timer.is_current(tick));
    }

    #[tokio::test]
    async fn refires_until_reset() {
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();
        let timer = ElectionTimer::spawn_with_clock(TIMEOUT, TIMEOUT, strong_actor_client.weak(), clock.clone());

        clock.advance(TIMEOUT);
        let first = actor.assert_election_timeout_event().await;
        actor.assert_no_event().await;
        clock.advance(TIMEOUT);
        let second = actor.assert_election_timeout_event().await;
        assert_eq!(first, second);
        assert!(timer.is_current(second));

        // Once reset, it's back to a full timeout of quiet.
        timer.reset_timeout();
        clock.advance(TIMEOUT / 2);
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn dropping_timer_ends_task() {
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();
        let timer = ElectionTimer::spawn_with_clock(TIMEOUT, TIMEOUT, strong_actor_client.weak(), clock.clone());

        drop(timer);
        clock.advance(TIMEOUT * 2);
        actor.assert_no_event().await;
    }
}
