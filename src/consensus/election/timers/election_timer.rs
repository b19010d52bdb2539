use crate::actor;
use crate::consensus::election::timers::shared_option::SharedOption;
use crate::consensus::election::timers::stop_signal;
use crate::consensus::election::timers::time::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// ElectionTimerHandle tracks the randomized election timeout while we are a
/// follower or candidate. Dropping the handle stops the timer task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    next_wake_time: SharedOption<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _to_drop: stop_signal::Stopper,
}

struct ElectionTimerTask<C: Clock> {
    next_wake_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    clock: C,
    stop_check: stop_signal::StopCheck,
    // Static wait between repeated timeout notifications while no election wins.
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.next_wake_time.replace(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let (stopper, stop_check) = stop_signal::new();

        let task = ElectionTimerTask {
            next_wake_time: shared_opt.clone(),
            actor_client,
            clock: clock.clone(),
            stop_check,
            timeout_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            next_wake_time: shared_opt,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _to_drop: stopper,
        };

        // The task must have a timeout value present when it starts, otherwise it
        // could fire immediately after we become a follower.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    // We've heard from a leader recently; sleep until the next timeout.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // We slept through the timeout without hearing from a leader.
                    // Notify the actor to start an election. Keep running in case the
                    // actor concurrently received an append and stays follower.
                    if self.stop_check.should_stop() {
                        return;
                    }
                    let _ = self.actor_client.election_timeout().await;
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // The handle dropped, meaning the role changed. Exit without starting a
            // new election.
            if self.stop_check.should_stop() {
                return;
            }
        }
    }
}
