use crate::actor;
use crate::consensus::api::HeartbeatTick;
use crate::consensus::election::timers::shared_option::SharedOption;
use crate::consensus::election::timers::time::{Clock, RealClock};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// HeartbeatTimerHandle drives AppendEntries heartbeats to one peer while we are
/// leader. Dropping the handle stops the timer task.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedOption<Instant>,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: SharedOption<Instant>,
    actor_client: actor::WeakActorClient,
    event: HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        member: crate::cluster::Member,
        term: crate::consensus::local_state::Term,
    ) -> Self {
        // Keep logic in this constructor minimal, it is untested.
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, member, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Push back the next periodic heartbeat for this peer, because we just sent it
    /// something.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        let new_timeout = self.clock.now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        member: crate::cluster::Member,
        term: crate::consensus::local_state::Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let shared_opt = SharedOption::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: shared_opt.clone(),
            clock: clock.clone(),
        });
        let event = HeartbeatTick { member, term };

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time: shared_opt,
            actor_client,
            event,
            clock,
        };
        let handle = HeartbeatTimerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The first loop iteration sees an empty SharedOption and immediately
        // publishes the timer event, which is what we want: a newly elected leader
        // (or a new leader-follower pair) should introduce itself right away.
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => {
                    // A recent send to this peer pushed the periodic heartbeat back.
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Slept through `next_heartbeat_time` with no update: we haven't
                    // sent this peer anything in a while.
                    if let Some(shared) = self.weak_shared.upgrade() {
                        let _ = self.actor_client.heartbeat_timer(self.event.clone()).await;
                        shared.reset_heartbeat_timer();
                    } else {
                        // The handle dropped: no longer leader for this term.
                        return;
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
    use crate::cluster::Member;
    use crate::consensus::election::timers::test_utils::TestUtilActor;
    use crate::consensus::election::timers::time;
    use crate::consensus::local_state::Term;
    use std::time::Duration;

    #[tokio::test]
    async fn heartbeat_timer_handle_lifecycle() {
        // -- setup --
        let heartbeat_timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let actor_client = strong_actor_client.weak();
        let mut actor = TestUtilActor::new(rx);

        let member = Member::new("peer-123".to_string(), 26502);
        let term = Term::new(10);
        let expected_heartbeat_event = HeartbeatTick {
            member: member.clone(),
            term,
        };

        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        // -- execute & verify --

        // 1. Spawn task, assert there is one event in the queue.
        let (timer_task, timer_handle) =
            HeartbeatTimerTask::new(heartbeat_timeout, actor_client, member, term, mock_clock);
        let task_join_handle = tokio::task::spawn(timer_task.run());

        actor.assert_heartbeat_event(expected_heartbeat_event.clone()).await;
        actor.assert_no_event().await;

        // 2. Advance time and receive heartbeat many times
        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_timeout);
            actor.assert_heartbeat_event(expected_heartbeat_event.clone()).await;
            actor.assert_no_event().await;
        }

        // 3. Advance time by a big leap, still receive a single heartbeat
        mock_clock_controller.advance(heartbeat_timeout * 5);
        actor.assert_heartbeat_event(expected_heartbeat_event.clone()).await;
        actor.assert_no_event().await;

        // 4. Drop handle and assert the task exited without more events.
        drop(timer_handle);
        mock_clock_controller.advance(heartbeat_timeout);
        task_join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn heartbeat_timer_handle_resetting_timeout() {
        // -- setup --
        let heartbeat_timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let actor_client = strong_actor_client.weak();
        let mut actor = TestUtilActor::new(rx);

        let member = Member::new("peer-123".to_string(), 26502);
        let term = Term::new(10);
        let expected_heartbeat_event = HeartbeatTick {
            member: member.clone(),
            term,
        };

        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        // 1. Spawn task, assert there is one event in the queue.
        let (timer_task, timer_handle) =
            HeartbeatTimerTask::new(heartbeat_timeout, actor_client, member, term, mock_clock);
        tokio::task::spawn(timer_task.run());

        actor.assert_heartbeat_event(expected_heartbeat_event.clone()).await;
        actor.assert_no_event().await;

        // 2a. Repeatedly advance time by 0.5 and reset the heartbeat timer
        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_timeout / 2);
            timer_handle.reset_heartbeat_timer();
        }
        // 2b. Assert no heartbeat (we kept resetting it).
        actor.assert_no_event().await;

        // Sanity check that T=2.5; heartbeat timeout should fire at T=3.5.
        assert_eq!(mock_clock_controller.elapsed_time(), heartbeat_timeout * 5 / 2);

        // 3a. Advance to T=3, assert no heartbeat
        mock_clock_controller.advance(heartbeat_timeout / 2);
        actor.assert_no_event().await;

        // 3b. Advance to T=3.5, heartbeat fires
        mock_clock_controller.advance(heartbeat_timeout / 2);
        actor.assert_heartbeat_event(expected_heartbeat_event.clone()).await;

        assert_eq!(mock_clock_controller.elapsed_time(), heartbeat_timeout * 7 / 2);
    }
}
