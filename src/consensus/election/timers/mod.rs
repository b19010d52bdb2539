mod election_timer;
mod heartbeat_timer;
mod shared_option;
mod stop_signal;
#[cfg(test)]
mod test_utils;
mod time;

pub(crate) use election_timer::ElectionTimerHandle;
pub(crate) use heartbeat_timer::HeartbeatTimerHandle;
