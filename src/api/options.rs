use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct ReplicationOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub election_min_timeout: Option<Duration>,
    pub election_max_timeout: Option<Duration>,
    pub append_timeout: Option<Duration>,
}

pub(super) struct ReplicationOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub append_timeout: Duration,
}

impl ReplicationOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.election_min_timeout {
            return Err("Election minimum timeout must be greater than leader's heartbeat");
        }
        if self.election_min_timeout >= self.election_max_timeout {
            return Err("Election minimum timeout must be less than maximum timeout");
        }
        if self.append_timeout >= self.election_min_timeout {
            return Err("Append RPC timeout must be less than the election timeout");
        }

        Ok(())
    }
}

impl TryFrom<ReplicationOptions> for ReplicationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicationOptions) -> Result<Self, Self::Error> {
        let values = ReplicationOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            election_min_timeout: options.election_min_timeout.unwrap_or(Duration::from_millis(500)),
            election_max_timeout: options.election_max_timeout.unwrap_or(Duration::from_millis(1500)),
            append_timeout: options.append_timeout.unwrap_or(Duration::from_millis(300)),
        };

        values.validate()?;
        Ok(values)
    }
}
