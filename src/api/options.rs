use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for a raft server. Anything left as `None` gets a default suited to a cluster on
/// a local network.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    /// How often the leader sends AppendEntries to an idle follower. Default 50ms.
    pub heartbeat_interval: Option<Duration>,
    /// Election timeouts are picked uniformly from [min, max]. Defaults 150ms and 300ms.
    pub election_min_timeout: Option<Duration>,
    pub election_max_timeout: Option<Duration>,
    /// Deadline for a single outbound RPC. Default 40ms.
    pub rpc_timeout: Option<Duration>,
    /// How long `do_command()` waits for its entry to be applied. Default 5s.
    pub command_timeout: Option<Duration>,
    /// Take a snapshot once this many applied entries are retained in the log. Default 10000.
    pub snapshot_threshold: Option<u64>,
    /// Most log entries carried by one AppendEntries request. Default 64.
    pub max_entries_per_request: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct RaftOptionsValidated {
    pub heartbeat_interval: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub rpc_timeout: Duration,
    pub command_timeout: Duration,
    pub snapshot_threshold: u64,
    pub max_entries_per_request: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval >= self.election_min_timeout {
            return Err("Election minimum timeout must be greater than leader's heartbeat interval");
        }
        if self.election_min_timeout >= self.election_max_timeout {
            return Err("Election minimum timeout must be less than maximum timeout");
        }
        if self.rpc_timeout >= self.election_min_timeout {
            return Err("RPC timeout must be less than the election minimum timeout");
        }
        if self.snapshot_threshold == 0 {
            return Err("Snapshot threshold must be greater than 0");
        }
        if self.max_entries_per_request == 0 {
            return Err("Max entries per request must be greater than 0");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            heartbeat_interval: options.heartbeat_interval.unwrap_or(Duration::from_millis(50)),
            election_min_timeout: options.election_min_timeout.unwrap_or(Duration::from_millis(150)),
            election_max_timeout: options.election_max_timeout.unwrap_or(Duration::from_millis(300)),
            rpc_timeout: options.rpc_timeout.unwrap_or(Duration::from_millis(40)),
            command_timeout: options.command_timeout.unwrap_or(Duration::from_secs(5)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(10_000),
            max_entries_per_request: options.max_entries_per_request.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(validated.election_min_timeout, Duration::from_millis(150));
        assert_eq!(validated.election_max_timeout, Duration::from_millis(300));
        assert_eq!(validated.snapshot_threshold, 10_000);
        assert_eq!(validated.max_entries_per_request, 64);
    }

    #[test]
    fn rejects_heartbeat_slower_than_election() {
        let options = RaftOptions {
            heartbeat_interval: Some(Duration::from_millis(200)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn rejects_inverted_election_range() {
        let options = RaftOptions {
            election_min_timeout: Some(Duration::from_millis(300)),
            election_max_timeout: Some(Duration::from_millis(300)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn rejects_slow_rpc_and_zero_sizes() {
        let slow_rpc = RaftOptions {
            rpc_timeout: Some(Duration::from_millis(150)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(slow_rpc).is_err());

        let zero_threshold = RaftOptions {
            snapshot_threshold: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(zero_threshold).is_err());

        let zero_batch = RaftOptions {
            max_entries_per_request: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(zero_batch).is_err());
    }
}
