use crate::replica::ElectionStateChangeListener;
use crate::replica::ElectionStateSnapshot;

// This is a really lazy event bus style just to expose *any* API to the consumer. Only role
// changes are published for now.

/// An event that happened, as observed by the local raft server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// An event of leader election or timeout. Consuming this event type is subtle. It doesn't queue
    /// intermediate events. If there are multiple events between when application awaits the next event,
    /// those events will be clobbered into only the most recent event.
    Election(RaftElectionState),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftElectionState {
    Leader,
    Candidate,
    Follower { leader: String },
    FollowerNoLeader,
    Snapshotting,
    Stopped,
}

#[derive(Clone)]
pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft server observes. None means the
    /// server has shut down.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|election_state| RaftEvent::Election(RaftElectionState::from(election_state)))
    }

    /// The most recently published election state.
    pub fn current_election_state(&self) -> RaftElectionState {
        RaftElectionState::from(self.election_state_change_listener.current())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftElectionState {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        match election_state {
            ElectionStateSnapshot::Leader => RaftElectionState::Leader,
            ElectionStateSnapshot::Candidate => RaftElectionState::Candidate,
            ElectionStateSnapshot::Follower(leader_id) => RaftElectionState::Follower {
                leader: leader_id.into_inner(),
            },
            ElectionStateSnapshot::FollowerNoLeader => RaftElectionState::FollowerNoLeader,
            ElectionStateSnapshot::Snapshotting => RaftElectionState::Snapshotting,
            ElectionStateSnapshot::Stopped => RaftElectionState::Stopped,
        }
    }
}
