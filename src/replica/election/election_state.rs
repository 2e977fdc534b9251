use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::peer_task::{PeerTaskConfig, PeerTaskHandle};
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::ElectionTimer;
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ElectionTimeoutTick, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub peer_task_config: PeerTaskConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(ReplicaId),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
///
/// Every transition replaces the previous state wholesale, which drops its timers and
/// replication tasks.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(initial_state.snapshot());

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<ReplicaId>) {
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: impl IntoIterator<Item = ReplicaId>,
        previous_log_entry_index: Option<Index>,
    ) {
        let mut peer_state = HashMap::new();
        for peer_id in peer_ids {
            let task = self.spawn_peer_task(peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(task, previous_log_entry_index));
        }

        self.state = State::Leader(LeaderState {
            term,
            tracker: LeaderStateTracker::new(peer_state),
        });
        self.notify_new_state();
    }

    /// A follower receiving a snapshot from `leader`. Still times out if the leader goes away.
    pub(crate) fn transition_to_snapshotting(&mut self, leader: ReplicaId) {
        if let State::Snapshotting(ss) = &self.state {
            if ss.follower.leader.as_ref() == Some(&leader) {
                ss.follower.election_timer.reset_timeout();
                return;
            }
        }
        self.state = State::Snapshotting(SnapshottingState {
            follower: FollowerState::new(Some(leader), &self.config, self.actor_client.clone()),
        });
        self.notify_new_state();
    }

    pub(crate) fn transition_to_stopped(&mut self) {
        self.state = State::Stopped;
        self.notify_new_state();
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        self.state.snapshot()
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.state.snapshot());
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        if let State::Leader(_) = self.state {
            return CurrentLeader::Me;
        }
        match self.state.follower().and_then(|fs| fs.leader.as_ref()) {
            Some(leader_id) => CurrentLeader::Other(leader_id.clone()),
            None => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let Some(fs) = self.state.follower() {
            fs.election_timer.reset_timeout();
        }
    }

    /// True if `tick` is the live timeout of the current follower or candidate state. Ticks from
    /// a timer that has since been reset or replaced are stale.
    pub(crate) fn is_current_timeout(&self, tick: ElectionTimeoutTick) -> bool {
        let timer = match &self.state {
            State::Candidate(cs) => &cs.election_timer,
            other => match other.follower() {
                Some(fs) => &fs.election_timer,
                None => return false,
            },
        };
        timer.is_current(tick)
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Snapshotting is over, go back to following the same leader.
    pub(crate) fn finish_snapshotting(&mut self) {
        if let State::Snapshotting(ss) = &mut self.state {
            let leader = ss.follower.leader.take();
            self.transition_to_follower(leader);
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    /// Votes from replicas that aren't in `members` don't count towards a majority.
    pub(crate) fn count_votes_if_candidate(&self, members: &HashSet<ReplicaId>) -> Option<usize> {
        if let State::Candidate(cs) = &self.state {
            Some(cs.received_votes_from.intersection(members).count())
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    /// Start replicating to a newly joined member. No-op unless leader.
    pub(crate) fn add_peer_if_leader(&mut self, peer_id: ReplicaId, previous_log_entry_index: Option<Index>) {
        let term = match &self.state {
            State::Leader(ls) if !ls.tracker.contains_peer(&peer_id) => ls.term,
            _ => return,
        };
        let task = self.spawn_peer_task(peer_id.clone(), term);
        if let State::Leader(ls) = &mut self.state {
            ls.tracker
                .insert_peer(peer_id, PeerState::new(task, previous_log_entry_index));
        }
    }

    /// Stop replicating to a removed member. No-op unless leader.
    pub(crate) fn remove_peer_if_leader(&mut self, peer_id: &ReplicaId) {
        if let State::Leader(ls) = &mut self.state {
            ls.tracker.remove_peer(peer_id);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        matches!(self.state, State::Stopped)
    }

    fn spawn_peer_task(&self, peer_id: ReplicaId, term: Term) -> PeerTaskHandle {
        PeerTaskHandle::spawn(
            self.config.peer_task_config.clone(),
            self.actor_client.clone(),
            peer_id,
            term,
        )
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.state.snapshot(), f)
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
    Snapshotting(SnapshottingState),
    Stopped,
}

impl State {
    fn snapshot(&self) -> ElectionStateSnapshot {
        match self {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(fs) => match &fs.leader {
                Some(leader_id) => ElectionStateSnapshot::Follower(leader_id.clone()),
                None => ElectionStateSnapshot::FollowerNoLeader,
            },
            State::Snapshotting(_) => ElectionStateSnapshot::Snapshotting,
            State::Stopped => ElectionStateSnapshot::Stopped,
        }
    }

    /// A snapshotting replica is still a follower as far as timeouts and redirects go.
    fn follower(&self) -> Option<&FollowerState> {
        match self {
            State::Follower(fs) => Some(fs),
            State::Snapshotting(ss) => Some(&ss.follower),
            _ => None,
        }
    }
}

struct LeaderState {
    term: Term,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    election_timer: ElectionTimer,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    election_timer: ElectionTimer,
}

struct SnapshottingState {
    follower: FollowerState,
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            election_timer: ElectionTimer::spawn(config.election_min_timeout, config.election_max_timeout, actor_client),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<ReplicaId>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            election_timer: ElectionTimer::spawn(config.election_min_timeout, config.election_max_timeout, actor_client),
        }
    }
}
