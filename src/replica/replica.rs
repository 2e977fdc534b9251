use crate::actor::WeakActorClient;
use crate::api::rpc;
use crate::api::{
    encode_command, ApplyContext, CommandRegistry, MembershipChange, NopCommand, RaftPeerStatus, RaftRole,
    RaftStatus, StateMachine, Transporter, NOP_COMMAND_NAME,
};
use crate::commitlog::{index_or_zero, Index, Log};
use crate::replica::election::{CurrentLeader, ElectionState, ElectionStateSnapshot};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{ClusterTracker, ReplicaId};
use crate::replica::pending_commands::PendingCommands;
use crate::replica::replica_api::{
    CommandApplyError, ElectionTimeoutTick, EnqueueForReplicationError, EnqueueForReplicationInput,
    EnqueueForReplicationOutput, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RequestVoteResult, TermOutOfDateInfo,
};
use crate::replica::snapshot::SnapshotStore;
use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
use bytes::Bytes;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ReplicaConfig<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub logger: slog::Logger,
    pub cluster_tracker: ClusterTracker,
    pub local_state: S,
    pub election_state: ElectionState,
    pub write_ahead_log: WriteAheadLog<L>,
    pub snapshot_store: SnapshotStore,
    pub state_machine: M,
    pub commands: CommandRegistry<M>,
    pub actor_client: WeakActorClient,
    pub transporter: Arc<dyn Transporter>,
    pub rpc_timeout: Duration,
    pub snapshot_threshold: u64,
    pub max_entries_per_request: usize,
}

/// Replica is the raft algorithm for a single server. All of its methods run on the actor's
/// event loop, so they're synchronous and never block on the network. Anything that talks to
/// peers is spawned as a task that reports back through the actor queue.
///
/// Handlers are split across a few files:
/// * here: client commands, elections, applying committed entries
/// * `replication.rs`: AppendEntries on both sides
/// * `snapshotting.rs`: log compaction and snapshot install on both sides
pub(crate) struct Replica<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub(super) logger: slog::Logger,
    pub(super) my_replica_id: ReplicaId,
    pub(super) cluster_tracker: ClusterTracker,
    pub(super) local_state: S,
    pub(super) election_state: ElectionState,
    pub(super) write_ahead_log: WriteAheadLog<L>,
    pub(super) snapshot_store: SnapshotStore,
    pub(super) state_machine: M,
    pub(super) commands: CommandRegistry<M>,
    pub(super) pending_commands: PendingCommands,
    pub(super) actor_client: WeakActorClient,
    pub(super) transporter: Arc<dyn Transporter>,
    pub(super) rpc_timeout: Duration,
    pub(super) snapshot_threshold: u64,
    pub(super) max_entries_per_request: usize,
}

impl<L, S, M> Replica<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub(crate) fn new(config: ReplicaConfig<L, S, M>) -> Self {
        Replica {
            logger: config.logger,
            my_replica_id: config.cluster_tracker.my_replica_id().clone(),
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state: config.election_state,
            write_ahead_log: config.write_ahead_log,
            snapshot_store: config.snapshot_store,
            state_machine: config.state_machine,
            commands: config.commands,
            pending_commands: PendingCommands::new(),
            actor_client: config.actor_client,
            transporter: config.transporter,
            rpc_timeout: config.rpc_timeout,
            snapshot_threshold: config.snapshot_threshold,
            max_entries_per_request: config.max_entries_per_request,
        }
    }

    /// Bring the state machine up to the commit index we had before restarting. Runs before the
    /// actor starts serving requests.
    pub(crate) fn replay_committed_entries(&mut self) -> Result<(), io::Error> {
        if let Some(persisted_commit_index) = self.local_state.commit_index() {
            self.write_ahead_log.commit_to(persisted_commit_index);
        }
        slog::info!(
            self.logger,
            "Replaying log through commit index {:?}",
            self.write_ahead_log.commit_index()
        );
        self.apply_committed_entries();

        if self.election_state.is_stopped() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "Replica halted while replaying committed entries",
            ));
        }
        self.election_state.reset_timeout_if_follower();

        Ok(())
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        if self.election_state.is_stopped() {
            return Err(EnqueueForReplicationError::Stopped);
        }

        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => {
                return Err(EnqueueForReplicationError::LeaderRedirect(Some(leader_id)));
            }
            CurrentLeader::Unknown => {
                return Err(EnqueueForReplicationError::LeaderRedirect(None));
            }
        }

        if !self.commands.contains(&input.command_name) {
            return Err(EnqueueForReplicationError::UnregisteredCommand(input.command_name));
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let appended_index = self
            .append_as_leader(term, input.command_name, input.command)
            .map_err(EnqueueForReplicationError::LocalIoError)?;
        let applied_receiver = self.pending_commands.register(appended_index, term);

        self.after_leader_append();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: appended_index,
            applied_receiver,
        })
    }

    fn append_as_leader(&mut self, term: Term, command_name: String, command: Bytes) -> Result<Index, io::Error> {
        let result = self.write_ahead_log.append(WriteAheadLogEntry {
            term,
            command_name,
            command,
        });
        result.map_err(|e| self.fatal_io_error("appending to log as leader", e))
    }

    /// Replicate eagerly instead of waiting on the next heartbeat. A leader without peers commits
    /// on its own.
    fn after_leader_append(&mut self) {
        if let Some(leader_state) = self.election_state.leader_state() {
            leader_state.trigger_all();
        }
        self.advance_leader_commit_index();
    }

    /// Leader only. Commit whatever a majority has replicated, then apply it.
    pub(super) fn advance_leader_commit_index(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(leader_state) => leader_state,
            None => return,
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let peers_matched_index: Vec<Option<Index>> = self
            .cluster_tracker
            .peer_ids()
            .iter()
            .map(|peer_id| leader_state.peer_state(peer_id).and_then(|peer| peer.matched()))
            .collect();
        let tentative_new_commit_index = if peers_matched_index.is_empty() {
            self.write_ahead_log.latest_index()
        } else {
            Self::get_cluster_commit_index(peers_matched_index)
        };

        let tentative_new_commit_index = match tentative_new_commit_index {
            Some(index) => index,
            None => return,
        };
        let current_term = self.local_state.current_term();
        match self
            .write_ahead_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
        {
            Ok(true) => self.on_commit_index_advanced(),
            Ok(false) => {}
            Err(e) => {
                self.fatal_io_error("confirming new commit index", e);
            }
        }
    }

    pub(super) fn get_cluster_commit_index(mut peers_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
        peers_matched_indexes.sort_by_key(|matched| index_or_zero(*matched));

        // We are always at the tail of the array, because our log is same/longest. Counting
        // ourselves in, the entry at len/2 is the highest index a majority has.
        // When in doubt, just read the unit tests.
        let quorum_idx = peers_matched_indexes.len() / 2;

        peers_matched_indexes.remove(quorum_idx)
    }

    /// Persist the new commit index and apply everything up to it.
    pub(super) fn on_commit_index_advanced(&mut self) {
        if let Some(commit_index) = self.write_ahead_log.commit_index() {
            let result = self.local_state.store_commit_index(commit_index);
            if let Err(e) = result {
                self.fatal_io_error("persisting commit index", e);
                return;
            }
        }

        self.apply_committed_entries();
        self.take_snapshot_if_log_is_large();
    }

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    pub(super) fn apply_committed_entries(&mut self) {
        loop {
            if self.election_state.is_stopped() {
                return;
            }

            let (index, entry) = match self.write_ahead_log.next_entry_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    self.fatal_io_error("reading committed entry", e);
                    return;
                }
            };

            // Every server must apply the same commands. One we can't decode means we'd diverge.
            let command = match self.commands.decode(&entry.command_name, &entry.command) {
                Ok(command) => command,
                Err(e) => {
                    self.halt(&format!("Can't decode committed entry {:?}: {}", index, e));
                    return;
                }
            };

            let (result, membership_changes) = {
                let mut context = ApplyContext::new(
                    &mut self.state_machine,
                    self.my_replica_id.as_str(),
                    entry.term.as_u64(),
                    index.as_u64(),
                );
                let result = command.apply(&mut context);
                (result, context.into_membership_changes())
            };
            self.write_ahead_log.mark_applied(index);

            if let Err(e) = &result {
                slog::warn!(self.logger, "Command {} at {:?} failed to apply: {}", entry.command_name, index, e);
            }
            self.pending_commands
                .complete(index, entry.term, result.map_err(CommandApplyError::Apply));

            for change in membership_changes {
                self.apply_membership_change(change);
            }
        }
    }

    fn apply_membership_change(&mut self, change: MembershipChange) {
        match change {
            MembershipChange::Add(name) => {
                let replica_id = ReplicaId::new(name);
                if !self.cluster_tracker.add_member(replica_id.clone()) {
                    return;
                }
                slog::info!(self.logger, "Member {:?} joined the cluster", replica_id);
                if replica_id != self.my_replica_id {
                    let latest_index = self.write_ahead_log.latest_index();
                    self.election_state.add_peer_if_leader(replica_id, latest_index);
                }
            }
            MembershipChange::Remove(name) => {
                let replica_id = ReplicaId::new(name);
                if !self.cluster_tracker.remove_member(&replica_id) {
                    return;
                }
                slog::info!(self.logger, "Member {:?} left the cluster", replica_id);
                if replica_id != self.my_replica_id {
                    self.election_state.remove_peer_if_leader(&replica_id);
                } else if self.election_state.current_leader() == CurrentLeader::Me {
                    slog::info!(self.logger, "Removed myself from the cluster. Stepping down.");
                    self.step_down(None);
                }
            }
        }
    }

    /// Become a follower. Pending submissions can no longer be answered by us.
    pub(super) fn step_down(&mut self, new_leader: Option<ReplicaId>) {
        self.election_state.transition_to_follower(new_leader);
        self.pending_commands.fail_all(|| CommandApplyError::TermChanged);
        slog::info!(self.logger, "Transitioned to follower. Election state: {:?}", self.election_state);
    }

    /// Any persistence failure leaves us unsure of what's durable, so we stop participating.
    pub(super) fn fatal_io_error(&mut self, context: &str, error: io::Error) -> io::Error {
        self.halt(&format!("IO failure while {}: {:?}", context, error));
        error
    }

    pub(super) fn halt(&mut self, reason: &str) {
        if self.election_state.is_stopped() {
            return;
        }
        slog::crit!(self.logger, "Halting replica. {}", reason);
        self.election_state.transition_to_stopped();
        self.pending_commands.fail_all(|| CommandApplyError::Stopped);
    }

    pub(crate) fn stop(&mut self) {
        if self.election_state.is_stopped() {
            return;
        }
        slog::info!(self.logger, "Stopping replica");
        if let Err(e) = self.local_state.flush_commit_index() {
            slog::warn!(self.logger, "Failed to flush commit index on stop: {}", e);
        }
        self.election_state.transition_to_stopped();
        self.pending_commands.fail_all(|| CommandApplyError::Stopped);
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        if self.election_state.is_stopped() {
            return Err(RequestVoteError::Stopped);
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // Removed servers don't know they're removed. Don't let them disrupt us with their terms.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::info!(self.logger, "Not granting vote. {:?} is not a member.", input.candidate_id);
            return Ok(RequestVoteOutput {
                current_term,
                vote_granted: false,
            });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(|e| RequestVoteError::LocalIoError(self.fatal_io_error("storing term", e)))?;
        if increased {
            self.step_down(None);
            slog::info!(self.logger, "Observed increased term {:?} in RequestVote call.", input.candidate_term);
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let current_term = input.candidate_term;

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput {
                    current_term,
                    vote_granted: false,
                });
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput {
                current_term,
                vote_granted: false,
            });
        }

        // ...grant vote
        slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(|e| RequestVoteError::LocalIoError(self.fatal_io_error("storing vote", e)))?;

        let vote_granted = cas_success || {
            // We lost CAS race. Re-read state and grant based on if the previous winner made the
            // same vote as we would've (i.e. a retried request).
            let (reread_current_term, reread_voted_for) = self.local_state.voted_for_current_term();
            reread_current_term == input.candidate_term
                && matches!(reread_voted_for, Some(voted_for) if voted_for.as_ref() == &input.candidate_id)
        };

        if vote_granted {
            // Granting a vote counts as hearing from a viable leader.
            self.election_state.reset_timeout_if_follower();
        } else {
            slog::info!(self.logger, "Not granting vote. Voted for someone else this term.");
        }

        Ok(RequestVoteOutput {
            current_term,
            vote_granted,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term > my_last_entry_term {
                    return true;
                } else if candidate_last_entry_term < my_last_entry_term {
                    return false;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                if self.election_state.add_vote_if_candidate(reply.peer_id).is_none() {
                    slog::info!(
                        self.logger,
                        "Received vote for term {:?} after transitioning to a election state: {:?}",
                        reply.term,
                        self.election_state,
                    );
                    return;
                }
                self.become_leader_if_won(reply.term);
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => match self.local_state.store_term_if_increased(new_term) {
                Ok(true) => {
                    slog::info!(self.logger, "Peer {:?} has newer term {:?}", reply.peer_id, new_term);
                    self.step_down(None);
                }
                Ok(false) => {}
                Err(e) => {
                    self.fatal_io_error("storing term", e);
                }
            },
            RequestVoteResult::RetryableFailure => {
                // No retry. If this election stalls, the next timeout starts a new one.
                slog::info!(self.logger, "No vote reply from {:?} for term {:?}", reply.peer_id, reply.term);
            }
        }
    }

    fn become_leader_if_won(&mut self, term: Term) -> bool {
        // Only current members' votes count, and we may have learned of membership changes since
        // the election started.
        let members: HashSet<ReplicaId> = self.cluster_tracker.members().into_iter().collect();
        let num_votes_received = match self.election_state.count_votes_if_candidate(&members) {
            Some(v) => v,
            None => return false,
        };

        let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
        slog::info!(
            self.logger,
            "Have {}/{} votes for term {:?}",
            num_votes_received,
            num_voting_replicas,
            term,
        );
        if num_votes_received < Self::get_majority_vote_count(num_voting_replicas) {
            return false;
        }

        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.write_ahead_log.latest_index(),
        );
        slog::info!(self.logger, "Won election for term {:?}", term);

        // > Raft handles this by having each leader commit a blank no-op entry into the log at
        // > the start of its term.
        let nop = match encode_command(&NopCommand {}) {
            Ok(nop) => nop,
            Err(e) => {
                self.halt(&format!("Can't encode nop command: {}", e));
                return true;
            }
        };
        if self
            .append_as_leader(term, NOP_COMMAND_NAME.to_string(), Bytes::from(nop))
            .is_ok()
        {
            self.after_leader_append();
        }

        true
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    pub(crate) fn handle_election_timeout(&mut self, tick: ElectionTimeoutTick) {
        if !self.election_state.is_current_timeout(tick) {
            slog::debug!(self.logger, "Ignoring stale election timeout {:?}", tick);
            return;
        }

        if !self.cluster_tracker.i_am_member() {
            // Not a voter (yet, or anymore). Keep waiting to hear from a leader.
            slog::debug!(self.logger, "Not a member. Not starting an election.");
            self.election_state.reset_timeout_if_follower();
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                self.fatal_io_error("starting election", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        // Single member cluster.
        if self.become_leader_if_won(new_term) {
            return;
        }

        let request = self.new_request_vote_request(new_term);
        for peer_id in self.cluster_tracker.peer_ids() {
            tokio::task::spawn(call_peer_request_vote(
                self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id))),
                self.transporter.clone(),
                peer_id,
                request.clone(),
                self.rpc_timeout,
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> rpc::RequestVoteRequest {
        let (last_log_term, last_log_index) = match self.write_ahead_log.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        rpc::RequestVoteRequest {
            term: term.as_u64(),
            candidate_name: self.my_replica_id.as_str().to_string(),
            last_log_index,
            last_log_term,
        }
    }

    pub(crate) fn status(&self) -> RaftStatus {
        let role = match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => RaftRole::Leader,
            ElectionStateSnapshot::Candidate => RaftRole::Candidate,
            ElectionStateSnapshot::Follower(_) | ElectionStateSnapshot::FollowerNoLeader => RaftRole::Follower,
            ElectionStateSnapshot::Snapshotting => RaftRole::Snapshotting,
            ElectionStateSnapshot::Stopped => RaftRole::Stopped,
        };
        let leader = match self.election_state.current_leader() {
            CurrentLeader::Me => Some(self.my_replica_id.as_str().to_string()),
            CurrentLeader::Other(leader_id) => Some(leader_id.into_inner()),
            CurrentLeader::Unknown => None,
        };

        let mut peers: Vec<RaftPeerStatus> = match self.election_state.leader_state() {
            None => Vec::new(),
            Some(leader_state) => leader_state
                .peers_iter()
                .map(|(peer_id, peer_state)| RaftPeerStatus {
                    name: peer_id.as_str().to_string(),
                    next_index: peer_state.next_and_previous_log_index().0.as_u64(),
                    matched_index: index_or_zero(peer_state.matched()),
                    last_contact: peer_state.last_contact(),
                    snapshotting: peer_state.snapshot_install().is_some(),
                })
                .collect(),
        };
        peers.sort_by(|a, b| a.name.cmp(&b.name));

        RaftStatus {
            name: self.my_replica_id.as_str().to_string(),
            term: self.local_state.current_term().as_u64(),
            role,
            leader,
            commit_index: index_or_zero(self.write_ahead_log.commit_index()),
            last_applied_index: index_or_zero(self.write_ahead_log.last_applied_index()),
            first_log_index: self.write_ahead_log.first_index().as_u64(),
            last_log_index: index_or_zero(self.write_ahead_log.latest_index()),
            members: self
                .cluster_tracker
                .members()
                .into_iter()
                .map(ReplicaId::into_inner)
                .collect(),
            peers,
        }
    }
}

async fn call_peer_request_vote(
    logger: slog::Logger,
    transporter: Arc<dyn Transporter>,
    peer_id: ReplicaId,
    rpc_request: rpc::RequestVoteRequest,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    term: Term,
) {
    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, transporter.send_vote_request(peer_id.as_str(), rpc_request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(response)) => {
            let response_term = Term::new(response.term);
            if response_term > term {
                RequestVoteResult::StaleTerm { new_term: response_term }
            } else if response.vote_granted {
                RequestVoteResult::VoteGranted
            } else {
                RequestVoteResult::VoteNotGranted
            }
        }
        Ok(Err(e)) => {
            slog::warn!(logger, "RequestVote failed: {}", e);
            RequestVoteResult::RetryableFailure
        }
        Err(_timeout) => {
            slog::warn!(logger, "Timed out calling RequestVote");
            RequestVoteResult::RetryableFailure
        }
    };

    callback
        .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
        .await;
}
