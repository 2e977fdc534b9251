use crate::api::rpc;
use crate::api::{BoxError, CommandOutput};
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use bytes::Bytes;
use std::io;
use tokio::sync::oneshot;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) command_name: String,
    pub(crate) command: Bytes,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    pub(crate) enqueued_index: Index,
    // Resolves once the entry has been applied locally (or can't be anymore).
    pub(crate) applied_receiver: oneshot::Receiver<Result<CommandOutput, CommandApplyError>>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("Not the leader")]
    LeaderRedirect(Option<ReplicaId>),

    #[error("Command {0:?} is not registered")]
    UnregisteredCommand(String),

    #[error("Failed to persist log entry")]
    LocalIoError(io::Error),

    #[error("Replica is stopped")]
    Stopped,

    #[error("Replica actor has exited")]
    ActorExited,
}

/// Why an enqueued entry will never produce an output for its submitter.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandApplyError {
    #[error("Leadership changed before the entry was applied")]
    TermChanged,
    #[error("Command failed to apply: {0}")]
    Apply(BoxError),
    #[error("Replica stopped before the entry was applied")]
    Stopped,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) current_term: Term,
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Candidate's term is behind ours")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Local storage failure: {0}")]
    LocalIoError(io::Error),
    #[error("Replica is stopped")]
    Stopped,
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) command_name: String,
    pub(crate) command: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) current_term: Term,
    pub(crate) last_log_index: Option<Index>,
    pub(crate) commit_index: Option<Index>,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Sender's term is behind ours")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Log has no entry matching the leader's previous entry")]
    ServerMissingPreviousLogEntry(LogStateInfo),
    #[error("Entries conflict with committed entries")]
    ConflictsWithCommitted(LogStateInfo),
    #[error("Local storage failure: {0}")]
    ServerIoError(io::Error),
    #[error("Replica is stopped")]
    Stopped,
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct LogStateInfo {
    pub(crate) current_term: Term,
    pub(crate) last_log_index: Option<Index>,
    pub(crate) commit_index: Option<Index>,
}

#[derive(Debug)]
pub(crate) struct SnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) last_entry: (Term, Index),
}

#[derive(Debug)]
pub(crate) struct SnapshotOutput {
    pub(crate) current_term: Term,
    pub(crate) accept: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum SnapshotError {
    #[error("Sender's term is behind ours")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Local storage failure: {0}")]
    LocalIoError(io::Error),
    #[error("Replica is stopped")]
    Stopped,
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct SnapshotRecoveryInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) last_entry: (Term, Index),
    pub(crate) members: Vec<ReplicaId>,
    pub(crate) state: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct SnapshotRecoveryOutput {
    pub(crate) current_term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum SnapshotRecoveryError {
    #[error("Sender's term is behind ours")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("State machine failed to recover from snapshot: {0}")]
    RecoveryFailed(BoxError),
    #[error("Local storage failure: {0}")]
    LocalIoError(io::Error),
    #[error("Replica is stopped")]
    Stopped,
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure,
}

/// Asks the replica what a peer's replication task should send next.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PeerRequestInput {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

#[derive(Debug)]
pub(crate) struct PeerRequestOutput {
    pub(crate) request: OutboundPeerRequest,
    pub(crate) descriptor: PeerRequestDescriptor,
}

#[derive(Debug)]
pub(crate) enum OutboundPeerRequest {
    AppendEntries(rpc::AppendEntriesRequest),
    Snapshot(rpc::SnapshotRequest),
    SnapshotRecovery(rpc::SnapshotRecoveryRequest),
}

/// Identifies the request a peer reply belongs to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PeerRequestDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) kind: PeerRequestKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PeerRequestKind {
    AppendEntries {
        previous_log_entry_index: Option<Index>,
        num_log_entries: usize,
    },
    Snapshot {
        last_entry: (Term, Index),
    },
    SnapshotRecovery {
        last_entry: (Term, Index),
    },
}

#[derive(Debug)]
pub(crate) struct PeerReplyInput {
    pub(crate) descriptor: PeerRequestDescriptor,
    pub(crate) result: PeerReplyResult,
}

/// Transport failures and timeouts are an `Err` with a description.
#[derive(Debug)]
pub(crate) enum PeerReplyResult {
    AppendEntries(Result<rpc::AppendEntriesResponse, String>),
    Snapshot(Result<rpc::SnapshotResponse, String>),
    SnapshotRecovery(Result<rpc::SnapshotRecoveryResponse, String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PeerNextStep {
    // There's more to send to this peer, don't wait for the heartbeat.
    SendImmediately,
    AwaitHeartbeat,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum PeerTaskError {
    #[error("No longer leader for term {0:?}")]
    NoLongerLeader(Term),
    #[error("Peer {0:?} is no longer a replication target")]
    UnknownPeer(ReplicaId),
    #[error("Failed to read local log: {0}")]
    LocalIoError(io::Error),
    #[error("Replica actor has exited")]
    ActorExited,
}

/// ElectionTimeoutTick identifies a single firing of an election timer. It's stale if the timer
/// was reset or replaced after the tick was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ElectionTimeoutTick {
    pub(crate) timer_id: u64,
    pub(crate) generation: u64,
}

#[derive(Debug)]
pub(crate) struct TakeSnapshotOutput {
    pub(crate) last_entry: (Term, Index),
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TakeSnapshotError {
    #[error("Nothing has been applied since the last snapshot")]
    NothingToSnapshot,
    #[error("State machine failed to save: {0}")]
    StateMachine(BoxError),
    #[error("Failed to persist snapshot: {0}")]
    LocalIoError(io::Error),
    #[error("Replica is stopped")]
    Stopped,
    #[error("Replica actor has exited")]
    ActorExited,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum StatusError {
    #[error("Replica actor has exited")]
    ActorExited,
}
