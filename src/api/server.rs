use crate::actor::ActorClient;
use crate::api::command::{encode_command, Command, CommandError, CommandOutput};
use crate::api::event_bus::RaftEventListener;
use crate::api::rpc;
use crate::api::state_machine::BoxError;
use crate::api::types::{RaftStatus, SnapshotInfo};
use crate::commitlog::{index_or_zero, Index};
use crate::replica;
use crate::replica::{ReplicaId, Term};
use bytes::Bytes;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;

/// RaftServer is the handle to one local raft server. Cloning it is cheap. The server keeps
/// running until every clone is dropped; `stop()` makes it refuse all further work first.
///
/// There are two kinds of callers:
/// * the application, which submits commands through `do_command()`
/// * the embedding transport, which hands incoming RPCs from other servers to the
///   `request_vote()`, `append_entries()`, `snapshot()` and `snapshot_recovery()` handlers
pub struct RaftServer<M> {
    name: String,
    actor_client: ActorClient,
    event_listener: RaftEventListener,
    command_timeout: Duration,
    // Commands are typed against the state machine.
    _state_machine: PhantomData<fn(M)>,
}

impl<M> Clone for RaftServer<M> {
    fn clone(&self) -> Self {
        RaftServer {
            name: self.name.clone(),
            actor_client: self.actor_client.clone(),
            event_listener: self.event_listener.clone(),
            command_timeout: self.command_timeout,
            _state_machine: PhantomData,
        }
    }
}

impl<M> RaftServer<M> {
    pub(crate) fn new(
        name: String,
        actor_client: ActorClient,
        event_listener: RaftEventListener,
        command_timeout: Duration,
    ) -> Self {
        RaftServer {
            name,
            actor_client,
            event_listener,
            command_timeout,
            _state_machine: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replicate `command` and wait until it's applied on this server. Only the leader accepts
    /// commands; anyone else answers with `NotLeader`.
    pub async fn do_command<C>(&self, command: C) -> Result<CommandOutput, DoCommandError>
    where
        C: Command<M> + Serialize,
    {
        let payload = encode_command(&command).map_err(DoCommandError::Encode)?;
        let input = replica::EnqueueForReplicationInput {
            command_name: command.name().to_string(),
            command: Bytes::from(payload),
        };

        let output = self.actor_client.enqueue_for_replication(input).await?;
        match tokio::time::timeout(self.command_timeout, output.applied_receiver).await {
            Ok(Ok(applied)) => applied.map_err(DoCommandError::from),
            // Actor dropped our waiter without answering. It's gone.
            Ok(Err(_)) => Err(DoCommandError::Stopped),
            Err(_) => Err(DoCommandError::Timeout),
        }
    }

    pub async fn request_vote(
        &self,
        request: rpc::RequestVoteRequest,
    ) -> Result<rpc::RequestVoteResponse, RpcHandlerError> {
        let input = convert_request_vote_input(request)?;
        match self.actor_client.request_vote(input).await {
            Ok(output) => Ok(rpc::RequestVoteResponse {
                term: output.current_term.as_u64(),
                vote_granted: output.vote_granted,
            }),
            Err(replica::RequestVoteError::RequestTermOutOfDate(info)) => Ok(rpc::RequestVoteResponse {
                term: info.current_term.as_u64(),
                vote_granted: false,
            }),
            Err(replica::RequestVoteError::LocalIoError(_))
            | Err(replica::RequestVoteError::Stopped)
            | Err(replica::RequestVoteError::ActorExited) => Err(RpcHandlerError::Stopped),
        }
    }

    pub async fn append_entries(
        &self,
        request: rpc::AppendEntriesRequest,
    ) -> Result<rpc::AppendEntriesResponse, RpcHandlerError> {
        let input = convert_append_entries_input(request)?;
        match self.actor_client.append_entries(input).await {
            Ok(output) => Ok(rpc::AppendEntriesResponse {
                term: output.current_term.as_u64(),
                success: true,
                last_log_index: index_or_zero(output.last_log_index),
                commit_index: index_or_zero(output.commit_index),
            }),
            Err(replica::AppendEntriesError::ClientTermOutOfDate(info)) => Ok(rpc::AppendEntriesResponse {
                term: info.current_term.as_u64(),
                success: false,
                last_log_index: 0,
                commit_index: 0,
            }),
            Err(replica::AppendEntriesError::ServerMissingPreviousLogEntry(info))
            | Err(replica::AppendEntriesError::ConflictsWithCommitted(info)) => Ok(rpc::AppendEntriesResponse {
                term: info.current_term.as_u64(),
                success: false,
                last_log_index: index_or_zero(info.last_log_index),
                commit_index: index_or_zero(info.commit_index),
            }),
            Err(replica::AppendEntriesError::ServerIoError(_))
            | Err(replica::AppendEntriesError::Stopped)
            | Err(replica::AppendEntriesError::ActorExited) => Err(RpcHandlerError::Stopped),
        }
    }

    pub async fn snapshot(&self, request: rpc::SnapshotRequest) -> Result<rpc::SnapshotResponse, RpcHandlerError> {
        let input = replica::SnapshotInput {
            leader_term: Term::new(request.term),
            leader_id: ReplicaId::new(request.leader_name),
            last_entry: convert_snapshot_point(request.last_term, request.last_index)?,
        };
        match self.actor_client.snapshot(input).await {
            Ok(output) => Ok(rpc::SnapshotResponse {
                term: output.current_term.as_u64(),
                accept: output.accept,
            }),
            Err(replica::SnapshotError::ClientTermOutOfDate(info)) => Ok(rpc::SnapshotResponse {
                term: info.current_term.as_u64(),
                accept: false,
            }),
            Err(replica::SnapshotError::LocalIoError(_))
            | Err(replica::SnapshotError::Stopped)
            | Err(replica::SnapshotError::ActorExited) => Err(RpcHandlerError::Stopped),
        }
    }

    pub async fn snapshot_recovery(
        &self,
        request: rpc::SnapshotRecoveryRequest,
    ) -> Result<rpc::SnapshotRecoveryResponse, RpcHandlerError> {
        let input = replica::SnapshotRecoveryInput {
            leader_term: Term::new(request.term),
            leader_id: ReplicaId::new(request.leader_name),
            last_entry: convert_snapshot_point(request.last_term, request.last_index)?,
            members: request.members.into_iter().map(ReplicaId::new).collect(),
            state: request.state,
        };
        match self.actor_client.snapshot_recovery(input).await {
            Ok(output) => Ok(rpc::SnapshotRecoveryResponse {
                term: output.current_term.as_u64(),
                success: true,
            }),
            Err(replica::SnapshotRecoveryError::ClientTermOutOfDate(info)) => Ok(rpc::SnapshotRecoveryResponse {
                term: info.current_term.as_u64(),
                success: false,
            }),
            Err(replica::SnapshotRecoveryError::RecoveryFailed(_))
            | Err(replica::SnapshotRecoveryError::LocalIoError(_))
            | Err(replica::SnapshotRecoveryError::Stopped)
            | Err(replica::SnapshotRecoveryError::ActorExited) => Err(RpcHandlerError::Stopped),
        }
    }

    /// Snapshot the state machine now and compact the log, regardless of the threshold.
    pub async fn take_snapshot(&self) -> Result<SnapshotInfo, AdminError> {
        let output = self.actor_client.take_snapshot().await?;
        let (term, index) = output.last_entry;

        Ok(SnapshotInfo {
            term: term.as_u64(),
            index: index.as_u64(),
        })
    }

    pub async fn status(&self) -> Result<RaftStatus, AdminError> {
        Ok(self.actor_client.status().await?)
    }

    /// Stop participating in the cluster. Pending commands fail with `Stopped`, and every later
    /// command or RPC is refused. Idempotent.
    pub async fn stop(&self) -> Result<(), AdminError> {
        Ok(self.actor_client.stop().await?)
    }

    pub fn event_listener(&self) -> RaftEventListener {
        self.event_listener.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DoCommandError {
    #[error("I'm not leader. Leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    // Leadership changed before the command was applied. It may or may not end up committed.
    #[error("Leadership changed before the command was applied")]
    TermChanged,

    #[error("Command failed to apply: {0}")]
    Apply(BoxError),

    // Command is still in the log and may be applied later.
    #[error("Timed out waiting for the command to be applied")]
    Timeout,

    #[error("Server is stopped")]
    Stopped,

    #[error("Command {0:?} is not registered")]
    Unregistered(String),

    #[error("Failed to encode command: {0}")]
    Encode(CommandError),
}

/// The local server can't handle the RPC. The caller sees no response.
#[derive(Debug, thiserror::Error)]
pub enum RpcHandlerError {
    #[error("Server is stopped")]
    Stopped,
    #[error("Malformed request: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Nothing has been applied since the last snapshot")]
    NothingToSnapshot,
    #[error("State machine failed to save: {0}")]
    StateMachine(BoxError),
    #[error("Server is stopped")]
    Stopped,
    #[error("Server task has exited")]
    Exited,
}

// ------- Conversions --------

fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, RpcHandlerError> {
    match (log_entry_term, log_entry_index) {
        (0, 0) => Ok(None),
        (0, _) => Err(RpcHandlerError::Malformed(
            "LastLogEntryTerm 0 and LastLogEntryIndex non-0".into(),
        )),
        (_, 0) => Err(RpcHandlerError::Malformed(
            "LastLogEntryIndex 0 and LastLogEntryTerm non-0".into(),
        )),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

fn convert_snapshot_point(last_term: u64, last_index: u64) -> Result<(Term, Index), RpcHandlerError> {
    // The log resumes right after the snapshot point, so that index must exist.
    if last_index == u64::MAX {
        return Err(RpcHandlerError::Malformed("Snapshot last index leaves no room for the log".into()));
    }
    convert_log_entry_metadata(last_term, last_index)?
        .ok_or_else(|| RpcHandlerError::Malformed("Snapshot with empty last entry".into()))
}

fn convert_request_vote_input(request: rpc::RequestVoteRequest) -> Result<replica::RequestVoteInput, RpcHandlerError> {
    Ok(replica::RequestVoteInput {
        candidate_term: Term::new(request.term),
        candidate_id: ReplicaId::new(request.candidate_name),
        candidate_last_log_entry: convert_log_entry_metadata(request.last_log_term, request.last_log_index)?,
    })
}

fn convert_append_entries_input(
    request: rpc::AppendEntriesRequest,
) -> Result<replica::AppendEntriesInput, RpcHandlerError> {
    let leader_previous_log_entry = convert_log_entry_metadata(request.prev_log_term, request.prev_log_index)?;
    // Every carried entry, and the index after the last one, must fit in a u64.
    request
        .prev_log_index
        .checked_add(request.entries.len() as u64 + 1)
        .ok_or_else(|| RpcHandlerError::Malformed(format!("Entries after {} overflow the log", request.prev_log_index)))?;

    // Entries are positional; the index on the wire is only there to be checked.
    let mut new_entries = Vec::with_capacity(request.entries.len());
    for (i, entry) in request.entries.into_iter().enumerate() {
        let expected_index = request.prev_log_index + 1 + i as u64;
        if entry.index != expected_index {
            return Err(RpcHandlerError::Malformed(format!(
                "Entry has index {}, expected {}",
                entry.index, expected_index
            )));
        }
        new_entries.push(replica::AppendEntriesLogEntry {
            term: Term::new(entry.term),
            command_name: entry.command_name,
            command: Bytes::from(entry.command),
        });
    }

    Ok(replica::AppendEntriesInput {
        leader_term: Term::new(request.term),
        leader_id: ReplicaId::new(request.leader_name),
        leader_previous_log_entry,
        leader_commit_index: Index::from_u64(request.commit_index),
        new_entries,
    })
}

impl From<replica::EnqueueForReplicationError> for DoCommandError {
    fn from(internal_error: replica::EnqueueForReplicationError) -> Self {
        match internal_error {
            replica::EnqueueForReplicationError::LeaderRedirect(leader) => DoCommandError::NotLeader {
                leader: leader.map(ReplicaId::into_inner),
            },
            replica::EnqueueForReplicationError::UnregisteredCommand(name) => DoCommandError::Unregistered(name),
            // Persistence failure halts the server.
            replica::EnqueueForReplicationError::LocalIoError(_)
            | replica::EnqueueForReplicationError::Stopped
            | replica::EnqueueForReplicationError::ActorExited => DoCommandError::Stopped,
        }
    }
}

impl From<replica::CommandApplyError> for DoCommandError {
    fn from(internal_error: replica::CommandApplyError) -> Self {
        match internal_error {
            replica::CommandApplyError::TermChanged => DoCommandError::TermChanged,
            replica::CommandApplyError::Apply(e) => DoCommandError::Apply(e),
            replica::CommandApplyError::Stopped => DoCommandError::Stopped,
        }
    }
}

impl From<replica::TakeSnapshotError> for AdminError {
    fn from(internal_error: replica::TakeSnapshotError) -> Self {
        match internal_error {
            replica::TakeSnapshotError::NothingToSnapshot => AdminError::NothingToSnapshot,
            replica::TakeSnapshotError::StateMachine(e) => AdminError::StateMachine(e),
            replica::TakeSnapshotError::LocalIoError(_) | replica::TakeSnapshotError::Stopped => AdminError::Stopped,
            replica::TakeSnapshotError::ActorExited => AdminError::Exited,
        }
    }
}

impl From<replica::StatusError> for AdminError {
    fn from(internal_error: replica::StatusError) -> Self {
        match internal_error {
            replica::StatusError::ActorExited => AdminError::Exited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> rpc::LogEntry {
        rpc::LogEntry {
            index,
            term: 1,
            command_name: "raft:nop".into(),
            command: b"{}".to_vec(),
        }
    }

    fn append_entries_request(prev_log_index: u64, entries: Vec<rpc::LogEntry>) -> rpc::AppendEntriesRequest {
        rpc::AppendEntriesRequest {
            term: 1,
            leader_name: "a".into(),
            prev_log_index,
            prev_log_term: if prev_log_index == 0 { 0 } else { 1 },
            commit_index: 0,
            entries,
        }
    }

    #[test]
    fn zero_on_the_wire_means_none() {
        assert_eq!(convert_log_entry_metadata(0, 0).unwrap(), None);
        assert_eq!(
            convert_log_entry_metadata(2, 7).unwrap(),
            Some((Term::new(2), Index::new(7)))
        );
        assert!(matches!(convert_log_entry_metadata(0, 7), Err(RpcHandlerError::Malformed(_))));
        assert!(matches!(convert_log_entry_metadata(2, 0), Err(RpcHandlerError::Malformed(_))));
        assert!(matches!(convert_snapshot_point(0, 0), Err(RpcHandlerError::Malformed(_))));
    }

    #[test]
    fn append_entries_indexes_must_follow_previous_entry() {
        let input = convert_append_entries_input(append_entries_request(3, vec![entry(4), entry(5)])).unwrap();
        assert_eq!(input.new_entries.len(), 2);
        assert_eq!(input.leader_previous_log_entry, Some((Term::new(1), Index::new(3))));
        assert_eq!(input.leader_commit_index, None);

        let result = convert_append_entries_input(append_entries_request(3, vec![entry(4), entry(6)]));
        assert!(matches!(result, Err(RpcHandlerError::Malformed(_))));

        let result = convert_append_entries_input(append_entries_request(0, vec![entry(2)]));
        assert!(matches!(result, Err(RpcHandlerError::Malformed(_))));
    }

    #[test]
    fn indexes_at_the_end_of_u64_are_malformed() {
        let mut request = append_entries_request(u64::MAX, vec![entry(0)]);
        request.prev_log_term = 1;
        assert!(matches!(convert_append_entries_input(request), Err(RpcHandlerError::Malformed(_))));

        let heartbeat = append_entries_request(u64::MAX, vec![]);
        assert!(matches!(convert_append_entries_input(heartbeat), Err(RpcHandlerError::Malformed(_))));

        let last_fitting = append_entries_request(u64::MAX - 2, vec![entry(u64::MAX - 1)]);
        assert!(convert_append_entries_input(last_fitting).is_ok());

        assert!(matches!(convert_snapshot_point(1, u64::MAX), Err(RpcHandlerError::Malformed(_))));
        assert_eq!(
            convert_snapshot_point(1, u64::MAX - 1).unwrap(),
            (Term::new(1), Index::new(u64::MAX - 1))
        );
    }

    #[test]
    fn apply_errors_map_to_public_errors() {
        assert!(matches!(
            DoCommandError::from(replica::CommandApplyError::TermChanged),
            DoCommandError::TermChanged
        ));
        assert!(matches!(
            DoCommandError::from(replica::EnqueueForReplicationError::LeaderRedirect(Some(ReplicaId::new("b")))),
            DoCommandError::NotLeader { leader: Some(ref leader) } if leader == "b"
        ));
        assert!(matches!(
            DoCommandError::from(replica::EnqueueForReplicationError::LeaderRedirect(None)),
            DoCommandError::NotLeader { leader: None }
        ));
    }
}
