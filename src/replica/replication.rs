use crate::api::StateMachine;
use crate::commitlog::{Index, Log};
use crate::replica::election::{CurrentLeader, ElectionStateSnapshot, SnapshotInstall};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, LogStateInfo, PeerNextStep,
    PeerReplyInput, PeerReplyResult, PeerRequestDescriptor, PeerRequestInput, PeerRequestKind, PeerRequestOutput,
    PeerTaskError, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use std::{cmp, io};

impl<L, S, M> Replica<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        if self.election_state.is_stopped() {
            return Err(AppendEntriesError::Stopped);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.leader_term)
            .map_err(|e| AppendEntriesError::ServerIoError(self.fatal_io_error("storing term", e)))?;
        if increased {
            self.step_down(Some(input.leader_id.clone()));
        } else {
            match self.election_state.current_state() {
                ElectionStateSnapshot::Leader => {
                    slog::crit!(
                        self.logger,
                        "Wtf! {:?} claims to be leader for my term {:?}",
                        input.leader_id,
                        current_term
                    );
                    return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                        current_term,
                    }));
                }
                // > If AppendEntries RPC received from new leader: convert to follower
                ElectionStateSnapshot::Candidate => self.step_down(Some(input.leader_id.clone())),
                // Back to normal replication after a snapshot install.
                ElectionStateSnapshot::Snapshotting => self.election_state.finish_snapshotting(),
                _ => self.election_state.set_leader_if_unknown(&input.leader_id),
            }
        }

        // Reset follower timeout.
        self.election_state.reset_timeout_if_follower();

        // Anything at or before our snapshot point is committed, so it matches by definition.
        let compacted_index = self.write_ahead_log.compacted_through().map(|(_, index)| index);
        let is_compacted = |index: Index| matches!(compacted_index, Some(ci) if index <= ci);

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            if !is_compacted(leader_prev_entry_index) {
                match self.write_ahead_log.term_at(leader_prev_entry_index) {
                    Ok(Some(term)) if term == leader_prev_entry_term => {}
                    Ok(_) => return Err(AppendEntriesError::ServerMissingPreviousLogEntry(self.log_state_info())),
                    Err(e) => {
                        return Err(AppendEntriesError::ServerIoError(
                            self.fatal_io_error("reading previous entry", e),
                        ))
                    }
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        for new_entry in input.new_entries {
            let this_entry_index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);
            if is_compacted(this_entry_index) {
                continue;
            }

            let opt_existing_term = self
                .write_ahead_log
                .term_at(this_entry_index)
                .map_err(|e| AppendEntriesError::ServerIoError(self.fatal_io_error("reading entry", e)))?;

            // 3. (if...)
            if let Some(existing_term) = opt_existing_term {
                if existing_term == new_entry.term {
                    // 4. (no-op)
                    continue;
                }

                if matches!(self.write_ahead_log.commit_index(), Some(ci) if this_entry_index <= ci) {
                    slog::crit!(
                        self.logger,
                        "Leader {:?} sent entry {:?} from term {:?} that conflicts with my committed entry from term {:?}",
                        input.leader_id,
                        this_entry_index,
                        new_entry.term,
                        existing_term,
                    );
                    return Err(AppendEntriesError::ConflictsWithCommitted(self.log_state_info()));
                }

                // 3. (delete)
                let truncated = self.write_ahead_log.truncate(this_entry_index);
                truncated.map_err(|e| AppendEntriesError::ServerIoError(self.fatal_io_error("truncating log", e)))?;
                self.pending_commands.fail_from(this_entry_index);
            }

            // 4. (append)
            let appended = self.write_ahead_log.append(WriteAheadLogEntry {
                term: new_entry.term,
                command_name: new_entry.command_name,
                command: new_entry.command,
            });
            let appended_index =
                appended.map_err(|e| AppendEntriesError::ServerIoError(self.fatal_io_error("appending to log", e)))?;
            assert_eq!(
                appended_index, this_entry_index,
                "Appended log entry to unexpected index."
            );
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            let new_commit_index = cmp::min(leader_commit_index, index_of_last_new_entry);
            if self.write_ahead_log.commit_to(new_commit_index) {
                self.on_commit_index_advanced();
            }
        }

        if self.election_state.is_stopped() {
            return Err(AppendEntriesError::Stopped);
        }

        Ok(AppendEntriesOutput {
            current_term: self.local_state.current_term(),
            last_log_index: self.write_ahead_log.latest_index(),
            commit_index: self.write_ahead_log.commit_index(),
        })
    }

    fn log_state_info(&self) -> LogStateInfo {
        LogStateInfo {
            current_term: self.local_state.current_term(),
            last_log_index: self.write_ahead_log.latest_index(),
            commit_index: self.write_ahead_log.commit_index(),
        }
    }

    /// A peer's replication task asks what to send next.
    pub(crate) fn handle_peer_request(&mut self, input: PeerRequestInput) -> Result<PeerRequestOutput, PeerTaskError> {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            return Err(PeerTaskError::NoLongerLeader(input.term));
        }

        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(PeerTaskError::NoLongerLeader(input.term))?;
        let peer_state = leader_state
            .peer_state_mut(&input.peer_id)
            .ok_or_else(|| PeerTaskError::UnknownPeer(input.peer_id.clone()))?;

        let latest_snapshot = self.snapshot_store.latest();
        let (request, kind) = match (peer_state.snapshot_install(), latest_snapshot) {
            (Some(SnapshotInstall::Accepted(point)), Some(snapshot)) if snapshot.point() == point => {
                request_builder::snapshot_recovery(current_term, &self.my_replica_id, snapshot)
            }
            _ => {
                let (next_index, _) = peer_state.next_and_previous_log_index();
                if next_index < self.write_ahead_log.first_index() {
                    // What the peer needs next has been compacted away. Announce our snapshot.
                    let snapshot = latest_snapshot.ok_or_else(|| {
                        PeerTaskError::LocalIoError(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "Wtf! Log is compacted but there's no snapshot",
                        ))
                    })?;
                    peer_state.set_snapshot_install(Some(SnapshotInstall::Announced(snapshot.point())));
                    request_builder::snapshot(current_term, &self.my_replica_id, snapshot.point())
                } else {
                    peer_state.set_snapshot_install(None);
                    request_builder::append_entries(
                        current_term,
                        &self.my_replica_id,
                        peer_state.next_and_previous_log_index(),
                        &self.write_ahead_log,
                        self.max_entries_per_request,
                    )
                    .map_err(PeerTaskError::LocalIoError)?
                }
            }
        };

        Ok(PeerRequestOutput {
            request,
            descriptor: PeerRequestDescriptor {
                peer_id: input.peer_id,
                term: current_term,
                seq_no: peer_state.next_seq_no(),
                kind,
            },
        })
    }

    /// A peer's replication task reports how its request went.
    pub(crate) fn handle_peer_reply(&mut self, reply: PeerReplyInput) -> Result<PeerNextStep, PeerTaskError> {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "Reply from peer: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term || self.election_state.current_leader() != CurrentLeader::Me {
            slog::info!(
                logger,
                "Received reply for term {:?}, but we're on term {:?} and not its leader",
                reply.descriptor.term,
                current_term
            );
            return Err(PeerTaskError::NoLongerLeader(reply.descriptor.term));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if let Some(peer_term) = reply_term(&reply.result) {
            if peer_term > current_term {
                let increased = self
                    .local_state
                    .store_term_if_increased(peer_term)
                    .map_err(|e| PeerTaskError::LocalIoError(self.fatal_io_error("storing term", e)))?;
                if increased {
                    slog::warn!(logger, "Peer has newer term {:?}. Stepping down.", peer_term);
                    self.step_down(None);
                }
                return Err(PeerTaskError::NoLongerLeader(current_term));
            }
        }

        let latest_index = self.write_ahead_log.latest_index();
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(PeerTaskError::NoLongerLeader(current_term))?;
        let peer_state = leader_state
            .peer_state_mut(&reply.descriptor.peer_id)
            .ok_or_else(|| PeerTaskError::UnknownPeer(reply.descriptor.peer_id.clone()))?;

        if !peer_state.ratchet_fwd_received_seq_no(reply.descriptor.seq_no) {
            slog::warn!(logger, "Dropping stale reply");
            return Ok(PeerNextStep::AwaitHeartbeat);
        }

        let mut made_progress = false;
        let mut matched_may_have_moved = false;
        match (reply.descriptor.kind, reply.result) {
            (
                PeerRequestKind::AppendEntries {
                    previous_log_entry_index,
                    num_log_entries,
                },
                PeerReplyResult::AppendEntries(Ok(response)),
            ) => {
                peer_state.mark_contacted();
                if response.success {
                    peer_state.update_log(previous_log_entry_index, num_log_entries);
                    matched_may_have_moved = true;
                } else {
                    slog::info!(logger, "Peer is missing previous log entry");
                    peer_state.rewind_log(&logger, Index::from_u64(response.last_log_index));
                }
                made_progress = true;
            }
            (PeerRequestKind::Snapshot { last_entry }, PeerReplyResult::Snapshot(Ok(response))) => {
                peer_state.mark_contacted();
                if response.accept {
                    peer_state.set_snapshot_install(Some(SnapshotInstall::Accepted(last_entry)));
                } else {
                    // Peer already holds the snapshot point. Resume regular replication after it.
                    peer_state.set_snapshot_install(None);
                    peer_state.ratchet_fwd_matched(last_entry.1);
                    matched_may_have_moved = true;
                }
                made_progress = true;
            }
            (PeerRequestKind::SnapshotRecovery { last_entry }, PeerReplyResult::SnapshotRecovery(Ok(response))) => {
                peer_state.mark_contacted();
                peer_state.set_snapshot_install(None);
                if response.success {
                    slog::info!(logger, "Peer installed snapshot at {:?}", last_entry);
                    peer_state.ratchet_fwd_matched(last_entry.1);
                    matched_may_have_moved = true;
                    made_progress = true;
                } else {
                    slog::warn!(logger, "Peer failed to install snapshot at {:?}", last_entry);
                }
            }
            (_, PeerReplyResult::AppendEntries(Err(message))) => {
                slog::warn!(logger, "AppendEntries failure: {}", message);
            }
            (_, PeerReplyResult::Snapshot(Err(message))) | (_, PeerReplyResult::SnapshotRecovery(Err(message))) => {
                slog::warn!(logger, "Snapshot install failure: {}", message);
                // Start the install over with whatever our latest snapshot is by then.
                peer_state.set_snapshot_install(None);
            }
            (kind, result) => {
                slog::error!(logger, "Wtf! Reply {:?} doesn't match request {:?}", result, kind);
            }
        }

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        // Failures wait for the heartbeat so we don't hammer an unreachable peer.
        let (next_index, _) = peer_state.next_and_previous_log_index();
        let has_more_to_send = peer_state.snapshot_install().is_some()
            || matches!(latest_index, Some(latest_index) if latest_index >= next_index);
        let next_step = if made_progress && has_more_to_send {
            PeerNextStep::SendImmediately
        } else {
            PeerNextStep::AwaitHeartbeat
        };

        if matched_may_have_moved {
            self.advance_leader_commit_index();
        }

        Ok(next_step)
    }
}

fn reply_term(result: &PeerReplyResult) -> Option<Term> {
    let term = match result {
        PeerReplyResult::AppendEntries(Ok(response)) => response.term,
        PeerReplyResult::Snapshot(Ok(response)) => response.term,
        PeerReplyResult::SnapshotRecovery(Ok(response)) => response.term,
        _ => return None,
    };
    Some(Term::new(term))
}

mod request_builder {
    use crate::api::rpc;
    use crate::commitlog::{index_or_zero, Index, Log};
    use crate::replica::replica_api::{OutboundPeerRequest, PeerRequestKind};
    use crate::replica::snapshot::Snapshot;
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{ReplicaId, Term};
    use std::io;

    pub(super) fn append_entries<L>(
        current_term: Term,
        my_id: &ReplicaId,
        (next_index, opt_previous_index): (Index, Option<Index>),
        write_ahead_log: &WriteAheadLog<L>,
        max_entries_per_request: usize,
    ) -> Result<(OutboundPeerRequest, PeerRequestKind), io::Error>
    where
        L: Log<WriteAheadLogEntry>,
    {
        let previous_log_entry_term = match opt_previous_index {
            None => 0,
            Some(previous_index) => match write_ahead_log.term_at(previous_index)? {
                Some(term) => term.as_u64(),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Wtf! Tracking peer at {:?}, but entry is missing from log", previous_index),
                    ))
                }
            },
        };

        let mut new_entries = Vec::new();
        if let Some(latest_index) = write_ahead_log.latest_index() {
            let mut index = next_index;
            while index <= latest_index && new_entries.len() < max_entries_per_request {
                let entry = write_ahead_log.read_required(index)?;
                new_entries.push(rpc::LogEntry {
                    index: index.as_u64(),
                    term: entry.term.as_u64(),
                    command_name: entry.command_name,
                    command: entry.command.to_vec(),
                });
                index = index.plus(1);
            }
        }

        let kind = PeerRequestKind::AppendEntries {
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };
        let request = rpc::AppendEntriesRequest {
            term: current_term.as_u64(),
            leader_name: my_id.as_str().to_string(),
            prev_log_index: index_or_zero(opt_previous_index),
            prev_log_term: previous_log_entry_term,
            commit_index: index_or_zero(write_ahead_log.commit_index()),
            entries: new_entries,
        };

        Ok((OutboundPeerRequest::AppendEntries(request), kind))
    }

    pub(super) fn snapshot(
        current_term: Term,
        my_id: &ReplicaId,
        (last_term, last_index): (Term, Index),
    ) -> (OutboundPeerRequest, PeerRequestKind) {
        let request = rpc::SnapshotRequest {
            term: current_term.as_u64(),
            leader_name: my_id.as_str().to_string(),
            last_index: last_index.as_u64(),
            last_term: last_term.as_u64(),
        };

        (
            OutboundPeerRequest::Snapshot(request),
            PeerRequestKind::Snapshot {
                last_entry: (last_term, last_index),
            },
        )
    }

    pub(super) fn snapshot_recovery(
        current_term: Term,
        my_id: &ReplicaId,
        snapshot: &Snapshot,
    ) -> (OutboundPeerRequest, PeerRequestKind) {
        let request = rpc::SnapshotRecoveryRequest {
            term: current_term.as_u64(),
            leader_name: my_id.as_str().to_string(),
            last_index: snapshot.last_index.as_u64(),
            last_term: snapshot.last_term.as_u64(),
            members: snapshot.members.iter().map(|m| m.as_str().to_string()).collect(),
            state: snapshot.state.clone(),
        };

        (
            OutboundPeerRequest::SnapshotRecovery(request),
            PeerRequestKind::SnapshotRecovery {
                last_entry: snapshot.point(),
            },
        )
    }
}
