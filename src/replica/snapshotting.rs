use crate::api::StateMachine;
use crate::commitlog::{Index, Log};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::ReplicaId;
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    SnapshotError, SnapshotInput, SnapshotOutput, SnapshotRecoveryError, SnapshotRecoveryInput,
    SnapshotRecoveryOutput, TakeSnapshotError, TakeSnapshotOutput, TermOutOfDateInfo,
};
use crate::replica::snapshot::Snapshot;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use std::io;

impl<L, S, M> Replica<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub(crate) fn handle_take_snapshot(&mut self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        if self.election_state.is_stopped() {
            return Err(TakeSnapshotError::Stopped);
        }

        self.take_snapshot()
    }

    pub(super) fn take_snapshot_if_log_is_large(&mut self) {
        if self.election_state.is_stopped() {
            return;
        }
        let num_retained = self.write_ahead_log.num_applied_entries_retained();
        if num_retained <= self.snapshot_threshold {
            return;
        }

        slog::info!(self.logger, "{} applied entries in log, taking snapshot", num_retained);
        if let Err(e) = self.take_snapshot() {
            slog::warn!(self.logger, "Failed to take snapshot: {}", e);
        }
    }

    /// Snapshot the state machine at the last applied entry, then drop the log up to it.
    fn take_snapshot(&mut self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        let last_applied_index = self
            .write_ahead_log
            .last_applied_index()
            .ok_or(TakeSnapshotError::NothingToSnapshot)?;
        if matches!(self.write_ahead_log.compacted_through(), Some((_, ci)) if ci >= last_applied_index) {
            return Err(TakeSnapshotError::NothingToSnapshot);
        }

        let last_applied_term = match self.write_ahead_log.term_at(last_applied_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                let e = io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Applied entry {:?} is missing from log", last_applied_index),
                );
                return Err(TakeSnapshotError::LocalIoError(self.fatal_io_error("reading applied entry", e)));
            }
            Err(e) => return Err(TakeSnapshotError::LocalIoError(self.fatal_io_error("reading applied entry", e))),
        };

        let state = self.state_machine.save().map_err(TakeSnapshotError::StateMachine)?;
        // Membership always reflects exactly the applied entries.
        let snapshot = Snapshot {
            last_term: last_applied_term,
            last_index: last_applied_index,
            members: self.cluster_tracker.members(),
            state,
        };

        let saved = self.snapshot_store.save(snapshot);
        saved.map_err(|e| TakeSnapshotError::LocalIoError(self.fatal_io_error("saving snapshot", e)))?;
        let compacted = self.write_ahead_log.compact(last_applied_term, last_applied_index);
        compacted.map_err(|e| TakeSnapshotError::LocalIoError(self.fatal_io_error("compacting log", e)))?;
        let flushed = self.local_state.flush_commit_index();
        flushed.map_err(|e| TakeSnapshotError::LocalIoError(self.fatal_io_error("persisting commit index", e)))?;

        slog::info!(
            self.logger,
            "Took snapshot at {:?}/{:?}. Log now starts at {:?}",
            last_applied_term,
            last_applied_index,
            self.write_ahead_log.first_index()
        );
        Ok(TakeSnapshotOutput {
            last_entry: (last_applied_term, last_applied_index),
        })
    }

    /// Leader announces a snapshot because what we need next is no longer in its log. We only want
    /// the full state if we don't already have the snapshot's last entry.
    pub(crate) fn server_handle_snapshot(&mut self, input: SnapshotInput) -> Result<SnapshotOutput, SnapshotError> {
        if self.election_state.is_stopped() {
            return Err(SnapshotError::Stopped);
        }

        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(SnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        let increased = self
            .local_state
            .store_term_if_increased(input.leader_term)
            .map_err(|e| SnapshotError::LocalIoError(self.fatal_io_error("storing term", e)))?;
        if increased {
            self.step_down(Some(input.leader_id.clone()));
        } else if self.is_leader_of_current_term(&input.leader_id) {
            return Err(SnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        let (last_term, last_index) = input.last_entry;
        let already_have_it = self
            .holds_entry(last_term, last_index)
            .map_err(|e| SnapshotError::LocalIoError(self.fatal_io_error("reading log", e)))?;

        if already_have_it {
            slog::info!(
                self.logger,
                "Already have snapshot point {:?}/{:?}, declining snapshot",
                last_term,
                last_index
            );
            self.follow_after_snapshot(&input.leader_id);
        } else {
            slog::info!(
                self.logger,
                "Accepting snapshot at {:?}/{:?} from {:?}",
                last_term,
                last_index,
                input.leader_id
            );
            self.election_state.transition_to_snapshotting(input.leader_id);
        }

        Ok(SnapshotOutput {
            current_term: input.leader_term,
            accept: !already_have_it,
        })
    }

    /// We won this term, so anyone else claiming to lead it is wrong. Never hand it our log.
    fn is_leader_of_current_term(&self, claimed_leader: &ReplicaId) -> bool {
        if self.election_state.current_state() != ElectionStateSnapshot::Leader {
            return false;
        }
        slog::crit!(
            self.logger,
            "Wtf! {:?} sent a snapshot claiming to be leader for my term {:?}",
            claimed_leader,
            self.local_state.current_term()
        );
        true
    }

    /// True if our log (or our own snapshot) already covers the entry at (term, index).
    fn holds_entry(&self, term: Term, index: Index) -> Result<bool, io::Error> {
        if let Some((_, compacted_index)) = self.write_ahead_log.compacted_through() {
            if index < compacted_index {
                // Our snapshot is newer. Everything before it is committed, so it must match.
                return Ok(true);
            }
        }

        Ok(self.write_ahead_log.term_at(index)? == Some(term))
    }

    /// Replace our state machine and log with the leader's snapshot.
    pub(crate) fn server_handle_snapshot_recovery(
        &mut self,
        input: SnapshotRecoveryInput,
    ) -> Result<SnapshotRecoveryOutput, SnapshotRecoveryError> {
        if self.election_state.is_stopped() {
            return Err(SnapshotRecoveryError::Stopped);
        }

        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(SnapshotRecoveryError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }
        let increased = self
            .local_state
            .store_term_if_increased(input.leader_term)
            .map_err(|e| SnapshotRecoveryError::LocalIoError(self.fatal_io_error("storing term", e)))?;
        if increased {
            self.step_down(Some(input.leader_id.clone()));
        } else if self.is_leader_of_current_term(&input.leader_id) {
            return Err(SnapshotRecoveryError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }
        self.election_state.reset_timeout_if_follower();

        let (last_term, last_index) = input.last_entry;
        let already_applied = matches!(self.write_ahead_log.last_applied_index(), Some(applied) if applied >= last_index)
            && self
                .holds_entry(last_term, last_index)
                .map_err(|e| SnapshotRecoveryError::LocalIoError(self.fatal_io_error("reading log", e)))?;
        if already_applied {
            slog::info!(self.logger, "Already applied through {:?}, skipping snapshot recovery", last_index);
            self.follow_after_snapshot(&input.leader_id);
            return Ok(SnapshotRecoveryOutput {
                current_term: input.leader_term,
            });
        }

        if let Err(e) = self.state_machine.recovery(&input.state) {
            self.halt(&format!("State machine failed to recover from snapshot: {}", e));
            return Err(SnapshotRecoveryError::RecoveryFailed(e));
        }
        self.cluster_tracker.replace_members(input.members.iter().cloned());

        let snapshot = Snapshot {
            last_term,
            last_index,
            members: input.members,
            state: input.state,
        };
        let saved = self.snapshot_store.save(snapshot);
        saved.map_err(|e| SnapshotRecoveryError::LocalIoError(self.fatal_io_error("saving snapshot", e)))?;
        let installed = self.write_ahead_log.install_snapshot(last_term, last_index);
        installed.map_err(|e| SnapshotRecoveryError::LocalIoError(self.fatal_io_error("installing snapshot", e)))?;

        self.follow_after_snapshot(&input.leader_id);
        // We may have kept committed entries after the snapshot point.
        self.on_commit_index_advanced();
        if self.election_state.is_stopped() {
            return Err(SnapshotRecoveryError::Stopped);
        }

        Ok(SnapshotRecoveryOutput {
            current_term: input.leader_term,
        })
    }

    fn follow_after_snapshot(&mut self, leader_id: &ReplicaId) {
        match self.election_state.current_state() {
            ElectionStateSnapshot::Snapshotting => self.election_state.finish_snapshotting(),
            ElectionStateSnapshot::Candidate => self.step_down(Some(leader_id.clone())),
            _ => self.election_state.set_leader_if_unknown(leader_id),
        }
        self.election_state.reset_timeout_if_follower();
    }
}
