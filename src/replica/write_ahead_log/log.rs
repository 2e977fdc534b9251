use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::WriteAheadLogEntry;
use std::io;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// The log may start after a snapshot point. Entries at or before `compacted_through` are gone,
/// but the snapshot point's (term, index) is still known so consistency checks can match on it.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last entry covered by the latest snapshot. The retained log starts right after it.
    compacted_through: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Wraps an existing log. `snapshot_point` is the (term, index) of the latest snapshot the
    /// state machine has been restored from, if any. Commit and applied indexes start there.
    pub(crate) fn new(logger: slog::Logger, mut log: L, snapshot_point: Option<(Term, Index)>) -> Result<Self, io::Error> {
        match snapshot_point {
            Some((_, snapshot_index)) => {
                // We may have crashed between persisting a snapshot and compacting the log.
                if log.first_index() <= snapshot_index {
                    log.compact(snapshot_index)?;
                }
                if log.first_index() > snapshot_index.plus(1) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Log starts at {:?} but snapshot only covers through {:?}",
                            log.first_index(),
                            snapshot_index
                        ),
                    ));
                }
            }
            None => {
                if log.first_index() != Index::start_index() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Log starts at {:?} but there is no snapshot", log.first_index()),
                    ));
                }
            }
        }

        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            Some(last_index) if last_index >= log.first_index() => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => return Err(missing_entry(last_index)),
            },
            _ => snapshot_point,
        };
        let snapshot_index = snapshot_point.map(|(_, index)| index);

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            compacted_through: snapshot_point,
            commit_index: snapshot_index,
            last_applied_index: snapshot_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn compacted_through(&self) -> Option<(Term, Index)> {
        self.compacted_through
    }

    /// Lowest index that can still be read from the log.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    pub(crate) fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        self.read(index)?.ok_or_else(|| missing_entry(index))
    }

    /// Term of the entry at `index`, including the compacted snapshot point.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((term, compacted_index)) = self.compacted_through {
            if index == compacted_index {
                return Ok(Some(term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later. Committed entries can't be removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if index <= ci) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to truncate at {:?}, at or before commit index {:?}",
                    index, self.commit_index
                ),
            ));
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader's commit rule. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        Ok(self.commit_to(tentative_new_commit_index))
    }

    /// Advance the commit index, clamped to our own log. Never moves backwards. Returns true if
    /// the commit index moved.
    pub(crate) fn commit_to(&mut self, new_commit_index: Index) -> bool {
        let latest_locally_written_index = match self.latest_index() {
            Some(index) => index,
            None => return false,
        };
        let new_commit_index = std::cmp::min(new_commit_index, latest_locally_written_index);

        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }

        slog::debug!(self.logger, "Commit index {:?} -> {:?}", self.commit_index, new_commit_index);
        self.commit_index.replace(new_commit_index);
        true
    }

    /// Returns the next committed but unapplied entry. Call `mark_applied()` once it's applied.
    pub(crate) fn next_entry_to_apply(&self) -> Result<Option<(Index, WriteAheadLogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(None),
        };
        let next_index = match self.last_applied_index {
            None => Index::start_index(),
            Some(applied) if applied < commit_index => applied.plus(1),
            Some(_) => return Ok(None),
        };

        let entry = self.read_required(next_index)?;
        Ok(Some((next_index, entry)))
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.last_applied_index.replace(index);
    }

    /// Number of applied entries still held in the log; i.e. how much a new snapshot would compact.
    pub(crate) fn num_applied_entries_retained(&self) -> u64 {
        let applied = commitlog::index_or_zero(self.last_applied_index);
        let compacted = commitlog::index_or_zero(self.compacted_through.map(|(_, index)| index));
        applied.saturating_sub(compacted)
    }

    /// Drop the log prefix covered by a local snapshot at (term, index).
    pub(crate) fn compact(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        self.log.compact(index)?;
        self.compacted_through.replace((term, index));
        Ok(())
    }

    /// Reset the log around a snapshot received from the leader. Entries after the snapshot point
    /// are kept only if our log agrees with the leader at the snapshot point.
    pub(crate) fn install_snapshot(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        let keep_suffix = self.term_at(index)? == Some(term);
        if !keep_suffix {
            self.log.truncate(index.plus(1))?;
        }
        self.log.compact(index)?;

        self.compacted_through.replace((term, index));
        if !keep_suffix || matches!(self.latest_entry_metadata, Some((_, latest)) if latest < index) {
            self.latest_entry_metadata.replace((term, index));
        }
        if !matches!(self.commit_index, Some(ci) if ci > index) {
            self.commit_index.replace(index);
        }
        // State machine was restored to exactly `index`.
        self.last_applied_index.replace(index);

        slog::info!(
            self.logger,
            "Installed snapshot at {:?}/{:?}, kept suffix: {}",
            term,
            index,
            keep_suffix
        );
        Ok(())
    }
}

fn missing_entry(index: Index) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Expected log entry at index {:?} but found none", index),
    )
}
