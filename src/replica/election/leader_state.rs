use crate::commitlog::{index_or_zero, Index};
use crate::replica::election::peer_task::PeerTaskHandle;
use crate::replica::{ReplicaId, Term};
use chrono::{DateTime, Utc};
use std::cmp;
use std::collections::HashMap;

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = (&ReplicaId, &PeerState)> {
        self.peer_state.iter()
    }

    pub(super) fn contains_peer(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(super) fn insert_peer(&mut self, peer_id: ReplicaId, peer_state: PeerState) {
        self.peer_state.insert(peer_id, peer_state);
    }

    pub(super) fn remove_peer(&mut self, peer_id: &ReplicaId) -> bool {
        self.peer_state.remove(peer_id).is_some()
    }

    /// Wake every replication task, e.g. after appending a new entry.
    pub(crate) fn trigger_all(&self) {
        for peer_state in self.peer_state.values() {
            peer_state.task.trigger();
        }
    }
}

pub(crate) struct PeerState {
    // Dropping this stops replication to the peer.
    task: PeerTaskHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    // After initial reconciliation of follower logs, this will converge
    // to always be the same as `next - 1`.
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    last_contact: Option<DateTime<Utc>>,
    snapshot_install: Option<SnapshotInstall>,
}

/// Progress of installing a snapshot on a peer whose next entry has already been compacted away.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum SnapshotInstall {
    /// Snapshot request sent, waiting to hear if the peer wants the state.
    Announced((Term, Index)),
    /// Peer wants the state. Next request is SnapshotRecovery.
    Accepted((Term, Index)),
}

impl PeerState {
    pub(super) fn new(task: PeerTaskHandle, previous_log_entry_index: Option<Index>) -> Self {
        PeerState {
            task,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            last_contact: None,
            snapshot_install: None,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn last_contact(&self) -> Option<DateTime<Utc>> {
        self.last_contact
    }

    pub(crate) fn snapshot_install(&self) -> Option<SnapshotInstall> {
        self.snapshot_install
    }

    pub(crate) fn set_snapshot_install(&mut self, snapshot_install: Option<SnapshotInstall>) {
        self.snapshot_install = snapshot_install;
    }

    pub(crate) fn mark_contacted(&mut self) {
        self.last_contact.replace(Utc::now());
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated. A false return means the reply is stale and must be
    /// ignored.
    pub(crate) fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    /// Peer accepted `num_entries_replicated` entries following `previous_log_entry`.
    pub(crate) fn update_log(&mut self, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            (None, 0) => return,
            (Some(prev), 0) => prev,
            (None, n) => Index::new_usize(n),
            (Some(prev), n) => prev.plus(n as u64),
        };
        self.ratchet_fwd_matched(new_matched);
    }

    /// Peer's log is known to contain everything through `index` (e.g. a snapshot it installed).
    pub(crate) fn ratchet_fwd_matched(&mut self, index: Index) {
        if matches!(self.matched, Some(matched) if matched >= index) {
            return;
        }
        self.matched.replace(index);
        self.next = cmp::max(self.next, index.plus(1));
    }

    /// Peer rejected AppendEntries because it doesn't have our previous entry. It told us how
    /// long its log is, so skip straight there instead of stepping back one entry at a time.
    pub(crate) fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        let stepped_back = match self.next.checked_minus(1) {
            Some(new) => new,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };
        // A hint past the end of u64 is garbage. Just step back.
        self.next = match peer_last_log_index {
            None => Index::start_index(),
            Some(i) => i.checked_plus(1).map_or(stepped_back, |hinted| cmp::min(stepped_back, hinted)),
        };

        // Don't panic here, because peer could return garbage data (or lost its disk).
        if matches!(self.matched, Some(matched) if matched >= self.next) {
            slog::warn!(
                logger,
                "Peer rejected entries at or before its matched index {}. Resetting matched.",
                index_or_zero(self.matched)
            );
            self.matched = self.next.checked_minus(1);
        }
    }
}
