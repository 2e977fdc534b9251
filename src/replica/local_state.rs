use crate::commitlog::{index_or_zero, Index};
use crate::replica::peers::ReplicaId;
use prost::Message;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fmt;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used for the state Raft requires to be persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. Every
/// method returns only after the new state is durable. An `Err` means the state was NOT mutated.
pub(crate) trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId)
        -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);

    /// Remember how far the log was known to be committed, so a restart can replay up to here
    /// before serving traffic. Only ever moves forward.
    ///
    /// Unlike the other store methods, this one may return before the new value is durable. A
    /// stale commit index only means replaying fewer entries on restart, the leader re-commits the
    /// rest. Call `flush_commit_index()` to force it out.
    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error>;
    fn commit_index(&self) -> Option<Index>;

    fn flush_commit_index(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

#[derive(Clone, PartialEq)]
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    commit_index: Option<Index>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            commit_index: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            Ok(false)
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            Ok(true)
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }

    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error> {
        if self.commit_index.map_or(true, |current| commit_index > current) {
            self.commit_index.replace(commit_index);
        }
        Ok(())
    }

    fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }
}

/// Commit index advances are written out once they get this far ahead of the file.
const COMMIT_INDEX_PERSIST_INTERVAL: u64 = 64;

/// File-backed local state. The whole state is re-written (temp file + rename) on every term or
/// vote mutation. Commit index advances are batched, see `COMMIT_INDEX_PERSIST_INTERVAL`.
///
/// File layout: `[crc32 u32 LE][prost PersistedLocalState]`.
pub(crate) struct FileLocalState {
    path: PathBuf,
    state: VolatileLocalState,
    persisted_commit_index: Option<Index>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct PersistedLocalState {
    #[prost(uint64, tag = "1")]
    term: u64,
    #[prost(string, tag = "2")]
    voted_for: String,
    #[prost(uint64, tag = "3")]
    commit_index: u64,
}

impl FileLocalState {
    pub(crate) fn open(path: impl AsRef<Path>, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();
        let mut state = VolatileLocalState::new(my_replica_id);

        match fs::read(&path) {
            Ok(bytes) => {
                let persisted = decode_checksummed::<PersistedLocalState>(&bytes)?;
                state.current_term = Term::new(persisted.term);
                if !persisted.voted_for.is_empty() {
                    state.voted_for_this_term = Some(Arc::new(ReplicaId::new(persisted.voted_for)));
                }
                state.commit_index = Index::from_u64(persisted.commit_index);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let persisted_commit_index = state.commit_index;
        Ok(FileLocalState {
            path,
            state,
            persisted_commit_index,
        })
    }

    /// Apply `mutation` to a copy of the state, persist the copy if it changed, then swap it in.
    fn mutate<T>(
        &mut self,
        mutation: impl FnOnce(&mut VolatileLocalState) -> Result<T, io::Error>,
    ) -> Result<T, io::Error> {
        let mut next = self.state.clone();
        let output = mutation(&mut next)?;
        if next != self.state {
            self.persist(&next)?;
            self.persisted_commit_index = next.commit_index;
            self.state = next;
        }

        Ok(output)
    }

    fn persist(&self, state: &VolatileLocalState) -> Result<(), io::Error> {
        let persisted = PersistedLocalState {
            term: state.current_term.as_u64(),
            voted_for: state
                .voted_for_this_term
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
            commit_index: index_or_zero(state.commit_index),
        };

        write_checksummed_atomically(&self.path, &persisted)
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        self.mutate(|state| state.store_term_if_increased(new_term))
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        self.mutate(|state| state.store_vote_for_term_if_unvoted(expected_term, vote))
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.mutate(|state| state.increment_term_and_vote_for_self())
    }

    fn current_term(&self) -> Term {
        self.state.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.state.voted_for_current_term()
    }

    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error> {
        self.state.store_commit_index(commit_index)?;
        let unpersisted =
            index_or_zero(self.state.commit_index).saturating_sub(index_or_zero(self.persisted_commit_index));
        if unpersisted >= COMMIT_INDEX_PERSIST_INTERVAL {
            self.flush_commit_index()?;
        }

        Ok(())
    }

    fn commit_index(&self) -> Option<Index> {
        self.state.commit_index()
    }

    fn flush_commit_index(&mut self) -> Result<(), io::Error> {
        if self.state.commit_index == self.persisted_commit_index {
            return Ok(());
        }
        self.persist(&self.state)?;
        self.persisted_commit_index = self.state.commit_index;

        Ok(())
    }
}

/// Writes `[crc32][message]` to a temp file, fsyncs it, and renames it over `path`.
pub(crate) fn write_checksummed_atomically<M: Message>(path: &Path, message: &M) -> Result<(), io::Error> {
    let mut payload = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut payload)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    file.write_all(&payload)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
}

pub(crate) fn decode_checksummed<M: Message + Default>(bytes: &[u8]) -> Result<M, io::Error> {
    if bytes.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "File too short"));
    }

    let (crc_bytes, payload) = bytes.split_at(4);
    let mut stored_crc = [0u8; 4];
    stored_crc.copy_from_slice(crc_bytes);
    if crc32fast::hash(payload) != u32::from_le_bytes(stored_crc) {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Checksum mismatch"));
    }

    M::decode(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
