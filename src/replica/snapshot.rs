use crate::commitlog::Index;
use crate::replica::local_state::{decode_checksummed, write_checksummed_atomically};
use crate::replica::{ReplicaId, Term};
use std::fs;
use std::io;
use std::path::PathBuf;

const SNAPSHOT_FILE_EXTENSION: &str = "ss";

/// A point-in-time image of the state machine, replacing the log through `last_index`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) last_term: Term,
    pub(crate) last_index: Index,
    pub(crate) members: Vec<ReplicaId>,
    pub(crate) state: Vec<u8>,
}

impl Snapshot {
    pub(crate) fn point(&self) -> (Term, Index) {
        (self.last_term, self.last_index)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct PersistedSnapshot {
    #[prost(uint64, tag = "1")]
    last_term: u64,
    #[prost(uint64, tag = "2")]
    last_index: u64,
    #[prost(string, repeated, tag = "3")]
    members: Vec<String>,
    #[prost(bytes, tag = "4")]
    state: Vec<u8>,
}

/// SnapshotStore holds the latest snapshot, and persists it as `{term}_{index}.ss` files in a
/// directory when one is configured. Only the latest snapshot file is kept.
pub(crate) struct SnapshotStore {
    logger: slog::Logger,
    directory: Option<PathBuf>,
    latest: Option<Snapshot>,
}

impl SnapshotStore {
    pub(crate) fn in_memory(logger: slog::Logger) -> Self {
        SnapshotStore {
            logger,
            directory: None,
            latest: None,
        }
    }

    /// Opens (creating if needed) a snapshot directory and loads the newest intact snapshot.
    pub(crate) fn open(logger: slog::Logger, directory: PathBuf) -> Result<Self, io::Error> {
        fs::create_dir_all(&directory)?;

        let mut candidates = Vec::new();
        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_FILE_EXTENSION) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(parse_snapshot_file_stem)
            {
                candidates.push((index, path));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut latest = None;
        for (_, path) in candidates {
            match fs::read(&path).and_then(|bytes| decode_checksummed::<PersistedSnapshot>(&bytes)) {
                Ok(persisted) => match Snapshot::try_from_persisted(persisted) {
                    Some(snapshot) => {
                        latest = Some(snapshot);
                        break;
                    }
                    None => slog::warn!(logger, "Snapshot file {:?} has no index. Skipping it.", path),
                },
                Err(e) => slog::warn!(logger, "Skipping unreadable snapshot file {:?}: {:?}", path, e),
            }
        }

        if let Some(snapshot) = &latest {
            slog::info!(
                logger,
                "Loaded snapshot at {:?}/{:?} with members {:?}",
                snapshot.last_term,
                snapshot.last_index,
                snapshot.members
            );
        }

        Ok(SnapshotStore {
            logger,
            directory: Some(directory),
            latest,
        })
    }

    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub(crate) fn latest_point(&self) -> Option<(Term, Index)> {
        self.latest.as_ref().map(Snapshot::point)
    }

    pub(crate) fn save(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        if let Some(directory) = &self.directory {
            let file_name = format!(
                "{}_{}.{}",
                snapshot.last_term.as_u64(),
                snapshot.last_index.as_u64(),
                SNAPSHOT_FILE_EXTENSION
            );
            let path = directory.join(file_name);
            write_checksummed_atomically(&path, &PersistedSnapshot::from(&snapshot))?;
            self.remove_older_than(&path);
        }

        self.latest.replace(snapshot);
        Ok(())
    }

    fn remove_older_than(&self, keep: &PathBuf) {
        let directory = match &self.directory {
            Some(d) => d,
            None => return,
        };
        let dir_entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                slog::warn!(self.logger, "Failed to list snapshot directory: {:?}", e);
                return;
            }
        };

        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            let is_snapshot = path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_FILE_EXTENSION);
            if is_snapshot && &path != keep {
                if let Err(e) = fs::remove_file(&path) {
                    slog::warn!(self.logger, "Failed to remove old snapshot {:?}: {:?}", path, e);
                }
            }
        }
    }
}

/// `{term}_{index}` -> index
fn parse_snapshot_file_stem(stem: &str) -> Option<u64> {
    let mut parts = stem.splitn(2, '_');
    let _term: u64 = parts.next()?.parse().ok()?;
    parts.next()?.parse().ok()
}

// ------- Conversions --------

impl From<&Snapshot> for PersistedSnapshot {
    fn from(snapshot: &Snapshot) -> Self {
        PersistedSnapshot {
            last_term: snapshot.last_term.as_u64(),
            last_index: snapshot.last_index.as_u64(),
            members: snapshot.members.iter().map(|m| m.as_str().to_string()).collect(),
            state: snapshot.state.clone(),
        }
    }
}

impl Snapshot {
    fn try_from_persisted(persisted: PersistedSnapshot) -> Option<Self> {
        Some(Snapshot {
            last_term: Term::new(persisted.last_term),
            last_index: Index::from_u64(persisted.last_index)?,
            members: persisted.members.into_iter().map(ReplicaId::new).collect(),
            state: persisted.state,
        })
    }
}
