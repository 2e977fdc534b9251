use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    /// Wire and file formats use 0 to mean "no index".
    pub fn from_u64(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Index::new(index))
        }
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_plus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_add(delta).map(Index::new)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Index::from_u64)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Converts an optional index into its 0-means-none representation.
pub fn index_or_zero(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. A log may
/// have its prefix compacted away, after which the first readable entry is `first_index()`.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry. The entry is durable
    /// (for durable impls) once this returns.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for indexes outside of the retained window.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes anything up to and including `through`. If `through` is past the end of the log,
    /// the log becomes empty and the next append will land at `through + 1`.
    fn compact(&mut self, through: Index) -> Result<(), io::Error>;

    /// first_index returns the lowest index still retained in the log. If the log is empty, this
    /// is the same as `next_index()`.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> {}
