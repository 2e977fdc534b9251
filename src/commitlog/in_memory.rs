use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// Non-durable log, for tests and ephemeral nodes.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        Self::starting_at(Index::start_index())
    }

    /// Creates an empty log whose first append lands at `first_index`.
    pub fn starting_at(first_index: Index) -> Self {
        InMemoryLog {
            log: vec![],
            first_index,
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.log.get(i)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        self.log.truncate(vec_index);
        Ok(())
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        let new_first_index = through.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        let num_to_drop = (new_first_index.as_u64() - self.first_index.as_u64()) as usize;
        if num_to_drop >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(..num_to_drop);
        }
        self.first_index = new_first_index;

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEntry(Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    fn entry(v: u8) -> TestEntry {
        TestEntry(vec![v])
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::create();
        assert_eq!(log.next_index(), Index::new(1));

        for v in 1..=5 {
            assert_eq!(log.append(entry(v)).unwrap(), Index::new(v as u64));
        }
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));
        assert_eq!(log.read(Index::new(6)).unwrap(), None);

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(9)));
    }

    #[test]
    fn compact_keeps_suffix() {
        let mut log = InMemoryLog::create();
        for v in 1..=5 {
            log.append(entry(v)).unwrap();
        }

        log.compact(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));

        // Compacting backwards is a no-op.
        log.compact(Index::new(2)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
    }

    #[test]
    fn compact_past_end_empties_log() {
        let mut log = InMemoryLog::create();
        log.append(entry(1)).unwrap();

        log.compact(Index::new(10)).unwrap();
        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(11));
    }
}
