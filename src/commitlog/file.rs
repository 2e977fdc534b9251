use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"RFTL";
const FORMAT_VERSION: u8 = 1;

/// Header layout:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+
/// |     Magic     |Vrs|    First index (8 bytes LE)   |
/// +---------------+---+-------------------------------+
/// ```
const HEADER_LEN: usize = 4 + 1 + 8;

/// Record layout: `[len u32 LE][crc32 u32 LE][payload; len]`. The crc covers only the payload.
const RECORD_PREFIX_LEN: usize = 4 + 4;

/// FileLog is a durable single-file log. Every append is fsync'd before it's acknowledged.
///
/// The whole retained window is cached in memory, so reads never touch disk. Compaction rewrites
/// the file with a new header and renames it over the old one.
pub struct FileLog<E: Entry> {
    logger: slog::Logger,
    path: PathBuf,
    file: File,
    first_index: Index,
    records: Vec<Record>,
    end_offset: u64,
    _pd: PhantomData<E>,
}

struct Record {
    offset: u64,
    payload: Vec<u8>,
}

impl<E: Entry> FileLog<E> {
    /// Opens the log at `path`, creating it if missing. A new log starts at `first_index`; an
    /// existing log keeps the first index from its header.
    ///
    /// A torn or corrupt tail record (e.g. a crash mid-append) is discarded.
    pub fn open(logger: slog::Logger, path: impl AsRef<Path>, first_index: Index) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();
        let existing = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        if existing.len() < HEADER_LEN {
            if !existing.is_empty() {
                slog::warn!(logger, "Log file {:?} has a torn header. Re-initializing it.", path);
            }
            let file = write_new_file(&path, first_index, &[])?;
            return Ok(FileLog {
                logger,
                path,
                file,
                first_index,
                records: Vec::new(),
                end_offset: HEADER_LEN as u64,
                _pd: PhantomData::default(),
            });
        }

        let header_first_index = parse_header(&existing)?;
        let (records, valid_len) = parse_records(&existing);

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if valid_len < existing.len() {
            slog::warn!(
                logger,
                "Discarding {} trailing bytes of partial or corrupt log record in {:?}",
                existing.len() - valid_len,
                path
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        slog::info!(
            logger,
            "Opened log {:?} with {} entries starting at {:?}",
            path,
            records.len(),
            header_first_index
        );

        Ok(FileLog {
            logger,
            path,
            file,
            first_index: header_first_index,
            records,
            end_offset: valid_len as u64,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        let payload: Vec<u8> = entry.into();
        let record = encode_record(&payload)?;

        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&record)?;
        self.file.sync_data()?;

        self.records.push(Record {
            offset: self.end_offset,
            payload,
        });
        self.end_offset += record.len() as u64;

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.records.get(i)) {
            Some(record) => E::try_from(record.payload.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        let new_end_offset = match self.records.get(vec_index) {
            Some(record) => record.offset,
            None => return Ok(()),
        };

        self.file.set_len(new_end_offset)?;
        self.file.sync_data()?;

        self.records.truncate(vec_index);
        self.end_offset = new_end_offset;

        Ok(())
    }

    fn compact(&mut self, through: Index) -> Result<(), io::Error> {
        let new_first_index = through.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        let num_to_drop = (new_first_index.as_u64() - self.first_index.as_u64()) as usize;
        let kept: Vec<Vec<u8>> = self
            .records
            .iter()
            .skip(num_to_drop)
            .map(|record| record.payload.clone())
            .collect();

        let tmp_path = self.path.with_extension("compacting");
        write_new_file(&tmp_path, new_first_index, &kept)?;
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        let mut offset = HEADER_LEN as u64;
        let mut records = Vec::with_capacity(kept.len());
        for payload in kept {
            let record_len = (RECORD_PREFIX_LEN + payload.len()) as u64;
            records.push(Record { offset, payload });
            offset += record_len;
        }

        slog::debug!(
            self.logger,
            "Compacted log through {:?}. Retaining {} entries.",
            through,
            records.len()
        );

        self.records = records;
        self.first_index = new_first_index;
        self.end_offset = offset;

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.records.len() as u64)
    }
}

fn write_new_file(path: &Path, first_index: Index, payloads: &[Vec<u8>]) -> Result<File, io::Error> {
    let mut bytes = Vec::with_capacity(HEADER_LEN);
    bytes.extend_from_slice(&MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&first_index.as_u64().to_le_bytes());
    for payload in payloads {
        bytes.extend_from_slice(&encode_record(payload)?);
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    Ok(file)
}

fn parse_header(bytes: &[u8]) -> Result<Index, io::Error> {
    if bytes[0..4] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Not a raft log file"));
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported log format version {}", bytes[4]),
        ));
    }

    let first_index = u64::from_le_bytes(read_array(&bytes[5..13]));
    Index::from_u64(first_index)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Log header has first index 0"))
}

/// Returns the intact records and the byte length of the valid prefix of the file.
fn parse_records(bytes: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut pos = HEADER_LEN;

    while bytes.len() - pos >= RECORD_PREFIX_LEN {
        let len = u32::from_le_bytes(read_array(&bytes[pos..pos + 4])) as usize;
        let stored_crc = u32::from_le_bytes(read_array(&bytes[pos + 4..pos + 8]));
        let payload_start = pos + RECORD_PREFIX_LEN;
        if bytes.len() - payload_start < len {
            break;
        }

        let payload = &bytes[payload_start..payload_start + len];
        if crc32fast::hash(payload) != stored_crc {
            break;
        }

        records.push(Record {
            offset: pos as u64,
            payload: payload.to_vec(),
        });
        pos = payload_start + len;
    }

    (records, pos)
}

fn encode_record(payload: &[u8]) -> Result<Vec<u8>, io::Error> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Log entry too large"))?;

    let mut record = Vec::with_capacity(RECORD_PREFIX_LEN + payload.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    record.extend_from_slice(payload);

    Ok(record)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    array
}
