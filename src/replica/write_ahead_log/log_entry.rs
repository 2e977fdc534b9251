use crate::commitlog;
use crate::replica::Term;
use bytes::Bytes;
use prost::Message;
use std::convert::TryFrom;
use std::io;

/// An entry in the raft log. Its index is positional, so it isn't stored in the entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) command_name: String,
    pub(crate) command: Bytes,
}

/// Serialized form. Checksums and framing are handled by the underlying commitlog.
#[derive(Clone, PartialEq, ::prost::Message)]
struct EncodedLogEntry {
    #[prost(uint64, tag = "1")]
    term: u64,
    #[prost(string, tag = "2")]
    command_name: String,
    #[prost(bytes, tag = "3")]
    command: Vec<u8>,
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let encoded =
            EncodedLogEntry::decode(&bytes[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(WriteAheadLogEntry {
            term: Term::new(encoded.term),
            command_name: encoded.command_name,
            command: Bytes::from(encoded.command),
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let encoded = EncodedLogEntry {
            term: entry.term.as_u64(),
            command_name: entry.command_name,
            command: entry.command.to_vec(),
        };

        let mut bytes = Vec::with_capacity(encoded.encoded_len());
        // Encoding into a Vec only fails on insufficient capacity, and a Vec grows.
        let _ = encoded.encode(&mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_an_error_not_a_panic() {
        let garbage = vec![0xff, 0xff, 0xff, 0xff];
        assert!(WriteAheadLogEntry::try_from(garbage).is_err());
    }

    #[test]
    fn empty_command_is_preserved() {
        let entry = WriteAheadLogEntry {
            term: Term::new(3),
            command_name: "raft:nop".to_string(),
            command: Bytes::new(),
        };

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }
}
