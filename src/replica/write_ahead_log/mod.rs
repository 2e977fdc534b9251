//! This module is a raft-specific commit log that wraps the generic commit log.

mod log;
mod log_entry;

pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::WriteAheadLogEntry;
