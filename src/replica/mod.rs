mod election;
mod local_state;
mod peers;
mod pending_commands;
#[allow(clippy::module_inception)]
mod replica;
mod replica_api;
mod replica_wiring;
mod replication;
mod snapshot;
mod snapshotting;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ReplicaId;
pub(crate) use replica::Replica;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaParts;
pub(crate) use snapshot::SnapshotStore;
pub(crate) use write_ahead_log::WriteAheadLog;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
