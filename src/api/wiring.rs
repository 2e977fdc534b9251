use crate::actor::{ActorClient, ReplicaActor};
use crate::api::command::CommandRegistry;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::server::RaftServer;
use crate::api::state_machine::{BoxError, StateMachine};
use crate::api::transport::Transporter;
use crate::commitlog::{FileLog, InMemoryLog, Index, Log};
use crate::replica;
use crate::replica::{
    ClusterTracker, FileLocalState, PersistentLocalState, ReplicaId, SnapshotStore, VolatileLocalState, WriteAheadLog,
    WriteAheadLogEntry,
};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const ACTOR_QUEUE_SIZE: usize = 64;

pub struct RaftServerConfig<M: StateMachine> {
    /// This server's name. Peers address it by this name through their `Transporter`.
    pub name: String,
    /// Initial voting members. A server joining an existing cluster lists the current members
    /// without itself, then gets added through a `JoinCommand` on the leader.
    pub members: Vec<String>,
    pub storage: StorageConfig,
    pub logger: slog::Logger,
    pub options: RaftOptions,
    pub transporter: Arc<dyn Transporter>,
    pub state_machine: M,
    pub commands: CommandRegistry<M>,
}

pub enum StorageConfig {
    /// Nothing survives the process. For tests and throwaway clusters.
    InMemory,
    /// Log, vote/term and snapshots live under this directory. Created if missing.
    Directory(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum RaftServerCreationError {
    #[error("Invalid cluster membership: {0}")]
    InvalidMembership(String),
    #[error("Illegal options for configuring server: {0}")]
    IllegalOptions(String),
    #[error("Failed to initialize storage: {0}")]
    StorageInitialization(io::Error),
    #[error("State machine failed to recover from snapshot: {0}")]
    StateMachineRecovery(BoxError),
}

/// Open (or create) local storage, restore the state machine from the latest snapshot, replay
/// committed log entries, and start the server as a follower.
///
/// Must be called from within a tokio runtime.
pub async fn try_create_raft_server<M: StateMachine>(
    config: RaftServerConfig<M>,
) -> Result<RaftServer<M>, RaftServerCreationError> {
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftServerCreationError::IllegalOptions(e.to_string()))?;
    validate_members(&config.members)?;

    let logger = config.logger.new(slog::o!("Server" => config.name.clone()));
    let my_replica_id = ReplicaId::new(config.name.clone());
    let members = config.members.into_iter().map(ReplicaId::new).collect::<Vec<_>>();

    let storage = StorageParts {
        name: config.name,
        logger,
        my_replica_id,
        members,
        options,
        transporter: config.transporter,
        state_machine: config.state_machine,
        commands: config.commands,
    };

    match config.storage {
        StorageConfig::InMemory => {
            let local_state = VolatileLocalState::new(storage.my_replica_id.clone());
            let snapshot_store = SnapshotStore::in_memory(storage.logger.clone());
            start_server(storage, local_state, snapshot_store, |_| Ok(InMemoryLog::<WriteAheadLogEntry>::create()))
        }
        StorageConfig::Directory(directory) => {
            std::fs::create_dir_all(&directory).map_err(RaftServerCreationError::StorageInitialization)?;
            let local_state = FileLocalState::open(directory.join("state"), storage.my_replica_id.clone())
                .map_err(RaftServerCreationError::StorageInitialization)?;
            let snapshot_store = SnapshotStore::open(storage.logger.clone(), directory.join("snapshot"))
                .map_err(RaftServerCreationError::StorageInitialization)?;
            let log_logger = storage.logger.clone();
            let log_path = directory.join("log");
            start_server(storage, local_state, snapshot_store, move |first_index| {
                FileLog::<WriteAheadLogEntry>::open(log_logger, log_path, first_index)
            })
        }
    }
}

/// Everything except the storage backends.
struct StorageParts<M: StateMachine> {
    name: String,
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    members: Vec<ReplicaId>,
    options: RaftOptionsValidated,
    transporter: Arc<dyn Transporter>,
    state_machine: M,
    commands: CommandRegistry<M>,
}

fn start_server<L, S, M>(
    parts: StorageParts<M>,
    mut local_state: S,
    snapshot_store: SnapshotStore,
    open_log: impl FnOnce(Index) -> Result<L, io::Error>,
) -> Result<RaftServer<M>, RaftServerCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
    M: StateMachine,
{
    let StorageParts {
        name,
        logger,
        my_replica_id,
        mut members,
        options,
        transporter,
        mut state_machine,
        commands,
    } = parts;

    // The snapshot is the base everything else is replayed on top of.
    let snapshot_point = snapshot_store.latest_point();
    if let Some(snapshot) = snapshot_store.latest() {
        state_machine
            .recovery(&snapshot.state)
            .map_err(RaftServerCreationError::StateMachineRecovery)?;
        members = snapshot.members.clone();
    }

    let first_index = snapshot_point.map_or_else(Index::start_index, |(_, index)| index.plus(1));
    let log = open_log(first_index).map_err(RaftServerCreationError::StorageInitialization)?;
    let write_ahead_log = WriteAheadLog::new(logger.clone(), log, snapshot_point)
        .map_err(RaftServerCreationError::StorageInitialization)?;

    // Never run in a term older than what our own log has seen.
    if let Some((latest_term, _)) = write_ahead_log.latest_entry() {
        local_state
            .store_term_if_increased(latest_term)
            .map_err(RaftServerCreationError::StorageInitialization)?;
    }

    let cluster_tracker = ClusterTracker::new(my_replica_id, members);
    slog::info!(
        logger,
        "Starting with members {:?} at term {:?}, log through {:?}",
        cluster_tracker.members(),
        local_state.current_term(),
        write_ahead_log.latest_entry()
    );

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);
    let command_timeout = options.command_timeout;
    let (mut replica, election_state_change_listener) = replica::create_replica(
        replica::ReplicaParts {
            logger: logger.clone(),
            cluster_tracker,
            local_state,
            write_ahead_log,
            snapshot_store,
            state_machine,
            commands,
            transporter,
            options,
        },
        actor_client.weak(),
    );
    replica
        .replay_committed_entries()
        .map_err(RaftServerCreationError::StorageInitialization)?;

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(RaftServer::new(
        name,
        actor_client,
        RaftEventListener::new(election_state_change_listener),
        command_timeout,
    ))
}

fn validate_members(members: &[String]) -> Result<(), RaftServerCreationError> {
    if members.is_empty() {
        return Err(RaftServerCreationError::InvalidMembership(
            "At least one member is required".into(),
        ));
    }

    let mut seen = HashSet::new();
    for member in members {
        if member.is_empty() {
            return Err(RaftServerCreationError::InvalidMembership("Empty member name".into()));
        }
        if !seen.insert(member.as_str()) {
            return Err(RaftServerCreationError::InvalidMembership(format!(
                "Duplicate member {:?}",
                member
            )));
        }
    }

    Ok(())
}
