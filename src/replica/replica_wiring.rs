use crate::actor::WeakActorClient;
use crate::api::{CommandRegistry, RaftOptionsValidated, StateMachine, Transporter};
use crate::commitlog::Log;
use crate::replica::election::{ElectionConfig, ElectionState, PeerTaskConfig};
use crate::replica::replica::{Replica, ReplicaConfig};
use crate::replica::{
    ClusterTracker, ElectionStateChangeListener, PersistentLocalState, SnapshotStore, WriteAheadLog, WriteAheadLogEntry,
};
use std::sync::Arc;

pub(crate) struct ReplicaParts<L, S, M>
where
    L: Log<WriteAheadLogEntry>,
    S: PersistentLocalState,
    M: StateMachine,
{
    pub logger: slog::Logger,
    pub cluster_tracker: ClusterTracker,
    pub local_state: S,
    pub write_ahead_log: WriteAheadLog<L>,
    pub snapshot_store: SnapshotStore,
    pub state_machine: M,
    pub commands: CommandRegistry<M>,
    pub transporter: Arc<dyn Transporter>,
    pub options: RaftOptionsValidated,
}

/// Build a replica that starts out as a follower. Must be called from within a tokio runtime,
/// since the follower's election timer is spawned right away.
pub(crate) fn create_replica<L, S, M>(
    parts: ReplicaParts<L, S, M>,
    actor_client: WeakActorClient,
) -> (Replica<L, S, M>, ElectionStateChangeListener)
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
    M: StateMachine,
{
    let options = parts.options;
    let my_replica_id = parts.cluster_tracker.my_replica_id().clone();

    let election_config = ElectionConfig {
        my_replica_id,
        election_min_timeout: options.election_min_timeout,
        election_max_timeout: options.election_max_timeout,
        peer_task_config: PeerTaskConfig {
            logger: parts.logger.clone(),
            transporter: parts.transporter.clone(),
            heartbeat_interval: options.heartbeat_interval,
            rpc_timeout: options.rpc_timeout,
            snapshot_recovery_timeout: options.election_max_timeout,
        },
    };
    let (election_state, election_state_change_listener) =
        ElectionState::new_follower(election_config, actor_client.clone());

    let replica = Replica::new(ReplicaConfig {
        logger: parts.logger,
        cluster_tracker: parts.cluster_tracker,
        local_state: parts.local_state,
        election_state,
        write_ahead_log: parts.write_ahead_log,
        snapshot_store: parts.snapshot_store,
        state_machine: parts.state_machine,
        commands: parts.commands,
        actor_client,
        transporter: parts.transporter,
        rpc_timeout: options.rpc_timeout,
        snapshot_threshold: options.snapshot_threshold,
        max_entries_per_request: options.max_entries_per_request,
    });

    (replica, election_state_change_listener)
}
