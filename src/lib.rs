mod actor;
mod api;
mod commitlog;
mod replica;

pub use api::try_create_raft_server;
pub use api::AdminError;
pub use api::AppendEntriesRequest;
pub use api::AppendEntriesResponse;
pub use api::ApplyContext;
pub use api::BoxError;
pub use api::Command;
pub use api::CommandError;
pub use api::CommandOutput;
pub use api::CommandRegistry;
pub use api::DoCommandError;
pub use api::JoinCommand;
pub use api::LeaveCommand;
pub use api::LogEntry;
pub use api::NopCommand;
pub use api::RaftElectionState;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftOptions;
pub use api::RaftPeerStatus;
pub use api::RaftRole;
pub use api::RaftServer;
pub use api::RaftServerConfig;
pub use api::RaftServerCreationError;
pub use api::RaftStatus;
pub use api::RequestVoteRequest;
pub use api::RequestVoteResponse;
pub use api::RpcHandlerError;
pub use api::SnapshotInfo;
pub use api::SnapshotRecoveryRequest;
pub use api::SnapshotRecoveryResponse;
pub use api::SnapshotRequest;
pub use api::SnapshotResponse;
pub use api::StateMachine;
pub use api::StorageConfig;
pub use api::TransportError;
pub use api::Transporter;
pub use api::JOIN_COMMAND_NAME;
pub use api::LEAVE_COMMAND_NAME;
pub use api::NOP_COMMAND_NAME;

