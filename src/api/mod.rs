//! This mod holds the library's application-facing API, and the collaborator traits the
//! application plugs in (state machine, commands, transport).
mod command;
mod event_bus;
mod options;
pub(crate) mod rpc;
mod server;
mod state_machine;
mod transport;
mod types;
mod wiring;

pub use command::ApplyContext;
pub use command::Command;
pub use command::CommandError;
pub use command::CommandOutput;
pub use command::CommandRegistry;
pub use command::JoinCommand;
pub use command::LeaveCommand;
pub use command::NopCommand;
pub use command::JOIN_COMMAND_NAME;
pub use command::LEAVE_COMMAND_NAME;
pub use command::NOP_COMMAND_NAME;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use rpc::AppendEntriesRequest;
pub use rpc::AppendEntriesResponse;
pub use rpc::LogEntry;
pub use rpc::RequestVoteRequest;
pub use rpc::RequestVoteResponse;
pub use rpc::SnapshotRecoveryRequest;
pub use rpc::SnapshotRecoveryResponse;
pub use rpc::SnapshotRequest;
pub use rpc::SnapshotResponse;
pub use server::AdminError;
pub use server::DoCommandError;
pub use server::RaftServer;
pub use server::RpcHandlerError;
pub use state_machine::BoxError;
pub use state_machine::StateMachine;
pub use transport::TransportError;
pub use transport::Transporter;
pub use types::RaftPeerStatus;
pub use types::RaftRole;
pub use types::RaftStatus;
pub use types::SnapshotInfo;
pub use wiring::try_create_raft_server;
pub use wiring::RaftServerConfig;
pub use wiring::RaftServerCreationError;
pub use wiring::StorageConfig;

// For the replica, which decodes and applies commands and reads options.
pub(crate) use command::encode_command;
pub(crate) use command::MembershipChange;
pub(crate) use options::RaftOptionsValidated;
