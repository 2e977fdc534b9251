use crate::api::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse, SnapshotRecoveryRequest,
    SnapshotRecoveryResponse, SnapshotRequest, SnapshotResponse,
};

/// Transporter carries raft RPCs to other servers in the cluster. Implementations deliver the
/// request to the named peer's `RaftServer` and return its response.
///
/// Any error is treated as "no response". The caller applies its own timeout and retries on its
/// own schedule, so implementations shouldn't retry internally.
#[async_trait::async_trait]
pub trait Transporter: Send + Sync + 'static {
    async fn send_vote_request(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn send_append_entries_request(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn send_snapshot_request(
        &self,
        peer: &str,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError>;

    async fn send_snapshot_recovery_request(
        &self,
        peer: &str,
        request: SnapshotRecoveryRequest,
    ) -> Result<SnapshotRecoveryResponse, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("Peer {0} rejected the request: {1}")]
    Rejected(String, String),
    #[error("Transport failure: {0}")]
    Other(String),
}
