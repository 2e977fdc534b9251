//! Wire messages exchanged between raft servers. They are plain prost messages so an embedding
//! transport can encode them however it likes. An index or term of 0 means "none".

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub candidate_name: String,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(string, tag = "3")]
    pub command_name: String,
    #[prost(bytes, tag = "4")]
    pub command: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_name: String,
    #[prost(uint64, tag = "3")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub prev_log_term: u64,
    #[prost(uint64, tag = "5")]
    pub commit_index: u64,
    #[prost(message, repeated, tag = "6")]
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub commit_index: u64,
}

/// Announces a snapshot install. The follower says whether it needs the full state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_name: String,
    #[prost(uint64, tag = "3")]
    pub last_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub accept: bool,
}

/// Carries the full snapshot: membership and serialized state machine.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRecoveryRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_name: String,
    #[prost(uint64, tag = "3")]
    pub last_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_term: u64,
    #[prost(string, repeated, tag = "5")]
    pub members: Vec<String>,
    #[prost(bytes, tag = "6")]
    pub state: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRecoveryResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
}
