use chrono::{DateTime, Utc};

/// Role a server currently plays in the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// A follower in the middle of installing a snapshot from the leader.
    Snapshotting,
    Stopped,
}

/// Point-in-time view of a server, as returned by `RaftServer::status()`.
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub name: String,
    pub term: u64,
    pub role: RaftRole,
    pub leader: Option<String>,
    /// 0 means nothing has been committed yet. Same for the other indexes.
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub first_log_index: u64,
    pub last_log_index: u64,
    pub members: Vec<String>,
    /// Replication progress per follower. Only populated on the leader.
    pub peers: Vec<RaftPeerStatus>,
}

#[derive(Clone, Debug)]
pub struct RaftPeerStatus {
    pub name: String,
    pub next_index: u64,
    pub matched_index: u64,
    pub last_contact: Option<DateTime<Utc>>,
    pub snapshotting: bool,
}

/// The (term, index) covered by a snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SnapshotInfo {
    pub term: u64,
    pub index: u64,
}
