use std::collections::BTreeSet;
use std::fmt;

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk. It's the cluster-unique server name.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(replica_id: impl Into<String>) -> Self {
        ReplicaId(replica_id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ClusterTracker is the local view of cluster membership. Membership only changes when a
/// snapshot is installed or a join/leave entry is applied.
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    i_am_member: bool,
    peers: BTreeSet<ReplicaId>,
}

impl ClusterTracker {
    pub(crate) fn new(my_replica_id: ReplicaId, members: impl IntoIterator<Item = ReplicaId>) -> Self {
        let mut tracker = ClusterTracker {
            my_replica_id,
            i_am_member: false,
            peers: BTreeSet::new(),
        };
        tracker.replace_members(members);

        tracker
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn i_am_member(&self) -> bool {
        self.i_am_member
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        if replica_id == &self.my_replica_id {
            self.i_am_member
        } else {
            self.peers.contains(replica_id)
        }
    }

    pub(crate) fn peer_ids(&self) -> BTreeSet<ReplicaId> {
        self.peers.clone()
    }

    /// All voting members, including me if I'm one.
    pub(crate) fn members(&self) -> Vec<ReplicaId> {
        let mut members: Vec<ReplicaId> = self.peers.iter().cloned().collect();
        if self.i_am_member {
            members.push(self.my_replica_id.clone());
            members.sort();
        }

        members
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + if self.i_am_member { 1 } else { 0 }
    }

    /// Returns true if membership changed.
    pub(crate) fn add_member(&mut self, replica_id: ReplicaId) -> bool {
        if replica_id == self.my_replica_id {
            let changed = !self.i_am_member;
            self.i_am_member = true;
            changed
        } else {
            self.peers.insert(replica_id)
        }
    }

    /// Returns true if membership changed.
    pub(crate) fn remove_member(&mut self, replica_id: &ReplicaId) -> bool {
        if replica_id == &self.my_replica_id {
            let changed = self.i_am_member;
            self.i_am_member = false;
            changed
        } else {
            self.peers.remove(replica_id)
        }
    }

    pub(crate) fn replace_members(&mut self, members: impl IntoIterator<Item = ReplicaId>) {
        self.i_am_member = false;
        self.peers.clear();
        for member in members {
            self.add_member(member);
        }
    }
}
