use crate::api::{RaftStatus, StateMachine};
use crate::commitlog;
use crate::replica;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous, inside the actor. All replica state (including the
// application's state machine) is owned by this one task, so there's never any locking.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to disk, locally buffer entry to be replicated later. Also stores callback.
    // Candidate/Follower: Redirect.
    EnqueueForReplication(
        replica::EnqueueForReplicationInput,
        Callback<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError>,
    ),

    // All: Grant vote if applicable (includes write to disk). Transition to follower on newer term.
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Candidate: Update local state. Transition to leader if quorum vote.
    // Leader/Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // All: Transition to follower if applicable. Clean up log. Respond to request.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Follower: Decide whether we need the leader's snapshot.
    Snapshot(replica::SnapshotInput, Callback<replica::SnapshotOutput, replica::SnapshotError>),
    SnapshotRecovery(
        replica::SnapshotRecoveryInput,
        Callback<replica::SnapshotRecoveryOutput, replica::SnapshotRecoveryError>,
    ),

    // Leader: A peer's replication task wants the next request to send.
    PeerRequest(
        replica::PeerRequestInput,
        Callback<replica::PeerRequestOutput, replica::PeerTaskError>,
    ),
    // Leader: Update peer progress and the commit index. Tells the task whether to send again.
    PeerReply(
        replica::PeerReplyInput,
        Callback<replica::PeerNextStep, replica::PeerTaskError>,
    ),

    // Candidate/Follower: Start a new election, unless the tick is stale.
    ElectionTimeout(replica::ElectionTimeoutTick),

    TakeSnapshot(Callback<replica::TakeSnapshotOutput, replica::TakeSnapshotError>),
    Status(Callback<RaftStatus, replica::StatusError>),
    Stop(Callback<(), replica::StatusError>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient doesn't keep the actor alive. Background tasks (timers, peer replication) hold
/// this, so the actor exits once the application drops all of its handles.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: replica::EnqueueForReplicationInput,
    ) -> Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError> {
        self.call(|cb| Event::EnqueueForReplication(input, cb))
            .await
            .unwrap_or(Err(replica::EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        self.call(|cb| Event::RequestVote(input, cb))
            .await
            .unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        self.call(|cb| Event::AppendEntries(input, cb))
            .await
            .unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn snapshot(
        &self,
        input: replica::SnapshotInput,
    ) -> Result<replica::SnapshotOutput, replica::SnapshotError> {
        self.call(|cb| Event::Snapshot(input, cb))
            .await
            .unwrap_or(Err(replica::SnapshotError::ActorExited))
    }

    pub(crate) async fn snapshot_recovery(
        &self,
        input: replica::SnapshotRecoveryInput,
    ) -> Result<replica::SnapshotRecoveryOutput, replica::SnapshotRecoveryError> {
        self.call(|cb| Event::SnapshotRecovery(input, cb))
            .await
            .unwrap_or(Err(replica::SnapshotRecoveryError::ActorExited))
    }

    pub(crate) async fn take_snapshot(
        &self,
    ) -> Result<replica::TakeSnapshotOutput, replica::TakeSnapshotError> {
        self.call(Event::TakeSnapshot)
            .await
            .unwrap_or(Err(replica::TakeSnapshotError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<RaftStatus, replica::StatusError> {
        self.call(Event::Status)
            .await
            .unwrap_or(Err(replica::StatusError::ActorExited))
    }

    pub(crate) async fn stop(&self) -> Result<(), replica::StatusError> {
        self.call(Event::Stop)
            .await
            .unwrap_or(Err(replica::StatusError::ActorExited))
    }

    async fn peer_request(
        &self,
        input: replica::PeerRequestInput,
    ) -> Result<replica::PeerRequestOutput, replica::PeerTaskError> {
        self.call(|cb| Event::PeerRequest(input, cb))
            .await
            .unwrap_or(Err(replica::PeerTaskError::ActorExited))
    }

    async fn peer_reply(
        &self,
        input: replica::PeerReplyInput,
    ) -> Result<replica::PeerNextStep, replica::PeerTaskError> {
        self.call(|cb| Event::PeerReply(input, cb))
            .await
            .unwrap_or(Err(replica::PeerTaskError::ActorExited))
    }

    /// Returns None if the actor is gone, either before or after it received the event.
    async fn call<O: Debug, E: Error>(
        &self,
        to_event: impl FnOnce(Callback<O, E>) -> Event,
    ) -> Option<Result<O, E>> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(to_event(Callback(tx))).await.ok()?;
        rx.await.ok()
    }

    async fn notify(&self, event: Event) {
        // Notifications are best effort. If the actor is gone, there's nobody to notify.
        let _ = self.sender.send(event).await;
    }
}

impl WeakActorClient {
    fn upgrade(&self) -> Option<ActorClient> {
        self.sender.upgrade().map(|sender| ActorClient { sender })
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(&self, input: replica::RequestVoteReplyFromPeer) {
        if let Some(client) = self.upgrade() {
            client.notify(Event::RequestVoteReplyFromPeer(input)).await;
        }
    }

    pub(crate) async fn election_timeout(&self, tick: replica::ElectionTimeoutTick) {
        if let Some(client) = self.upgrade() {
            client.notify(Event::ElectionTimeout(tick)).await;
        }
    }

    pub(crate) async fn peer_request(
        &self,
        input: replica::PeerRequestInput,
    ) -> Result<replica::PeerRequestOutput, replica::PeerTaskError> {
        match self.upgrade() {
            Some(client) => client.peer_request(input).await,
            None => Err(replica::PeerTaskError::ActorExited),
        }
    }

    pub(crate) async fn peer_reply(
        &self,
        input: replica::PeerReplyInput,
    ) -> Result<replica::PeerNextStep, replica::PeerTaskError> {
        match self.upgrade() {
            Some(client) => client.peer_reply(input).await,
            None => Err(replica::PeerTaskError::ActorExited),
        }
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S, M>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
    S: replica::PersistentLocalState,
    M: StateMachine,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S, M>,
}

impl<L, S, M> ReplicaActor<L, S, M>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
    S: replica::PersistentLocalState,
    M: StateMachine,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S, M>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Event: {:?}", event);
            self.handle_event(event);
        }
        slog::info!(self.logger, "All handles dropped. Replica actor exiting.");
    }

    // This must NOT be async. Any long running work must be spawned on another actor
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                let result = self.replica.handle_enqueue_for_replication(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(input) => {
                self.replica.handle_request_vote_reply_from_peer(input);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::Snapshot(input, callback) => {
                let result = self.replica.server_handle_snapshot(input);
                callback.send(result);
            }
            Event::SnapshotRecovery(input, callback) => {
                let result = self.replica.server_handle_snapshot_recovery(input);
                callback.send(result);
            }
            Event::PeerRequest(input, callback) => {
                let result = self.replica.handle_peer_request(input);
                callback.send(result);
            }
            Event::PeerReply(input, callback) => {
                let result = self.replica.handle_peer_reply(input);
                callback.send(result);
            }
            Event::ElectionTimeout(tick) => {
                self.replica.handle_election_timeout(tick);
            }
            Event::TakeSnapshot(callback) => {
                let result = self.replica.handle_take_snapshot();
                callback.send(result);
            }
            Event::Status(callback) => {
                callback.send(Ok(self.replica.status()));
            }
            Event::Stop(callback) => {
                self.replica.stop();
                callback.send(Ok(()));
            }
        }
    }
}
