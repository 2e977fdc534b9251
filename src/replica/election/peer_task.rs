use crate::actor::WeakActorClient;
use crate::api::{TransportError, Transporter};
use crate::replica::election::timers::{Clock, RealClock};
use crate::replica::{
    OutboundPeerRequest, PeerNextStep, PeerReplyInput, PeerReplyResult, PeerRequestInput, ReplicaId, Term,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::Duration;

#[derive(Clone)]
pub(crate) struct PeerTaskConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) transporter: Arc<dyn Transporter>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) rpc_timeout: Duration,
    // SnapshotRecovery carries the whole state machine, so it gets a longer deadline.
    pub(crate) snapshot_recovery_timeout: Duration,
}

/// PeerTaskHandle owns a leader's replication task for one follower, for one term. The task
/// doesn't decide anything on its own. It asks the actor what to send, sends it, and reports the
/// reply back. That keeps exactly one request in flight per peer, and keeps replication to a
/// peer strictly ordered.
///
/// Dropping the handle aborts the task.
pub(crate) struct PeerTaskHandle {
    trigger: Arc<Notify>,
    join_handle: JoinHandle<()>,
}

struct PeerTask<C: Clock> {
    logger: slog::Logger,
    config: PeerTaskConfig,
    peer_id: ReplicaId,
    term: Term,
    actor_client: WeakActorClient,
    trigger: Arc<Notify>,
    clock: C,
}

impl PeerTaskHandle {
    pub(crate) fn spawn(config: PeerTaskConfig, actor_client: WeakActorClient, peer_id: ReplicaId, term: Term) -> Self {
        Self::spawn_with_clock(config, actor_client, peer_id, term, RealClock)
    }

    fn spawn_with_clock<C: Clock>(
        config: PeerTaskConfig,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let task = PeerTask {
            logger: config
                .logger
                .new(slog::o!("Peer" => peer_id.as_str().to_string(), "Term" => term.as_u64())),
            config,
            peer_id,
            term,
            actor_client,
            trigger: trigger.clone(),
            clock,
        };
        let join_handle = tokio::task::spawn(task.run());

        PeerTaskHandle { trigger, join_handle }
    }

    /// Send to the peer now rather than at the next heartbeat, e.g. because a new entry was
    /// appended. If a request is already in flight, the task goes again as soon as it's back.
    pub(crate) fn trigger(&self) {
        self.trigger.notify_one();
    }
}

impl Drop for PeerTaskHandle {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

impl<C: Clock> PeerTask<C> {
    async fn run(self) {
        // A new leader (or a newly joined peer) should hear from us right away.
        let mut next_step = PeerNextStep::SendImmediately;
        loop {
            if next_step == PeerNextStep::AwaitHeartbeat {
                let deadline = self.clock.now() + self.config.heartbeat_interval;
                tokio::select! {
                    _ = self.clock.sleep_until(deadline) => {}
                    _ = self.trigger.notified() => {}
                }
            }

            let request_input = PeerRequestInput {
                peer_id: self.peer_id.clone(),
                term: self.term,
            };
            let output = match self.actor_client.peer_request(request_input).await {
                Ok(output) => output,
                Err(e) => {
                    slog::info!(self.logger, "Stopping replication task: {}", e);
                    return;
                }
            };

            let result = self.send(output.request).await;

            let reply_input = PeerReplyInput {
                descriptor: output.descriptor,
                result,
            };
            next_step = match self.actor_client.peer_reply(reply_input).await {
                Ok(next_step) => next_step,
                Err(e) => {
                    slog::info!(self.logger, "Stopping replication task: {}", e);
                    return;
                }
            };
        }
    }

    async fn send(&self, request: OutboundPeerRequest) -> PeerReplyResult {
        let peer = self.peer_id.as_str();
        let transporter = &self.config.transporter;
        match request {
            OutboundPeerRequest::AppendEntries(request) => {
                slog::debug!(self.logger, "ClientWire - {:?}", request);
                let reply = tokio::time::timeout(
                    self.config.rpc_timeout,
                    transporter.send_append_entries_request(peer, request),
                )
                .await;
                slog::debug!(self.logger, "ClientWire - {:?}", reply);
                PeerReplyResult::AppendEntries(flatten_reply(reply))
            }
            OutboundPeerRequest::Snapshot(request) => {
                slog::debug!(self.logger, "ClientWire - {:?}", request);
                let reply =
                    tokio::time::timeout(self.config.rpc_timeout, transporter.send_snapshot_request(peer, request))
                        .await;
                slog::debug!(self.logger, "ClientWire - {:?}", reply);
                PeerReplyResult::Snapshot(flatten_reply(reply))
            }
            OutboundPeerRequest::SnapshotRecovery(request) => {
                slog::info!(
                    self.logger,
                    "Sending snapshot through index {} ({} bytes)",
                    request.last_index,
                    request.state.len()
                );
                let reply = tokio::time::timeout(
                    self.config.snapshot_recovery_timeout,
                    transporter.send_snapshot_recovery_request(peer, request),
                )
                .await;
                slog::debug!(self.logger, "ClientWire - {:?}", reply);
                PeerReplyResult::SnapshotRecovery(flatten_reply(reply))
            }
        }
    }
}

fn flatten_reply<T>(reply: Result<Result<T, TransportError>, Elapsed>) -> Result<T, String> {
    match reply {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(transport_error)) => Err(transport_error.to_string()),
        Err(_timeout) => Err("Timed out waiting for peer".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::api::rpc;
    use crate::replica::election::timers::{ManualClock, TestUtilActor};
    use crate::replica::{PeerRequestDescriptor, PeerRequestKind, PeerRequestOutput, PeerTaskError};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Only AppendEntries is exercised here. It can be flipped to fail.
    struct FakeTransporter {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transporter for FakeTransporter {
        async fn send_vote_request(
            &self,
            peer: &str,
            _request: rpc::RequestVoteRequest,
        ) -> Result<rpc::RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable(peer.to_string()))
        }

        async fn send_append_entries_request(
            &self,
            peer: &str,
            request: rpc::AppendEntriesRequest,
        ) -> Result<rpc::AppendEntriesResponse, TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable(peer.to_string()));
            }
            Ok(rpc::AppendEntriesResponse {
                term: request.term,
                success: true,
                last_log_index: request.prev_log_index + request.entries.len() as u64,
                commit_index: request.commit_index,
            })
        }

        async fn send_snapshot_request(
            &self,
            peer: &str,
            _request: rpc::SnapshotRequest,
        ) -> Result<rpc::SnapshotResponse, TransportError> {
            Err(TransportError::Unreachable(peer.to_string()))
        }

        async fn send_snapshot_recovery_request(
            &self,
            peer: &str,
            _request: rpc::SnapshotRecoveryRequest,
        ) -> Result<rpc::SnapshotRecoveryResponse, TransportError> {
            Err(TransportError::Unreachable(peer.to_string()))
        }
    }

    fn config(transporter: Arc<FakeTransporter>, heartbeat_interval: Duration) -> PeerTaskConfig {
        PeerTaskConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            transporter,
            heartbeat_interval,
            rpc_timeout: Duration::from_secs(1),
            snapshot_recovery_timeout: Duration::from_secs(1),
        }
    }

    fn heartbeat(seq_no: u64) -> PeerRequestOutput {
        PeerRequestOutput {
            request: OutboundPeerRequest::AppendEntries(rpc::AppendEntriesRequest {
                term: 3,
                leader_name: "leader".into(),
                prev_log_index: 4,
                prev_log_term: 2,
                commit_index: 4,
                entries: vec![],
            }),
            descriptor: PeerRequestDescriptor {
                peer_id: ReplicaId::new("peer"),
                term: Term::new(3),
                seq_no,
                kind: PeerRequestKind::AppendEntries {
                    previous_log_entry_index: None,
                    num_log_entries: 0,
                },
            },
        }
    }

    #[tokio::test]
    async fn sends_immediately_then_on_heartbeat() {
        // -- setup --
        let heartbeat_interval = Duration::from_millis(100);
        let transporter = Arc::new(FakeTransporter {
            fail: AtomicBool::new(false),
        });
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();

        let _handle = PeerTaskHandle::spawn_with_clock(
            config(transporter, heartbeat_interval),
            strong_actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(3),
            clock.clone(),
        );

        // -- execute & verify --
        // 1. First request goes out without waiting for a heartbeat.
        let (input, callback) = actor.recv_peer_request().await;
        assert_eq!(
            input,
            PeerRequestInput {
                peer_id: ReplicaId::new("peer"),
                term: Term::new(3),
            }
        );
        callback.send(Ok(heartbeat(1)));

        let (reply, callback) = actor.recv_peer_reply().await;
        assert_eq!(reply.descriptor.seq_no, 1);
        match reply.result {
            PeerReplyResult::AppendEntries(Ok(response)) => assert!(response.success),
            other => panic!("Unexpected reply {:?}", other),
        }
        callback.send(Ok(PeerNextStep::AwaitHeartbeat));

        // 2. Nothing until the heartbeat interval elapses.
        actor.assert_no_event().await;
        clock.advance(heartbeat_interval / 2);
        actor.assert_no_event().await;
        clock.advance(heartbeat_interval / 2);

        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Ok(heartbeat(2)));
        let (reply, callback) = actor.recv_peer_reply().await;
        assert_eq!(reply.descriptor.seq_no, 2);
        callback.send(Ok(PeerNextStep::SendImmediately));

        // 3. SendImmediately skips the wait.
        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Err(PeerTaskError::NoLongerLeader(Term::new(3))));

        // 4. Task has exited.
        clock.advance(heartbeat_interval * 2);
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn trigger_skips_heartbeat_wait() {
        // -- setup --
        let heartbeat_interval = Duration::from_millis(100);
        let transporter = Arc::new(FakeTransporter {
            fail: AtomicBool::new(false),
        });
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();

        let handle = PeerTaskHandle::spawn_with_clock(
            config(transporter, heartbeat_interval),
            strong_actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(3),
            clock.clone(),
        );
        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Ok(heartbeat(1)));
        let (_, callback) = actor.recv_peer_reply().await;
        callback.send(Ok(PeerNextStep::AwaitHeartbeat));
        actor.assert_no_event().await;

        // -- execute & verify --
        handle.trigger();
        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Ok(heartbeat(2)));
        actor.recv_peer_reply().await;
    }

    #[tokio::test]
    async fn transport_failure_is_reported_not_retried() {
        // -- setup --
        let transporter = Arc::new(FakeTransporter {
            fail: AtomicBool::new(true),
        });
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();

        let _handle = PeerTaskHandle::spawn_with_clock(
            config(transporter, Duration::from_millis(100)),
            strong_actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(3),
            clock.clone(),
        );

        // -- execute & verify --
        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Ok(heartbeat(1)));
        let (reply, callback) = actor.recv_peer_reply().await;
        assert!(matches!(reply.result, PeerReplyResult::AppendEntries(Err(_))));
        callback.send(Ok(PeerNextStep::AwaitHeartbeat));
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn dropping_handle_stops_task() {
        // -- setup --
        let heartbeat_interval = Duration::from_millis(100);
        let transporter = Arc::new(FakeTransporter {
            fail: AtomicBool::new(false),
        });
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let clock = ManualClock::new();

        let handle = PeerTaskHandle::spawn_with_clock(
            config(transporter, heartbeat_interval),
            strong_actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(3),
            clock.clone(),
        );
        let (_, callback) = actor.recv_peer_request().await;
        callback.send(Ok(heartbeat(1)));
        let (_, callback) = actor.recv_peer_reply().await;
        callback.send(Ok(PeerNextStep::AwaitHeartbeat));
        actor.assert_no_event().await;

        // -- execute --
        drop(handle);
        clock.advance(heartbeat_interval * 2);

        // -- verify --
        actor.assert_no_event().await;
    }
}
