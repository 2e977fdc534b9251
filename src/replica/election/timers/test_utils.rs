use crate::actor::{Callback, Event};
use crate::replica::{
    ElectionTimeoutTick, PeerNextStep, PeerReplyInput, PeerRequestInput, PeerRequestOutput, PeerTaskError,
};
use std::time::Duration;
use tokio::sync::mpsc;

// Real time. Only bounds how long a test hangs when an expected event never shows up.
const SANITY_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(10);

/// Stands in for the replica actor, so background tasks can be tested against its queue.
pub(crate) struct TestUtilActor {
    queue: mpsc::Receiver<Event>,
}

impl TestUtilActor {
    pub(crate) fn new(queue: mpsc::Receiver<Event>) -> Self {
        TestUtilActor { queue }
    }

    async fn next_event(&mut self) -> Event {
        tokio::time::timeout(SANITY_TIMEOUT, self.queue.recv())
            .await
            .expect("Timed out waiting for an event")
            .expect("Actor queue closed")
    }

    pub(crate) async fn assert_election_timeout_event(&mut self) -> ElectionTimeoutTick {
        match self.next_event().await {
            Event::ElectionTimeout(tick) => tick,
            other => panic!("Expected election timeout, got {:?}", other),
        }
    }

    pub(crate) async fn recv_peer_request(&mut self) -> (PeerRequestInput, Callback<PeerRequestOutput, PeerTaskError>) {
        match self.next_event().await {
            Event::PeerRequest(input, callback) => (input, callback),
            other => panic!("Expected peer request, got {:?}", other),
        }
    }

    pub(crate) async fn recv_peer_reply(&mut self) -> (PeerReplyInput, Callback<PeerNextStep, PeerTaskError>) {
        match self.next_event().await {
            Event::PeerReply(input, callback) => (input, callback),
            other => panic!("Expected peer reply, got {:?}", other),
        }
    }

    pub(crate) async fn assert_no_event(&mut self) {
        if let Ok(event) = tokio::time::timeout(QUIET_PERIOD, self.queue.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
