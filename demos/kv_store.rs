//! A replicated key/value store: three raft servers in one process, with a transport that calls
//! straight into the target server.
//!
//!     cargo run --example kv_store

use async_trait::async_trait;
use bytes::Bytes;
use raft::{
    ApplyContext, BoxError, Command, CommandOutput, CommandRegistry, DoCommandError, RaftOptions, RaftServer,
    RaftServerConfig, StateMachine, StorageConfig, TransportError, Transporter,
};
use serde::{Deserialize, Serialize};
use slog::Drain;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;

#[derive(Default)]
struct KvStore {
    data: BTreeMap<String, String>,
}

impl StateMachine for KvStore {
    fn save(&self) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    fn recovery(&mut self, state: &[u8]) -> Result<(), BoxError> {
        self.data = serde_json::from_slice(state)?;
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Put {
    key: String,
    value: String,
}

impl Command<KvStore> for Put {
    fn name(&self) -> &str {
        "kv:put"
    }

    fn apply(&self, context: &mut ApplyContext<'_, KvStore>) -> Result<CommandOutput, BoxError> {
        let previous = context
            .state_machine()
            .data
            .insert(self.key.clone(), self.value.clone());
        Ok(match previous {
            Some(previous) => CommandOutput::Data(Bytes::from(previous)),
            None => CommandOutput::NoData,
        })
    }
}

/// Reads go through the log too, so they see everything committed before them.
#[derive(Clone, Serialize, Deserialize)]
struct Get {
    key: String,
}

impl Command<KvStore> for Get {
    fn name(&self) -> &str {
        "kv:get"
    }

    fn apply(&self, context: &mut ApplyContext<'_, KvStore>) -> Result<CommandOutput, BoxError> {
        Ok(match context.state_machine().data.get(&self.key) {
            Some(value) => CommandOutput::Data(Bytes::from(value.clone())),
            None => CommandOutput::NoData,
        })
    }
}

type Directory = Arc<RwLock<HashMap<String, RaftServer<KvStore>>>>;

/// Calls straight into the target server.
struct InProcessTransport {
    servers: Directory,
}

impl InProcessTransport {
    fn lookup(&self, peer: &str) -> Result<RaftServer<KvStore>, TransportError> {
        let servers = self
            .servers
            .read()
            .map_err(|_| TransportError::Other("Server directory poisoned".into()))?;
        servers
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))
    }
}

fn handler_error(peer: &str, e: raft::RpcHandlerError) -> TransportError {
    TransportError::Rejected(peer.to_string(), e.to_string())
}

#[async_trait]
impl Transporter for InProcessTransport {
    async fn send_vote_request(
        &self,
        peer: &str,
        request: raft::RequestVoteRequest,
    ) -> Result<raft::RequestVoteResponse, TransportError> {
        let server = self.lookup(peer)?;
        server.request_vote(request).await.map_err(|e| handler_error(peer, e))
    }

    async fn send_append_entries_request(
        &self,
        peer: &str,
        request: raft::AppendEntriesRequest,
    ) -> Result<raft::AppendEntriesResponse, TransportError> {
        let server = self.lookup(peer)?;
        server.append_entries(request).await.map_err(|e| handler_error(peer, e))
    }

    async fn send_snapshot_request(
        &self,
        peer: &str,
        request: raft::SnapshotRequest,
    ) -> Result<raft::SnapshotResponse, TransportError> {
        let server = self.lookup(peer)?;
        server.snapshot(request).await.map_err(|e| handler_error(peer, e))
    }

    async fn send_snapshot_recovery_request(
        &self,
        peer: &str,
        request: raft::SnapshotRecoveryRequest,
    ) -> Result<raft::SnapshotRecoveryResponse, TransportError> {
        let server = self.lookup(peer)?;
        server
            .snapshot_recovery(request)
            .await
            .map_err(|e| handler_error(peer, e))
    }
}

fn create_root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

/// Submit to whoever we think is leader, following redirects.
async fn do_command<C>(servers: &Directory, mut target: String, command: C) -> Result<CommandOutput, Box<dyn Error>>
where
    C: Command<KvStore> + Serialize + Clone,
{
    for _ in 0..20 {
        let server = servers.read().map_err(|_| "Server directory poisoned")?[&target].clone();
        match server.do_command(command.clone()).await {
            Ok(output) => return Ok(output),
            Err(DoCommandError::NotLeader { leader: Some(leader) }) => target = leader,
            Err(DoCommandError::NotLeader { leader: None }) | Err(DoCommandError::TermChanged) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err("Gave up looking for the leader".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger();
    let names = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
    let servers: Directory = Arc::default();

    for name in &names {
        let mut commands = CommandRegistry::new();
        commands.register::<Put>("kv:put")?;
        commands.register::<Get>("kv:get")?;

        let server = raft::try_create_raft_server(RaftServerConfig {
            name: name.clone(),
            members: names.clone(),
            storage: StorageConfig::InMemory,
            logger: logger.clone(),
            options: RaftOptions::default(),
            transporter: Arc::new(InProcessTransport {
                servers: servers.clone(),
            }),
            state_machine: KvStore::default(),
            commands,
        })
        .await?;
        servers.write().map_err(|_| "Server directory poisoned")?.insert(name.clone(), server);
    }

    let put = Put {
        key: "greeting".into(),
        value: "hello".into(),
    };
    do_command(&servers, names[0].clone(), put).await?;
    let output = do_command(&servers, names[1].clone(), Get { key: "greeting".into() }).await?;
    println!("greeting = {:?}", output);

    for name in &names {
        let server = servers.read().map_err(|_| "Server directory poisoned")?[name].clone();
        let status = server.status().await?;
        println!(
            "{}: {:?} term={} commit={} leader={:?}",
            status.name, status.role, status.term, status.commit_index, status.leader
        );
    }

    Ok(())
}
