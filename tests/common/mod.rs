#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use raft::{
    ApplyContext, BoxError, Command, CommandOutput, CommandRegistry, RaftOptions, RaftServer, RaftServerConfig,
    RaftStatus, RpcHandlerError, StateMachine, StorageConfig, TransportError, Transporter,
};
use serde::{Deserialize, Serialize};
use slog::Drain;
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(20);

// ------- State machine --------

/// One applied `cmd_1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Applied {
    pub index: u64,
    pub val: String,
    pub i: u64,
}

/// Records every applied `cmd_1` and sums every `cmd_2`. Tests peek at the state through a shared
/// handle, since the server owns the state machine itself.
#[derive(Clone, Default)]
pub struct RecordingStore {
    state: Arc<Mutex<RecordedState>>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct RecordedState {
    records: Vec<Applied>,
    total: u64,
}

impl RecordingStore {
    pub fn records(&self) -> Vec<Applied> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn values(&self) -> Vec<u64> {
        self.records().into_iter().map(|applied| applied.i).collect()
    }

    pub fn total(&self) -> u64 {
        self.state.lock().unwrap().total
    }
}

impl StateMachine for RecordingStore {
    fn save(&self) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(&*self.state.lock().unwrap())?)
    }

    fn recovery(&mut self, state: &[u8]) -> Result<(), BoxError> {
        let restored: RecordedState = serde_json::from_slice(state)?;
        *self.state.lock().unwrap() = restored;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cmd1 {
    pub val: String,
    pub i: u64,
}

impl Command<RecordingStore> for Cmd1 {
    fn name(&self) -> &str {
        "cmd_1"
    }

    fn apply(&self, context: &mut ApplyContext<'_, RecordingStore>) -> Result<CommandOutput, BoxError> {
        let index = context.index();
        let mut state = context.state_machine().state.lock().unwrap();
        state.records.push(Applied {
            index,
            val: self.val.clone(),
            i: self.i,
        });
        Ok(CommandOutput::Data(Bytes::from(state.records.len().to_string())))
    }
}

/// Adds `x` to the running total. Zero is refused, so tests can watch an apply failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cmd2 {
    pub x: u64,
}

impl Command<RecordingStore> for Cmd2 {
    fn name(&self) -> &str {
        "cmd_2"
    }

    fn apply(&self, context: &mut ApplyContext<'_, RecordingStore>) -> Result<CommandOutput, BoxError> {
        if self.x == 0 {
            return Err("x must be non-zero".into());
        }
        let mut state = context.state_machine().state.lock().unwrap();
        state.total += self.x;
        Ok(CommandOutput::Data(Bytes::from(state.total.to_string())))
    }
}

pub fn cmd(i: u64) -> Cmd1 {
    Cmd1 { val: "x".into(), i }
}

pub fn commands() -> CommandRegistry<RecordingStore> {
    let mut registry = CommandRegistry::new();
    registry.register::<Cmd1>("cmd_1").unwrap();
    registry.register::<Cmd2>("cmd_2").unwrap();
    registry
}

// ------- Network --------

/// In-process network. Links can be cut one direction at a time.
#[derive(Clone, Default)]
pub struct TestNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    servers: BTreeMap<String, RaftServer<RecordingStore>>,
    cut_links: HashSet<(String, String)>,
    killed: HashSet<String>,
}

impl TestNetwork {
    pub fn transporter_for(&self, name: &str) -> Arc<dyn Transporter> {
        Arc::new(TestTransporter {
            from: name.to_string(),
            network: self.clone(),
        })
    }

    pub fn register(&self, server: RaftServer<RecordingStore>) {
        let mut state = self.inner.lock().unwrap();
        state.killed.remove(server.name());
        state.servers.insert(server.name().to_string(), server);
    }

    /// Drop every message from `from` to `to`.
    pub fn cut(&self, from: &str, to: &str) {
        self.inner
            .lock()
            .unwrap()
            .cut_links
            .insert((from.to_string(), to.to_string()));
    }

    pub fn isolate(&self, name: &str) {
        let others: Vec<String> = self.names().into_iter().filter(|other| other != name).collect();
        for other in others {
            self.cut(name, &other);
            self.cut(&other, name);
        }
    }

    pub fn heal(&self) {
        self.inner.lock().unwrap().cut_links.clear();
    }

    /// Stop the server and drop all traffic to and from it.
    pub async fn kill(&self, name: &str) {
        let server = {
            let mut state = self.inner.lock().unwrap();
            state.killed.insert(name.to_string());
            state.servers.get(name).cloned()
        };
        if let Some(server) = server {
            let _ = server.stop().await;
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().servers.keys().cloned().collect()
    }

    pub fn server(&self, name: &str) -> RaftServer<RecordingStore> {
        self.inner.lock().unwrap().servers[name].clone()
    }

    fn route(&self, from: &str, to: &str) -> Result<RaftServer<RecordingStore>, TransportError> {
        let state = self.inner.lock().unwrap();
        if state.killed.contains(from) || state.killed.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        if state.cut_links.contains(&(from.to_string(), to.to_string())) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        state
            .servers
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }

    // Responses travel back over the reverse link.
    fn check_return_path(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.route(to, from).map(|_| ())
    }
}

struct TestTransporter {
    from: String,
    network: TestNetwork,
}

fn rejected(peer: &str, e: RpcHandlerError) -> TransportError {
    TransportError::Rejected(peer.to_string(), e.to_string())
}

#[async_trait]
impl Transporter for TestTransporter {
    async fn send_vote_request(
        &self,
        peer: &str,
        request: raft::RequestVoteRequest,
    ) -> Result<raft::RequestVoteResponse, TransportError> {
        let server = self.network.route(&self.from, peer)?;
        let response = server.request_vote(request).await.map_err(|e| rejected(peer, e))?;
        self.network.check_return_path(&self.from, peer)?;
        Ok(response)
    }

    async fn send_append_entries_request(
        &self,
        peer: &str,
        request: raft::AppendEntriesRequest,
    ) -> Result<raft::AppendEntriesResponse, TransportError> {
        let server = self.network.route(&self.from, peer)?;
        let response = server.append_entries(request).await.map_err(|e| rejected(peer, e))?;
        self.network.check_return_path(&self.from, peer)?;
        Ok(response)
    }

    async fn send_snapshot_request(
        &self,
        peer: &str,
        request: raft::SnapshotRequest,
    ) -> Result<raft::SnapshotResponse, TransportError> {
        let server = self.network.route(&self.from, peer)?;
        let response = server.snapshot(request).await.map_err(|e| rejected(peer, e))?;
        self.network.check_return_path(&self.from, peer)?;
        Ok(response)
    }

    async fn send_snapshot_recovery_request(
        &self,
        peer: &str,
        request: raft::SnapshotRecoveryRequest,
    ) -> Result<raft::SnapshotRecoveryResponse, TransportError> {
        let server = self.network.route(&self.from, peer)?;
        let response = server.snapshot_recovery(request).await.map_err(|e| rejected(peer, e))?;
        self.network.check_return_path(&self.from, peer)?;
        Ok(response)
    }
}

// ------- Cluster --------

pub struct TestCluster {
    pub network: TestNetwork,
    pub stores: BTreeMap<String, RecordingStore>,
}

pub fn options() -> RaftOptions {
    RaftOptions {
        heartbeat_interval: Some(HEARTBEAT),
        election_min_timeout: Some(Duration::from_millis(150)),
        election_max_timeout: Some(Duration::from_millis(300)),
        rpc_timeout: Some(Duration::from_millis(15)),
        command_timeout: Some(Duration::from_secs(2)),
        ..RaftOptions::default()
    }
}

impl TestCluster {
    pub async fn start(names: &[&str], options: RaftOptions) -> TestCluster {
        let mut cluster = TestCluster {
            network: TestNetwork::default(),
            stores: BTreeMap::new(),
        };
        let members: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        for name in names {
            cluster.add_server(name, members.clone(), options.clone()).await;
        }
        cluster
    }

    /// Start a server that knows about `members`, which may or may not include itself.
    pub async fn add_server(&mut self, name: &str, members: Vec<String>, options: RaftOptions) {
        let store = RecordingStore::default();
        let server = raft::try_create_raft_server(RaftServerConfig {
            name: name.to_string(),
            members,
            storage: StorageConfig::InMemory,
            logger: create_root_logger_for_stdout(name.to_string()),
            options,
            transporter: self.network.transporter_for(name),
            state_machine: store.clone(),
            commands: commands(),
        })
        .await
        .expect("server should start");

        self.network.register(server);
        self.stores.insert(name.to_string(), store);
    }

    pub fn server(&self, name: &str) -> RaftServer<RecordingStore> {
        self.network.server(name)
    }

    pub fn store(&self, name: &str) -> &RecordingStore {
        &self.stores[name]
    }

    pub async fn status(&self, name: &str) -> RaftStatus {
        self.server(name).status().await.expect("status")
    }

    /// Wait until exactly one of `candidates` is leader and the others agree on it.
    pub async fn wait_for_leader(&self, candidates: &[&str], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leaders = HashSet::new();
            let mut agreed = true;
            for name in candidates {
                let status = self.status(name).await;
                if status.role == raft::RaftRole::Leader {
                    leaders.insert(name.to_string());
                }
                match &status.leader {
                    Some(leader) => {
                        leaders.insert(leader.clone());
                    }
                    None => agreed = false,
                }
            }
            if agreed && leaders.len() == 1 {
                let leader = leaders.into_iter().next().unwrap();
                if candidates.contains(&leader.as_str()) {
                    return leader;
                }
            }

            assert!(Instant::now() < deadline, "Timeout waiting for leader among {:?}", candidates);
            tokio::time::sleep(HEARTBEAT).await;
        }
    }

    /// Wait until every named server has applied `expected` (as `i` values, in order).
    pub async fn wait_for_values(&self, names: &[&str], expected: &[u64], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if names.iter().all(|name| self.store(name).values() == expected) {
                return;
            }

            if Instant::now() >= deadline {
                let actual: Vec<(&&str, Vec<u64>)> =
                    names.iter().map(|name| (name, self.store(name).values())).collect();
                panic!("Timeout waiting for {:?}. Applied: {:?}", expected, actual);
            }
            tokio::time::sleep(HEARTBEAT).await;
        }
    }
}

pub fn create_root_logger_for_stdout(server_name: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!("Test" => server_name))
}

pub fn create_root_logger_for_file(directory: &std::path::Path, server_name: String) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    let log_path = directory.join(format!("{}_{}_info.log", server_name, now));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Test" => server_name))
}
