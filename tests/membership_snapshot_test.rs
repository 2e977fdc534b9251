mod common;

use common::{cmd, commands, create_root_logger_for_file, options, RecordingStore, TestCluster, HEARTBEAT};
use raft::{
    AdminError, JoinCommand, RaftOptions, RaftRole, RaftServerConfig, StorageConfig, TransportError, Transporter,
};
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn joined_server_counts_towards_majority() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::start(&["a", "b", "c"], options()).await;
    let leader = cluster.wait_for_leader(&["a", "b", "c"], WAIT).await;
    cluster.server(&leader).do_command(cmd(1)).await?;

    // D only knows the current members. It doesn't campaign until it's been added.
    let original: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    cluster.add_server("d", original.clone(), options()).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let d_status = cluster.status("d").await;
    assert_eq!(d_status.role, RaftRole::Follower);
    assert_eq!(cluster.status(&leader).await.members, original);

    cluster
        .server(&leader)
        .do_command(JoinCommand { name: "d".into() })
        .await?;
    cluster.wait_for_values(&["a", "b", "c", "d"], &[1], WAIT).await;

    let expected_members = vec!["a", "b", "c", "d"];
    let deadline = Instant::now() + WAIT;
    loop {
        let mut all_agree = true;
        for name in &expected_members {
            all_agree &= cluster.status(name).await.members == expected_members;
        }
        if all_agree {
            break;
        }
        assert!(Instant::now() < deadline, "Members never converged");
        tokio::time::sleep(HEARTBEAT).await;
    }
    assert!(cluster.status(&leader).await.peers.iter().any(|peer| peer.name == "d"));

    // 4 members need 3 acks. With one original follower gone, D's ack is required.
    let followers: Vec<&str> = ["a", "b", "c"].iter().copied().filter(|name| *name != leader).collect();
    cluster.network.kill(followers[0]).await;
    cluster.server(&leader).do_command(cmd(2)).await?;
    cluster.wait_for_values(&[leader.as_str(), followers[1], "d"], &[1, 2], WAIT).await;

    // And with D unreachable too, there's no majority.
    cluster.network.isolate("d");
    let result = tokio::time::timeout(Duration::from_millis(500), cluster.server(&leader).do_command(cmd(3))).await;
    assert!(result.is_err(), "Command committed without a majority: {:?}", result);

    Ok(())
}

#[tokio::test]
async fn joining_server_counts_only_after_join_commits() -> Result<(), Box<dyn Error>> {
    let names = ["a", "b", "c"];
    let mut cluster = TestCluster::start(&names, options()).await;
    let leader = cluster.wait_for_leader(&names, WAIT).await;
    cluster.server(&leader).do_command(cmd(1)).await?;
    let original: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    cluster.add_server("d", original.clone(), options()).await;

    // Only D is reachable. D can't help commit its own join.
    for follower in names.iter().filter(|name| **name != leader) {
        cluster.network.cut(&leader, follower);
        cluster.network.cut(follower, &leader);
    }
    let commit_index_before = cluster.status(&leader).await.commit_index;
    let server = cluster.server(&leader);
    let result = tokio::time::timeout(
        Duration::from_millis(500),
        server.do_command(JoinCommand { name: "d".into() }),
    )
    .await;
    assert!(!matches!(result, Ok(Ok(_))), "Join committed with only D's ack: {:?}", result);
    let status = cluster.status(&leader).await;
    assert_eq!(status.members, original);
    assert_eq!(status.commit_index, commit_index_before);
    assert!(cluster.store("d").records().is_empty());

    // The join commits through the original members while D hears nothing.
    cluster.network.heal();
    cluster.network.isolate("d");
    let leader = cluster.wait_for_leader(&names, WAIT).await;
    cluster
        .server(&leader)
        .do_command(JoinCommand { name: "d".into() })
        .await?;
    assert_eq!(cluster.status(&leader).await.members, vec!["a", "b", "c", "d"]);

    // D catches up, then both original followers go away. Leader plus D is 2 of 4.
    cluster.network.heal();
    cluster.wait_for_values(&["d"], &[1], WAIT).await;
    for follower in names.iter().filter(|name| **name != leader) {
        cluster.network.kill(follower).await;
    }
    let commit_index_before = cluster.status(&leader).await.commit_index;
    let result = tokio::time::timeout(Duration::from_millis(500), cluster.server(&leader).do_command(cmd(2))).await;
    assert!(!matches!(result, Ok(Ok(_))), "Command committed with only D's ack: {:?}", result);
    assert_eq!(cluster.status(&leader).await.commit_index, commit_index_before);
    assert_eq!(cluster.store(&leader).values(), vec![1]);

    Ok(())
}

#[tokio::test]
async fn lagging_follower_catches_up_from_snapshot() -> Result<(), Box<dyn Error>> {
    let names = ["a", "b", "c"];
    let snapshot_options = RaftOptions {
        snapshot_threshold: Some(5),
        max_entries_per_request: Some(4),
        ..options()
    };
    let cluster = TestCluster::start(&names, snapshot_options).await;
    let leader = cluster.wait_for_leader(&names, WAIT).await;
    let followers: Vec<&str> = names.iter().copied().filter(|name| *name != leader).collect();
    let lagging = followers[0];

    cluster.server(&leader).do_command(cmd(1)).await?;
    cluster.wait_for_values(&names, &[1], WAIT).await;

    cluster.network.isolate(lagging);
    let expected: Vec<u64> = (1..=20).collect();
    for i in 2..=20 {
        cluster.server(&leader).do_command(cmd(i)).await?;
    }
    cluster.wait_for_values(&[leader.as_str(), followers[1]], &expected, WAIT).await;

    let leader_status = cluster.status(&leader).await;
    let lagging_status = cluster.status(lagging).await;
    assert!(
        leader_status.first_log_index > lagging_status.last_log_index + 1,
        "Leader log starts at {}, lagging follower has through {}",
        leader_status.first_log_index,
        lagging_status.last_log_index
    );

    cluster.network.heal();
    cluster.wait_for_values(&names, &expected, WAIT).await;
    assert_eq!(cluster.store(lagging).records(), cluster.store(&leader).records());

    // The lagging follower's higher term may have forced a new election.
    let leader = cluster.wait_for_leader(&names, WAIT).await;
    // Regular replication resumes after the snapshot.
    cluster.server(&leader).do_command(cmd(21)).await?;
    let expected: Vec<u64> = (1..=21).collect();
    cluster.wait_for_values(&names, &expected, WAIT).await;
    let lagging_status = cluster.status(lagging).await;
    assert_eq!(lagging_status.role, RaftRole::Follower);
    assert!(lagging_status.first_log_index > 1);

    Ok(())
}

#[tokio::test]
async fn manual_snapshot_compacts_log() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a"], options()).await;
    let leader = cluster.wait_for_leader(&["a"], WAIT).await;
    let server = cluster.server(&leader);

    for i in 1..=3 {
        server.do_command(cmd(i)).await?;
    }
    let snapshot = server.take_snapshot().await?;
    let status = server.status().await?;
    assert_eq!(snapshot.index, status.last_applied_index);
    assert_eq!(status.first_log_index, snapshot.index + 1);

    assert!(matches!(server.take_snapshot().await, Err(AdminError::NothingToSnapshot)));

    Ok(())
}

/// Single server cluster, so nothing ever needs to be sent.
struct NoPeers;

#[async_trait::async_trait]
impl Transporter for NoPeers {
    async fn send_vote_request(
        &self,
        peer: &str,
        _: raft::RequestVoteRequest,
    ) -> Result<raft::RequestVoteResponse, TransportError> {
        Err(TransportError::Unreachable(peer.to_string()))
    }

    async fn send_append_entries_request(
        &self,
        peer: &str,
        _: raft::AppendEntriesRequest,
    ) -> Result<raft::AppendEntriesResponse, TransportError> {
        Err(TransportError::Unreachable(peer.to_string()))
    }

    async fn send_snapshot_request(
        &self,
        peer: &str,
        _: raft::SnapshotRequest,
    ) -> Result<raft::SnapshotResponse, TransportError> {
        Err(TransportError::Unreachable(peer.to_string()))
    }

    async fn send_snapshot_recovery_request(
        &self,
        peer: &str,
        _: raft::SnapshotRecoveryRequest,
    ) -> Result<raft::SnapshotRecoveryResponse, TransportError> {
        Err(TransportError::Unreachable(peer.to_string()))
    }
}

async fn start_on_disk(
    directory: &std::path::Path,
    log_directory: &std::path::Path,
) -> Result<(raft::RaftServer<RecordingStore>, RecordingStore), Box<dyn Error>> {
    let store = RecordingStore::default();
    let server = raft::try_create_raft_server(RaftServerConfig {
        name: "solo".into(),
        members: vec!["solo".into()],
        storage: StorageConfig::Directory(directory.to_path_buf()),
        logger: create_root_logger_for_file(log_directory, "solo".into()),
        options: RaftOptions {
            snapshot_threshold: Some(3),
            ..options()
        },
        transporter: Arc::new(NoPeers),
        state_machine: store.clone(),
        commands: commands(),
    })
    .await?;

    Ok((server, store))
}

async fn wait_until_leader(server: &raft::RaftServer<RecordingStore>) {
    let deadline = Instant::now() + WAIT;
    while !matches!(server.status().await, Ok(status) if status.role == RaftRole::Leader) {
        assert!(Instant::now() < deadline, "Never became leader");
        tokio::time::sleep(HEARTBEAT).await;
    }
}

#[tokio::test]
async fn restart_restores_snapshot_and_log() -> Result<(), Box<dyn Error>> {
    let data = tempfile::tempdir()?;
    let logs = tempfile::tempdir()?;

    let (server, store) = start_on_disk(data.path(), logs.path()).await?;
    wait_until_leader(&server).await;
    let term_before = server.status().await?.term;
    for i in 1..=5 {
        server.do_command(cmd(i)).await?;
    }
    let status_before = server.status().await?;
    assert!(status_before.first_log_index > 1, "Expected a snapshot: {:?}", status_before);
    let records_before = store.records();
    server.stop().await?;
    drop(server);

    let (server, store) = start_on_disk(data.path(), logs.path()).await?;
    // Replayed before the server even starts taking requests.
    assert_eq!(store.records(), records_before);

    wait_until_leader(&server).await;
    let status_after = server.status().await?;
    assert!(status_after.term > term_before);
    assert!(status_after.last_log_index > status_before.last_log_index);

    server.do_command(cmd(6)).await?;
    assert_eq!(store.values(), vec![1, 2, 3, 4, 5, 6]);

    Ok(())
}
