use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ballot::raft::{
    FileLog, KvCommand, KvResult, NodeRole, RaftConfig, RaftError, RaftHandle, RaftLog,
};
use ballot::LocalCluster;

fn put(key: &str, value: &str) -> Vec<u8> {
    KvCommand::Put {
        key: key.into(),
        value: value.into(),
    }
    .encode()
}

async fn wait_applied(node: &RaftHandle, index: u64) {
    node.wait_for(Duration::from_secs(10), |s| s.last_applied >= index)
        .await
        .unwrap_or_else(|e| panic!("{} never applied {index}: {e}", node.address()));
}

#[tokio::test(start_paused = true)]
async fn submitted_commands_reach_every_node() {
    let cluster = LocalCluster::start(3, &RaftConfig::new("template")).expect("cluster");
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let first = leader.submit(put("a", "1")).await.expect("submit");
    assert_eq!(first.index, 1);
    let result: KvResult = serde_json::from_slice(&first.result).expect("kv result");
    assert_eq!(result.value, None);

    let second = leader.submit(put("a", "2")).await.expect("submit");
    let result: KvResult = serde_json::from_slice(&second.result).expect("kv result");
    assert_eq!(result.value.as_deref(), Some("1"));

    for i in 0..3 {
        cluster
            .submit(put(&format!("k{i}"), "v"), Duration::from_secs(5))
            .await
            .expect("submit");
    }

    for node in cluster.nodes() {
        wait_applied(node, 5).await;
        let state = node.status();
        assert_eq!(state.commit_index, 5);
        assert_eq!(state.current_leader.as_deref(), Some(leader.address()));
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn followers_refuse_submits() {
    let cluster = LocalCluster::start(3, &RaftConfig::new("template")).expect("cluster");
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    for node in cluster.nodes().iter().filter(|n| n.address() != leader.address()) {
        let err = node.submit(put("a", "1")).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader));
        assert_eq!(err.to_string(), "Not a leader.");
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn submit_fails_without_a_reachable_majority() {
    let cluster = LocalCluster::start(3, &RaftConfig::new("template")).expect("cluster");
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    for node in cluster.nodes().iter().filter(|n| n.address() != leader.address()) {
        cluster.fabric().isolate(node.address());
    }

    let err = leader.submit(put("a", "1")).await.unwrap_err();
    assert!(matches!(err, RaftError::QuorumUnreachable), "got {err:?}");
    assert_eq!(leader.status().commit_index, 0);
    assert_eq!(leader.status().role, NodeRole::Leader);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lagging_follower_catches_up_after_healing() {
    let cluster = LocalCluster::start(3, &RaftConfig::new("template")).expect("cluster");
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    let lagging = cluster
        .nodes()
        .iter()
        .find(|n| n.address() != leader.address())
        .cloned()
        .expect("a follower");

    cluster.fabric().isolate(lagging.address());
    for i in 0..3 {
        cluster
            .submit(put(&format!("k{i}"), "v"), Duration::from_secs(5))
            .await
            .expect("submit");
    }
    for node in cluster.nodes().iter().filter(|n| n.address() != lagging.address()) {
        wait_applied(node, 3).await;
    }
    assert_eq!(lagging.status().last_applied, 0);

    cluster.fabric().heal();
    wait_applied(&lagging, 3).await;

    // Everyone agrees on one leader again.
    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader");
    let state = lagging
        .wait_for(Duration::from_secs(10), |s| {
            s.current_leader.as_deref() == Some(leader.address())
        })
        .await
        .expect("follows");
    assert_eq!(state.role, NodeRole::Follower);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn replicated_entries_are_durable() {
    let dirs: BTreeMap<String, TempDir> = (1..=3)
        .map(|i| (format!("node-{i}"), TempDir::new().expect("tempdir")))
        .collect();

    let cluster = LocalCluster::start_with(3, &RaftConfig::new("template"), |address| {
        let dir = dirs.get(address).expect("dir for node");
        Arc::new(FileLog::open(dir.path()).expect("open log")) as Arc<dyn RaftLog>
    })
    .expect("cluster");

    for i in 0..3 {
        cluster
            .submit(put(&format!("k{i}"), "v"), Duration::from_secs(5))
            .await
            .expect("submit");
    }
    for node in cluster.nodes() {
        wait_applied(node, 3).await;
    }
    cluster.shutdown().await;

    for (address, dir) in &dirs {
        let log = FileLog::open(dir.path()).expect("reopen");
        assert_eq!(log.last_index().await.expect("last index"), 3, "{address}");
        let entries = log.entries(1, None).await.expect("entries");
        let command: KvCommand = serde_json::from_slice(&entries[2].command).expect("command");
        assert_eq!(
            command,
            KvCommand::Put {
                key: "k2".into(),
                value: "v".into()
            }
        );
    }
}
