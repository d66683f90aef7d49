//! # cluster tests
//!
//! why: verify whole clusters elect, replicate, and recover from partitions
//! relations: runs real RaftServer runtimes over LocalNetwork and MemStorage
//! what: election convergence, command replication, leader isolation

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use extentfs_raft::{
    LocalNetwork, LogEntry, RaftConfig, RaftError, RaftServer, RaftService,
    StateMachine,
};
use extentfs_raft_storage::MemStorage;

/// Records every applied entry, in order.
#[derive(Default)]
struct AppliedLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl AppliedLog {
    fn commands(&self) -> Vec<Vec<u8>> {
        self.entries.lock().iter().map(|e| e.command.clone()).collect()
    }
}

impl StateMachine for AppliedLog {
    fn apply(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

struct Cluster {
    net: Arc<LocalNetwork>,
    servers: Vec<Arc<RaftServer<AppliedLog>>>,
    machines: Vec<Arc<AppliedLog>>,
}

impl Cluster {
    fn start(size: u64) -> Self {
        let net = LocalNetwork::new();
        let ids: Vec<u64> = (1..=size).collect();
        let mut servers = Vec::new();
        let mut machines = Vec::new();
        for &id in &ids {
            let machine = Arc::new(AppliedLog::default());
            let server = RaftServer::new(
                id,
                ids.clone(),
                RaftConfig::default(),
                Box::new(MemStorage::new()),
                LocalNetwork::transport_for(&net, id),
                Arc::clone(&machine),
            )
            .unwrap();
            net.register(id, Arc::clone(&server) as Arc<dyn RaftService>);
            servers.push(server);
            machines.push(machine);
        }
        for server in &servers {
            RaftServer::start(server);
        }
        Self { net, servers, machines }
    }

    fn stop(&self) {
        for server in &self.servers {
            server.stop();
        }
    }

    /// Poll until exactly one reachable node claims leadership and every
    /// other reachable node acknowledges it.
    fn wait_for_leader_except(&self, excluded: Option<usize>) -> usize {
        self.wait_until("a leader to emerge", |c| {
            let mut claimants = c
                .servers
                .iter()
                .enumerate()
                .filter(|(i, s)| Some(*i) != excluded && s.is_leader().0)
                .map(|(i, _)| i);
            let idx = claimants.next()?;
            if claimants.next().is_some() {
                return None;
            }
            let id = (idx + 1) as u64;
            c.servers
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != excluded && *i != idx)
                .all(|(_, s)| s.status().leader_id == Some(id))
                .then_some(idx)
        })
    }

    fn wait_for_leader(&self) -> usize {
        self.wait_for_leader_except(None)
    }

    fn wait_until<T>(&self, what: &str, mut probe: impl FnMut(&Self) -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(out) = probe(self) {
                return out;
            }
            thread::sleep(Duration::from_millis(25));
        }
        self.stop();
        panic!("timed out waiting for {what}");
    }
}

#[test]
fn three_node_cluster_elects_exactly_one_leader() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    // give a competing candidate time to concede, then count leaders
    thread::sleep(Duration::from_millis(600));
    let leaders: Vec<usize> = cluster
        .servers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_leader().0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(leaders, vec![leader]);
    cluster.stop();
}

#[test]
fn command_is_replicated_committed_and_applied_once_everywhere() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    let (_, index) = cluster.servers[leader]
        .new_command(b"create /a".to_vec())
        .unwrap();

    cluster.wait_until("a majority to commit the entry", |c| {
        let committed = c
            .servers
            .iter()
            .filter(|s| s.status().commit_index >= index)
            .count();
        (committed >= 2).then_some(())
    });
    cluster.wait_until("every machine to apply the entry", |c| {
        c.machines
            .iter()
            .all(|m| m.commands() == vec![b"create /a".to_vec()])
            .then_some(())
    });

    // applied exactly once: no machine holds a duplicate
    for machine in &cluster.machines {
        assert_eq!(machine.commands().len(), 1);
    }
    cluster.stop();
}

#[test]
fn followers_reject_commands() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    for (i, server) in cluster.servers.iter().enumerate() {
        if i == leader {
            continue;
        }
        assert!(matches!(
            server.new_command(b"nope".to_vec()),
            Err(RaftError::NotLeader)
        ));
    }
    cluster.stop();
}

#[test]
fn isolated_leader_is_replaced_and_steps_down_on_reconnect() {
    let cluster = Cluster::start(3);
    let old_leader = cluster.wait_for_leader();
    let old_id = (old_leader + 1) as u64;

    cluster.net.isolate(old_id);
    let new_leader = cluster.wait_for_leader_except(Some(old_leader));
    assert_ne!(new_leader, old_leader);

    // commit something the deposed leader missed, so its log can never win
    let (_, index) = cluster.servers[new_leader]
        .new_command(b"while you were away".to_vec())
        .unwrap();
    cluster.wait_until("the new leader to commit", |c| {
        (c.servers[new_leader].status().commit_index >= index).then_some(())
    });

    cluster.net.reconnect(old_id);
    cluster.wait_until("the old leader to step down", |c| {
        (!c.servers[old_leader].is_leader().0).then_some(())
    });
    cluster.wait_until("the old leader to catch up", |c| {
        (c.machines[old_leader].commands() == vec![b"while you were away".to_vec()])
            .then_some(())
    });
    cluster.stop();
}

#[test]
fn single_node_cluster_leads_and_commits_alone() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_for_leader();
    assert_eq!(leader, 0);

    let (_, index) = cluster.servers[0].new_command(b"solo".to_vec()).unwrap();
    cluster.wait_until("the lone node to commit and apply", |c| {
        let status = c.servers[0].status();
        (status.commit_index >= index && status.last_applied >= index).then_some(())
    });
    assert_eq!(cluster.machines[0].commands(), vec![b"solo".to_vec()]);
    cluster.stop();
}

#[test]
fn log_converges_across_many_commands() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    let mut expected = Vec::new();
    for i in 0u8..10 {
        let cmd = vec![b'c', i];
        cluster.servers[leader].new_command(cmd.clone()).unwrap();
        expected.push(cmd);
    }

    cluster.wait_until("every machine to apply the full sequence", |c| {
        c.machines
            .iter()
            .all(|m| m.commands() == expected)
            .then_some(())
    });
    cluster.stop();
}
