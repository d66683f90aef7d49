//! # comprehensive extent tests
//!
//! why: verify the extent protocol end to end over a live raft runtime
//! relations: drives ReplicatedExtentServer through RaftServer + LocalNetwork
//! what: full protocol round trips, leader-only writes, replica convergence

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use extentfs_extent::{
    ExtentError, ExtentStateMachine, ReplicatedExtentServer, TYPE_DIR, TYPE_FILE,
};
use extentfs_raft::{LocalNetwork, RaftConfig, RaftServer, RaftService};
use extentfs_raft_storage::MemStorage;

struct Cluster {
    rafts: Vec<Arc<RaftServer<ExtentStateMachine>>>,
    machines: Vec<Arc<ExtentStateMachine>>,
    servers: Vec<ReplicatedExtentServer>,
}

impl Cluster {
    fn start(size: u64) -> Self {
        let net = LocalNetwork::new();
        let ids: Vec<u64> = (1..=size).collect();
        let mut rafts = Vec::new();
        let mut machines = Vec::new();
        let mut servers = Vec::new();
        for &id in &ids {
            let machine = Arc::new(ExtentStateMachine::new());
            let raft = RaftServer::new(
                id,
                ids.clone(),
                RaftConfig::default(),
                Box::new(MemStorage::new()),
                LocalNetwork::transport_for(&net, id),
                Arc::clone(&machine),
            )
            .unwrap();
            net.register(id, Arc::clone(&raft) as Arc<dyn RaftService>);
            servers.push(ReplicatedExtentServer::new(Arc::clone(&raft), Arc::clone(&machine)));
            rafts.push(raft);
            machines.push(machine);
        }
        for raft in &rafts {
            RaftServer::start(raft);
        }
        Self { rafts, machines, servers }
    }

    fn stop(&self) {
        for raft in &self.rafts {
            raft.stop();
        }
    }

    fn wait_for_leader(&self) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(i) = self.rafts.iter().position(|r| r.is_leader().0) {
                return i;
            }
            thread::sleep(Duration::from_millis(25));
        }
        self.stop();
        panic!("no leader elected");
    }
}

#[test]
fn full_protocol_round_trip_on_a_single_node() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_for_leader();
    let server = &cluster.servers[leader];

    let id = server.create(TYPE_FILE).unwrap();
    assert_eq!(id, 2); // 1 is the root directory

    server.put(id, b"extent body".to_vec()).unwrap();
    assert_eq!(server.get(id).unwrap(), b"extent body".to_vec());

    let attr = server.getattr(id).unwrap();
    assert_eq!(attr.file_type, TYPE_FILE);
    assert_eq!(attr.size, 11);

    server.remove(id).unwrap();
    // reads of a missing extent answer empty, matching every other replica
    assert!(server.get(id).unwrap().is_empty());
    assert_eq!(server.getattr(id).unwrap().file_type, 0);

    cluster.stop();
}

#[test]
fn root_directory_is_always_present() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_for_leader();
    let server = &cluster.servers[leader];

    let attr = server.getattr(1).unwrap();
    assert_eq!(attr.file_type, TYPE_DIR);

    cluster.stop();
}

#[test]
fn followers_refuse_mutations() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    for (i, server) in cluster.servers.iter().enumerate() {
        if i == leader {
            continue;
        }
        assert!(matches!(
            server.create(TYPE_FILE),
            Err(ExtentError::NotLeader)
        ));
    }
    cluster.stop();
}

#[test]
fn mutations_reach_every_replica() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader();

    let id = cluster.servers[leader].create(TYPE_FILE).unwrap();
    cluster.servers[leader].put(id, b"replicated".to_vec()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let converged = cluster.machines.iter().all(|m| {
            m.with_store(|s| s.get(id).ok() == Some(b"replicated".to_vec()))
        });
        if converged {
            break;
        }
        if Instant::now() >= deadline {
            cluster.stop();
            panic!("replicas never converged");
        }
        thread::sleep(Duration::from_millis(25));
    }
    cluster.stop();
}

#[test]
fn creates_allocate_distinct_increasing_ids() {
    let cluster = Cluster::start(1);
    let leader = cluster.wait_for_leader();
    let server = &cluster.servers[leader];

    let a = server.create(TYPE_FILE).unwrap();
    let b = server.create(TYPE_DIR).unwrap();
    let c = server.create(TYPE_FILE).unwrap();
    assert_eq!((a, b, c), (2, 3, 4));

    cluster.stop();
}
