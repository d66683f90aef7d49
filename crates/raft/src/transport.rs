//! # transport
//!
//! why: keep the rpc framing out of the consensus core
//! relations: Transport is consumed by server.rs; LocalNetwork wires whole
//!            in-process clusters together for tests and demos
//! what: Transport trait, RaftService trait, LocalNetwork with partitioning

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::RaftError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::node::NodeId;

/// Outbound rpc surface the consensus core calls into.
///
/// Calls are synchronous and run on worker-pool threads, never under the
/// consensus lock. A real implementation would marshal over the wire; the
/// framing itself is out of scope here.
pub trait Transport: Send + Sync {
    fn request_vote(&self, target: NodeId, req: &VoteRequest) -> Result<VoteResponse, RaftError>;

    fn append_entries(
        &self,
        target: NodeId,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError>;
}

/// Inbound rpc surface a node exposes. Implemented by the server runtime and
/// registered with whatever transport delivers requests to it.
pub trait RaftService: Send + Sync {
    fn on_request_vote(&self, req: &VoteRequest) -> VoteResponse;

    fn on_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse;
}

/// An in-process cluster fabric.
///
/// Every node registers itself under its id; outbound calls are direct method
/// calls on the target's [`RaftService`]. Individual nodes can be isolated to
/// simulate partitions: an isolated node can neither send nor receive.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<dyn RaftService>>>,
    isolated: Mutex<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, service: Arc<dyn RaftService>) {
        self.nodes.write().insert(id, service);
    }

    /// Cut every link to and from the node.
    pub fn isolate(&self, id: NodeId) {
        self.isolated.lock().insert(id);
    }

    /// Restore the node's links.
    pub fn reconnect(&self, id: NodeId) {
        self.isolated.lock().remove(&id);
    }

    fn link_up(&self, a: NodeId, b: NodeId) -> bool {
        let isolated = self.isolated.lock();
        !isolated.contains(&a) && !isolated.contains(&b)
    }

    /// A [`Transport`] handle bound to one node's view of the network.
    pub fn transport_for(net: &Arc<Self>, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalPeer { net: Arc::clone(net), from })
    }

    fn call<T>(
        &self,
        from: NodeId,
        target: NodeId,
        f: impl FnOnce(&dyn RaftService) -> T,
    ) -> Result<T, RaftError> {
        if !self.link_up(from, target) {
            return Err(RaftError::Unreachable(target));
        }
        let service = self
            .nodes
            .read()
            .get(&target)
            .cloned()
            .ok_or(RaftError::Unreachable(target))?;
        Ok(f(service.as_ref()))
    }
}

struct LocalPeer {
    net: Arc<LocalNetwork>,
    from: NodeId,
}

impl Transport for LocalPeer {
    fn request_vote(&self, target: NodeId, req: &VoteRequest) -> Result<VoteResponse, RaftError> {
        self.net.call(self.from, target, |svc| svc.on_request_vote(req))
    }

    fn append_entries(
        &self,
        target: NodeId,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.net.call(self.from, target, |svc| svc.on_append_entries(req))
    }
}
