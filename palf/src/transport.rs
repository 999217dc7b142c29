//! Transport seam between replicas.
//!
//! The engine never opens connections itself. Outgoing messages go through a
//! [`LogTransport`]; incoming ones are dispatched to the [`ReplicaEndpoint`]
//! registered for `(node, group)`. A real deployment plugs an RPC layer in
//! here. [`InMemoryNetwork`] delivers messages in-process and can isolate
//! nodes or cut single links, which is what the cluster tests use to provoke
//! elections and stale leaders.
//!
//! Single-core design: no `Send` bounds, endpoints are `Rc`-owned replicas
//! registered through `Weak` references so the network never keeps a removed
//! replica alive.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use tracing::trace;

use crate::error::PalfError;
use crate::messages::{
    ChangeLeaderRequest, FetchLogRequest, FetchLogResponse, PrepareRequest, PrepareResponse,
    PushLogRequest, PushLogResponse,
};
use crate::types::{GroupId, NodeId};

/// Receiving side of a replica.
#[async_trait(?Send)]
pub trait ReplicaEndpoint {
    /// Handle groups pushed by a leader.
    fn on_push_log(&self, request: PushLogRequest) -> Result<PushLogResponse, PalfError>;

    /// Handle a campaign's prepare.
    fn on_prepare(&self, request: PrepareRequest) -> Result<PrepareResponse, PalfError>;

    /// Serve groups to a replica catching up.
    fn on_fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse, PalfError>;

    /// Campaign on behalf of the current leader.
    async fn on_change_leader(&self, request: ChangeLeaderRequest) -> Result<(), PalfError>;
}

/// Sending side, shared by every replica of a node.
#[async_trait(?Send)]
pub trait LogTransport {
    /// Route messages for `(node, group)` to `endpoint`.
    fn register(&self, node: NodeId, group: GroupId, endpoint: Weak<dyn ReplicaEndpoint>);

    /// Stop routing messages for `(node, group)`.
    fn unregister(&self, node: NodeId, group: GroupId);

    /// Push groups from `from` to `to`.
    async fn push_log(
        &self,
        from: NodeId,
        to: NodeId,
        request: PushLogRequest,
    ) -> Result<PushLogResponse, PalfError>;

    /// Send a prepare from `from` to `to`.
    async fn prepare(
        &self,
        from: NodeId,
        to: NodeId,
        request: PrepareRequest,
    ) -> Result<PrepareResponse, PalfError>;

    /// Pull groups from `to`.
    async fn fetch_log(
        &self,
        from: NodeId,
        to: NodeId,
        request: FetchLogRequest,
    ) -> Result<FetchLogResponse, PalfError>;

    /// Ask `to` to take over leadership.
    async fn change_leader(
        &self,
        from: NodeId,
        to: NodeId,
        request: ChangeLeaderRequest,
    ) -> Result<(), PalfError>;
}

/// In-process [`LogTransport`] with fault injection.
///
/// Each delivery yields to the executor once on the way in and once on the
/// way out, so concurrent fan-outs interleave the way remote calls would.
#[derive(Default)]
pub struct InMemoryNetwork {
    endpoints: RefCell<HashMap<(NodeId, GroupId), Weak<dyn ReplicaEndpoint>>>,
    isolated: RefCell<HashSet<NodeId>>,
    blocked: RefCell<HashSet<(NodeId, NodeId)>>,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Drop every message to or from `node`.
    pub fn isolate(&self, node: NodeId) {
        self.isolated.borrow_mut().insert(node);
    }

    /// Undo [`InMemoryNetwork::isolate`].
    pub fn reconnect(&self, node: NodeId) {
        self.isolated.borrow_mut().remove(&node);
    }

    /// Drop messages between `a` and `b`, both directions.
    pub fn block_link(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.borrow_mut();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Remove every fault.
    pub fn heal(&self) {
        self.isolated.borrow_mut().clear();
        self.blocked.borrow_mut().clear();
    }

    fn route(
        &self,
        from: NodeId,
        to: NodeId,
        group: GroupId,
    ) -> Result<Rc<dyn ReplicaEndpoint>, PalfError> {
        {
            let isolated = self.isolated.borrow();
            if isolated.contains(&from) || isolated.contains(&to) {
                trace!(%from, %to, "message dropped: isolated");
                return Err(PalfError::Transport(format!("{to} unreachable from {from}")));
            }
        }
        if self.blocked.borrow().contains(&(from, to)) {
            trace!(%from, %to, "message dropped: link blocked");
            return Err(PalfError::Transport(format!("{to} unreachable from {from}")));
        }
        self.endpoints
            .borrow()
            .get(&(to, group))
            .and_then(Weak::upgrade)
            .ok_or_else(|| PalfError::Transport(format!("no {group} on {to}")))
    }

    /// The link must still be up when the answer travels back.
    fn deliver_back<T>(&self, from: NodeId, to: NodeId, reply: T) -> Result<T, PalfError> {
        let isolated = self.isolated.borrow();
        if isolated.contains(&from)
            || isolated.contains(&to)
            || self.blocked.borrow().contains(&(to, from))
        {
            return Err(PalfError::Transport(format!("reply from {to} lost")));
        }
        Ok(reply)
    }
}

#[async_trait(?Send)]
impl LogTransport for InMemoryNetwork {
    fn register(&self, node: NodeId, group: GroupId, endpoint: Weak<dyn ReplicaEndpoint>) {
        self.endpoints.borrow_mut().insert((node, group), endpoint);
    }

    fn unregister(&self, node: NodeId, group: GroupId) {
        self.endpoints.borrow_mut().remove(&(node, group));
    }

    async fn push_log(
        &self,
        from: NodeId,
        to: NodeId,
        request: PushLogRequest,
    ) -> Result<PushLogResponse, PalfError> {
        tokio::task::yield_now().await;
        let endpoint = self.route(from, to, request.group_id)?;
        let reply = endpoint.on_push_log(request)?;
        tokio::task::yield_now().await;
        self.deliver_back(from, to, reply)
    }

    async fn prepare(
        &self,
        from: NodeId,
        to: NodeId,
        request: PrepareRequest,
    ) -> Result<PrepareResponse, PalfError> {
        tokio::task::yield_now().await;
        let endpoint = self.route(from, to, request.group_id)?;
        let reply = endpoint.on_prepare(request)?;
        tokio::task::yield_now().await;
        self.deliver_back(from, to, reply)
    }

    async fn fetch_log(
        &self,
        from: NodeId,
        to: NodeId,
        request: FetchLogRequest,
    ) -> Result<FetchLogResponse, PalfError> {
        tokio::task::yield_now().await;
        let endpoint = self.route(from, to, request.group_id)?;
        let reply = endpoint.on_fetch_log(request)?;
        tokio::task::yield_now().await;
        self.deliver_back(from, to, reply)
    }

    async fn change_leader(
        &self,
        from: NodeId,
        to: NodeId,
        request: ChangeLeaderRequest,
    ) -> Result<(), PalfError> {
        tokio::task::yield_now().await;
        let endpoint = self.route(from, to, request.group_id)?;
        endpoint.on_change_leader(request).await?;
        self.deliver_back(from, to, ())
    }
}
