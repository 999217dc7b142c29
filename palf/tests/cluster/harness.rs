//! Cluster construction and polling helpers shared by the scenarios.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use palf::{
    AppendOptions, GroupId, GroupMember, InMemoryLogStorage, InMemoryNetwork, LocationCacheCb,
    Lsn, NodeId, PalfConfig, PalfEnv, PalfHandle, Role, Scn,
};

/// Group every scenario replicates.
pub const GROUP: GroupId = GroupId(1001);

/// Timeout of blocking calls expected to succeed.
pub const OK_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout of blocking calls expected to time out.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(200);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

pub fn blocking() -> AppendOptions {
    AppendOptions::blocking(OK_TIMEOUT)
}

pub fn members(ids: &[u64]) -> Vec<GroupMember> {
    ids.iter().map(|id| GroupMember::new(NodeId(*id))).collect()
}

// ============================================================================
// Cluster
// ============================================================================

pub struct Node {
    pub env: Rc<PalfEnv<InMemoryLogStorage>>,
    pub handle: PalfHandle<InMemoryLogStorage>,
    pub storage: InMemoryLogStorage,
}

/// Nodes `1..=n`, each hosting [`GROUP`], on one network.
pub struct Cluster {
    pub network: Rc<InMemoryNetwork>,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// `n` nodes, all acceptors, `replica_num == n`.
    pub fn new(n: u64) -> Self {
        let acceptors: Vec<u64> = (1..=n).collect();
        Self::with_members(n, &acceptors, PalfConfig::for_testing())
    }

    /// `n` nodes; only `acceptors` get the initial member list, the other
    /// nodes wait to be added.
    pub fn with_members(n: u64, acceptors: &[u64], config: PalfConfig) -> Self {
        init_tracing();
        let network = InMemoryNetwork::new();
        let mut nodes = Vec::new();
        for id in 1..=n {
            let storage = InMemoryLogStorage::new();
            let shared = storage.clone();
            let env = PalfEnv::new(NodeId(id), config.clone(), network.clone(), move |_| {
                shared.clone()
            })
            .expect("env");
            let handle = env.create(GROUP).expect("create group");
            if acceptors.contains(&id) {
                handle
                    .set_initial_member_list(members(acceptors), acceptors.len())
                    .expect("initial member list");
            }
            nodes.push(Node {
                env,
                handle,
                storage,
            });
        }
        Self { network, nodes }
    }

    pub fn node(&self, id: u64) -> &Node {
        &self.nodes[(id - 1) as usize]
    }

    pub fn handle(&self, id: u64) -> &PalfHandle<InMemoryLogStorage> {
        &self.node(id).handle
    }

    /// Make `id` the leader and wait for its reconfirm entry to commit.
    pub async fn elect(&self, id: u64) {
        self.handle(id).campaign().await.expect("campaign");
        let (role, _, pending) = self.handle(id).get_role().expect("role");
        assert_eq!(role, Role::Leader);
        assert!(!pending, "reconfirmed after campaign");
    }

    /// Blocking append through `id` of `payload`.
    pub async fn append(&self, id: u64, payload: &[u8]) -> (Lsn, Scn) {
        self.handle(id)
            .append(blocking(), payload.to_vec(), Scn::MIN)
            .await
            .expect("append")
    }

    /// Data payloads `id` holds from the beginning of its log.
    pub fn raw_payloads(&self, id: u64) -> Vec<Vec<u8>> {
        let begin = self.handle(id).get_begin_lsn().expect("begin");
        self.handle(id)
            .seek_raw(begin)
            .expect("seek")
            .map(|entry| entry.expect("entry").data)
            .collect()
    }

    /// Committed data payloads `id` holds from the beginning of its log.
    pub fn committed_payloads(&self, id: u64) -> Vec<Vec<u8>> {
        let begin = self.handle(id).get_begin_lsn().expect("begin");
        self.handle(id)
            .seek(begin)
            .expect("seek")
            .map(|entry| entry.expect("entry").data)
            .collect()
    }

    /// The reconfirmed leader, if exactly one node claims to be it.
    pub fn leader(&self) -> Option<u64> {
        let leaders: Vec<u64> = (1..=self.nodes.len() as u64)
            .filter(|id| {
                matches!(
                    self.handle(*id).get_role(),
                    Ok((Role::Leader, _, false))
                )
            })
            .collect();
        match leaders.as_slice() {
            [leader] => Some(*leader),
            _ => None,
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Location cache recorder
// ============================================================================

/// Records every leader change a replica reports.
#[derive(Default)]
pub struct LeaderRecorder {
    pub events: RefCell<Vec<(GroupId, Option<NodeId>)>>,
}

impl LocationCacheCb for LeaderRecorder {
    fn on_leader_changed(&self, group_id: GroupId, leader: Option<NodeId>) {
        self.events.borrow_mut().push((group_id, leader));
    }
}
