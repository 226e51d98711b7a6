//! Handle to one registered node

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::SelectionWeights;
use crate::id::{Instance, NodeId};
use crate::link::{Link, LinkError};
use crate::mask::NodeMask;
use crate::wire::{Export, Frame, Location};

use super::status::{NodeFlags, NodeSnapshot, NodeState, Role, Usage};

/// What a node announced at login. Host, port and session id stay fixed
/// for the life of the record; the rest is replaced when the node logs in
/// again.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub session_id: Option<String>,
    pub role: Role,
    pub level: u8,
    pub exports: Vec<Export>,
}

impl NodeInfo {
    /// A reconnecting node is recognised by host, port and session id.
    pub fn same_identity(&self, other: &NodeInfo) -> bool {
        self.host == other.host && self.port == other.port && self.session_id == other.session_id
    }
}

struct Inner {
    id: NodeId,
    slot: usize,
    info: RwLock<NodeInfo>,
    state: Mutex<NodeState>,
}

/// Shared handle to a registered node. Cloning is cheap; every clone sees
/// the same record behind the same lock.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        slot: usize,
        info: NodeInfo,
        link: Arc<dyn Link>,
        config_id: u32,
    ) -> Self {
        let state = NodeState::new(link, config_id);
        Node {
            inner: Arc::new(Inner {
                id,
                slot,
                info: RwLock::new(info),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn slot(&self) -> usize {
        self.inner.slot
    }

    pub fn mask(&self) -> NodeMask {
        NodeMask::slot(self.inner.slot)
    }

    pub fn info(&self) -> NodeInfo {
        self.inner.info.read().clone()
    }

    pub fn host(&self) -> String {
        self.inner.info.read().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.info.read().port
    }

    pub fn role(&self) -> Role {
        self.inner.info.read().role
    }

    pub fn level(&self) -> u8 {
        self.inner.info.read().level
    }

    pub(crate) fn same_identity(&self, info: &NodeInfo) -> bool {
        self.inner.info.read().same_identity(info)
    }

    /// Swap in what the node announced on its latest login.
    pub(crate) fn replace_info(&self, info: NodeInfo) {
        *self.inner.info.write() = info;
    }

    pub fn instance(&self) -> Instance {
        self.inner.state.lock().instance
    }

    pub fn flags(&self) -> NodeFlags {
        self.inner.state.lock().flags
    }

    pub fn usage(&self) -> Usage {
        self.inner.state.lock().usage
    }

    pub fn link(&self) -> Arc<dyn Link> {
        self.inner.state.lock().link.clone()
    }

    /// Whether `link` is the one the node currently talks over. A node that
    /// reconnected has moved on to a new link.
    pub fn is_current_link(&self, link: &Arc<dyn Link>) -> bool {
        let current = self.link();
        std::ptr::addr_eq(Arc::as_ptr(&current), Arc::as_ptr(link))
    }

    pub fn is_same(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` under the node lock.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(&mut state)
    }

    /// Run `f` under the node lock and return the change in the node's
    /// (active, staging) contribution to the cluster counters.
    pub(crate) fn change(&self, f: impl FnOnce(&mut NodeState)) -> (i32, i32) {
        let mut state = self.inner.state.lock();
        let before = state.flags.contribution();
        f(&mut state);
        let after = state.flags.contribution();
        (after.0 - before.0, after.1 - before.1)
    }

    /// Apply a capacity change and recompute the node's cost.
    pub(crate) fn update_capacity(
        &self,
        weights: &SelectionWeights,
        f: impl FnOnce(&mut super::status::Capacity),
    ) {
        let level = self.level();
        self.with_state(|state| {
            f(&mut state.capacity);
            state.capacity.recompute(level, weights);
            state.last_seen = Utc::now();
        });
    }

    /// Replace the drop timer, cancelling the one already armed.
    pub(crate) fn arm_drop_timer(&self, token: Option<CancellationToken>) {
        let previous = self.with_state(|state| std::mem::replace(&mut state.drop_timer, token));
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let info = self.info();
        let state = self.inner.state.lock();
        NodeSnapshot {
            id: self.inner.id,
            slot: self.inner.slot,
            instance: state.instance,
            config_id: state.config_id,
            host: info.host,
            port: info.port,
            level: info.level,
            last_seen: state.last_seen,
            flags: state.flags,
            capacity: state.capacity,
            usage: state.usage,
        }
    }

    pub fn location(&self) -> Location {
        let info = self.info();
        Location {
            node: self.inner.id,
            host: info.host,
            port: info.port,
            writable: self.flags().read_write,
        }
    }

    /// Send raw bytes to the node. Offline nodes refuse all traffic.
    pub fn send(&self, data: Bytes) -> Result<(), LinkError> {
        let (link, offline) = self.with_state(|state| (state.link.clone(), state.flags.offline));
        if offline {
            return Err(LinkError::Closed(self.host()));
        }
        link.send(data)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        self.send(frame.encode())
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.inner.info.read();
        write!(f, "{} {}:{}", info.role, info.host, info.port)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.inner.info.read();
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("slot", &self.inner.slot)
            .field("host", &info.host)
            .field("port", &info.port)
            .finish()
    }
}

impl Eq for Node {}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
