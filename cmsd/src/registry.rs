//! Slot table of registered nodes and the masks derived from it.
//!
//! Lock order is registry then node: the registry lock may be held while a
//! node's lock is taken, never the other way round.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::id::NodeId;
use crate::link::Link;
use crate::mask::{MAX_NODES, NodeMask};
use crate::node::{LoginError, Node, NodeInfo};
use crate::select::{self, Criteria, Purpose};
use crate::wire::Frame;

#[cfg(test)]
#[path = "registry.test.rs"]
mod tests;

/// Result of a successful login.
pub struct Admission {
    pub node: Node,
    /// The node took back the slot it held before its link dropped.
    pub reconnected: bool,
    /// Link the node used before reconnecting, to be closed by the caller.
    pub previous_link: Option<Arc<dyn Link>>,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("node", &self.node)
            .field("reconnected", &self.reconnected)
            .field(
                "previous_link",
                &self.previous_link.as_ref().map(|link| link.host().to_string()),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
struct ExportEntry {
    prefix: String,
    readers: NodeMask,
    writers: NodeMask,
}

impl ExportEntry {
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }
}

struct Tables {
    slots: Vec<Option<Node>>,
    next_id: u32,
    members: NodeMask,
    subscribers: NodeMask,
    exports: Vec<ExportEntry>,
    presence: HashMap<String, NodeMask>,
}

impl Tables {
    fn holds(&self, node: &Node) -> bool {
        matches!(self.slots.get(node.slot()), Some(Some(held)) if held.is_same(node))
    }

    fn add_exports(&mut self, node: &Node) {
        let bit = node.mask();
        for export in &node.info().exports {
            let index = match self.exports.iter().position(|e| e.prefix == export.prefix) {
                Some(index) => index,
                None => {
                    self.exports.push(ExportEntry {
                        prefix: export.prefix.clone(),
                        readers: NodeMask::empty(),
                        writers: NodeMask::empty(),
                    });
                    self.exports.len() - 1
                }
            };
            let entry = &mut self.exports[index];
            entry.readers |= bit;
            if export.writable {
                entry.writers |= bit;
            }
        }
    }

    fn clear_exports(&mut self, bit: NodeMask) {
        for entry in &mut self.exports {
            entry.readers.remove(bit);
            entry.writers.remove(bit);
        }
        self.exports.retain(|e| !e.readers.is_empty());
    }

    fn clear_bit(&mut self, bit: NodeMask) {
        self.members.remove(bit);
        self.subscribers.remove(bit);
        self.clear_exports(bit);
        self.presence.retain(|_, mask| {
            mask.remove(bit);
            !mask.is_empty()
        });
    }

    fn nodes_in(&self, mask: NodeMask) -> Vec<Node> {
        mask.slots()
            .filter_map(|slot| self.slots.get(slot).cloned().flatten())
            .collect()
    }
}

pub struct Registry {
    tables: RwLock<Tables>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            tables: RwLock::new(Tables {
                slots: vec![None; MAX_NODES],
                next_id: 1,
                members: NodeMask::empty(),
                subscribers: NodeMask::empty(),
                exports: Vec::new(),
                presence: HashMap::new(),
            }),
        }
    }

    /// Give a logging in node a slot. A node with the same identity takes
    /// its old slot back with a new instance number, and whatever it now
    /// exports replaces what it exported before.
    pub fn admit(
        &self,
        info: NodeInfo,
        link: Arc<dyn Link>,
        config_id: u32,
    ) -> Result<Admission, LoginError> {
        let mut tables = self.tables.write();

        let existing = tables
            .slots
            .iter()
            .flatten()
            .find(|node| node.same_identity(&info))
            .cloned();
        if let Some(node) = existing {
            node.replace_info(info);
            tables.clear_exports(node.mask());
            tables.add_exports(&node);
            let (previous_link, timer) = node.with_state(|state| {
                state.instance = state.instance.wrapping_add(1);
                state.config_id = config_id;
                (
                    std::mem::replace(&mut state.link, link),
                    state.drop_timer.take(),
                )
            });
            if let Some(timer) = timer {
                timer.cancel();
            }
            return Ok(Admission {
                node,
                reconnected: true,
                previous_link: Some(previous_link),
            });
        }

        let Some(slot) = tables.slots.iter().position(Option::is_none) else {
            return Err(LoginError::RegistryFull(info.host));
        };
        let id = NodeId(tables.next_id);
        tables.next_id += 1;

        let node = Node::new(id, slot, info, link, config_id);
        tables.add_exports(&node);
        tables.slots[slot] = Some(node.clone());
        Ok(Admission {
            node,
            reconnected: false,
            previous_link: None,
        })
    }

    /// Bring the aggregate masks in line with the node's flags.
    pub fn sync(&self, node: &Node) {
        let mut tables = self.tables.write();
        if !tables.holds(node) {
            return;
        }
        let bit = node.mask();
        let flags = node.flags();
        if flags.is_member() {
            tables.members |= bit;
        } else {
            tables.members.remove(bit);
        }
        if flags.is_member() && node.role().subscribes() {
            tables.subscribers |= bit;
        } else {
            tables.subscribers.remove(bit);
        }
    }

    /// Free the node's slot and clear its bit everywhere. Returns false
    /// when the slot already belongs to someone else.
    pub fn remove(&self, node: &Node) -> bool {
        let mut tables = self.tables.write();
        if !tables.holds(node) {
            return false;
        }
        tables.slots[node.slot()] = None;
        tables.clear_bit(node.mask());
        true
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.tables.read().holds(node)
    }

    pub fn get(&self, slot: usize) -> Option<Node> {
        self.tables.read().slots.get(slot).cloned().flatten()
    }

    pub fn find(&self, id: NodeId) -> Option<Node> {
        self.tables
            .read()
            .slots
            .iter()
            .flatten()
            .find(|node| node.id() == id)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.tables.read().slots.iter().flatten().cloned().collect()
    }

    pub fn nodes_in(&self, mask: NodeMask) -> Vec<Node> {
        self.tables.read().nodes_in(mask)
    }

    pub fn len(&self) -> usize {
        self.tables.read().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes that are bound, connected and neither disabled nor gone.
    pub fn members(&self) -> NodeMask {
        self.tables.read().members
    }

    pub fn subscribers(&self) -> NodeMask {
        self.tables.read().subscribers
    }

    /// Nodes exporting the longest prefix of `path`. Writers only when
    /// `write` is set.
    pub fn space_mask(&self, path: &str, write: bool) -> NodeMask {
        let tables = self.tables.read();
        tables
            .exports
            .iter()
            .filter(|entry| entry.matches(path))
            .max_by_key(|entry| entry.prefix.len())
            .map(|entry| if write { entry.writers } else { entry.readers })
            .unwrap_or_default()
    }

    /// Record that the nodes in `mask` hold `path`.
    pub fn add_presence(&self, path: &str, mask: NodeMask) {
        let mut tables = self.tables.write();
        *tables.presence.entry(path.to_string()).or_default() |= mask;
    }

    pub fn presence(&self, path: &str) -> NodeMask {
        self.tables
            .read()
            .presence
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Rank the member nodes in `mask`, best first.
    pub fn locate(&self, mask: NodeMask, criteria: Criteria) -> Vec<Node> {
        let nodes = self.nodes_in(mask & self.members());
        let snapshots = nodes.iter().map(Node::snapshot).collect();
        select::rank(snapshots, criteria, Purpose::Redirect)
            .into_iter()
            .filter_map(|snap| nodes.iter().find(|n| n.slot() == snap.slot).cloned())
            .collect()
    }

    /// Pick the best member node in `mask` and charge it with the pick.
    pub fn select(&self, mask: NodeMask, criteria: Criteria, purpose: Purpose) -> Option<Node> {
        let nodes = self.nodes_in(mask & self.members());
        let winner = select::best(nodes.iter().map(Node::snapshot), criteria, purpose)?;
        let node = nodes.into_iter().find(|n| n.slot() == winner.slot)?;
        node.with_state(|state| match purpose {
            Purpose::Redirect => {
                state.usage.redirects += 1;
                state.usage.redirects_total += 1;
            }
            Purpose::Allocate => {
                state.usage.allocations += 1;
                state.usage.allocations_total += 1;
            }
        });
        Some(node)
    }

    /// Start a new accounting period.
    pub fn reset_usage(&self) {
        for node in self.nodes() {
            node.with_state(|state| {
                state.usage.allocations = 0;
                state.usage.redirects = 0;
            });
        }
    }

    /// Send `frame` to every node in `mask`. Returns how many sends
    /// succeeded.
    pub fn broadcast(&self, mask: NodeMask, frame: &Frame) -> usize {
        let data = frame.encode();
        let mut sent = 0;
        for node in self.nodes_in(mask) {
            match node.send(data.clone()) {
                Ok(()) => sent += 1,
                Err(err) => tracing::debug!(node=%node, error=%err, "Broadcast skipped node"),
            }
        }
        sent
    }
}
