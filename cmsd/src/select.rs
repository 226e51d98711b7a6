//! Node ranking for redirection and placement.
//!
//! Candidates are ranked by ascending cost, then by lifetime pick count for
//! the purpose at hand, then by node id so equal registries always produce
//! the same winner.

use crate::node::{NodeFlags, NodeSnapshot};

#[cfg(test)]
#[path = "select.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("No servers are available to {verb} {path}, temporarily unavailable")]
    NoServer { verb: &'static str, path: String },

    #[error("Staging is disabled, {path} is temporarily unavailable")]
    NoStaging { path: String },

    #[error("Cluster is suspended, {path} is temporarily unavailable")]
    Suspended { path: String },
}

/// Why a node is being picked. Redirects send a client to an existing
/// copy, allocations place a new or staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Redirect,
    Allocate,
}

/// What the caller needs from a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Criteria {
    pub write: bool,
    pub stage: bool,
}

impl Criteria {
    pub fn read() -> Self {
        Criteria::default()
    }

    pub fn write() -> Self {
        Criteria {
            write: true,
            stage: false,
        }
    }

    pub fn verb(&self) -> &'static str {
        if self.write { "write" } else { "read" }
    }
}

/// Whether a node with `flags` may be chosen under `criteria`.
pub fn is_eligible(flags: &NodeFlags, criteria: Criteria) -> bool {
    if !flags.connected || flags.offline || flags.disabled || flags.gone || flags.suspended {
        return false;
    }
    if criteria.write && !flags.read_write {
        return false;
    }
    if criteria.stage && flags.no_stage {
        return false;
    }
    true
}

fn rank_key(node: &NodeSnapshot, purpose: Purpose) -> (u32, u64, crate::id::NodeId) {
    let picks = match purpose {
        Purpose::Redirect => node.usage.redirects_total,
        Purpose::Allocate => node.usage.allocations_total,
    };
    (node.capacity.cost, picks, node.id)
}

/// Drop ineligible candidates and order the rest best first.
pub fn rank(
    mut candidates: Vec<NodeSnapshot>,
    criteria: Criteria,
    purpose: Purpose,
) -> Vec<NodeSnapshot> {
    candidates.retain(|node| is_eligible(&node.flags, criteria));
    candidates.sort_by_key(|node| rank_key(node, purpose));
    candidates
}

/// The single best candidate, if any survives the eligibility filter.
pub fn best(
    candidates: impl IntoIterator<Item = NodeSnapshot>,
    criteria: Criteria,
    purpose: Purpose,
) -> Option<NodeSnapshot> {
    candidates
        .into_iter()
        .filter(|node| is_eligible(&node.flags, criteria))
        .min_by_key(|node| rank_key(node, purpose))
}
