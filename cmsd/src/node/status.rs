//! Node status types and state management

use chrono::{DateTime, Utc};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::config::SelectionWeights;
use crate::id::{Instance, NodeId};
use crate::link::Link;
use crate::wire::{DiskReport, LoadReport, SpaceReport};
use std::sync::Arc;

/// Capabilities a node announces at login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Role {
    pub manager: bool,
    pub peer: bool,
    pub proxy: bool,
}

impl Role {
    /// Managers and peers receive cluster status broadcasts.
    pub fn subscribes(&self) -> bool {
        self.manager || self.peer
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s {
            "server" => Role::default(),
            "supervisor" | "manager" => Role {
                manager: true,
                ..Role::default()
            },
            "peer" => Role {
                manager: true,
                peer: true,
                ..Role::default()
            },
            "proxy" => Role {
                proxy: true,
                ..Role::default()
            },
            other => return Err(other.to_string()),
        };
        Ok(role)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match (self.manager, self.peer, self.proxy) {
            (_, true, _) => "peer",
            (true, _, _) => "manager",
            (_, _, true) => "proxy",
            _ => "server",
        };
        write!(f, "{}", name)
    }
}

/// Independent status flags of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// Temporarily removed by an admin.
    pub disabled: bool,
    /// The link failed.
    pub offline: bool,
    pub no_stage: bool,
    pub suspended: bool,
    /// Part of the configuration.
    pub bound: bool,
    /// Can write or stage data.
    pub read_write: bool,
    /// A state report has been received.
    pub known: bool,
    pub connected: bool,
    /// Must be deleted.
    pub gone: bool,
    /// Permanently bound.
    pub permanent: bool,
    /// A ping was sent and no pong has come back yet.
    pub ping_pending: bool,
}

impl NodeFlags {
    /// Whether the node belongs in the registry's active mask.
    pub fn is_member(&self) -> bool {
        self.connected && self.bound && !self.disabled && !self.gone
    }

    /// Whether the node counts towards the cluster's active nodes.
    pub fn is_active(&self) -> bool {
        self.is_member() && !self.offline && !self.suspended && self.read_write
    }

    /// Whether the node counts towards the cluster's staging nodes.
    pub fn is_staging(&self) -> bool {
        self.is_active() && !self.no_stage
    }

    pub(crate) fn contribution(&self) -> (i32, i32) {
        (self.is_active() as i32, self.is_staging() as i32)
    }
}

/// Capacity and load of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub sample: LoadReport,
    /// Largest free space in KB.
    pub disk_free: u64,
    pub disk_util: u8,
    pub disk_nums: u32,
    /// Weighted load without space.
    pub load: u32,
    /// Load plus weighted disk utilisation.
    pub mass: u32,
    /// Mass plus the placement level bias.
    pub cost: u32,
}

impl Capacity {
    /// Weights come from configuration, so every step saturates.
    pub fn recompute(&mut self, level: u8, weights: &SelectionWeights) {
        let sample = &self.sample;
        let load = [
            (sample.cpu, weights.cpu),
            (sample.net, weights.net),
            (sample.xeq, weights.xeq),
            (sample.mem, weights.mem),
            (sample.pag, weights.pag),
        ]
        .into_iter()
        .fold(0u32, |sum, (value, weight)| {
            sum.saturating_add(u32::from(value).saturating_mul(weight))
        });
        self.load = load / 100;
        let space = u32::from(self.disk_util).saturating_mul(weights.disk_util) / 100;
        self.mass = self.load.saturating_add(space);
        self.cost = self
            .mass
            .saturating_add(u32::from(level).saturating_mul(weights.level_bias));
    }

    pub fn apply_load(&mut self, report: LoadReport) {
        self.sample = report;
        self.disk_free = report.disk_free;
        self.disk_util = report.disk_util;
    }

    pub fn apply_space(&mut self, report: SpaceReport) {
        self.disk_free = report.disk_free;
        self.disk_util = report.disk_util;
    }

    pub fn apply_disk(&mut self, report: DiskReport) {
        self.disk_free = report.disk_free;
        self.disk_util = report.disk_util;
        self.disk_nums = report.disk_nums;
    }
}

/// How often a node was picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub allocations: u32,
    pub allocations_total: u64,
    pub redirects: u32,
    pub redirects_total: u64,
}

/// Mutable part of a node, only reachable through the node lock.
pub(crate) struct NodeState {
    pub flags: NodeFlags,
    pub capacity: Capacity,
    pub usage: Usage,
    pub instance: Instance,
    pub config_id: u32,
    pub last_seen: DateTime<Utc>,
    pub link: Arc<dyn Link>,
    pub drop_timer: Option<CancellationToken>,
}

impl NodeState {
    pub(crate) fn new(link: Arc<dyn Link>, config_id: u32) -> Self {
        NodeState {
            flags: NodeFlags::default(),
            capacity: Capacity::default(),
            usage: Usage::default(),
            instance: 0,
            config_id,
            last_seen: Utc::now(),
            link,
            drop_timer: None,
        }
    }
}

/// Copy of everything selection needs to know about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub slot: usize,
    pub instance: Instance,
    pub config_id: u32,
    pub host: String,
    pub port: u16,
    pub level: u8,
    /// Time of the last load or space report.
    pub last_seen: DateTime<Utc>,
    pub flags: NodeFlags,
    pub capacity: Capacity,
    pub usage: Usage,
}
