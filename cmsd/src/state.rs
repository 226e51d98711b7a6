//! Cluster-wide availability state.
//!
//! The aggregate state is a two bit word, `ALL_SUSPEND` and `ALL_NOSTAGE`,
//! derived from counters and admin overrides every time one of them changes.
//! The derived flags are never written directly. When the word differs from
//! the one last broadcast, the broadcaster loop is woken and tells every
//! subscriber which bits changed.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::admin::{AdminFiles, Sentinel};
use crate::link::{Link, LinkError};
use crate::wire::{Frame, RRCode, modifier};

#[cfg(test)]
#[path = "state.test.rs"]
mod tests;

pub const ALL_SUSPEND: u8 = 0x01;
pub const ALL_NOSTAGE: u8 = 0x02;

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("Unable to update {file}: {source}")]
    Sentinel {
        file: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid state update trigger {0}")]
    InvalidTrigger(u8),
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdate {
    /// Admin forced suspend on (`true`) or off.
    AdminSuspend(bool),
    /// Change in the number of active and staging capable nodes.
    Counts { active: i32, staging: i32 },
    /// Whether the front end is able to serve.
    FrontEnd(bool),
    /// Whether there is space left to stage into.
    Space(bool),
    /// Admin forced no-staging on (`true`) or off.
    AdminNoStage(bool),
}

impl StateUpdate {
    /// Decode a trigger code as carried by admin commands. For the admin
    /// triggers a zero `active` value turns the override on.
    pub fn from_code(code: u8, active: i32, staging: i32) -> Result<Self, StateError> {
        match code {
            0 => Ok(StateUpdate::AdminSuspend(active == 0)),
            1 => Ok(StateUpdate::Counts { active, staging }),
            2 => Ok(StateUpdate::FrontEnd(active != 0)),
            3 => Ok(StateUpdate::Space(active != 0)),
            4 => Ok(StateUpdate::AdminNoStage(active == 0)),
            other => Err(StateError::InvalidTrigger(other)),
        }
    }
}

/// Receives status frames whenever the aggregate state changes.
pub trait StatusSink: Send + Sync {
    fn broadcast(&self, frame: &Frame);
}

/// Point in time view of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub num_active: u32,
    pub num_staging: u32,
    pub min_nodes: u32,
    pub admin_suspend: bool,
    pub admin_no_stage: bool,
    pub front_end_ok: bool,
    pub no_space: bool,
    pub suspended: bool,
    pub no_staging: bool,
    pub enabled: bool,
}

struct Inner {
    min_nodes: u32,
    num_active: u32,
    num_staging: u32,
    admin_suspend: bool,
    admin_no_stage: bool,
    front_end_ok: bool,
    no_space: bool,
    current: u8,
    previous: u8,
    enabled: bool,
    files: AdminFiles,
}

impl Inner {
    fn recompute(&mut self) {
        let mut state = 0;
        if self.num_active < self.min_nodes || self.admin_suspend || !self.front_end_ok {
            state |= ALL_SUSPEND;
        }
        if self.num_staging < 1 || self.admin_no_stage || self.no_space {
            state |= ALL_NOSTAGE;
        }
        self.current = state;
    }

    fn store_override(&mut self, which: Sentinel, active: bool) -> Result<bool, StateError> {
        let flag = match which {
            Sentinel::Suspend => &mut self.admin_suspend,
            Sentinel::NoStage => &mut self.admin_no_stage,
        };
        if *flag == active {
            return Ok(false);
        }
        self.files
            .store(which, active)
            .map_err(|source| StateError::Sentinel {
                file: which.file_name(),
                source,
            })?;
        *flag = active;
        Ok(true)
    }
}

pub struct ClusterState {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl ClusterState {
    pub fn new(min_nodes: u32, admin_path: Option<PathBuf>, front_end_ok: bool) -> Self {
        ClusterState {
            inner: Mutex::new(Inner {
                min_nodes,
                num_active: 0,
                num_staging: 0,
                admin_suspend: false,
                admin_no_stage: false,
                front_end_ok,
                no_space: false,
                current: ALL_SUSPEND | ALL_NOSTAGE,
                previous: 0,
                enabled: false,
                files: AdminFiles::new(admin_path),
            }),
            changed: Notify::new(),
        }
    }

    /// Change the minimum node count and, when given, the admin directory.
    pub fn set(&self, min_nodes: u32, admin_path: Option<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.min_nodes = min_nodes;
        if admin_path.is_some() {
            inner.files = AdminFiles::new(admin_path);
        }
        self.commit(&mut inner);
    }

    /// Load the admin overrides from their sentinel files and force the
    /// next broadcast to carry the complete state.
    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        inner.admin_suspend = inner.files.is_set(Sentinel::Suspend);
        inner.admin_no_stage = inner.files.is_set(Sentinel::NoStage);
        inner.recompute();
        inner.enabled = true;
        inner.previous = !inner.current;
        tracing::debug!(
            admin_suspend = inner.admin_suspend,
            admin_no_stage = inner.admin_no_stage,
            "Cluster state enabled"
        );
        self.changed.notify_one();
    }

    pub fn update(&self, update: StateUpdate) -> Result<(), StateError> {
        tracing::debug!(?update, "State update");
        let mut inner = self.inner.lock();
        let result = match update {
            StateUpdate::AdminSuspend(on) => inner.store_override(Sentinel::Suspend, on).map(|_| ()),
            StateUpdate::AdminNoStage(on) => inner.store_override(Sentinel::NoStage, on).map(|_| ()),
            StateUpdate::Counts { active, staging } => {
                inner.num_active = inner.num_active.saturating_add_signed(active);
                inner.num_staging = inner.num_staging.saturating_add_signed(staging);
                Ok(())
            }
            StateUpdate::FrontEnd(ok) => {
                inner.front_end_ok = ok;
                Ok(())
            }
            StateUpdate::Space(available) => {
                inner.no_space = !available;
                Ok(())
            }
        };
        self.commit(&mut inner);
        if let Err(err) = &result {
            tracing::error!(error=%err, ?update, "State update rejected");
        }
        result
    }

    /// Apply an update given as a raw trigger code. Invalid codes are logged
    /// and leave the state untouched.
    pub fn update_code(&self, code: u8, active: i32, staging: i32) {
        match StateUpdate::from_code(code, active, staging) {
            Ok(update) => {
                let _ = self.update(update);
            }
            Err(err) => tracing::error!(error=%err, "Invalid state update"),
        }
    }

    /// Admin suspend toggle. Returns whether the override actually changed.
    pub fn set_admin_suspend(&self, on: bool) -> Result<bool, StateError> {
        self.toggle(Sentinel::Suspend, on)
    }

    /// Admin no-stage toggle. Returns whether the override actually changed.
    pub fn set_admin_no_stage(&self, on: bool) -> Result<bool, StateError> {
        self.toggle(Sentinel::NoStage, on)
    }

    fn toggle(&self, which: Sentinel, on: bool) -> Result<bool, StateError> {
        let mut inner = self.inner.lock();
        let changed = inner.store_override(which, on);
        self.commit(&mut inner);
        match &changed {
            Ok(true) => tracing::info!(file = which.file_name(), on, "Admin override changed"),
            Ok(false) => {}
            Err(err) => tracing::error!(error=%err, on, "Admin override rejected"),
        }
        changed
    }

    fn commit(&self, inner: &mut Inner) {
        inner.recompute();
        if inner.current != inner.previous && inner.enabled {
            self.changed.notify_one();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().current & ALL_SUSPEND != 0
    }

    pub fn is_no_staging(&self) -> bool {
        self.inner.lock().current & ALL_NOSTAGE != 0
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            num_active: inner.num_active,
            num_staging: inner.num_staging,
            min_nodes: inner.min_nodes,
            admin_suspend: inner.admin_suspend,
            admin_no_stage: inner.admin_no_stage,
            front_end_ok: inner.front_end_ok,
            no_space: inner.no_space,
            suspended: inner.current & ALL_SUSPEND != 0,
            no_staging: inner.current & ALL_NOSTAGE != 0,
            enabled: inner.enabled,
        }
    }

    /// Send the complete current state to one newly connected node.
    pub fn send_state(&self, link: &dyn Link) -> Result<(), LinkError> {
        let inner = self.inner.lock();
        let mut bits = if inner.current & ALL_SUSPEND != 0 {
            modifier::SUSPEND
        } else {
            modifier::RESUME
        };
        bits |= if inner.current & ALL_NOSTAGE != 0 {
            modifier::NO_STAGE
        } else {
            modifier::STAGE
        };
        link.send(Frame::empty(0, RRCode::Status, bits).encode())
    }

    /// Wait for state changes and broadcast them until cancelled.
    pub async fn run_broadcaster(
        self: Arc<Self>,
        sink: Arc<dyn StatusSink>,
        cancellation: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = self.changed.notified() => {}
            }

            let (changes, state) = {
                let mut inner = self.inner.lock();
                let changes = inner.current ^ inner.previous;
                inner.previous = inner.current;
                (changes, inner.current)
            };

            if let Some(bits) = status_modifier(changes, state) {
                tracing::debug!(modifier = bits, "Sending status");
                sink.broadcast(&Frame::empty(0, RRCode::Status, bits));
            }
        }
    }
}

/// Build the status modifier for the bits in `changes`, logging the
/// transition. Returns `None` when nothing relevant changed.
pub fn status_modifier(changes: u8, state: u8) -> Option<u8> {
    let mut bits = 0;
    let mut suspend_text = None;
    let mut stage_text = None;

    if changes & ALL_SUSPEND != 0 {
        if state & ALL_SUSPEND != 0 {
            bits |= modifier::SUSPEND;
            suspend_text = Some("suspended");
        } else {
            bits |= modifier::RESUME;
            suspend_text = Some("active");
        }
    }

    if changes & ALL_NOSTAGE != 0 {
        if state & ALL_NOSTAGE != 0 {
            bits |= modifier::NO_STAGE;
            stage_text = Some("nostaging");
        } else {
            bits |= modifier::STAGE;
            stage_text = Some("staging");
        }
    }

    if bits == 0 {
        return None;
    }

    match (suspend_text, stage_text) {
        (Some(s), Some(n)) => tracing::info!("Status changed to {} + {}", s, n),
        (Some(s), None) => tracing::info!("Status changed to {}", s),
        (None, Some(n)) => tracing::info!("Status changed to {}", n),
        (None, None) => {}
    }
    Some(bits)
}
