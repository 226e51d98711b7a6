//! The manager context shared by every connection.
//!
//! Owns the registry, the cluster state and the prepare queue and runs the
//! background loops: the status broadcaster, the prepare worker and the
//! heartbeat sweep. Handlers reach all shared services through it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ManagerConfig;
use crate::id::NodeId;
use crate::link::Link;
use crate::mask::NodeMask;
use crate::node::{LoginError, Node, NodeFlags, NodeInfo, Role};
use crate::prepare::{PrepareError, PrepareHandler, PrepareOutcome, PrepareQueue, PrepareRequest};
use crate::registry::Registry;
use crate::security::{Authenticator, HostAuthorizer, UnixAuthenticator};
use crate::select::{Criteria, Purpose, SelectError};
use crate::state::{ClusterState, StateError, StateUpdate, StatusSink};
use crate::wire::{
    CURRENT_PROTOCOL_VERSION, Frame, LoadReport, Login, PathQuery, RRCode, SpaceReport,
};

#[cfg(test)]
#[path = "manager.test.rs"]
mod tests;

/// The manager this one reports to.
pub trait Upstream: Send + Sync {
    fn inform(&self, frame: &Frame);
}

/// Where a handler wants a frame relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    Upstream(Frame),
    Nodes { mask: NodeMask, frame: Frame },
}

pub struct Manager {
    config: ManagerConfig,
    registry: Registry,
    state: Arc<ClusterState>,
    prepare: Arc<PrepareQueue>,
    authorizer: HostAuthorizer,
    authenticator: Box<dyn Authenticator>,
    upstream: Option<Arc<dyn Upstream>>,
    local_load: Mutex<LoadReport>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Self::with_parts(config, Box::new(UnixAuthenticator), None)
    }

    pub fn with_parts(
        config: ManagerConfig,
        authenticator: Box<dyn Authenticator>,
        upstream: Option<Arc<dyn Upstream>>,
    ) -> Arc<Self> {
        let state = ClusterState::new(
            config.min_nodes,
            config.admin_path.clone(),
            !config.require_front_end,
        );
        let authorizer = HostAuthorizer::new(&config.allowed_hosts, config.auth_lifetime);
        Arc::new(Manager {
            registry: Registry::new(),
            state: Arc::new(state),
            prepare: Arc::new(PrepareQueue::new()),
            authorizer,
            authenticator,
            upstream,
            local_load: Mutex::new(LoadReport::default()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn prepare(&self) -> &PrepareQueue {
        &self.prepare
    }

    /// Spawn the background loops and enable the cluster state, which
    /// forces the first status broadcast.
    pub fn start(self: &Arc<Self>) {
        let sink: Arc<dyn StatusSink> = self.clone();
        tokio::spawn(
            self.state
                .clone()
                .run_broadcaster(sink, self.shutdown.child_token())
                .instrument(tracing::debug_span!("state-broadcaster", name=%self.config.name)),
        );

        let handler: Arc<dyn PrepareHandler> = self.clone();
        tokio::spawn(
            self.prepare
                .clone()
                .run(handler, self.shutdown.child_token())
                .instrument(tracing::debug_span!("prepare-worker", name=%self.config.name)),
        );

        if !self.config.heartbeat_interval.is_zero() {
            let manager = self.clone();
            tokio::spawn(
                async move { manager.run_heartbeat().await }
                    .instrument(tracing::debug_span!("heartbeat", name=%self.config.name)),
            );
        }

        self.state.enable();
        tracing::info!(name=%self.config.name, min_nodes = self.config.min_nodes, "Manager started");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.prepare.close();
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat(),
            }
        }
    }

    /// Disconnect nodes that never answered the last ping and ping the rest.
    pub fn heartbeat(self: &Arc<Self>) {
        let ping = Frame::empty(0, RRCode::Ping, 0);
        for node in self.registry.nodes() {
            let missed = node.with_state(|state| {
                if !state.flags.connected {
                    return None;
                }
                let missed = state.flags.ping_pending;
                state.flags.ping_pending = true;
                Some(missed)
            });
            match missed {
                Some(true) => self.disconnect(&node, "missed heartbeat"),
                Some(false) => {
                    if let Err(err) = node.send_frame(&ping) {
                        tracing::debug!(node=%node, error=%err, "Ping failed");
                    }
                }
                None => {}
            }
        }
    }

    /// Validate a login and register the node.
    pub fn login(&self, login: Login, link: Arc<dyn Link>) -> Result<Node, LoginError> {
        if login.protocol_version != CURRENT_PROTOCOL_VERSION {
            return Err(LoginError::ProtocolMismatch {
                expected: CURRENT_PROTOCOL_VERSION,
                actual: login.protocol_version,
            });
        }
        let role: Role = login.role.parse().map_err(LoginError::UnknownRole)?;
        if login.host.trim().is_empty() {
            return Err(LoginError::MissingHost);
        }
        if login.port == 0 {
            return Err(LoginError::InvalidPort(login.port));
        }

        self.authorizer
            .authorize_login(&login.host, link.host(), link.addr())?;
        let identity = self
            .authenticator
            .authenticate(&login.credentials, &login.host)?;

        let read_write = login.exports.iter().any(|export| export.writable);
        let info = NodeInfo {
            host: login.host,
            port: login.port,
            session_id: login.session_id,
            role,
            level: login.level,
            exports: login.exports,
        };
        let admission = self.registry.admit(info, link, login.config_id)?;
        if let Some(previous) = admission.previous_link {
            previous.close();
        }
        let node = admission.node;

        let delta = node.change(|state| {
            state.flags = NodeFlags {
                bound: true,
                connected: true,
                known: true,
                read_write,
                suspended: login.suspended,
                no_stage: login.no_stage,
                disabled: state.flags.disabled,
                permanent: state.flags.permanent,
                ..NodeFlags::default()
            };
        });
        node.update_capacity(&self.config.weights, |capacity| capacity.apply_disk(login.disk));
        self.registry.sync(&node);
        self.apply_counts(delta);

        if role.subscribes() {
            if let Err(err) = self.state.send_state(node.link().as_ref()) {
                tracing::warn!(node=%node, error=%err, "Unable to send cluster state");
            }
        }

        tracing::info!(
            node=%node,
            id=%node.id(),
            slot = node.slot(),
            instance = node.instance(),
            user=%identity.name,
            reconnected = admission.reconnected,
            "Node logged in"
        );
        Ok(node)
    }

    /// Mark the node offline and drop it after the configured delay unless
    /// it logs in again first.
    pub fn disconnect(self: &Arc<Self>, node: &Node, reason: &str) {
        if !self.registry.contains(node) || !node.flags().connected {
            return;
        }
        let delta = node.change(|state| {
            state.flags.connected = false;
            state.flags.offline = true;
            state.flags.ping_pending = false;
        });
        self.registry.sync(node);
        self.apply_counts(delta);
        node.link().close();
        tracing::info!(node=%node, reason, "Node disconnected");

        let delay = self.config.drop_delay;
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !delay.is_zero() => self.schedule_drop(&runtime, node, delay),
            _ => self.drop_node(node, reason),
        }
    }

    fn schedule_drop(self: &Arc<Self>, runtime: &tokio::runtime::Handle, node: &Node, delay: Duration) {
        let token = CancellationToken::new();
        node.arm_drop_timer(Some(token.clone()));
        let instance = node.instance();
        let manager = self.clone();
        let node = node.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = manager.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let stale = node.instance() == instance && !node.flags().connected;
                    if stale {
                        manager.drop_node(&node, "drop timer expired");
                    }
                }
            }
        });
    }

    /// Remove the node right away, freeing its slot.
    pub fn drop_node(&self, node: &Node, reason: &str) {
        let delta = node.change(|state| {
            state.flags.gone = true;
            state.flags.connected = false;
            state.flags.offline = true;
        });
        node.arm_drop_timer(None);
        if self.registry.remove(node) {
            self.apply_counts(delta);
            node.link().close();
            tracing::info!(node=%node, reason, "Node dropped");
        }
    }

    /// Admin disconnect by node id.
    pub fn admin_disconnect(self: &Arc<Self>, id: NodeId) -> bool {
        match self.registry.find(id) {
            Some(node) => {
                self.disconnect(&node, "admin disconnect");
                true
            }
            None => false,
        }
    }

    /// Admin disable (`true`) or re-enable of a node.
    pub fn set_disabled(&self, id: NodeId, disabled: bool) -> bool {
        let Some(node) = self.registry.find(id) else {
            return false;
        };
        let delta = node.change(|state| state.flags.disabled = disabled);
        self.registry.sync(&node);
        self.apply_counts(delta);
        tracing::info!(node=%node, disabled, "Node admin state changed");
        true
    }

    pub fn set_admin_suspend(&self, on: bool) -> Result<bool, StateError> {
        self.state.set_admin_suspend(on)
    }

    pub fn set_admin_no_stage(&self, on: bool) -> Result<bool, StateError> {
        self.state.set_admin_no_stage(on)
    }

    pub fn set_min_nodes(&self, min_nodes: u32, admin_path: Option<std::path::PathBuf>) {
        self.state.set(min_nodes, admin_path);
    }

    /// Record this manager's own load, reported to `Usage` requests.
    pub fn set_local_load(&self, load: LoadReport) {
        *self.local_load.lock() = load;
    }

    pub fn local_load(&self) -> LoadReport {
        *self.local_load.lock()
    }

    pub(crate) fn apply_counts(&self, (active, staging): (i32, i32)) {
        if active == 0 && staging == 0 {
            return;
        }
        if let Err(err) = self.state.update(StateUpdate::Counts { active, staging }) {
            tracing::error!(error=%err, active, staging, "Unable to update node counts");
        }
    }

    /// Whether there is still room to stage into, as seen by the local
    /// space monitor.
    pub fn set_space_available(&self, available: bool) {
        if let Err(err) = self.state.update(StateUpdate::Space(available)) {
            tracing::error!(error=%err, available, "Unable to update space state");
        }
    }

    /// Whether the front end is able to serve.
    pub fn set_front_end(&self, ok: bool) {
        if let Err(err) = self.state.update(StateUpdate::FrontEnd(ok)) {
            tracing::error!(error=%err, ok, "Unable to update front end state");
        }
    }

    /// Largest free space and average utilisation over writable members.
    pub fn best_space(&self) -> SpaceReport {
        let nodes: Vec<_> = self
            .registry
            .nodes_in(self.registry.members())
            .iter()
            .map(Node::snapshot)
            .filter(|node| crate::select::is_eligible(&node.flags, Criteria::write()))
            .collect();
        if nodes.is_empty() {
            return SpaceReport::default();
        }
        let disk_free = nodes.iter().map(|n| n.capacity.disk_free).max().unwrap_or(0);
        let util: u32 = nodes.iter().map(|n| n.capacity.disk_util as u32).sum();
        SpaceReport {
            disk_free,
            disk_util: (util / nodes.len() as u32) as u8,
        }
    }

    /// All member nodes holding `query.path`, best first.
    pub fn locate(&self, query: &PathQuery) -> Result<Vec<Node>, SelectError> {
        let criteria = Criteria {
            write: query.write,
            stage: false,
        };
        let space = self.registry.space_mask(&query.path, query.write);
        let holders = self.registry.presence(&query.path) & space;
        let nodes = self.registry.locate(holders, criteria);
        if nodes.is_empty() {
            return Err(SelectError::NoServer {
                verb: criteria.verb(),
                path: query.path.clone(),
            });
        }
        Ok(nodes)
    }

    /// Pick one node for `query`: a holder of the file when there is one,
    /// otherwise a place to create or stage it.
    pub fn select(&self, query: &PathQuery) -> Result<Node, SelectError> {
        if self.state.is_suspended() {
            return Err(SelectError::Suspended {
                path: query.path.clone(),
            });
        }
        let read = Criteria {
            write: query.write,
            stage: false,
        };
        let space = self.registry.space_mask(&query.path, query.write);
        let holders = self.registry.presence(&query.path) & space;
        if let Some(node) = self.registry.select(holders, read, Purpose::Redirect) {
            return Ok(node);
        }

        if query.stage {
            if self.state.is_no_staging() {
                return Err(SelectError::NoStaging {
                    path: query.path.clone(),
                });
            }
            let stage = Criteria {
                write: query.write,
                stage: true,
            };
            if let Some(node) = self.registry.select(space, stage, Purpose::Allocate) {
                return Ok(node);
            }
        } else if query.write {
            if let Some(node) = self.registry.select(space, read, Purpose::Allocate) {
                return Ok(node);
            }
        }

        Err(SelectError::NoServer {
            verb: read.verb(),
            path: query.path.clone(),
        })
    }

    pub fn forward(&self, forward: Forward) {
        match forward {
            Forward::Upstream(frame) => match &self.upstream {
                Some(upstream) => upstream.inform(&frame),
                None => tracing::trace!(code=?frame.header.code, "No upstream to forward to"),
            },
            Forward::Nodes { mask, frame } => {
                let sent = self.registry.broadcast(mask, &frame);
                tracing::debug!(code=?frame.header.code, sent, "Forwarded to nodes");
            }
        }
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }
}

impl StatusSink for Manager {
    fn broadcast(&self, frame: &Frame) {
        let sent = self.registry.broadcast(self.registry.subscribers(), frame);
        if let Some(upstream) = &self.upstream {
            upstream.inform(frame);
        }
        tracing::debug!(sent, modifier = frame.header.modifier, "Status broadcast");
    }
}

impl PrepareHandler for Manager {
    fn process(&self, request: &PrepareRequest) -> Result<PrepareOutcome, PrepareError> {
        let write = request.wants_write();
        let space = self.registry.space_mask(&request.path, write);
        let online = Criteria {
            write,
            stage: false,
        };
        let holders = self.registry.presence(&request.path) & space;
        if let Some(node) = self.registry.locate(holders, online).first() {
            return Ok(PrepareOutcome::Present(node.id()));
        }

        if self.state.is_no_staging() {
            return Err(SelectError::NoStaging {
                path: request.path.clone(),
            }
            .into());
        }

        let stage = Criteria { write, stage: true };
        let near = request
            .coloc_path()
            .map(|coloc| self.registry.presence(coloc) & space)
            .unwrap_or_default();
        let node = self
            .registry
            .select(near, stage, Purpose::Allocate)
            .or_else(|| self.registry.select(space, stage, Purpose::Allocate))
            .ok_or_else(|| SelectError::NoServer {
                verb: "stage",
                path: request.path.clone(),
            })?;

        let frame = Frame::with_body(0, RRCode::Stage, &request.to_wire())?;
        node.send_frame(&frame)
            .map_err(|source| PrepareError::Send {
                node: node.id(),
                source,
            })?;
        Ok(PrepareOutcome::Dispatched(node.id()))
    }
}
