//! Command handlers run against one node.
//!
//! Every handler touches the node's fields under the node lock, releases it
//! and only then updates the registry masks or the cluster state.

use std::sync::Arc;

use crate::id::RequestId;
use crate::manager::{Forward, Manager};
use crate::prepare::PrepareRequest;
use crate::wire::{
    DiskReport, Frame, LoadReport, PathQuery, PrepAdd, PrepDel, RRCode, Request, Response,
    SpaceReport, StateReport, modifier,
};

use super::errors::HandlerError;
use super::node::Node;

/// What the connection should do after a handler succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to send back.
    Done,
    Respond(Response),
    Forward(Forward),
    /// The node is leaving, stop reading from it.
    Close,
}

fn check_percent(what: &str, value: u8) -> Result<(), HandlerError> {
    if value > 100 {
        return Err(HandlerError::invalid(format!("{} {} out of range", what, value)));
    }
    Ok(())
}

fn check_path(path: &str) -> Result<(), HandlerError> {
    if !path.starts_with('/') {
        return Err(HandlerError::invalid(format!("path '{}' is not absolute", path)));
    }
    Ok(())
}

impl Node {
    /// Run `request` against this node.
    pub fn dispatch(
        &self,
        manager: &Arc<Manager>,
        request: Request,
    ) -> Result<Reply, HandlerError> {
        tracing::trace!(node=%self, code=?request.code(), "Dispatching request");
        match request {
            Request::Login(_) => Err(HandlerError::AlreadyLoggedIn),
            Request::Load(report) => self.do_load(manager, report),
            Request::AvKb => Ok(self.do_avkb(manager)),
            Request::Space(report) => self.do_space(manager, report),
            Request::Disk(report) => self.do_disk(manager, report),
            Request::Have(path) => self.do_have(manager, &path),
            Request::Locate(query) => self.do_locate(manager, &query),
            Request::Select(query) => self.do_select(manager, &query),
            Request::Ping => Ok(Reply::Respond(Response::Pong)),
            Request::Pong => Ok(self.do_pong()),
            Request::State(report) => {
                self.do_state(manager, report);
                Ok(self.do_state_fwd(manager, report))
            }
            Request::Status(bits) => self.do_status(manager, bits),
            Request::Update => self.do_update(manager),
            Request::Disc(reason) => Ok(self.do_disc(manager, reason.as_deref())),
            Request::Gone => Ok(self.do_gone(manager)),
            Request::PrepAdd(prep) => self.do_prep_add(manager, prep),
            Request::PrepDel(del) => Ok(self.do_prep_del(manager, del)),
            Request::Usage => Ok(Reply::Respond(Response::Usage(manager.local_load()))),
        }
    }

    fn do_load(&self, manager: &Manager, report: LoadReport) -> Result<Reply, HandlerError> {
        for (what, value) in [
            ("cpu", report.cpu),
            ("net", report.net),
            ("xeq", report.xeq),
            ("mem", report.mem),
            ("pag", report.pag),
            ("disk utilization", report.disk_util),
        ] {
            check_percent(what, value)?;
        }
        self.update_capacity(&manager.config().weights, |capacity| {
            capacity.apply_load(report)
        });
        Ok(Reply::Done)
    }

    fn do_avkb(&self, manager: &Manager) -> Reply {
        Reply::Respond(Response::Space(manager.best_space()))
    }

    fn do_space(&self, manager: &Manager, report: SpaceReport) -> Result<Reply, HandlerError> {
        check_percent("disk utilization", report.disk_util)?;
        self.update_capacity(&manager.config().weights, |capacity| {
            capacity.apply_space(report)
        });
        Ok(Reply::Done)
    }

    fn do_disk(&self, manager: &Manager, report: DiskReport) -> Result<Reply, HandlerError> {
        check_percent("disk utilization", report.disk_util)?;
        self.update_capacity(&manager.config().weights, |capacity| {
            capacity.apply_disk(report)
        });
        Ok(Reply::Done)
    }

    fn do_have(&self, manager: &Manager, path: &str) -> Result<Reply, HandlerError> {
        check_path(path)?;
        manager.registry().add_presence(path, self.mask());
        tracing::trace!(node=%self, path, "Node has file");
        Ok(Reply::Done)
    }

    fn do_locate(&self, manager: &Manager, query: &PathQuery) -> Result<Reply, HandlerError> {
        check_path(&query.path)?;
        let nodes = manager.locate(query)?;
        let locations = nodes.iter().map(Node::location).collect();
        Ok(Reply::Respond(Response::Locate(locations)))
    }

    fn do_select(&self, manager: &Manager, query: &PathQuery) -> Result<Reply, HandlerError> {
        check_path(&query.path)?;
        let node = manager.select(query)?;
        tracing::debug!(requester=%self, path=%query.path, chosen=%node, "Selected node");
        Ok(Reply::Respond(Response::Select(node.location())))
    }

    fn do_pong(&self) -> Reply {
        self.with_state(|state| state.flags.ping_pending = false);
        Reply::Done
    }

    /// Fold a subordinate's aggregate state into its contribution.
    fn do_state(&self, manager: &Manager, report: StateReport) {
        let delta = self.change(|state| {
            state.flags.known = true;
            state.flags.suspended = report.suspended;
            state.flags.no_stage = report.no_stage;
        });
        manager.registry().sync(self);
        manager.apply_counts(delta);
    }

    /// Relay a subordinate's state report to the manager above us.
    fn do_state_fwd(&self, manager: &Manager, report: StateReport) -> Reply {
        if !manager.has_upstream() {
            return Reply::Done;
        }
        match Frame::with_body(0, RRCode::State, &report) {
            Ok(frame) => Reply::Forward(Forward::Upstream(frame)),
            Err(err) => {
                tracing::error!(node=%self, error=%err, "Unable to forward state");
                Reply::Done
            }
        }
    }

    fn do_status(&self, manager: &Manager, bits: u8) -> Result<Reply, HandlerError> {
        let suspend = bits & modifier::SUSPEND != 0;
        let resume = bits & modifier::RESUME != 0;
        let no_stage = bits & modifier::NO_STAGE != 0;
        let stage = bits & modifier::STAGE != 0;
        if bits == 0 || (suspend && resume) || (no_stage && stage) {
            return Err(HandlerError::invalid(format!("status modifier {:#04x}", bits)));
        }

        let delta = self.change(|state| {
            if suspend || resume {
                state.flags.suspended = suspend;
            }
            if no_stage || stage {
                state.flags.no_stage = no_stage;
            }
        });
        manager.registry().sync(self);
        manager.apply_counts(delta);
        tracing::debug!(node=%self, suspend, resume, no_stage, stage, "Node status changed");
        Ok(Reply::Done)
    }

    fn do_update(&self, manager: &Manager) -> Result<Reply, HandlerError> {
        manager.state().send_state(self.link().as_ref())?;
        Ok(Reply::Done)
    }

    fn do_disc(&self, manager: &Arc<Manager>, reason: Option<&str>) -> Reply {
        manager.disconnect(self, reason.unwrap_or("node disconnected"));
        Reply::Close
    }

    fn do_gone(&self, manager: &Manager) -> Reply {
        manager.drop_node(self, "node gone");
        Reply::Close
    }

    fn do_prep_add(&self, manager: &Manager, prep: PrepAdd) -> Result<Reply, HandlerError> {
        check_path(&prep.path)?;
        let request = PrepareRequest::from_wire(prep);
        tracing::debug!(node=%self, reqid=%request.id, path=%request.path, "Prepare requested");
        manager.prepare().push(request);
        Ok(Reply::Done)
    }

    fn do_prep_del(&self, manager: &Manager, del: PrepDel) -> Reply {
        let id = RequestId::from_client(&del.reqid);
        let cancelled = manager.prepare().cancel(&id);
        tracing::debug!(node=%self, reqid=%id, cancelled, "Prepare cancel requested");

        let mask = manager.registry().members() & !self.mask();
        match Frame::with_body(0, RRCode::PrepDel, &del) {
            Ok(frame) => Reply::Forward(Forward::Nodes { mask, frame }),
            Err(err) => {
                tracing::error!(node=%self, error=%err, "Unable to forward prepare cancel");
                Reply::Done
            }
        }
    }
}
