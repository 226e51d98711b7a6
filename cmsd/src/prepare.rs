//! Prepare (staging) request queue.
//!
//! Producers append to the tail under the queue lock and add a permit to
//! the semaphore. One worker waits on the semaphore, pops the head and hands
//! the request to a [`PrepareHandler`]. Requests are served strictly in
//! arrival order and at most one is being selected at any time. A request
//! whose selection fails is dropped, never requeued.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::id::{NodeId, RequestId};
use crate::link::LinkError;
use crate::select::SelectError;
use crate::wire::{PrepAdd, WireError};

#[cfg(test)]
#[path = "prepare.test.rs"]
mod tests;

pub mod options {
    /// Notify the requestor when staging fails.
    pub const MSG_FAIL: u32 = 0x01;
    /// Notify the requestor when staging succeeds.
    pub const MSG_SUCC: u32 = 0x02;
    /// Stage onto a writable node.
    pub const MAKE_RW: u32 = 0x04;
    /// Place next to the co-location path.
    pub const COLOC: u32 = 0x08;
}

pub const MAX_PRIORITY: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub id: RequestId,
    pub path: String,
    pub opaque: Option<String>,
    pub coloc: Option<String>,
    pub ident: String,
    pub notify: String,
    pub priority: u8,
    pub mode: String,
    pub options: u32,
    pub queued_at: DateTime<Utc>,
}

impl PrepareRequest {
    pub fn new(path: impl Into<String>) -> Self {
        PrepareRequest {
            id: RequestId::new(),
            path: path.into(),
            opaque: None,
            coloc: None,
            ident: String::new(),
            notify: String::new(),
            priority: 0,
            mode: String::new(),
            options: 0,
            queued_at: Utc::now(),
        }
    }

    pub fn from_wire(prep: PrepAdd) -> Self {
        PrepareRequest {
            id: RequestId::from_client(&prep.reqid),
            path: prep.path,
            opaque: prep.opaque,
            coloc: prep.coloc,
            ident: prep.ident,
            notify: prep.notify,
            priority: prep.priority.min(MAX_PRIORITY),
            mode: prep.mode,
            options: prep.options,
            queued_at: Utc::now(),
        }
    }

    pub fn to_wire(&self) -> PrepAdd {
        PrepAdd {
            reqid: self.id.to_string(),
            ident: self.ident.clone(),
            notify: self.notify.clone(),
            priority: self.priority,
            mode: self.mode.clone(),
            options: self.options,
            path: self.path.clone(),
            opaque: self.opaque.clone(),
            coloc: self.coloc.clone(),
        }
    }

    pub fn wants_write(&self) -> bool {
        self.options & options::MAKE_RW != 0
    }

    /// Co-location path, only when the option asks for it.
    pub fn coloc_path(&self) -> Option<&str> {
        if self.options & options::COLOC != 0 {
            self.coloc.as_deref()
        } else {
            None
        }
    }
}

/// What happened to a request the worker processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The file is already online on this node, nothing to stage.
    Present(NodeId),
    /// A stage request was sent to this node.
    Dispatched(NodeId),
}

#[derive(thiserror::Error, Debug)]
pub enum PrepareError {
    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("Unable to send stage request to {node}: {source}")]
    Send {
        node: NodeId,
        #[source]
        source: LinkError,
    },

    #[error("Unable to encode stage request: {0}")]
    Encode(#[from] WireError),
}

/// Selection step run by the worker for each request.
pub trait PrepareHandler: Send + Sync {
    fn process(&self, request: &PrepareRequest) -> Result<PrepareOutcome, PrepareError>;
}

pub struct PrepareQueue {
    queue: Mutex<VecDeque<PrepareRequest>>,
    ready: Semaphore,
}

impl Default for PrepareQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PrepareQueue {
    pub fn new() -> Self {
        PrepareQueue {
            queue: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
        }
    }

    pub fn push(&self, request: PrepareRequest) {
        tracing::debug!(reqid=%request.id, path=%request.path, "Queued prepare request");
        self.queue.lock().push_back(request);
        self.ready.add_permits(1);
    }

    /// Remove a request that is still waiting. Returns whether it was found.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|request| &request.id != id);
        before != queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Ids of the waiting requests, head first.
    pub fn pending(&self) -> Vec<RequestId> {
        self.queue.lock().iter().map(|r| r.id.clone()).collect()
    }

    /// Wait for the next request. Permits left behind by cancelled requests
    /// find the queue empty and are skipped.
    pub async fn next(&self) -> Option<PrepareRequest> {
        loop {
            let permit = self.ready.acquire().await.ok()?;
            permit.forget();
            if let Some(request) = self.queue.lock().pop_front() {
                return Some(request);
            }
        }
    }

    /// Stop handing out requests. A waiting worker returns.
    pub fn close(&self) {
        self.ready.close();
    }

    /// Serve requests one at a time until cancelled or closed.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn PrepareHandler>,
        cancellation: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                _ = cancellation.cancelled() => break,
                request = self.next() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match handler.process(&request) {
                Ok(PrepareOutcome::Present(node)) => {
                    tracing::debug!(reqid=%request.id, path=%request.path, %node, "File already online")
                }
                Ok(PrepareOutcome::Dispatched(node)) => {
                    tracing::info!(reqid=%request.id, path=%request.path, %node, "Prepare request dispatched")
                }
                Err(err) => {
                    tracing::warn!(reqid=%request.id, path=%request.path, error=%err, "Dropping prepare request")
                }
            }
        }
        tracing::debug!("Prepare worker stopped");
    }
}
