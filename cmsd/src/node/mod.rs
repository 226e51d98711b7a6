//! # Node Module
//!
//! A [`Node`] is the manager's record of one logged in data server,
//! supervisor, peer or proxy.
//!
//! ## State
//!
//! The immutable part (host, port, role, placement level, exports) is fixed
//! at login. Everything else lives behind a single per-node lock:
//! - **NodeFlags**: independent booleans (connected, offline, suspended,
//!   no-stage, disabled, gone, ...)
//! - **Capacity**: the last load sample plus the derived load, mass and cost
//! - **Usage**: how often the node was picked, per period and in total
//! - the current link, instance counter and pending drop timer
//!
//! ## Contribution
//!
//! A node counts as *active* while it is a connected, bound, read-write
//! member that is not suspended, and as *staging* while it is active and
//! staging is allowed. Handlers measure the change in that contribution
//! under the node lock and feed it to the cluster state after releasing it.
//!
//! ## Lifecycle
//!
//! ```text
//! login ──► connected ──Disc/EOF/missed ping──► offline ──drop delay──► removed
//!              ▲                                   │
//!              └──────────── same host:port:sid ───┘
//!                       (slot reused, instance + 1)
//! connected ──Gone──► removed
//! ```

pub mod errors;
pub mod handlers;
pub mod node;
pub mod status;

pub use errors::{HandlerError, LoginError};
pub use handlers::Reply;
pub use node::{Node, NodeInfo};
pub use status::{Capacity, NodeFlags, NodeSnapshot, Role, Usage};

#[cfg(test)]
#[path = "mod.test.rs"]
mod tests;
