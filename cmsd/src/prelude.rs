//! Commonly used cluster manager types.
//!
//! Import this module to embed a manager behind your own listener.

pub use super::config::{ManagerConfig, SelectionWeights};
pub use super::id::{Instance, NodeId, RequestId};
pub use super::link::{ChannelLink, Link, LinkError};
pub use super::manager::{Forward, Manager, Upstream};
pub use super::mask::NodeMask;
pub use super::node::{HandlerError, LoginError, Node, NodeFlags, NodeSnapshot, Role};
pub use super::protocol::serve;
pub use super::security::{AuthError, Authenticator, Identity, UnixAuthenticator};
pub use super::select::SelectError;
pub use super::state::{StateSnapshot, StateUpdate};
pub use super::wire::{Frame, RRCode, Request, Response};
