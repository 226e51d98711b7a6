use serde::{Deserialize, Serialize};
use std::fmt::Display;

use uuid::Uuid;

/// Identifier of a registered node. Stable for the lifetime of the slot the
/// node occupies; reused slots are told apart by [`Instance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Counter bumped every time a slot is handed to a (re)connecting node.
pub type Instance = u32;

/// Identifier of a prepare request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Use a caller supplied id, generating one when it is empty.
    pub fn from_client(id: &str) -> Self {
        if id.trim().is_empty() {
            Self::new()
        } else {
            Self(id.trim().to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::from_client(s)
    }
}
