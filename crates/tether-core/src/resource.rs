//! Resource handles issued by a broker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, connection-scoped handle to an endpoint served by a broker.
///
/// IDs only mean something to the broker pair that issued them. Dialing an ID
/// against any other broker is a usage bug and fails with
/// [`TetherError::ResourceNotFound`](crate::TetherError::ResourceNotFound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    /// The root service of a link. Never issued by `serve_new`.
    pub const ROOT: ResourceId = ResourceId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ResourceId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Response body of every method that logically returns a new capability.
///
/// Carries the handle and nothing else; the sub-resource's data is only
/// reachable by dialing the handle and calling methods on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReply {
    pub resource_id: ResourceId,
}
