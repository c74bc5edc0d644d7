//! Registry Events
//!
//! Events emitted by the node registry for consumers that react to
//! topology changes. Events are sent after the registry lock is released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A node was added and assigned an identity
    NodeAdded { uuid: String, name: String },

    /// A node record was replaced
    NodeUpdated { uuid: String, name: String },

    /// A node was removed
    NodeDeleted { uuid: String, name: String },

    /// Every node was removed
    RegistryCleared { removed: usize },

    /// The registry was repopulated from a fresh discovery
    RegistryRefreshed { node_count: usize, at: DateTime<Utc> },
}

impl RegistryEvent {
    /// Name of the affected node, if the event concerns a single node
    pub fn node_name(&self) -> Option<&str> {
        match self {
            RegistryEvent::NodeAdded { name, .. }
            | RegistryEvent::NodeUpdated { name, .. }
            | RegistryEvent::NodeDeleted { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}
