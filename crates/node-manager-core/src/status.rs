//! Node lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the supervised node. Exactly one value is current at
/// any time; it is owned by the supervisor and published on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Off,
    Starting,
    Bootstrapping,
    On,
    Desynced,
    Stopping,
    Crashed,
}

impl NodeStatus {
    /// Whether a node process is (or is about to be) alive.
    pub fn is_running(&self) -> bool {
        !matches!(self, NodeStatus::Off | NodeStatus::Crashed)
    }

    pub fn is_closed_or_closing(&self) -> bool {
        !self.is_running() || *self == NodeStatus::Stopping
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Off => "off",
            NodeStatus::Starting => "starting",
            NodeStatus::Bootstrapping => "bootstrapping",
            NodeStatus::On => "on",
            NodeStatus::Desynced => "desynced",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
