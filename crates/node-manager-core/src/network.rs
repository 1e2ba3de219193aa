//! Network selector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NodeManagerError;

/// The network a node session runs against. Mainnet and buildnet keep
/// disjoint staking targets and value histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Buildnet,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Mainnet, Network::Buildnet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Buildnet => "buildnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = NodeManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "buildnet" => Ok(Network::Buildnet),
            other => Err(NodeManagerError::InvalidRequest(format!(
                "unknown network: {other}"
            ))),
        }
    }
}
