//! Node manager error types.

use crate::status::NodeStatus;

/// Coarse classification used by callers to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation is invalid for the current state; never retried automatically.
    RejectedByState,
    /// Connection refused or timeout against the node, metrics or client.
    TransientRemote,
    /// The store has no such row.
    NotFound,
    /// An operation is still in flight for this address; skip this cycle.
    PendingConflict,
    /// Missing binaries or unusable directories.
    FatalSetup,
    /// Caller supplied arguments that can never succeed.
    InvalidRequest,
    Internal,
}

/// Errors that can occur in the node manager.
#[derive(Debug, thiserror::Error)]
pub enum NodeManagerError {
    #[error("node is already running (status: {0})")]
    AlreadyRunning(NodeStatus),

    #[error("node is already stopped")]
    AlreadyStopped,

    #[error("node is already stopping")]
    AlreadyStopping,

    #[error("node is not up")]
    NodeNotUp,

    #[error("node manager is shutting down")]
    Closed,

    #[error("address {0} is already staking")]
    AddressAlreadyStaking(String),

    #[error("address {0} is not a staking address")]
    AddressNotFound(String),

    #[error("address {address} needs to {action} rolls but has {balance} which is less than minimal fees ({fees:.2})")]
    InsufficientFees {
        address: String,
        action: &'static str,
        balance: f64,
        fees: f64,
    },

    #[error("operation {operation_id} of address {address} is not completed yet")]
    PendingOperation {
        address: String,
        operation_id: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("node RPC error: {0}")]
    Rpc(String),

    #[error("client command error: {0}")]
    Client(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<NodeManagerError>),
}

pub type Result<T> = std::result::Result<T, NodeManagerError>;

impl NodeManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyRunning(_)
            | Self::AlreadyStopped
            | Self::AlreadyStopping
            | Self::NodeNotUp
            | Self::Closed
            | Self::AddressAlreadyStaking(_)
            | Self::AddressNotFound(_)
            | Self::InsufficientFees { .. } => ErrorKind::RejectedByState,
            Self::PendingOperation { .. } => ErrorKind::PendingConflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NodeUnreachable(_) | Self::Timeout(_) => ErrorKind::TransientRemote,
            Self::Http(e) if e.is_connect() || e.is_timeout() => ErrorKind::TransientRemote,
            Self::Config(_) => ErrorKind::FatalSetup,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_pending_conflict(&self) -> bool {
        self.kind() == ErrorKind::PendingConflict
    }

    /// True when the node API refused the connection, which is expected while
    /// the node is still bootstrapping.
    pub fn is_connection_refused(&self) -> bool {
        match self {
            Self::NodeUnreachable(_) => true,
            Self::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    /// Collapse a list of errors: none → `Ok`, one → that error, more → `Multiple`.
    pub fn aggregate(mut errors: Vec<NodeManagerError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

fn join_messages(errors: &[NodeManagerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
