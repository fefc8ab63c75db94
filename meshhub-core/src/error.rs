use thiserror::Error;

use crate::transport::TransportKind;

/// Errors surfaced by the connection, transport and persistence layers
#[derive(Debug, Error)]
pub enum MeshError {
    /// The transport type is known but this build has no implementation for it
    #[error("{0} transport is not supported in this build")]
    TransportNotSupported(TransportKind),

    /// A transport name outside the recognized set; a caller bug, not an environmental failure
    #[error("unknown transport type: {0:?}")]
    UnknownTransportType(String),

    /// The radio could not be reached, rejected us, or timed out
    #[error("failed to connect to {address} via {kind}: {message}")]
    Connection {
        kind: TransportKind,
        address: String,
        message: String,
    },

    /// Discovery on one transport failed; other transports are unaffected
    #[error("scanning for {kind} devices failed: {message}")]
    Scan { kind: TransportKind, message: String },

    /// A Connected session already exists for this address
    #[error("already connected to {0}")]
    DuplicateConnect(String),

    #[error("no session named {0}")]
    UnknownSession(String),

    /// The session exists but its link has been closed
    #[error("session {0} is not connected")]
    SessionClosed(String),

    #[error("channel {index} on {device} is disabled")]
    ChannelDisabled { device: String, index: u32 },

    #[error("device {device} has no channel {index}")]
    UnknownChannel { device: String, index: u32 },

    #[error("node {node} not found in the node list of {device}")]
    UnknownNode { device: String, node: String },

    #[error("nothing to send")]
    EmptyMessage,

    /// The transport accepted the session but failed to transmit
    #[error("send on {device} failed: {message}")]
    Send { device: String, message: String },

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("message log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message log format error: {0}")]
    Csv(#[from] csv::Error),
}

impl MeshError {
    /// Whether a caller may log this error and carry on with other work.
    ///
    /// Only an unrecognized transport type indicates a programming or
    /// configuration error that should abort the surrounding operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MeshError::UnknownTransportType(_))
    }

    /// True for the persistence variants
    pub fn is_persistence(&self) -> bool {
        matches!(self, MeshError::Io(_) | MeshError::Csv(_))
    }
}
