//! Error taxonomy for the tunnel stream subsystem.
//!
//! Mirrors the five error kinds in the design: protocol, transport, persistence,
//! resource, and programmer errors. Each concern gets its own `thiserror` enum;
//! [`TunnelError`] composes them so callers can match on [`ErrorKind`] without
//! parsing message text.

use std::io;

/// Wire codec failures (§4.A).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("incomplete data: needed {needed} bytes, had {available}")]
    IncompleteData { needed: usize, available: usize },

    #[error("decode error: {field} out of range: {detail}")]
    DecodeError { field: &'static str, detail: String },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("wrong container type: expected {expected}, found {found}")]
    WrongContainerType { expected: u8, found: u8 },
}

impl CodecError {
    pub fn incomplete(needed: usize, available: usize) -> Self {
        CodecError::IncompleteData { needed, available }
    }

    pub fn decode(field: &'static str, detail: impl Into<String>) -> Self {
        CodecError::DecodeError { field, detail: detail.into() }
    }
}

/// Persistence store failures (§4.C).
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o error during {step}: {source}")]
    Io {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("persistence file is locked by another process")]
    AlreadyLocked,

    #[error("unsupported persistence file version {0} (only version 3 is supported)")]
    UnsupportedVersion(u32),

    #[error("recovery inconsistency: free({free}) + saved({saved}) != max_msg_count({max})")]
    RecoveryInconsistency { free: u32, saved: u32, max: u32 },

    #[error("persistence store is full ({0} slots in use)")]
    PersistenceFull(u32),

    #[error("message length {0} exceeds max_msg_length {1}")]
    MessageTooLarge(u32, u32),

    #[error("invalid slot reference {0}")]
    InvalidSlot(u32),
}

impl PersistenceError {
    pub fn io(step: &'static str, source: io::Error) -> Self {
        PersistenceError::Io { step, source }
    }
}

/// Classification used to decide how a failure is surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Transport,
    Persistence,
    Resource,
    Programmer,
}

/// Top-level error type returned from every public entry point.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("transport error: {0}")]
    Transport(io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no buffer available")]
    BufferNoBuffers,

    #[error("no such tunnel stream")]
    NoTunnelStream,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Codec(_) | TunnelError::Protocol(_) => ErrorKind::Protocol,
            TunnelError::Persistence(_) => ErrorKind::Persistence,
            TunnelError::Transport(_) => ErrorKind::Transport,
            TunnelError::BufferNoBuffers => ErrorKind::Resource,
            TunnelError::InvalidArgument(_) | TunnelError::NoTunnelStream => {
                ErrorKind::Programmer
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
