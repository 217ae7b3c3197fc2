//! Common error types
//!
//! One variant per failure kind the servers distinguish on the wire. Leaf
//! components return these; the USB/IP and API front-ends translate them to
//! wire-level statuses.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed wire input (USB/IP message or API line)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown bus, device, endpoint or device type
    #[error("{0} not found")]
    NotFound(String),

    /// Identifier already allocated or device already held
    #[error("conflict: {0}")]
    Conflict(String),

    /// Endpoint already has a pending waiter
    #[error("busy: {0}")]
    Busy(String),

    /// Cancellation propagated from a parent handle
    #[error("cancelled")]
    Cancelled,

    /// Descriptor encoding failure
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that identify a missing entity rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
