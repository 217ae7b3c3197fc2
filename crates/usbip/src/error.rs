//! Wire protocol error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown URB command: {0:#010x}")]
    UnknownCommand(u32),

    #[error("unknown op code: {0:#06x}")]
    UnknownOp(u16),

    #[error("unsupported protocol version: {0:#06x}")]
    BadVersion(u16),

    #[error("transfer buffer too large: {0} bytes")]
    TransferTooLarge(u32),

    #[error("busid is not valid UTF-8")]
    BadBusId,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
