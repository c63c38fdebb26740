//! Errors internal to the protocol engine.
//!
//! These end a single client connection; they are logged and never surface to the host.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("write stalled for more than {0:?}")]
    WriteTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, VncError>;
