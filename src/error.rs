//! Error types for the session core.
//!
//! Every failure surfaced to the host maps onto one of the categories below. None of them
//! is fatal to the process: a failed call leaves the session either `Stopped` or in its
//! previous `Running` state.

use std::io;

use thiserror::Error;

/// Errors raised by [`Session`](crate::session::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Framebuffer(#[from] FramebufferError),

    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Establish(#[from] EstablishError),

    #[error("async runtime unavailable: {0}")]
    Runtime(#[source] io::Error),
}

/// Errors raised while allocating or writing the pixel buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramebufferError {
    #[error("invalid framebuffer dimensions {width}x{height} (must be 1-{max})")]
    InvalidDimensions { width: u32, height: u32, max: u16 },

    #[error("framebuffer size {width}x{height}x4 overflows")]
    SizeOverflow { width: u16, height: u16 },

    #[error("failed to allocate {bytes} bytes for framebuffer")]
    AllocationFailed { bytes: usize },

    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Errors raised by reverse and repeater connections.
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("repeater identifier is {len} bytes, at most {max} fit in the ID frame")]
    IdentifierTooLong { len: usize, max: usize },

    #[error("failed to connect to {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {ms}ms connecting to {host}:{port}")]
    Timeout { host: String, port: u16, ms: u128 },

    #[error("repeater ID frame truncated: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Errors raised when binding a protocol thread to the host runtime.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to attach thread to host runtime: {0}")]
    AttachFailed(String),
}
