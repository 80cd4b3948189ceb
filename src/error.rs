//! Error taxonomy distinguishing fatal configuration errors from
//! per-connection I/O conditions. Per-connection I/O errors (a failed
//! `read`/`write`, ECONNRESET, EWOULDBLOCK, ...) are not represented here;
//! they're matched inline against `io::ErrorKind` at the call site and
//! folded into connection teardown, mirroring `muduo`'s `LOG_ERROR` usage.
//! `ReactorError` covers only the class of errors that `muduo` reports via
//! `LOG_FATAL`: failures that mean the process cannot usefully continue.
use std::io;

use thiserror::Error;

/// Fatal, non-recoverable configuration errors raised while building or
/// starting a server: a bad bind address, a listen() failure, or a failure
/// to create the OS-level polling primitives an event loop needs.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Failed to create the listening socket.
    #[error("failed to create listening socket: {0}")]
    SocketCreate(#[source] io::Error),

    /// Failed to bind the listening socket to its address.
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    /// Failed to put the listening socket into the listening state.
    #[error("failed to listen on socket: {0}")]
    Listen(#[source] io::Error),

    /// Failed to create the `mio` poll instance backing an event loop.
    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),

    /// Failed to create the cross-thread wakeup handle for an event loop.
    #[error("failed to create waker: {0}")]
    Waker(#[source] io::Error),
}

impl ReactorError {
    /// Logs this error at fatal severity and aborts the process, matching
    /// `muduo`'s `LOG_FATAL`, which does the same on construction-time
    /// failures of this kind. These errors are not recoverable: a bad
    /// bind address or a broken polling primitive means the process
    /// cannot usefully continue. Intended to be called as
    /// `server_result.unwrap_or_else(|e| e.log_fatal())` at startup; the
    /// `!` return type lets it stand in for any `T` the `Result` carried.
    pub fn log_fatal(&self) -> ! {
        tracing::error!(error = %self, "fatal reactor configuration error");
        std::process::abort();
    }
}
