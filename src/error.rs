// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Library error type.
//
// Fatal conditions (buffer magic mismatch mid-datapath, accounting mismatch
// between copied bytes and the message size) are not representable as an
// `Error`: they imply shared-memory corruption and abort the process.

/// Errors reported to the caller by the datapath and control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument is unusable: zero/oversize message,
    /// malformed IP string, mismatched scatter-gather accounting.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The caller's receive vector is smaller than the incoming message.
    /// The entire incoming chain has been released back to the pool.
    #[error("receive vector too small for incoming message")]
    Truncated,

    /// The buffer pool cannot supply the required count, or a transmit
    /// ring rejected an enqueue. Nothing was sent; no buffers leaked.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The controller could not be reached, reported a failure status, or
    /// did not answer within the bounded retry budget.
    #[error("controller unavailable: {0}")]
    ControllerUnavailable(String),

    /// The controller answered with a malformed or mismatched response, or
    /// a mapped segment fails its magic validation.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Abort the process on unrecoverable shared-memory corruption.
///
/// The channel segment is shared with the controller; once a buffer magic
/// or byte-accounting check fails there is no consistent state to return to.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal channel corruption: {msg}");
    std::process::abort();
}
