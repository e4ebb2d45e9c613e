//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by public interfaces in the `ember` workspace.
pub type EmberResult<T> = Result<T, EmberError>;

/// High-level error categories for the execution core and its collaborators.
///
/// Client-visible command failures never travel through this enum. They are
/// reported on the reply channel as error-typed replies so the connection
/// stays usable; `EmberError` is reserved for programmatic API misuse,
/// malformed wire payloads and I/O faults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmberError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client payload is malformed or violates framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
