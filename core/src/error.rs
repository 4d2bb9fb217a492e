use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Engine status codes never cross this boundary: a non-success status is
/// translated at the call site into `Io`, carrying the path that was being
/// operated on.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Session is closed")]
    Disposed,
}
