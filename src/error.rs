//! The crate-wide error taxonomy.
//!
//! Each variant names one failure kind that callers (and the reconnection
//! supervisor) may want to branch on. Transport-level detail lives in the
//! module errors ([`crate::handshake::Error`], [`crate::http::Error`]) which are
//! carried as sources.

use std::path::PathBuf;
use std::time::Duration;

/// Everything that can go wrong while discovering, connecting to, or talking
/// with the control plane.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No manifest exists in any candidate location.
    #[error("no control-plane manifest found in any known location")]
    DiscoveryUnavailable,
    #[error("failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {path} is malformed: {source}")]
    ManifestInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The helper could not be spawned, read from, or its payload decoded.
    #[error("native handshake failed: {0}")]
    HandshakeIo(#[source] crate::handshake::Error),
    #[error("native handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("stream handshake failed: {0}")]
    StreamHandshakeFailed(String),
    #[error("tool registration failed: {0}")]
    ToolRegistrationFailed(String),
    /// No response arrived for a correlated request.
    #[error("request {id} ({method}) timed out after {timeout:?}")]
    RequestTimeout {
        id: String,
        method: String,
        timeout: Duration,
    },
    /// The message endpoint answered something other than 202.
    #[error("message endpoint rejected submission with status {0}")]
    SubmissionRejected(u16),
    #[error("connection to the control plane was lost")]
    ConnectionLost,
    #[error("main-thread work item did not complete within {0:?}")]
    WorkItemTimeout(Duration),
    /// The bridge was closed before the item ran.
    #[error("main-thread work item was cancelled before it ran")]
    WorkItemCancelled,
    #[error("handler failed: {0}")]
    HandlerException(String),
    /// A stop was requested while connecting.
    #[error("client is stopping")]
    Stopping,
    #[error("not connected to the control plane")]
    NotConnected,
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<crate::handshake::Error> for Error {
    fn from(value: crate::handshake::Error) -> Self {
        match value {
            crate::handshake::Error::Timeout(after) => Error::HandshakeTimeout(after),
            other => Error::HandshakeIo(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_keeps_its_own_kind() {
        let err: Error = crate::handshake::Error::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, Error::HandshakeTimeout(d) if d == Duration::from_secs(5)));

        let err: Error = crate::handshake::Error::InvalidLength(0).into();
        assert!(matches!(err, Error::HandshakeIo(_)));
    }
}
