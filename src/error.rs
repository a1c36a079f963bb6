// Error taxonomy shared by every layer. All variants map to exit code 74
// at the top level; usage errors are handled by the argument parser before
// any of these can occur.

use std::path::PathBuf;
use std::time::Duration;

/// What kind of remote entry a lookup was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Folder => write!(f, "folder"),
        }
    }
}

/// Errors produced by the client library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lookup by name matched nothing.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntryKind, name: String },

    /// A lookup by name matched more than one entry.
    #[error("{kind} '{name}' matched more than one entry")]
    AmbiguousMatch { kind: EntryKind, name: String },

    /// The local download destination already exists. Checked before any
    /// byte is written; no partial file is ever left behind.
    #[error("the local file '{}' already exists", .0.display())]
    LocalConflict(PathBuf),

    /// The remote API answered with a non-success status that the retry
    /// policy does not cover (or no policy is active).
    #[error("remote API returned HTTP {status}: {detail}")]
    Api { status: u16, detail: String },

    /// The retry budget ran out while a request kept failing.
    #[error("giving up after {attempts} attempts over {elapsed:.0?}: {last}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        last: String,
    },

    /// A chunk of a streamed (non-seekable) source failed and cannot be
    /// retried, even though a retry policy is active. Kept distinct from
    /// [`Error::RetriesExhausted`] so the operator can tell a capability
    /// gap from a spent budget.
    #[error("transfer failed and a streamed source cannot be retried: {0}")]
    StreamNotRetryable(String),

    /// The remote side violated the resumable-transfer protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authorization handshake or credential refresh failure.
    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}
