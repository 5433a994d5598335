use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the patch engine.
///
/// Fatal variants unwind the whole apply attempt immediately. Rename
/// failures are *not* represented here: they are collected as
/// [`FailedReplacement`](crate::model::FailedReplacement) values and
/// returned to the caller so the same journal can be retried later.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Malformed patch container or metadata. Raised before any file
    /// mutation takes place.
    #[error("malformed patch container: {0}")]
    Format(String),

    /// Declared and actual file content disagree.
    #[error("checksum mismatch for {path}: expected {expected}/{expected_len} bytes, found {actual}/{actual_len} bytes")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        expected_len: u64,
        actual: String,
        actual_len: u64,
    },

    /// The checksum could not be computed at all (I/O error reading the
    /// file). Kept distinct from a mismatch on purpose.
    #[error("failed to read {path} for checksum verification")]
    ChecksumRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An impossible on-disk combination, e.g. destination missing with no
    /// backup. Requires operator attention; the journal is preserved.
    #[error("unrecoverable state for {path}: {detail}")]
    FatalState { path: PathBuf, detail: String },

    /// Timed out acquiring an advisory lock.
    #[error("timed out acquiring the {name} lock after {waited_ms} ms")]
    LockTimeout { name: String, waited_ms: u64 },

    /// Cooperative interruption. Open handles are closed on unwind and the
    /// journal stays consistent for resume.
    #[error("patch application cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;
