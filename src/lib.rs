//! In-place patch application and recovery engine.
//!
//! Applies binary patch containers against a live installation with
//! crash-safe recovery: every file mutation is framed by write-ahead
//! journal records, so a killed process can resume exactly where it
//! stopped or roll partially-applied changes back. Advisory file locks
//! serialize updater, downloader, and running-instance activity across
//! processes.

pub mod apply;
pub mod batch;
pub mod cancel;
pub mod container;
pub mod delta;
pub mod error;
pub mod journal;
pub mod lock;
pub mod model;
pub mod revert;
pub mod util;

pub use apply::{apply_patch, NullProgress, ProgressSink, JOURNAL_FILE};
pub use batch::{apply_batch, BatchConfig, BatchOutcome, DestinationMap};
pub use cancel::CancelToken;
pub use container::{write_container, Compression, ContainerReader};
pub use error::{PatchError, Result};
pub use lock::LockCoordinator;
pub use model::{
    FailedReplacement, FileSpec, OpKind, Operation, PatchDescriptor, PayloadRef, TargetKind,
    ValidationFile,
};
pub use revert::revert_patch;
pub use util::clear_staging_area;
