use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// One file or folder mutation inside a patch. Matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    New,
    Force,
    Replace,
    Patch,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    File,
    Folder,
}

/// Path plus expected content identity (blake3 hex + byte length).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub checksum: String,
    pub length: u64,
}

/// Expected final state of one installation path. `length == -1` means the
/// path must be a directory (checksum ignored).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFile {
    pub path: String,
    #[serde(default)]
    pub checksum: String,
    pub length: i64,
}

/// Byte range of an operation's payload inside the container's compressed
/// payload stream. Payloads are concatenated in operation order.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PayloadRef {
    pub position: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Sequential, starts at 1. Also names staging files
    /// (`tempDir/<id>`, `tempDir/old_<id>`).
    pub id: u32,
    pub kind: OpKind,
    pub target: TargetKind,
    /// Relative, '/'-separated. Subject to destination redirection.
    pub destination: String,
    #[serde(default)]
    pub payload: PayloadRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_file: Option<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_file: Option<FileSpec>,
}

impl Operation {
    pub fn old_spec(&self) -> Result<&FileSpec> {
        self.old_file.as_ref().ok_or_else(|| {
            PatchError::Format(format!("operation {} is missing its old file descriptor", self.id))
        })
    }

    pub fn new_spec(&self) -> Result<&FileSpec> {
        self.new_file.as_ref().ok_or_else(|| {
            PatchError::Format(format!("operation {} is missing its new file descriptor", self.id))
        })
    }
}

/// Metadata for one version-to-version upgrade. Immutable once decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from_subsequent: Option<String>,
    pub version_to: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub validations: Vec<ValidationFile>,
}

impl PatchDescriptor {
    /// Structural checks run right after decoding, before any mutation.
    pub fn validate(&self) -> Result<()> {
        if self.version_from.is_some() && self.version_from_subsequent.is_some() {
            return Err(PatchError::Format(
                "version_from and version_from_subsequent are mutually exclusive".into(),
            ));
        }
        for (index, op) in self.operations.iter().enumerate() {
            if op.id as usize != index + 1 {
                return Err(PatchError::Format(format!(
                    "operation ids must be sequential from 1, found {} at index {}",
                    op.id, index
                )));
            }
            if op.destination.is_empty() {
                return Err(PatchError::Format(format!(
                    "operation {} has an empty destination path",
                    op.id
                )));
            }
            if op.target == TargetKind::File {
                match op.kind {
                    OpKind::New | OpKind::Force => {
                        op.new_spec()?;
                    }
                    OpKind::Replace | OpKind::Patch => {
                        op.old_spec()?;
                        op.new_spec()?;
                    }
                    OpKind::Remove => {
                        op.old_spec()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Label for the version this patch upgrades from, for journal headers
    /// and progress messages.
    pub fn from_label(&self) -> &str {
        self.version_from
            .as_deref()
            .or(self.version_from_subsequent.as_deref())
            .unwrap_or("any")
    }
}

/// A replacement that could not complete (typically a rename blocked by a
/// file lock held by another process). Collected, not thrown; the next run
/// picks these up through the journal's fail list.
#[derive(Debug, Clone)]
pub struct FailedReplacement {
    pub patch_id: u64,
    pub file_index: usize,
    pub backup: PathBuf,
    pub staged: PathBuf,
    pub dest: PathBuf,
    pub reason: String,
}
