//! Operation application state machine and single-patch apply session.
//!
//! Every branch is idempotent: re-running an already-completed operation
//! detects completion through checksum short-circuits and no-ops. Fatal
//! conditions abort the whole patch; rename failures are collected as
//! [`FailedReplacement`]s and returned so the caller can retry the same
//! journal later. Payload bytes are always consumed, even on skipped or
//! short-circuited branches, because the container stream is not seekable.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::batch::DestinationMap;
use crate::cancel::CancelToken;
use crate::container::ContainerReader;
use crate::delta;
use crate::error::{PatchError, Result};
use crate::journal::{self, JournalWriter, ReplacementRecord};
use crate::model::{
    FailedReplacement, FileSpec, OpKind, Operation, PatchDescriptor, TargetKind, ValidationFile,
};
use crate::util;

pub const JOURNAL_FILE: &str = "update.log";

/// Single-method progress callback. Implementations receive a 0-100
/// percentage plus a human-readable message, and are told when the cancel
/// control should be disabled (mid-swap, where interruption is unsafe).
pub trait ProgressSink: Send {
    fn report(&mut self, percent: u8, message: &str);

    fn cancel_allowed(&mut self, _allowed: bool) {}
}

/// Sink that swallows everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&mut self, _percent: u8, _message: &str) {}
}

enum OpStatus {
    Done,
    Failed(String),
}

struct OpPaths {
    /// Where the pre-patch content currently lives. Equal to `dest` unless
    /// the operation relocates a file.
    current: PathBuf,
    dest: PathBuf,
    staged: PathBuf,
    backup: PathBuf,
}

/// Apply one patch container against a live installation.
///
/// Resumes from the journal in `temp_dir` when one exists: settled
/// operations are skipped (their payload bytes drained), previously failed
/// replacements are retried, and an already-finished patch returns
/// immediately with an empty failure list.
pub fn apply_patch(
    container: &Path,
    patch_id: u64,
    install_dir: &Path,
    temp_dir: &Path,
    redirects: &DestinationMap,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Vec<FailedReplacement>> {
    let mut reader = ContainerReader::open(container)?;
    let descriptor = reader.descriptor().clone();
    if descriptor.id != patch_id {
        return Err(PatchError::Format(format!(
            "container holds patch {} but {} was requested",
            descriptor.id, patch_id
        )));
    }

    fs::create_dir_all(temp_dir)?;
    let journal_path = temp_dir.join(JOURNAL_FILE);

    let mut start_index = 0usize;
    let mut retry_indices: Vec<usize> = Vec::new();
    let mut already_started = false;
    if journal_path.exists() {
        let parsed = journal::parse_journal(&journal_path)?;
        if parsed.current_patch == Some(patch_id) {
            if parsed.log_ended {
                info!(patch_id, "patch already applied, nothing to do");
                return Ok(Vec::new());
            }
            if parsed.log_started {
                already_started = true;
                start_index = parsed.start_file_index.unwrap_or(0);
                retry_indices = parsed
                    .fail_list
                    .iter()
                    .filter(|r| r.patch_id == patch_id)
                    .map(|r| r.file_index)
                    .collect();
                info!(
                    patch_id,
                    start_index,
                    retries = retry_indices.len(),
                    "resuming from journal"
                );
            }
        }
    }

    let mut journal = JournalWriter::open(
        &journal_path,
        descriptor.from_label(),
        &descriptor.version_to,
    )?;
    if !already_started {
        journal.start(patch_id)?;
    }

    let mut session = Session {
        patch_id,
        install_dir,
        temp_dir,
        redirects,
        journal,
        progress,
        cancel,
        failures: Vec::new(),
    };

    let total = descriptor.operations.len().max(1);
    for (index, op) in descriptor.operations.iter().enumerate() {
        session.cancel.checkpoint()?;
        session.progress.report(
            (index * 100 / total) as u8,
            &format!("applying {}", op.destination),
        );

        if index < start_index && !retry_indices.contains(&index) {
            debug!(index, "already settled, draining payload");
            reader.skip_payload(op.payload.length, session.cancel)?;
            continue;
        }

        session.run_operation(&mut reader, op, index)?;
    }

    if session.failures.is_empty() {
        validate(&descriptor, install_dir, redirects)?;
        session.journal.finish(patch_id)?;
        purge_leftovers(temp_dir)?;
        session.progress.report(100, "patch applied");
        info!(patch_id, version = %descriptor.version_to, "patch finished");
    } else {
        warn!(
            patch_id,
            failed = session.failures.len(),
            "patch left retryable failures, validation skipped"
        );
    }
    Ok(session.failures)
}

struct Session<'a> {
    patch_id: u64,
    install_dir: &'a Path,
    temp_dir: &'a Path,
    redirects: &'a DestinationMap,
    journal: JournalWriter,
    progress: &'a mut dyn ProgressSink,
    cancel: &'a CancelToken,
    failures: Vec<FailedReplacement>,
}

impl Session<'_> {
    fn op_paths(&self, op: &Operation) -> OpPaths {
        let dest = self
            .install_dir
            .join(self.redirects.redirect(&op.destination));
        let current = match &op.old_file {
            Some(old) => self.install_dir.join(self.redirects.redirect(&old.path)),
            None => dest.clone(),
        };
        OpPaths {
            current,
            dest,
            staged: self.temp_dir.join(op.id.to_string()),
            backup: self.temp_dir.join(format!("old_{}", op.id)),
        }
    }

    /// Journal record for this operation. Operations that never stage carry
    /// an empty staged path; operations that never back anything up carry
    /// an empty backup path. Revert keys off those empties.
    fn record_for(&self, op: &Operation, index: usize, paths: &OpPaths) -> ReplacementRecord {
        let stages = op.target == TargetKind::File
            && matches!(
                op.kind,
                OpKind::New | OpKind::Force | OpKind::Replace | OpKind::Patch
            );
        let backs_up = op.kind != OpKind::New
            && !(op.target == TargetKind::Folder && op.kind == OpKind::Force);
        ReplacementRecord {
            patch_id: self.patch_id,
            file_index: index,
            backup: if backs_up {
                paths.backup.clone()
            } else {
                PathBuf::new()
            },
            staged: if stages {
                paths.staged.clone()
            } else {
                PathBuf::new()
            },
            dest: paths.dest.clone(),
        }
    }

    fn run_operation(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        index: usize,
    ) -> Result<()> {
        let paths = self.op_paths(op);
        let record = self.record_for(op, index, &paths);
        self.journal.replacement_start(&record)?;

        let status = match op.target {
            TargetKind::Folder => self.apply_folder(reader, op, &paths),
            TargetKind::File => match op.kind {
                OpKind::Remove => self.remove_file(reader, op, &paths),
                OpKind::New => self.new_file(reader, op, &paths),
                OpKind::Force => self.force_file(reader, op, &paths),
                OpKind::Replace | OpKind::Patch => self.replace_file(reader, op, &paths),
            },
        };

        match status {
            Ok(OpStatus::Done) => {
                self.journal.replacement_finish(self.patch_id, index)?;
                Ok(())
            }
            Ok(OpStatus::Failed(reason)) => {
                warn!(index, dest = %paths.dest.display(), reason, "replacement failed");
                self.journal.replacement_failed(self.patch_id, index)?;
                self.failures.push(FailedReplacement {
                    patch_id: self.patch_id,
                    file_index: index,
                    backup: record.backup,
                    staged: record.staged,
                    dest: record.dest,
                    reason,
                });
                Ok(())
            }
            // Fatal: abort immediately, leaving the start record unmatched
            // so the journal shows the operation in flight.
            Err(e) => Err(e),
        }
    }

    fn apply_folder(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<OpStatus> {
        reader.skip_payload(op.payload.length, self.cancel)?;
        match op.kind {
            OpKind::Remove => {
                if paths.current.is_file() {
                    return Err(PatchError::FatalState {
                        path: paths.current.clone(),
                        detail: "expected a folder to remove, found a file".into(),
                    });
                }
                if !paths.current.exists() {
                    return Ok(OpStatus::Done);
                }
                if !util::is_dir_empty(&paths.current)? {
                    // A non-empty folder is deliberately left alone: it
                    // holds data the patch did not put there.
                    debug!(path = %paths.current.display(), "folder not empty, leaving in place");
                    return Ok(OpStatus::Done);
                }
                match fs::rename(&paths.current, &paths.backup) {
                    Ok(()) => Ok(OpStatus::Done),
                    Err(e) => Ok(OpStatus::Failed(format!("folder backup rename: {e}"))),
                }
            }
            OpKind::New | OpKind::Force => {
                if paths.dest.is_file() {
                    return Err(PatchError::FatalState {
                        path: paths.dest.clone(),
                        detail: "a file occupies the path of a new folder".into(),
                    });
                }
                if !paths.dest.exists() {
                    fs::create_dir_all(&paths.dest)?;
                }
                Ok(OpStatus::Done)
            }
            OpKind::Replace | OpKind::Patch => Err(PatchError::Format(format!(
                "operation {} cannot target a folder",
                op.id
            ))),
        }
    }

    fn remove_file(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<OpStatus> {
        reader.skip_payload(op.payload.length, self.cancel)?;
        if paths.current.exists() {
            return Ok(self.swap(&[(&paths.current, &paths.backup)]));
        }
        if paths.backup.exists() {
            // A prior attempt already moved it into the backup slot.
            return Ok(OpStatus::Done);
        }
        Err(PatchError::FatalState {
            path: paths.current.clone(),
            detail: "file to remove is missing and no backup exists".into(),
        })
    }

    fn new_file(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<OpStatus> {
        let new = op.new_spec()?.clone();
        if paths.dest.exists() {
            reader.skip_payload(op.payload.length, self.cancel)?;
            if checked_matches(&paths.dest, &new)? {
                return Ok(OpStatus::Done);
            }
            return Err(self.mismatch(&paths.dest, &new));
        }
        self.stage_payload(reader, op, paths)?;
        Ok(self.swap(&[(&paths.staged, &paths.dest)]))
    }

    fn force_file(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<OpStatus> {
        let new = op.new_spec()?.clone();
        if !paths.current.exists() {
            self.stage_payload(reader, op, paths)?;
            return Ok(self.swap(&[(&paths.staged, &paths.dest)]));
        }

        // An I/O error computing the checksum is not a mismatch; keep the
        // two conditions as distinct fatal kinds.
        let (digest, length) =
            util::file_digest(&paths.current).map_err(|e| PatchError::ChecksumRead {
                path: paths.current.clone(),
                source: e,
            })?;
        if digest == new.checksum && length == new.length {
            reader.skip_payload(op.payload.length, self.cancel)?;
            return Ok(OpStatus::Done);
        }
        if paths.backup.exists() {
            return Err(PatchError::FatalState {
                path: paths.current.clone(),
                detail:
                    "backup already exists but the destination matches neither old nor new content"
                        .into(),
            });
        }
        self.stage_payload(reader, op, paths)?;
        Ok(self.swap(&[
            (&paths.current, &paths.backup),
            (&paths.staged, &paths.dest),
        ]))
    }

    fn replace_file(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<OpStatus> {
        let old = op.old_spec()?.clone();
        if paths.current.exists() {
            if paths.backup.exists() {
                // A prior attempt already advanced past the swap.
                reader.skip_payload(op.payload.length, self.cancel)?;
                return Ok(OpStatus::Done);
            }
            if !checked_matches(&paths.current, &old)? {
                return Err(self.mismatch(&paths.current, &old));
            }
            self.stage_payload(reader, op, paths)?;
            return Ok(self.swap(&[
                (&paths.current, &paths.backup),
                (&paths.staged, &paths.dest),
            ]));
        }

        // No pre-patch content anywhere. Only an interrupted swap (backup
        // and staged both present) is recoverable.
        reader.skip_payload(op.payload.length, self.cancel)?;
        if paths.backup.exists() {
            if paths.dest.exists() {
                return Ok(OpStatus::Done);
            }
            if paths.staged.exists() {
                return Ok(self.swap(&[(&paths.staged, &paths.dest)]));
            }
        }
        Err(PatchError::FatalState {
            path: paths.current.clone(),
            detail: "destination is missing and no backup/staged pair exists".into(),
        })
    }

    /// Reconstruct or copy the new content into the staged slot, always
    /// consuming exactly `payload.length` bytes from the stream. If a
    /// staged file from an interrupted run already matches the expected
    /// new content, staging is skipped and the payload drained.
    fn stage_payload(
        &mut self,
        reader: &mut ContainerReader,
        op: &Operation,
        paths: &OpPaths,
    ) -> Result<()> {
        let new = op.new_spec()?;
        if util::matches_spec(&paths.staged, new)? {
            debug!(staged = %paths.staged.display(), "staged file already complete");
            return reader.skip_payload(op.payload.length, self.cancel);
        }

        let mut out = BufWriter::new(File::create(&paths.staged)?);
        match op.kind {
            OpKind::Patch => {
                let source = util::mmap_file(&paths.current)?;
                let mut payload = reader.payload_reader(op.payload.length);
                delta::apply(
                    &mut payload,
                    op.payload.length,
                    &source,
                    &mut out,
                    self.cancel,
                )?;
            }
            _ => reader.copy_payload(op.payload.length, &mut out, self.cancel)?,
        }
        out.flush()?;
        drop(out);

        // Catch a corrupt payload before anything is swapped in.
        if !util::matches_spec(&paths.staged, new)? {
            let (actual, actual_len) = util::file_digest(&paths.staged)?;
            return Err(PatchError::ChecksumMismatch {
                path: paths.staged.clone(),
                expected: new.checksum.clone(),
                expected_len: new.length,
                actual,
                actual_len,
            });
        }
        Ok(())
    }

    /// Run a rename sequence with cancellation disabled, so an interrupt
    /// can never observe a half-swapped pair. Any rename failure is a
    /// collected replacement failure, not an abort.
    fn swap(&mut self, renames: &[(&Path, &Path)]) -> OpStatus {
        self.cancel.set_cancel_enabled(false);
        self.progress.cancel_allowed(false);
        let mut status = OpStatus::Done;
        for (from, to) in renames {
            if let Err(e) = fs::rename(from, to) {
                status = OpStatus::Failed(format!(
                    "rename {} -> {}: {e}",
                    from.display(),
                    to.display()
                ));
                break;
            }
        }
        self.cancel.set_cancel_enabled(true);
        self.progress.cancel_allowed(true);
        status
    }

    fn mismatch(&self, path: &Path, spec: &FileSpec) -> PatchError {
        let (actual, actual_len) = match util::file_digest(path) {
            Ok(pair) => pair,
            Err(_) => ("<unreadable>".to_string(), 0),
        };
        PatchError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: spec.checksum.clone(),
            expected_len: spec.length,
            actual,
            actual_len,
        }
    }
}

/// [`util::matches_spec`] with read failures mapped to
/// [`PatchError::ChecksumRead`]: I/O trouble while hashing is not a
/// content mismatch.
fn checked_matches(path: &Path, spec: &FileSpec) -> Result<bool> {
    util::matches_spec(path, spec).map_err(|e| PatchError::ChecksumRead {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Final-state validation, run only when no replacement failed.
fn validate(
    descriptor: &PatchDescriptor,
    install_dir: &Path,
    redirects: &DestinationMap,
) -> Result<()> {
    for validation in &descriptor.validations {
        let path = install_dir.join(redirects.redirect(&validation.path));
        if validation.length < 0 {
            if !path.is_dir() {
                return Err(PatchError::FatalState {
                    path,
                    detail: "expected a directory after patching".into(),
                });
            }
            continue;
        }
        check_validation_file(&path, validation)?;
    }
    Ok(())
}

fn check_validation_file(path: &Path, validation: &ValidationFile) -> Result<()> {
    let (actual, actual_len) = util::file_digest(path).map_err(|e| PatchError::ChecksumRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    if actual != validation.checksum || actual_len != validation.length as u64 {
        return Err(PatchError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: validation.checksum.clone(),
            expected_len: validation.length as u64,
            actual,
            actual_len,
        });
    }
    Ok(())
}

/// Drop the retained `old_<id>` backups and any stale `<id>` staged files
/// once a patch is confirmed finished. A staged file survives here when an
/// interrupted run staged it and the retry short-circuited without
/// promoting it. The journal is never touched.
fn purge_leftovers(temp_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let id = name.strip_prefix("old_").unwrap_or(name);
        if id.parse::<u32>().is_err() {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util;

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_a_read_error_not_a_mismatch() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"content").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0)).unwrap();

        let spec = FileSpec {
            path: "f".into(),
            checksum: util::hash_bytes(b"content"),
            length: 7,
        };
        match checked_matches(&path, &spec) {
            Err(PatchError::ChecksumRead { .. }) => {}
            // Privileged users bypass permission bits; the read succeeds.
            Ok(true) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn purge_spares_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old_2"), b"backup").unwrap();
        fs::write(dir.path().join("3"), b"staged").unwrap();
        fs::write(dir.path().join(JOURNAL_FILE), b"journal").unwrap();

        purge_leftovers(dir.path()).unwrap();
        assert!(!dir.path().join("old_2").exists());
        assert!(!dir.path().join("3").exists());
        assert!(dir.path().join(JOURNAL_FILE).exists());
    }
}
