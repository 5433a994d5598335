//! Rollback protocol: undo partially-applied patches using the journal.
//!
//! The undo list is the unfinished replacement (if the process died with
//! one in flight), then the failed replacements, then the finished ones
//! newest-first, so changes are unwound in the reverse of the order they
//! were made. Each reverted entry is journaled with a `Revert` record,
//! which makes repeated revert attempts idempotent: a second pass sees
//! those records and has nothing left to undo.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;
use crate::journal::{self, JournalWriter, ReplacementRecord};

/// Undo every in-flight, failed, and finished replacement recorded in
/// `journal_path`. Returns the number of entries reverted.
pub fn revert_patch(journal_path: &Path) -> Result<usize> {
    let parsed = journal::parse_journal(journal_path)?;
    let mut journal = JournalWriter::open(journal_path, "rollback", "previous")?;

    // The unfinished replacement is the newest mutation of all: a kill
    // between the two swap renames leaves its backup holding the original
    // with no finish record, so it must be unwound first.
    let mut reverted = 0usize;
    for record in parsed
        .unfinished
        .iter()
        .chain(parsed.fail_list.iter())
        .chain(parsed.revert_list.iter())
    {
        revert_record(record)?;
        journal.revert(record.patch_id, record.file_index)?;
        reverted += 1;
    }
    info!(
        journal = %journal_path.display(),
        reverted,
        "rollback complete"
    );
    Ok(reverted)
}

/// Undo one replacement. The staged/backup paths in the record drive the
/// direction: a promoted file moves back to its staged slot, a backed-up
/// original moves back to the destination, and a pure creation (empty
/// staged path) is deleted outright.
fn revert_record(record: &ReplacementRecord) -> Result<()> {
    let staged_is_empty = record.staged.as_os_str().is_empty();
    let backup_is_empty = record.backup.as_os_str().is_empty();

    // A record that declares a backup only mutated the destination after
    // creating it; a missing backup means the swap never ran and the
    // destination still holds the original.
    if record.dest.exists() && (staged_is_empty || !record.staged.exists()) {
        if staged_is_empty {
            if backup_is_empty {
                remove_created(&record.dest);
            }
        } else if backup_is_empty || record.backup.exists() {
            debug!(dest = %record.dest.display(), "moving promoted file back to staging");
            fs::rename(&record.dest, &record.staged)?;
        }
    }

    if !backup_is_empty && !record.dest.exists() && record.backup.exists() {
        debug!(dest = %record.dest.display(), "restoring backup");
        fs::rename(&record.backup, &record.dest)?;
    }
    Ok(())
}

/// Delete something a patch created. Directories are only removed when
/// empty: anything inside was put there after the fact and is not ours to
/// destroy.
fn remove_created(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "leaving created path in place");
    }
}
