//! Crash-recovery journal.
//!
//! Append-only, line-oriented write-ahead log. One journal serves one apply
//! session, which may span several queued patches. Line grammar:
//!
//! ```text
//! (<patchId> <action> [<fileIndex>] [<hexBackup> <hexNew> <hexDest>])\t<from>-><to>, <description>
//! ```
//!
//! Actions: 0 start, 1 finish, 2 replacement-start, 3 replacement-finish,
//! 4 replacement-failed, 5 revert. The three hex-encoded path fields appear
//! only on action 2; actions 2-5 carry the file index. An empty path (an
//! operation that never stages or never backs up) is written as `-`.
//!
//! The parser walks the file sequentially and skips malformed lines, so a
//! line truncated mid-write by a crash does not poison the whole parse.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Finish,
    ReplacementStart,
    ReplacementFinish,
    ReplacementFailed,
    Revert,
}

impl Action {
    fn code(self) -> u8 {
        match self {
            Action::Start => 0,
            Action::Finish => 1,
            Action::ReplacementStart => 2,
            Action::ReplacementFinish => 3,
            Action::ReplacementFailed => 4,
            Action::Revert => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Action::Start,
            1 => Action::Finish,
            2 => Action::ReplacementStart,
            3 => Action::ReplacementFinish,
            4 => Action::ReplacementFailed,
            5 => Action::Revert,
            _ => return None,
        })
    }

    fn describe(self) -> &'static str {
        match self {
            Action::Start => "patch start",
            Action::Finish => "patch finish",
            Action::ReplacementStart => "replacement start",
            Action::ReplacementFinish => "replacement finish",
            Action::ReplacementFailed => "replacement failed",
            Action::Revert => "revert",
        }
    }
}

/// Everything needed to retry or undo one operation's replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRecord {
    pub patch_id: u64,
    pub file_index: usize,
    pub backup: PathBuf,
    pub staged: PathBuf,
    pub dest: PathBuf,
}

pub struct JournalWriter {
    file: File,
    version_from: String,
    version_to: String,
}

impl JournalWriter {
    /// Open for appending, creating the file if needed. `from`/`to` label
    /// the informational tail of every line.
    pub fn open(path: &Path, from: &str, to: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            version_from: from.to_string(),
            version_to: to.to_string(),
        })
    }

    pub fn start(&mut self, patch_id: u64) -> Result<()> {
        self.write_line(format!("{patch_id} {}", Action::Start.code()), Action::Start)
    }

    pub fn finish(&mut self, patch_id: u64) -> Result<()> {
        self.write_line(format!("{patch_id} {}", Action::Finish.code()), Action::Finish)
    }

    pub fn replacement_start(&mut self, record: &ReplacementRecord) -> Result<()> {
        self.write_line(
            format!(
                "{} {} {} {} {} {}",
                record.patch_id,
                Action::ReplacementStart.code(),
                record.file_index,
                encode_path(&record.backup),
                encode_path(&record.staged),
                encode_path(&record.dest),
            ),
            Action::ReplacementStart,
        )
    }

    pub fn replacement_finish(&mut self, patch_id: u64, file_index: usize) -> Result<()> {
        self.indexed(Action::ReplacementFinish, patch_id, file_index)
    }

    pub fn replacement_failed(&mut self, patch_id: u64, file_index: usize) -> Result<()> {
        self.indexed(Action::ReplacementFailed, patch_id, file_index)
    }

    pub fn revert(&mut self, patch_id: u64, file_index: usize) -> Result<()> {
        self.indexed(Action::Revert, patch_id, file_index)
    }

    fn indexed(&mut self, action: Action, patch_id: u64, file_index: usize) -> Result<()> {
        self.write_line(format!("{patch_id} {} {file_index}", action.code()), action)
    }

    /// Each record is flushed and synced individually: the journal must hit
    /// the disk before the file mutation it describes becomes observable.
    fn write_line(&mut self, head: String, action: Action) -> Result<()> {
        let line = format!(
            "({head})\t{}->{}, {}\n",
            self.version_from,
            self.version_to,
            action.describe()
        );
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn encode_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    if text.is_empty() {
        "-".to_string()
    } else {
        hex::encode(text.as_bytes())
    }
}

fn decode_path(token: &str) -> Option<PathBuf> {
    if token == "-" {
        return Some(PathBuf::new());
    }
    let bytes = hex::decode(token).ok()?;
    Some(PathBuf::from(String::from_utf8(bytes).ok()?))
}

/// Outcome of replaying a journal after a restart.
#[derive(Debug, Default)]
pub struct ParsedJournal {
    pub log_started: bool,
    pub log_ended: bool,
    /// The patch most recently opened in this journal.
    pub current_patch: Option<u64>,
    /// Replacements whose last event was a failure, in encounter order.
    pub fail_list: Vec<ReplacementRecord>,
    /// Replacements whose last event was a finish, most recent first, so a
    /// rollback undoes the newest change before anything it built on.
    pub revert_list: Vec<ReplacementRecord>,
    /// A replacement-start with no matching finish/failed: the operation in
    /// flight when the process stopped.
    pub unfinished: Option<ReplacementRecord>,
    /// File index to resume the current patch from, `None` once finished.
    pub start_file_index: Option<usize>,
}

struct RawRecord {
    patch_id: u64,
    action: Action,
    file_index: Option<usize>,
    paths: Option<(PathBuf, PathBuf, PathBuf)>,
}

pub fn parse_journal(path: &Path) -> Result<ParsedJournal> {
    let reader = BufReader::new(File::open(path)?);

    let mut out = ParsedJournal::default();
    // Encounter-ordered replacement entries with their latest action.
    let mut entries: Vec<(ReplacementRecord, Action)> = Vec::new();
    let mut by_key: HashMap<(u64, usize), usize> = HashMap::new();
    let mut skipped = 0usize;

    for line in reader.split(b'\n') {
        let line = line?;
        let Ok(text) = std::str::from_utf8(&line) else {
            skipped += 1;
            continue;
        };
        let Some(raw) = parse_line(text) else {
            if !text.trim().is_empty() {
                skipped += 1;
            }
            continue;
        };
        match raw.action {
            Action::Start => {
                out.log_started = true;
                out.log_ended = false;
                out.current_patch = Some(raw.patch_id);
            }
            Action::Finish => {
                out.log_ended = true;
            }
            Action::ReplacementStart => {
                let (backup, staged, dest) = match raw.paths {
                    Some(paths) => paths,
                    None => continue,
                };
                let (file_index, record) = match raw.file_index {
                    Some(index) => (
                        index,
                        ReplacementRecord {
                            patch_id: raw.patch_id,
                            file_index: index,
                            backup,
                            staged,
                            dest,
                        },
                    ),
                    None => continue,
                };
                match by_key.get(&(raw.patch_id, file_index)) {
                    Some(&slot) => entries[slot] = (record, Action::ReplacementStart),
                    None => {
                        by_key.insert((raw.patch_id, file_index), entries.len());
                        entries.push((record, Action::ReplacementStart));
                    }
                }
            }
            Action::ReplacementFinish | Action::ReplacementFailed | Action::Revert => {
                let Some(index) = raw.file_index else { continue };
                if let Some(&slot) = by_key.get(&(raw.patch_id, index)) {
                    entries[slot].1 = raw.action;
                }
            }
        }
    }

    if skipped > 0 {
        debug!(skipped, path = %path.display(), "skipped malformed journal lines");
    }

    let mut finished = Vec::new();
    for (record, last) in &entries {
        match last {
            Action::ReplacementFailed => out.fail_list.push(record.clone()),
            Action::ReplacementFinish => finished.push(record.clone()),
            Action::ReplacementStart => {
                if out.current_patch == Some(record.patch_id) {
                    out.unfinished = Some(record.clone());
                }
            }
            _ => {}
        }
    }
    finished.reverse();
    out.revert_list = finished;

    out.start_file_index = if out.log_ended || !out.log_started {
        None
    } else if let Some(unfinished) = &out.unfinished {
        Some(unfinished.file_index)
    } else {
        let settled_max = entries
            .iter()
            .filter(|(record, last)| {
                out.current_patch == Some(record.patch_id)
                    && matches!(last, Action::ReplacementFinish | Action::ReplacementFailed)
            })
            .map(|(record, _)| record.file_index)
            .max();
        Some(settled_max.map_or(0, |max| max + 1))
    };

    Ok(out)
}

fn parse_line(line: &str) -> Option<RawRecord> {
    let rest = line.strip_prefix('(')?;
    let (head, _tail) = rest.split_once(')')?;
    let mut tokens = head.split_ascii_whitespace();

    let patch_id: u64 = tokens.next()?.parse().ok()?;
    let action = Action::from_code(tokens.next()?.parse().ok()?)?;

    let mut record = RawRecord {
        patch_id,
        action,
        file_index: None,
        paths: None,
    };
    match action {
        Action::Start | Action::Finish => {}
        Action::ReplacementFinish | Action::ReplacementFailed | Action::Revert => {
            record.file_index = Some(tokens.next()?.parse().ok()?);
        }
        Action::ReplacementStart => {
            record.file_index = Some(tokens.next()?.parse().ok()?);
            let backup = decode_path(tokens.next()?)?;
            let staged = decode_path(tokens.next()?)?;
            let dest = decode_path(tokens.next()?)?;
            record.paths = Some((backup, staged, dest));
        }
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(patch_id: u64, file_index: usize) -> ReplacementRecord {
        ReplacementRecord {
            patch_id,
            file_index,
            backup: PathBuf::from(format!("/tmp/old_{}", file_index + 1)),
            staged: PathBuf::from(format!("/tmp/{}", file_index + 1)),
            dest: PathBuf::from(format!("/install/f{file_index}")),
        }
    }

    fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("update.log")
    }

    #[test]
    fn round_trips_replacement_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(5).unwrap();
        let rec = record(5, 0);
        writer.replacement_start(&rec).unwrap();
        writer.replacement_finish(5, 0).unwrap();
        writer.finish(5).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert!(parsed.log_started);
        assert!(parsed.log_ended);
        assert_eq!(parsed.current_patch, Some(5));
        assert_eq!(parsed.start_file_index, None);
        assert_eq!(parsed.revert_list, vec![rec]);
        assert!(parsed.fail_list.is_empty());
        assert!(parsed.unfinished.is_none());
    }

    #[test]
    fn unfinished_replacement_sets_resume_index() {
        // Start plus a replacement-start at index 2 with no finish/failed.
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(9).unwrap();
        writer.replacement_start(&record(9, 0)).unwrap();
        writer.replacement_finish(9, 0).unwrap();
        writer.replacement_start(&record(9, 2)).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert!(parsed.log_started);
        assert!(!parsed.log_ended);
        assert_eq!(parsed.start_file_index, Some(2));
        assert_eq!(parsed.unfinished, Some(record(9, 2)));
    }

    #[test]
    fn resume_index_after_settled_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(3).unwrap();
        writer.replacement_start(&record(3, 0)).unwrap();
        writer.replacement_finish(3, 0).unwrap();
        writer.replacement_start(&record(3, 1)).unwrap();
        writer.replacement_failed(3, 1).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert_eq!(parsed.start_file_index, Some(2));
        assert_eq!(parsed.fail_list, vec![record(3, 1)]);
        assert_eq!(parsed.revert_list, vec![record(3, 0)]);
    }

    #[test]
    fn revert_list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(1).unwrap();
        for index in 0..3 {
            writer.replacement_start(&record(1, index)).unwrap();
            writer.replacement_finish(1, index).unwrap();
        }

        let parsed = parse_journal(&path).unwrap();
        let indices: Vec<usize> = parsed.revert_list.iter().map(|r| r.file_index).collect();
        assert_eq!(indices, vec![2, 1, 0]);
    }

    #[test]
    fn revert_records_erase_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(1).unwrap();
        writer.replacement_start(&record(1, 0)).unwrap();
        writer.replacement_finish(1, 0).unwrap();
        writer.replacement_start(&record(1, 1)).unwrap();
        writer.replacement_failed(1, 1).unwrap();
        writer.revert(1, 1).unwrap();
        writer.revert(1, 0).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert!(parsed.fail_list.is_empty());
        assert!(parsed.revert_list.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(4).unwrap();
        writer.replacement_start(&record(4, 0)).unwrap();
        writer.replacement_finish(4, 0).unwrap();
        // Simulate a crash truncating a line mid-write, plus garbage.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"(4 2 1 6261").unwrap();
        file.write_all(b"\nnot a journal line\n").unwrap();
        file.write_all(&[0xFF, 0xFE, b'\n']).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert_eq!(parsed.revert_list, vec![record(4, 0)]);
        assert_eq!(parsed.start_file_index, Some(1));
    }

    #[test]
    fn empty_paths_round_trip_as_dash() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let mut writer = JournalWriter::open(&path, "1.0", "1.1").unwrap();
        writer.start(2).unwrap();
        let rec = ReplacementRecord {
            patch_id: 2,
            file_index: 0,
            backup: PathBuf::new(),
            staged: PathBuf::new(),
            dest: PathBuf::from("/install/dir"),
        };
        writer.replacement_start(&rec).unwrap();

        let parsed = parse_journal(&path).unwrap();
        assert_eq!(parsed.unfinished, Some(rec));
    }
}
