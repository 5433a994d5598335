use std::fs;
use std::path::Path;

use patchup::delta::{self, DeltaChunk};
use patchup::journal::parse_journal;
use patchup::util::hash_bytes;
use patchup::{
    apply_batch, apply_patch, revert_patch, write_container, BatchConfig, CancelToken,
    Compression, DestinationMap, FileSpec, NullProgress, OpKind, Operation, PatchDescriptor,
    PatchError, PayloadRef, ProgressSink, TargetKind, ValidationFile, JOURNAL_FILE,
};

fn file_spec(path: &str, data: &[u8]) -> FileSpec {
    FileSpec {
        path: path.to_string(),
        checksum: hash_bytes(data),
        length: data.len() as u64,
    }
}

fn validation(path: &str, data: &[u8]) -> ValidationFile {
    ValidationFile {
        path: path.to_string(),
        checksum: hash_bytes(data),
        length: data.len() as i64,
    }
}

fn base_op(id: u32, kind: OpKind, target: TargetKind, destination: &str) -> Operation {
    Operation {
        id,
        kind,
        target,
        destination: destination.to_string(),
        payload: PayloadRef::default(),
        old_file: None,
        new_file: None,
    }
}

fn new_op(id: u32, destination: &str, data: &[u8]) -> (Operation, Vec<u8>) {
    let mut op = base_op(id, OpKind::New, TargetKind::File, destination);
    op.new_file = Some(file_spec(destination, data));
    (op, data.to_vec())
}

fn force_op(id: u32, destination: &str, data: &[u8]) -> (Operation, Vec<u8>) {
    let mut op = base_op(id, OpKind::Force, TargetKind::File, destination);
    op.new_file = Some(file_spec(destination, data));
    (op, data.to_vec())
}

fn remove_op(id: u32, path: &str, old_data: &[u8]) -> (Operation, Vec<u8>) {
    let mut op = base_op(id, OpKind::Remove, TargetKind::File, path);
    op.old_file = Some(file_spec(path, old_data));
    (op, Vec::new())
}

fn replace_op(id: u32, destination: &str, old: &[u8], new: &[u8]) -> (Operation, Vec<u8>) {
    let mut op = base_op(id, OpKind::Replace, TargetKind::File, destination);
    op.old_file = Some(file_spec(destination, old));
    op.new_file = Some(file_spec(destination, new));
    (op, new.to_vec())
}

fn patch_op(
    id: u32,
    destination: &str,
    old: &[u8],
    chunks: &[DeltaChunk],
) -> (Operation, Vec<u8>) {
    let new = reconstruct(old, chunks);
    let mut op = base_op(id, OpKind::Patch, TargetKind::File, destination);
    op.old_file = Some(file_spec(destination, old));
    op.new_file = Some(file_spec(destination, &new));
    (op, delta::encode(chunks))
}

fn reconstruct(old: &[u8], chunks: &[DeltaChunk]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        match chunk {
            DeltaChunk::Copy { offset, length } => {
                let start = *offset as usize;
                out.extend_from_slice(&old[start..start + *length as usize]);
            }
            DeltaChunk::Insert { data } => out.extend_from_slice(data),
        }
    }
    out
}

fn build_container(
    path: &Path,
    id: u64,
    version_from: &str,
    version_to: &str,
    ops: Vec<(Operation, Vec<u8>)>,
    validations: Vec<ValidationFile>,
) -> PatchDescriptor {
    let (operations, payloads): (Vec<_>, Vec<_>) = ops.into_iter().unzip();
    let mut descriptor = PatchDescriptor {
        id,
        version_from: Some(version_from.to_string()),
        version_from_subsequent: None,
        version_to: version_to.to_string(),
        operations,
        validations,
    };
    write_container(path, &mut descriptor, &payloads, Compression::Zstd).unwrap();
    descriptor
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Vec<u8>)>) {
    for entry in fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().to_string();
        if path.is_dir() {
            collect_recursive(root, &path, entries);
        } else {
            entries.push((rel, fs::read(&path).unwrap()));
        }
    }
}

fn run(
    container: &Path,
    patch_id: u64,
    install: &Path,
    temp: &Path,
) -> patchup::Result<Vec<patchup::FailedReplacement>> {
    apply_patch(
        container,
        patch_id,
        install,
        temp,
        &DestinationMap::default(),
        &mut NullProgress,
        &CancelToken::new(),
    )
}

#[test]
fn test_new_and_remove_scenario() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let legacy = vec![0x42u8; 50];
    fs::write(install.join("legacy.bin"), &legacy).unwrap();
    let fresh = vec![0xA5u8; 100];

    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![new_op(1, "fresh.bin", &fresh), remove_op(2, "legacy.bin", &legacy)],
        vec![validation("fresh.bin", &fresh)],
    );

    let failures = run(&container, 1, &install, &temp).unwrap();
    assert!(failures.is_empty());

    assert_eq!(fs::read(install.join("fresh.bin")).unwrap(), fresh);
    assert!(!install.join("legacy.bin").exists());

    let parsed = parse_journal(&temp.join(JOURNAL_FILE)).unwrap();
    assert!(parsed.log_ended);
    assert_eq!(parsed.start_file_index, None);

    // Backups are purged once the patch is confirmed finished.
    assert!(!temp.join("old_2").exists());
}

#[test]
fn test_second_run_with_same_journal_is_a_noop() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let data = b"version two".to_vec();
    let container = root.path().join("p1.patch");
    build_container(&container, 1, "1.0", "1.1", vec![new_op(1, "app.bin", &data)], vec![]);

    assert!(run(&container, 1, &install, &temp).unwrap().is_empty());
    let before = collect_dir_tree(&install);

    assert!(run(&container, 1, &install, &temp).unwrap().is_empty());
    assert_eq!(collect_dir_tree(&install), before);
}

#[test]
fn test_already_patched_installation_short_circuits() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    fs::create_dir_all(&install).unwrap();

    let new_a = b"fresh A".to_vec();
    let new_b = b"forced B".to_vec();
    fs::write(install.join("a.bin"), b"old B content").unwrap();

    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![new_op(1, "new.bin", &new_a), force_op(2, "a.bin", &new_b)],
        vec![],
    );

    let temp1 = root.path().join("staging1");
    assert!(run(&container, 1, &install, &temp1).unwrap().is_empty());
    let before = collect_dir_tree(&install);

    // Fresh staging area and journal: completion must be detected from the
    // installation itself via the checksum short-circuits.
    let temp2 = root.path().join("staging2");
    assert!(run(&container, 1, &install, &temp2).unwrap().is_empty());
    assert_eq!(collect_dir_tree(&install), before);
}

struct InterruptAt {
    token: CancelToken,
    percent: u8,
}

impl ProgressSink for InterruptAt {
    fn report(&mut self, percent: u8, _message: &str) {
        if percent == self.percent {
            self.token.interrupt();
        }
    }
}

#[test]
fn test_interrupted_apply_resumes_to_identical_result() {
    let root = tempfile::tempdir().unwrap();

    let old1 = b"first file, first version".to_vec();
    let new1 = b"first file, second version".to_vec();
    let fresh = vec![0x11u8; 64];
    let old3 = b"AAAA_BBBB_CCCC".to_vec();
    let chunks = vec![
        DeltaChunk::Copy { offset: 0, length: 5 },
        DeltaChunk::Insert { data: b"XXXX_".to_vec() },
        DeltaChunk::Copy { offset: 10, length: 4 },
    ];

    let ops = || {
        vec![
            replace_op(1, "f1.bin", &old1, &new1),
            new_op(2, "f2.bin", &fresh),
            patch_op(3, "f3.bin", &old3, &chunks),
        ]
    };

    let seed = |install: &Path| {
        fs::create_dir_all(install).unwrap();
        fs::write(install.join("f1.bin"), &old1).unwrap();
        fs::write(install.join("f3.bin"), &old3).unwrap();
    };

    // Reference: uninterrupted run.
    let ref_install = root.path().join("ref_install");
    seed(&ref_install);
    let container = root.path().join("p1.patch");
    build_container(&container, 1, "1.0", "1.1", ops(), vec![]);
    assert!(run(&container, 1, &ref_install, &root.path().join("ref_staging"))
        .unwrap()
        .is_empty());

    // Interrupted run: the token fires during operation 3's progress
    // report, so the cancellation lands inside that operation's staging.
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    seed(&install);
    let token = CancelToken::new();
    let mut sink = InterruptAt {
        token: token.clone(),
        percent: 66,
    };
    let err = apply_patch(
        &container,
        1,
        &install,
        &temp,
        &DestinationMap::default(),
        &mut sink,
        &token,
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::Cancelled));

    let parsed = parse_journal(&temp.join(JOURNAL_FILE)).unwrap();
    assert!(!parsed.log_ended);
    assert_eq!(parsed.start_file_index, Some(2));
    assert!(parsed.unfinished.is_some());

    // Resume with the same journal and staging area.
    assert!(run(&container, 1, &install, &temp).unwrap().is_empty());
    assert_eq!(collect_dir_tree(&install), collect_dir_tree(&ref_install));
}

#[test]
fn test_revert_restores_pre_patch_state() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let old1 = b"replace me".to_vec();
    let new1 = b"replaced".to_vec();
    let declared_old2 = b"what the patch expects".to_vec();
    fs::write(install.join("f1.bin"), &old1).unwrap();
    // The on-disk content disagrees with the declared old checksum, so
    // operation 2 aborts the patch after operation 1 already swapped.
    fs::write(install.join("f2.bin"), b"something else entirely").unwrap();

    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![
            replace_op(1, "f1.bin", &old1, &new1),
            replace_op(2, "f2.bin", &declared_old2, b"never applied"),
        ],
        vec![],
    );

    let before = collect_dir_tree(&install);
    let err = run(&container, 1, &install, &temp).unwrap_err();
    assert!(matches!(err, PatchError::ChecksumMismatch { .. }));
    assert_eq!(fs::read(install.join("f1.bin")).unwrap(), new1);

    let journal = temp.join(JOURNAL_FILE);
    // Two entries walked: the replacement left in flight by the abort
    // (settled without touching the disk) and the finished one.
    let reverted = revert_patch(&journal).unwrap();
    assert_eq!(reverted, 2);
    assert_eq!(collect_dir_tree(&install), before);

    // Reverting again has nothing left to undo.
    assert_eq!(revert_patch(&journal).unwrap(), 0);
}

#[test]
fn test_failed_replacement_is_collected_not_thrown() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    // The destination's parent directory does not exist, so the promote
    // rename fails; that is a retryable failure, not an abort.
    let data = b"payload".to_vec();
    let good = b"good file".to_vec();
    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![
            new_op(1, "missing_parent/app.bin", &data),
            new_op(2, "ok.bin", &good),
        ],
        vec![],
    );

    let failures = run(&container, 1, &install, &temp).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].file_index, 0);
    // Remaining operations still executed.
    assert_eq!(fs::read(install.join("ok.bin")).unwrap(), good);

    let parsed = parse_journal(&temp.join(JOURNAL_FILE)).unwrap();
    assert!(!parsed.log_ended);
    assert_eq!(parsed.fail_list.len(), 1);

    // Create the parent and retry with the same journal: the failed
    // replacement is picked up and completes.
    fs::create_dir_all(install.join("missing_parent")).unwrap();
    let failures = run(&container, 1, &install, &temp).unwrap();
    assert!(failures.is_empty());
    assert_eq!(fs::read(install.join("missing_parent/app.bin")).unwrap(), data);
}

#[test]
fn test_folder_operations() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(install.join("empty_dir")).unwrap();
    fs::create_dir_all(install.join("busy_dir")).unwrap();
    fs::write(install.join("busy_dir/user.data"), b"keep").unwrap();

    let mut remove_empty = base_op(1, OpKind::Remove, TargetKind::Folder, "empty_dir");
    remove_empty.old_file = Some(FileSpec {
        path: "empty_dir".into(),
        checksum: String::new(),
        length: 0,
    });
    let mut remove_busy = base_op(2, OpKind::Remove, TargetKind::Folder, "busy_dir");
    remove_busy.old_file = Some(FileSpec {
        path: "busy_dir".into(),
        checksum: String::new(),
        length: 0,
    });
    let create = base_op(3, OpKind::New, TargetKind::Folder, "plugins/enabled");

    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![
            (remove_empty, Vec::new()),
            (remove_busy, Vec::new()),
            (create, Vec::new()),
        ],
        vec![ValidationFile {
            path: "plugins/enabled".into(),
            checksum: String::new(),
            length: -1,
        }],
    );

    let failures = run(&container, 1, &install, &temp).unwrap();
    assert!(failures.is_empty());

    assert!(!install.join("empty_dir").exists());
    // Non-empty folders are treated as already succeeded and left alone.
    assert!(install.join("busy_dir/user.data").exists());
    assert!(install.join("plugins/enabled").is_dir());
}

#[test]
fn test_stale_staged_file_purged_on_finish() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();
    fs::create_dir_all(&temp).unwrap();

    let data = b"already installed".to_vec();
    fs::write(install.join("a.bin"), &data).unwrap();
    // Leftover staging from an interrupted earlier attempt; the operation
    // short-circuits to done without promoting it.
    fs::write(temp.join("1"), b"partial staging").unwrap();

    let container = root.path().join("p1.patch");
    build_container(&container, 1, "1.0", "1.1", vec![new_op(1, "a.bin", &data)], vec![]);

    assert!(run(&container, 1, &install, &temp).unwrap().is_empty());
    assert!(!temp.join("1").exists());
    assert!(temp.join(JOURNAL_FILE).exists());
}

#[test]
fn test_batch_redirects_relocated_destination() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let v1 = b"app jar version 1".to_vec();
    let v2 = b"app jar version 2, renamed".to_vec();
    let v3 = b"app jar version 3".to_vec();
    fs::write(install.join("app.jar"), &v1).unwrap();

    // Patch 1 relocates app.jar to app-2.jar.
    let c1 = root.path().join("p1.patch");
    let mut relocate = base_op(1, OpKind::Replace, TargetKind::File, "app-2.jar");
    relocate.old_file = Some(file_spec("app.jar", &v1));
    relocate.new_file = Some(file_spec("app-2.jar", &v2));
    build_container(&c1, 1, "1.0", "1.1", vec![(relocate, v2.clone())], vec![]);

    // Patch 2 still references app.jar; the destination map must redirect
    // it to app-2.jar.
    let c2 = root.path().join("p2.patch");
    build_container(
        &c2,
        2,
        "1.1",
        "1.2",
        vec![replace_op(1, "app.jar", &v2, &v3)],
        vec![],
    );

    let config = BatchConfig::new(&install, &temp, "1.0");
    let outcome = apply_batch(
        &[c1, c2],
        &config,
        &mut NullProgress,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(outcome.applied, vec![1, 2]);
    assert!(outcome.skipped.is_empty());
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.final_version, "1.2");
    assert!(!install.join("app.jar").exists());
    assert_eq!(fs::read(install.join("app-2.jar")).unwrap(), v3);
}

#[test]
fn test_batch_skips_version_mismatch() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let data = b"new file".to_vec();
    let c1 = root.path().join("p1.patch");
    build_container(&c1, 1, "1.0", "1.1", vec![new_op(1, "a.bin", &data)], vec![]);
    // Declares the wrong starting version; applying it out of order would
    // corrupt the installation.
    let c2 = root.path().join("p2.patch");
    build_container(&c2, 2, "9.9", "10.0", vec![new_op(1, "b.bin", &data)], vec![]);

    let config = BatchConfig::new(&install, &temp, "1.0");
    let outcome = apply_batch(
        &[c1, c2],
        &config,
        &mut NullProgress,
        &CancelToken::new(),
    )
    .unwrap();

    assert_eq!(outcome.applied, vec![1]);
    assert_eq!(outcome.skipped, vec![2]);
    assert_eq!(outcome.final_version, "1.1");
    assert!(!install.join("b.bin").exists());
}

#[test]
fn test_force_overwrites_unexpected_content() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();
    fs::write(install.join("cfg.bin"), b"locally modified").unwrap();

    let wanted = b"canonical content".to_vec();
    let container = root.path().join("p1.patch");
    build_container(
        &container,
        1,
        "1.0",
        "1.1",
        vec![force_op(1, "cfg.bin", &wanted)],
        vec![validation("cfg.bin", &wanted)],
    );

    assert!(run(&container, 1, &install, &temp).unwrap().is_empty());
    assert_eq!(fs::read(install.join("cfg.bin")).unwrap(), wanted);
}

#[test]
fn test_validation_failure_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let install = root.path().join("install");
    let temp = root.path().join("staging");
    fs::create_dir_all(&install).unwrap();

    let data = b"actual content".to_vec();
    let container = root.path().join("p1.patch");
    let mut descriptor = PatchDescriptor {
        id: 1,
        version_from: Some("1.0".into()),
        version_from_subsequent: None,
        version_to: "1.1".into(),
        operations: vec![new_op(1, "a.bin", &data).0],
        validations: vec![validation("a.bin", b"declared something else")],
    };
    write_container(&container, &mut descriptor, &[data], Compression::Gzip).unwrap();

    let err = run(&container, 1, &install, &temp).unwrap_err();
    assert!(matches!(err, PatchError::ChecksumMismatch { .. }));
    // The journal is preserved unfinished for diagnosis.
    assert!(!parse_journal(&temp.join(JOURNAL_FILE)).unwrap().log_ended);
}
