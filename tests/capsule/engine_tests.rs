// Tests for the reconstruction engine modes

use crate::common::*;
use capsule::protocol::engine::{self, EntryState};
use capsule::protocol::{CapsuleError, RunMode};
use std::fs;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn packed_project() -> (TempDir, TempDir, std::path::PathBuf) {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);
    (src, out, summary.artifact_path)
}

#[test]
fn test_create_restores_exact_bytes() {
    let (src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();

    let report = run(&artifact, target.path(), RunMode::Create);
    assert!(report.is_success());
    assert_eq!(report.success_count, 5);
    assert_eq!(report.expected_count, 5);

    for key in ["README.md", "src/main.rs", "src/util/mod.rs", "assets/logo.bin", "empty.txt"] {
        assert_eq!(
            fs::read(target.path().join(key)).unwrap(),
            fs::read(src.path().join(key)).unwrap(),
            "content of {}",
            key
        );
    }
    assert!(!target.path().join(".git").exists());
    assert!(!target.path().join("build.log").exists());
}

#[test]
fn test_create_into_missing_directory() {
    let (_src, _out, artifact) = packed_project();
    let parent = TempDir::new().unwrap();
    let target = parent.path().join("fresh/nested");

    let report = run(&artifact, &target, RunMode::Create);
    assert!(report.is_success());
    assert!(target.join("src/main.rs").is_file());
}

#[test]
fn test_create_refuses_non_empty_target() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    write_file(target.path(), "keep.txt", b"mine");

    let err = run_mode(&artifact, target.path(), RunMode::Create, &mut Answer::no()).unwrap_err();
    assert!(matches!(err, CapsuleError::TargetNotEmpty { .. }));
    assert_eq!(fs::read(target.path().join("keep.txt")).unwrap(), b"mine");
}

#[test]
fn test_update_overwrites_existing_files() {
    let (src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    write_file(target.path(), "src/main.rs", b"stale");
    write_file(target.path(), "extra.txt", b"untouched");

    let report = run(&artifact, target.path(), RunMode::Update);
    assert!(report.is_success());
    assert_eq!(
        fs::read(target.path().join("src/main.rs")).unwrap(),
        fs::read(src.path().join("src/main.rs")).unwrap()
    );
    assert_eq!(fs::read(target.path().join("extra.txt")).unwrap(), b"untouched");
}

#[test]
fn test_verify_is_idempotent_and_detects_drift() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    run(&artifact, target.path(), RunMode::Create);

    let first = run(&artifact, target.path(), RunMode::Verify);
    let second = run(&artifact, target.path(), RunMode::Verify);
    assert!(first.is_success());
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.digest.as_ref().unwrap().file_count, 5);

    // excluded paths in the target do not count
    write_file(target.path(), "debug.log", b"local noise");
    assert!(run(&artifact, target.path(), RunMode::Verify).is_success());

    write_file(target.path(), "README.md", b"edited\n");
    let drifted = run(&artifact, target.path(), RunMode::Verify);
    assert!(!drifted.is_success());
    assert_eq!(drifted.exit_code(), 1);
    let check = drifted.digest.unwrap();
    assert_ne!(check.expected, check.computed);
}

#[test]
fn test_verify_without_target_is_an_error() {
    let (_src, _out, artifact) = packed_project();
    let parent = TempDir::new().unwrap();
    let err = run_mode(&artifact, &parent.path().join("absent"), RunMode::Verify, &mut Answer::no()).unwrap_err();
    assert!(matches!(err, CapsuleError::DirectoryNotFound { .. }));
}

#[test]
fn test_dry_run_writes_nothing() {
    let (_src, _out, artifact) = packed_project();
    let parent = TempDir::new().unwrap();
    let target = parent.path().join("planned");

    let report = run(&artifact, &target, RunMode::DryRun);
    assert!(report.is_success());
    assert_eq!(report.listed.len(), 5);
    assert!(report.listed.iter().all(|line| line.starts_with("create")));
    assert!(report.outcomes.iter().all(|o| o.state == EntryState::Pending));
    assert!(!target.exists());
}

#[test]
fn test_dump_filters_entries() {
    let (_src, _out, artifact) = packed_project();
    let scratch = TempDir::new().unwrap();

    let all = run(&artifact, scratch.path(), RunMode::Dump { filter: None });
    assert_eq!(all.dump.len(), 5);
    assert_eq!(all.header.as_ref().unwrap().name, "demo");

    let rust = run(&artifact, scratch.path(), RunMode::Dump { filter: Some("src/**/*.rs".into()) });
    let paths: Vec<&str> = rust.dump.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["src/main.rs", "src/util/mod.rs"]);
    assert!(rust.is_success());
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn test_retry_touches_only_failed_entries() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();

    // a directory where a file belongs makes that one write fail
    write_file(target.path(), "src/main.rs/blocker", b"x");
    let first = run(&artifact, target.path(), RunMode::Update);
    assert!(!first.is_success());
    assert_eq!(first.failed, vec!["src/main.rs"]);
    assert_eq!(first.success_count, 4);
    let list = engine::failed_list_path(&artifact);
    assert_eq!(first.failed_list.as_deref(), Some(list.as_path()));
    assert!(list.is_file());

    let untouched = ["README.md", "src/util/mod.rs", "assets/logo.bin", "empty.txt"];
    let before: Vec<_> = untouched
        .iter()
        .map(|k| fs::metadata(target.path().join(k)).unwrap().modified().unwrap())
        .collect();

    fs::remove_dir_all(target.path().join("src/main.rs")).unwrap();
    thread::sleep(Duration::from_millis(20));

    let retry = run(&artifact, target.path(), RunMode::RetryFailed { list: None });
    assert!(retry.is_success());
    assert_eq!(retry.outcomes.len(), 1);
    assert_eq!(retry.outcomes[0].path, "src/main.rs");
    assert_eq!(retry.expected_count, 1);
    assert!(!list.exists());

    let after: Vec<_> = untouched
        .iter()
        .map(|k| fs::metadata(target.path().join(k)).unwrap().modified().unwrap())
        .collect();
    assert_eq!(before, after);
    assert!(run(&artifact, target.path(), RunMode::Verify).is_success());
}

#[test]
fn test_retry_keeps_entries_that_fail_again() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    write_file(target.path(), "empty.txt/blocker", b"x");
    run(&artifact, target.path(), RunMode::Update);

    let retry = run(&artifact, target.path(), RunMode::RetryFailed { list: None });
    assert_eq!(retry.failed, vec!["empty.txt"]);
    assert_eq!(retry.exit_code(), 1);
    assert!(engine::failed_list_path(&artifact).is_file());
}

#[test]
fn test_retry_without_list_is_a_configuration_error() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    let err = run_mode(&artifact, target.path(), RunMode::RetryFailed { list: None }, &mut Answer::no()).unwrap_err();
    assert!(matches!(err, CapsuleError::Configuration { .. }));
}

#[test]
fn test_corrupted_payload_fails_only_that_entry() {
    let (_src, out, artifact) = packed_project();
    let text = fs::read_to_string(&artifact).unwrap();
    // flip one base64 character inside the binary payload
    let start = text.find("#@chunk 1/").unwrap();
    let line_start = text[start..].find('\n').unwrap() + start + 1;
    let mut bytes = text.into_bytes();
    bytes[line_start] = if bytes[line_start] == b'A' { b'B' } else { b'A' };
    let damaged = out.path().join("damaged.capsule");
    fs::write(&damaged, bytes).unwrap();

    let target = TempDir::new().unwrap();
    let report = run(&damaged, target.path(), RunMode::Create);
    assert_eq!(report.failed, vec!["assets/logo.bin"]);
    assert_eq!(report.success_count, 4);
    assert!(!target.path().join("assets/logo.bin").exists());
    assert!(target.path().join("README.md").is_file());
}

#[test]
fn test_truncated_artifact_fails_the_run() {
    let (_src, out, artifact) = packed_project();
    let text = fs::read_to_string(&artifact).unwrap();
    let first_end = text.find("#@@ END ").unwrap();
    let cut = text[first_end..].find('\n').unwrap() + first_end + 1;
    let truncated = out.path().join("truncated.capsule");
    fs::write(&truncated, &text[..cut]).unwrap();

    let target = TempDir::new().unwrap();
    let report = run(&truncated, target.path(), RunMode::Create);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.expected_count, 5);
    assert_eq!(report.missing_records, 4);
    assert!(!report.is_success());
    assert_eq!(report.exit_code(), 1);

    let planned = run(&truncated, &target.path().join("planned"), RunMode::DryRun);
    assert_eq!(planned.missing_records, 4);
    assert!(!planned.is_success());
}

#[test]
fn test_failed_list_survives_a_retry_that_cannot_start() {
    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    write_file(target.path(), "empty.txt/blocker", b"x");
    run(&artifact, target.path(), RunMode::Update);
    let list = engine::failed_list_path(&artifact);
    assert!(list.is_file());

    // the target cannot be created, so the retry stops before any entry
    let parent = TempDir::new().unwrap();
    let not_a_dir = write_file(parent.path(), "occupied", b"file");
    let err = run_mode(&artifact, &not_a_dir, RunMode::RetryFailed { list: None }, &mut Answer::no());
    assert!(err.is_err());
    assert!(list.is_file());

    fs::remove_dir_all(target.path().join("empty.txt")).unwrap();
    let retry = run(&artifact, target.path(), RunMode::RetryFailed { list: None });
    assert!(retry.is_success());
    assert_eq!(retry.outcomes.len(), 1);
    assert!(!list.exists());
}

#[test]
fn test_existing_entry_is_skipped_without_overwrite() {
    let (_src, _out, artifact_path) = packed_project();
    let artifact = capsule::protocol::Artifact::read_from(&artifact_path).unwrap();
    let target = TempDir::new().unwrap();
    write_file(target.path(), "README.md", b"local copy\n");

    let record = artifact.record("README.md").unwrap();
    let outcome = engine::apply_entry(target.path(), record, false);
    assert_eq!(outcome.state, EntryState::Skipped);
    assert!(outcome.state.is_success());
    assert_eq!(fs::read(target.path().join("README.md")).unwrap(), b"local copy\n");

    let written = engine::apply_entry(target.path(), record, true);
    assert_eq!(written.state, EntryState::PermissionsApplied);
    assert_ne!(fs::read(target.path().join("README.md")).unwrap(), b"local copy\n");
}

#[cfg(unix)]
#[test]
fn test_update_replaces_symlink_instead_of_following_it() {
    use std::os::unix::fs::symlink;

    let (src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let victim = write_file(outside.path(), "victim.txt", b"do not touch\n");
    symlink(&victim, target.path().join("README.md")).unwrap();

    let report = run(&artifact, target.path(), RunMode::Update);
    assert!(report.is_success());
    assert_eq!(fs::read(&victim).unwrap(), b"do not touch\n");
    let readme = target.path().join("README.md");
    assert!(!fs::symlink_metadata(&readme).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(&readme).unwrap(), fs::read(src.path().join("README.md")).unwrap());
}

#[cfg(unix)]
#[test]
fn test_update_refuses_to_write_through_symlinked_directory() {
    use std::os::unix::fs::symlink;

    let (_src, _out, artifact) = packed_project();
    let target = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    symlink(outside.path(), target.path().join("src")).unwrap();

    let report = run(&artifact, target.path(), RunMode::Update);
    assert_eq!(report.failed, vec!["src/main.rs", "src/util/mod.rs"]);
    assert_eq!(report.success_count, 3);
    assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
}

#[cfg(unix)]
#[test]
fn test_update_replaces_read_only_files() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let locked = write_file(src.path(), "locked.txt", b"sealed\n");
    write_file(src.path(), "open.txt", b"open\n");
    set_mode(&locked, 0o444);
    let summary = pack(src.path(), out.path(), &[]);

    let target = TempDir::new().unwrap();
    assert!(run(&summary.artifact_path, target.path(), RunMode::Create).is_success());
    assert_eq!(mode_of(&target.path().join("locked.txt")), 0o444);

    let report = run(&summary.artifact_path, target.path(), RunMode::Update);
    assert!(report.is_success());
    assert!(report.failed.is_empty());
    assert_eq!(fs::read(target.path().join("locked.txt")).unwrap(), b"sealed\n");
    assert_eq!(mode_of(&target.path().join("locked.txt")), 0o444);
}
