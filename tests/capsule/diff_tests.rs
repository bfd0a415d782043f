// Tests for the diff mode

use crate::common::*;
use capsule::protocol::signal::InterruptGuard;
use capsule::protocol::{Artifact, CapsuleError, ReconstructionEngine, RunMode, RunOptions};
use std::fs;
use tempfile::TempDir;

fn diff(reference: &std::path::Path, filter: Option<&str>) -> RunMode {
    RunMode::Diff { reference: reference.to_path_buf(), filter: filter.map(str::to_string) }
}

#[test]
fn test_diff_against_exact_reconstruction_is_clean() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);

    let target = TempDir::new().unwrap();
    run(&summary.artifact_path, target.path(), RunMode::Create);

    let report = run(&summary.artifact_path, target.path(), diff(target.path(), None));
    let result = report.diff.as_ref().unwrap();
    assert!(result.is_clean(), "{:?}", result);
    assert_eq!(result.unchanged, 5);
    assert!(report.is_success());
}

#[test]
fn test_diff_against_source_ignores_excluded_files() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);

    // the source still holds .git, .gitignore and build.log
    let report = run(&summary.artifact_path, out.path(), diff(src.path(), None));
    assert!(report.diff.unwrap().is_clean());
}

#[test]
fn test_diff_reports_drift_and_fails() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);

    write_file(src.path(), "src/main.rs", b"fn main() { changed(); }\n");
    write_file(src.path(), "NEW.md", b"new\n");
    fs::remove_file(src.path().join("empty.txt")).unwrap();

    let report = run(&summary.artifact_path, out.path(), diff(src.path(), None));
    let result = report.diff.as_ref().unwrap();
    assert_eq!(result.changed.len(), 1);
    assert_eq!(result.changed[0].path, "src/main.rs");
    assert_eq!(result.only_in_reference, vec!["NEW.md"]);
    assert_eq!(result.only_in_capsule, vec!["empty.txt"]);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_diff_filter_limits_both_sides() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);
    write_file(src.path(), "README.md", b"changed outside the filter\n");

    let report = run(&summary.artifact_path, out.path(), diff(src.path(), Some("src/**")));
    let result = report.diff.unwrap();
    assert!(result.is_clean());
    assert_eq!(result.capsule_files, 2);
}

#[test]
fn test_diff_requires_existing_reference() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &[]);

    let missing = out.path().join("missing");
    let err = run_mode(&summary.artifact_path, out.path(), diff(&missing, None), &mut Answer::no()).unwrap_err();
    assert!(matches!(err, CapsuleError::DirectoryNotFound { .. }));
}

#[test]
fn test_interrupted_diff_removes_its_scratch_directory() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);
    let artifact = Artifact::read_from(&summary.artifact_path).unwrap();

    let scratch = TempDir::new().unwrap();
    let options = RunOptions {
        artifact_path: Some(summary.artifact_path.clone()),
        target_dir: None,
        mode: diff(src.path(), None),
        scratch_root: Some(scratch.path().to_path_buf()),
    };
    let guard = InterruptGuard::install();
    guard.trigger();

    let err = ReconstructionEngine::new(&artifact, options)
        .run_guarded(&mut Answer::no(), &guard)
        .unwrap_err();
    assert!(matches!(err, CapsuleError::Interrupted));
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}
