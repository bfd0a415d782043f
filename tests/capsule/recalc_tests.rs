// Tests for re-stamping an artifact's hash

use crate::common::*;
use capsule::protocol::{Artifact, RunMode};
use std::fs;
use tempfile::TempDir;

fn drifted_target() -> (TempDir, TempDir, std::path::PathBuf) {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let artifact = pack(src.path(), out.path(), &["*.log"]).artifact_path;
    let target = TempDir::new().unwrap();
    run(&artifact, target.path(), RunMode::Create);
    write_file(target.path(), "src/main.rs", b"fn main() { drift(); }\n");
    (target, out, artifact)
}

#[test]
fn test_declined_recalculation_is_cancelled() {
    let (target, _out, artifact) = drifted_target();
    let before = fs::read(&artifact).unwrap();

    let mut answer = Answer::no();
    let report = run_mode(&artifact, target.path(), RunMode::RecalculateHash, &mut answer).unwrap();
    assert_eq!(answer.asked, 1);
    assert!(report.cancelled);
    assert!(!report.stamped_rewritten);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(fs::read(&artifact).unwrap(), before);
}

#[test]
fn test_accepted_recalculation_restamps_only_the_hash() {
    let (target, out, artifact) = drifted_target();
    let original = Artifact::read_from(&artifact).unwrap();

    let mut answer = Answer::yes();
    let report = run_mode(&artifact, target.path(), RunMode::RecalculateHash, &mut answer).unwrap();
    assert!(report.stamped_rewritten);
    assert!(report.is_success());

    let updated = Artifact::read_from(&artifact).unwrap();
    assert_eq!(updated.header.source_hash, report.digest.unwrap().computed);
    assert_ne!(updated.header.source_hash, original.header.source_hash);
    assert_eq!(updated.records, original.records);

    // the re-stamped artifact now verifies against the drifted tree
    assert!(run(&artifact, target.path(), RunMode::Verify).is_success());
    // no backup or temp files left behind
    let leftovers: Vec<_> = fs::read_dir(out.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".capsule-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_matching_digest_skips_the_prompt() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let artifact = pack(src.path(), out.path(), &["*.log"]).artifact_path;
    let target = TempDir::new().unwrap();
    run(&artifact, target.path(), RunMode::Create);

    let mut answer = Answer::yes();
    let report = run_mode(&artifact, target.path(), RunMode::RecalculateHash, &mut answer).unwrap();
    assert_eq!(answer.asked, 0);
    assert!(report.is_success());
    assert!(!report.stamped_rewritten);
}
