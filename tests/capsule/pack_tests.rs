// Tests for artifact generation

use crate::common::*;
use capsule::protocol::digest;
use capsule::protocol::{Artifact, CapsuleError, ExclusionRules, PackOptions, RunMode};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

#[cfg(unix)]
#[test]
fn test_two_file_scenario_stamps_concatenated_digest() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    let a = write_file(src.path(), "a.txt", b"hello\n");
    let mut random = [0u8; 100];
    rand::thread_rng().fill_bytes(&mut random);
    random[0] = 0;
    let b = write_file(src.path(), "b.bin", &random);
    set_mode(&a, 0o644);
    set_mode(&b, 0o755);

    let summary = pack(src.path(), out.path(), &[]);

    let mut expected = Sha256::new();
    expected.update(b"hello\n");
    expected.update(random);
    assert_eq!(summary.digest, hex::encode(expected.finalize()));
    assert_eq!(summary.file_count, 2);
    assert_eq!(summary.binary_count, 1);
    assert_eq!(summary.total_size, 106);

    let report = run(&summary.artifact_path, target.path(), RunMode::Create);
    assert!(report.is_success(), "failed: {:?}", report.failed);
    assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"hello\n");
    assert_eq!(fs::read(target.path().join("b.bin")).unwrap(), random);
    assert_eq!(mode_of(&target.path().join("a.txt")), 0o644);
    assert_eq!(mode_of(&target.path().join("b.bin")), 0o755);

    let verify = run(&summary.artifact_path, target.path(), RunMode::Verify);
    assert!(verify.is_success());
}

#[test]
fn test_header_records_defaults_and_metadata() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());

    let mut options = PackOptions::new(src.path());
    options.output_dir = Some(out.path().to_path_buf());
    options.name = Some("demo".into());
    options.metadata = vec!["commit abc123".into(), "built on ci".into()];
    options.exclude = vec!["*.log".into()];
    let summary = assembler().pack(&options).unwrap();

    assert_eq!(summary.artifact_path.file_name().unwrap(), "demo-0.0.0.capsule");
    let artifact = Artifact::read_from(&summary.artifact_path).unwrap();
    assert_eq!(artifact.header.name, "demo");
    assert_eq!(artifact.header.version, "0.0.0");
    assert_eq!(artifact.header.metadata, vec!["commit abc123", "built on ci"]);
    assert_eq!(artifact.header.file_count, 5);
    assert_eq!(artifact.header.source_hash, summary.digest);

    let keys: Vec<&str> = artifact.records.iter().map(|r| r.relative_path.as_str()).collect();
    assert_eq!(keys, vec!["README.md", "assets/logo.bin", "empty.txt", "src/main.rs", "src/util/mod.rs"]);
    assert!(artifact.record("assets/logo.bin").unwrap().is_binary);
    assert!(!artifact.record("README.md").unwrap().is_binary);

    let mut expected = ExclusionRules::with_defaults(false);
    expected.push_pattern("*.log");
    assert_eq!(artifact.header.exclusions, expected);
}

#[cfg(unix)]
#[test]
fn test_artifact_is_executable_with_shebang() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", b"a");
    let summary = pack(src.path(), out.path(), &[]);

    let bytes = fs::read(&summary.artifact_path).unwrap();
    assert!(bytes.starts_with(b"#!/usr/bin/env -S capsule run\n"));
    assert_eq!(mode_of(&summary.artifact_path), 0o755);
}

#[test]
fn test_editing_excluded_file_keeps_digest() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());

    let first = pack(src.path(), out.path(), &["*.log"]);
    write_file(src.path(), "build.log", b"completely different noise\n");
    write_file(src.path(), ".git/HEAD", b"ref: refs/heads/other\n");
    fs::remove_file(&first.artifact_path).unwrap();
    let second = pack(src.path(), out.path(), &["*.log"]);
    assert_eq!(first.digest, second.digest);

    write_file(src.path(), "src/main.rs", b"fn main() {}\n");
    fs::remove_file(&second.artifact_path).unwrap();
    let third = pack(src.path(), out.path(), &["*.log"]);
    assert_ne!(third.digest, second.digest);
}

#[test]
fn test_index_offsets_point_at_entries() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());

    let mut options = PackOptions::new(src.path());
    options.output_dir = Some(out.path().to_path_buf());
    options.name = Some("indexed".into());
    options.write_index = true;
    let summary = assembler().pack(&options).unwrap();

    let index_path = summary.index_path.expect("index requested");
    let index: BTreeMap<String, u64> = serde_json::from_str(&fs::read_to_string(index_path).unwrap()).unwrap();
    let bytes = fs::read(&summary.artifact_path).unwrap();
    assert_eq!(index.len(), summary.file_count);
    for (key, offset) in index {
        assert!(bytes[offset as usize..].starts_with(format!("#@@ BEGIN {}\n", key).as_bytes()));
    }
}

#[test]
fn test_stamped_digest_matches_tree_digest_of_source() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    project_tree(src.path());
    let summary = pack(src.path(), out.path(), &["*.log"]);

    let artifact = Artifact::read_from(&summary.artifact_path).unwrap();
    let recomputed = digest::tree_digest(src.path(), &artifact.header.exclusions).unwrap();
    assert_eq!(recomputed.hex, summary.digest);
}

#[test]
fn test_bad_pattern_fails_before_writing() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", b"a");

    let mut options = PackOptions::new(src.path());
    options.output_dir = Some(out.path().to_path_buf());
    options.exclude = vec!["broken[".into()];
    let err = assembler().pack(&options).unwrap_err();
    assert!(matches!(err, CapsuleError::Configuration { .. }));
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn test_missing_source_is_reported() {
    let out = TempDir::new().unwrap();
    let mut options = PackOptions::new(out.path().join("nope"));
    options.output_dir = Some(out.path().to_path_buf());
    let err = assembler().pack(&options).unwrap_err();
    assert!(matches!(err, CapsuleError::DirectoryNotFound { .. }));
}
