// Shared fixtures for capsule integration tests

use capsule::config::CapsuleConfig;
use capsule::protocol::engine::Prompt;
use capsule::protocol::{
    Artifact, Assembler, CapsuleError, Classifier, ClassifierPolicy, PackOptions, PackSummary, ReconstructionEngine,
    RunMode, RunOptions, RunReport,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Answers every confirmation with a fixed value and counts the questions
pub struct Answer {
    pub yes: bool,
    pub asked: usize,
}

impl Answer {
    pub fn yes() -> Self {
        Self { yes: true, asked: 0 }
    }

    pub fn no() -> Self {
        Self { yes: false, asked: 0 }
    }
}

impl Prompt for Answer {
    fn confirm(&mut self, _question: &str) -> Result<bool, CapsuleError> {
        self.asked += 1;
        Ok(self.yes)
    }
}

/// Assembler with default config and the printable-byte classifier only
pub fn assembler() -> Assembler {
    Assembler::new(&CapsuleConfig::default())
        .unwrap()
        .with_classifier(Classifier::with_sniffer(ClassifierPolicy::default(), None))
}

pub fn write_file(root: &Path, key: &str, content: &[u8]) -> PathBuf {
    let path = root.join(key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(unix)]
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

/// A small project tree with text, binary, nested and excluded files
pub fn project_tree(root: &Path) {
    write_file(root, "README.md", b"# demo\n\nCosts $5 and `echo` works \\ fine.\n");
    write_file(root, "src/main.rs", b"fn main() {\n    println!(\"hi\");\n}\n");
    write_file(root, "src/util/mod.rs", b"pub fn util() {}\n");
    let mut blob: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    blob.extend_from_slice(b"CAPSULE_not_a_real_delimiter");
    write_file(root, "assets/logo.bin", &blob);
    write_file(root, "empty.txt", b"");
    write_file(root, ".git/HEAD", b"ref: refs/heads/main\n");
    write_file(root, ".gitignore", b"target\n");
    write_file(root, "build.log", b"noise\n");
}

/// Pack `source` into `out` as `demo-1.0.capsule`
pub fn pack(source: &Path, out: &Path, exclude: &[&str]) -> PackSummary {
    let mut options = PackOptions::new(source);
    options.output_dir = Some(out.to_path_buf());
    options.name = Some("demo".to_string());
    options.version = Some("1.0".to_string());
    options.exclude = exclude.iter().map(|s| s.to_string()).collect();
    assembler().pack(&options).unwrap()
}

pub fn run_mode(artifact_path: &Path, target: &Path, mode: RunMode, prompt: &mut dyn Prompt) -> Result<RunReport, CapsuleError> {
    let artifact = Artifact::read_from(artifact_path)?;
    let options = RunOptions {
        artifact_path: Some(artifact_path.to_path_buf()),
        target_dir: Some(target.to_path_buf()),
        mode,
        scratch_root: None,
    };
    ReconstructionEngine::new(&artifact, options).run(prompt)
}

pub fn run(artifact_path: &Path, target: &Path, mode: RunMode) -> RunReport {
    run_mode(artifact_path, target, mode, &mut Answer::no()).unwrap()
}
