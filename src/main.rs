use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use capsule::config::CapsuleConfig;
use capsule::protocol::engine::StdinPrompt;
use capsule::protocol::{Artifact, Assembler, PackOptions, ReconstructionEngine, RunMode, RunOptions};

#[derive(Parser, Debug)]
#[command(
    name = "capsule",
    version,
    about = "Pack a directory tree into a single self-describing artifact and replay it later"
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an artifact from a source directory
    Pack(PackArgs),
    /// Run an artifact: restore, verify, diff or inspect it
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Source directory to pack
    source: PathBuf,

    /// Directory the artifact is written to (default: current directory)
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Capsule name (default: source directory name)
    #[arg(long)]
    name: Option<String>,

    /// Capsule version (default: VERSION file, else 0.0.0)
    #[arg(long = "version", value_name = "VERSION")]
    release: Option<String>,

    /// Include .git and VCS metadata files
    #[arg(long)]
    include_vcs: bool,

    /// Extra exclusion pattern; a pattern with '/' prunes that path from the root
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Free-text metadata line stored in the header
    #[arg(short = 'm', long = "meta", value_name = "LINE")]
    metadata: Vec<String>,

    /// Also write <artifact>.index.json
    #[arg(long)]
    index: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Replace an existing artifact
    #[arg(short, long)]
    force: bool,

    /// Configuration file (default: capsule.toml in SOURCE, then the user config dir)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("mode")
        .args(["update", "dry_run", "verify", "recalculate_hash", "retry_failed", "diff", "dump"])
        .multiple(false)
))]
struct RunArgs {
    /// Artifact file
    artifact: PathBuf,

    /// Directory to restore into (default: ./<name>)
    #[arg(long, value_name = "DIR")]
    target_dir: Option<PathBuf>,

    /// Overwrite files in an existing target
    #[arg(long)]
    update: bool,

    /// Show what would be written without writing
    #[arg(long)]
    dry_run: bool,

    /// Compare the target's digest with the stamped hash
    #[arg(long)]
    verify: bool,

    /// Re-stamp the artifact with the target's digest (asks first)
    #[arg(long)]
    recalculate_hash: bool,

    /// Retry entries that failed last time (default list: <artifact>.failed.json)
    #[arg(long, value_name = "LIST", num_args = 0..=1)]
    retry_failed: Option<Option<PathBuf>>,

    /// Decode into a scratch directory and compare with REFERENCE
    #[arg(long, num_args = 1..=2, value_names = ["REFERENCE", "FILTER"])]
    diff: Option<Vec<String>>,

    /// List header and entries, optionally filtered by a glob
    #[arg(long, value_name = "FILTER", num_args = 0..=1)]
    dump: Option<Option<String>>,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.update {
            RunMode::Update
        } else if self.dry_run {
            RunMode::DryRun
        } else if self.verify {
            RunMode::Verify
        } else if self.recalculate_hash {
            RunMode::RecalculateHash
        } else if let Some(list) = &self.retry_failed {
            RunMode::RetryFailed { list: list.clone() }
        } else if let Some(args) = &self.diff {
            RunMode::Diff {
                reference: PathBuf::from(args.first().cloned().unwrap_or_default()),
                filter: args.get(1).cloned(),
            }
        } else if let Some(filter) = &self.dump {
            RunMode::Dump { filter: filter.clone() }
        } else {
            RunMode::Create
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Pack(args) => pack(args),
        Command::Run(args) => replay(args),
    }
}

fn pack(args: PackArgs) -> Result<ExitCode> {
    let config = CapsuleConfig::load(args.config.as_deref(), Some(&args.source))?;
    let assembler = Assembler::new(&config)?;

    let options = PackOptions {
        source: args.source.clone(),
        output_dir: args.output_dir,
        name: args.name,
        version: args.release,
        include_vcs: args.include_vcs,
        exclude: args.exclude,
        metadata: args.metadata,
        force: args.force,
        write_index: args.index,
        show_progress: args.progress,
    };
    let summary = assembler
        .pack(&options)
        .with_context(|| format!("packing {}", args.source.display()))?;
    summary.display();
    Ok(ExitCode::SUCCESS)
}

fn replay(args: RunArgs) -> Result<ExitCode> {
    let artifact = Artifact::read_from(&args.artifact)?;
    let options = RunOptions {
        artifact_path: Some(args.artifact.clone()),
        target_dir: args.target_dir.clone(),
        mode: args.mode(),
        scratch_root: None,
    };

    let engine = ReconstructionEngine::new(&artifact, options);
    let report = engine.run(&mut StdinPrompt)?;
    report.display();
    Ok(ExitCode::from(report.exit_code() as u8))
}
