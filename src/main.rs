use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patchup::{
    apply_batch, apply_patch, clear_staging_area, revert_patch, write_container, BatchConfig,
    CancelToken, Compression, DestinationMap, LockCoordinator, PatchDescriptor, ProgressSink,
    JOURNAL_FILE,
};

#[derive(Parser)]
#[command(name = "patchup", about = "In-place binary patch applier with crash recovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a single patch container to an installation
    Apply {
        /// Path to the patch container
        #[arg(long, short)]
        container: PathBuf,
        /// Path to the installation directory to patch
        #[arg(long)]
        install_dir: PathBuf,
        /// Staging directory for in-flight files, backups, and the journal
        #[arg(long)]
        temp_dir: PathBuf,
        /// Lock directory (defaults to <install-dir>/locks)
        #[arg(long)]
        lock_dir: Option<PathBuf>,
        /// Seconds to wait for the updater lock
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
    /// Apply an ordered batch of patch containers
    ApplyBatch {
        /// Patch containers, in upgrade order
        containers: Vec<PathBuf>,
        #[arg(long)]
        install_dir: PathBuf,
        #[arg(long)]
        temp_dir: PathBuf,
        /// Version currently installed
        #[arg(long)]
        current_version: String,
        #[arg(long)]
        lock_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 30)]
        lock_timeout: u64,
    },
    /// Undo the failed and finished replacements recorded in a journal
    Revert {
        /// Path to the journal (update.log in the staging directory)
        #[arg(long, short)]
        journal: PathBuf,
    },
    /// Delete staged files, backups, and the journal from a staging directory
    ClearStaging {
        #[arg(long)]
        temp_dir: PathBuf,
    },
    /// Assemble a patch container from a descriptor and payload files
    Pack {
        /// Patch descriptor JSON (payload positions/lengths are computed)
        #[arg(long)]
        descriptor: PathBuf,
        /// Directory holding one payload file per operation, named by id
        #[arg(long)]
        payload_dir: PathBuf,
        /// Output path for the container
        #[arg(long, short)]
        output: PathBuf,
        /// Use the higher-ratio block compressor instead of gzip
        #[arg(long)]
        zstd: bool,
    },
}

struct ConsoleProgress {
    last: u8,
}

impl ProgressSink for ConsoleProgress {
    fn report(&mut self, percent: u8, message: &str) {
        if percent != self.last {
            println!("  [{percent:3}%] {message}");
            self.last = percent;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            container,
            install_dir,
            temp_dir,
            lock_dir,
            lock_timeout,
        } => {
            println!("Applying patch...");
            println!("  Container: {}", container.display());
            println!("  Install dir: {}", install_dir.display());

            let lock_dir = lock_dir.unwrap_or_else(|| install_dir.join("locks"));
            let cancel = interruptible_token();
            let start = Instant::now();
            let failures = {
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                    let locks = LockCoordinator::new(&lock_dir).with_timing(
                        Duration::from_millis(500),
                        Duration::from_secs(lock_timeout),
                    );
                    let _updater = locks.acquire_updater()?;
                    let descriptor = patchup::ContainerReader::open(&container)?
                        .descriptor()
                        .clone();
                    let mut progress = ConsoleProgress { last: u8::MAX };
                    Ok(apply_patch(
                        &container,
                        descriptor.id,
                        &install_dir,
                        &temp_dir,
                        &DestinationMap::default(),
                        &mut progress,
                        &cancel,
                    )?)
                })
                .await??
            };
            let elapsed = start.elapsed();

            if failures.is_empty() {
                println!("\nPatch applied successfully!");
            } else {
                println!("\nPatch left {} retryable failures:", failures.len());
                for failure in &failures {
                    println!("  {}: {}", failure.dest.display(), failure.reason);
                }
                println!("Re-run the same command to retry once the files are free.");
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::ApplyBatch {
            containers,
            install_dir,
            temp_dir,
            current_version,
            lock_dir,
            lock_timeout,
        } => {
            println!("Applying {} patches...", containers.len());

            let cancel = interruptible_token();
            let outcome = {
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                    let mut config = BatchConfig::new(&install_dir, &temp_dir, &current_version);
                    if let Some(dir) = lock_dir {
                        config.lock_dir = dir;
                    }
                    config.lock_timeout = Duration::from_secs(lock_timeout);
                    let mut progress = ConsoleProgress { last: u8::MAX };
                    Ok(apply_batch(&containers, &config, &mut progress, &cancel)?)
                })
                .await??
            };

            println!("\nBatch finished at version {}", outcome.final_version);
            println!("  Applied: {:?}", outcome.applied);
            if !outcome.skipped.is_empty() {
                println!("  Skipped (version mismatch): {:?}", outcome.skipped);
            }
            if !outcome.failures.is_empty() {
                println!("  Retryable failures: {}", outcome.failures.len());
            }
        }
        Commands::Revert { journal } => {
            println!("Reverting from journal {}...", journal.display());
            let reverted =
                tokio::task::spawn_blocking(move || revert_patch(&journal)).await??;
            println!("Reverted {reverted} replacements.");
        }
        Commands::ClearStaging { temp_dir } => {
            clear_staging_area(&temp_dir)
                .with_context(|| format!("Failed to clear {}", temp_dir.display()))?;
            println!("Staging area cleared (including {JOURNAL_FILE}).");
        }
        Commands::Pack {
            descriptor,
            payload_dir,
            output,
            zstd,
        } => {
            let text = std::fs::read_to_string(&descriptor)
                .with_context(|| format!("Failed to read {}", descriptor.display()))?;
            let mut descriptor: PatchDescriptor =
                serde_json::from_str(&text).context("Failed to parse patch descriptor")?;

            let mut payloads = Vec::with_capacity(descriptor.operations.len());
            for op in &descriptor.operations {
                let path = payload_dir.join(op.id.to_string());
                let payload = if path.exists() {
                    std::fs::read(&path)
                        .with_context(|| format!("Failed to read payload {}", path.display()))?
                } else {
                    Vec::new()
                };
                payloads.push(payload);
            }

            let compression = if zstd {
                Compression::Zstd
            } else {
                Compression::Gzip
            };
            write_container(&output, &mut descriptor, &payloads, compression)?;
            println!(
                "Container written to {} ({} operations).",
                output.display(),
                descriptor.operations.len()
            );
        }
    }

    Ok(())
}

/// A token wired to Ctrl-C: the first signal requests cooperative
/// cancellation, honored at the engine's next cancel-enabled checkpoint.
fn interruptible_token() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt requested; stopping at the next safe point...");
            handle.interrupt();
        }
    });
    token
}
