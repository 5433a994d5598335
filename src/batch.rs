//! Batch driver: applies an ordered sequence of patches in one update
//! session, gating each on the running version, carrying relocations
//! forward through the destination replacement map, and reporting weighted
//! progress across the whole batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::apply::{apply_patch, ProgressSink};
use crate::cancel::CancelToken;
use crate::container::ContainerReader;
use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::model::{FailedReplacement, PatchDescriptor};

/// Mapping from an operation's original destination path to the path an
/// *earlier* patch in the same batch relocated it to. Created empty per
/// batch run, merged after each patch completes, never persisted.
#[derive(Debug, Clone, Default)]
pub struct DestinationMap {
    map: HashMap<String, String>,
}

impl DestinationMap {
    pub fn redirect<'a>(&'a self, path: &'a str) -> &'a str {
        self.map.get(path).map(String::as_str).unwrap_or(path)
    }

    /// Record that `from` now lives at `to`. Stale values pointing at
    /// `from` are rewritten so chained relocations resolve in one hop.
    pub fn insert(&mut self, from: String, to: String) {
        if from == to {
            return;
        }
        for value in self.map.values_mut() {
            if *value == from {
                *value = to.clone();
            }
        }
        self.map.insert(from, to);
    }

    /// Fold in the relocations a completed patch performed: every file
    /// operation whose old path differs from its destination moved a file.
    pub fn merge_from(&mut self, descriptor: &PatchDescriptor) {
        for op in &descriptor.operations {
            if let Some(old) = &op.old_file {
                if old.path != op.destination {
                    self.insert(old.path.clone(), op.destination.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub install_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Lock directory inside the installation's working directory.
    pub lock_dir: PathBuf,
    pub current_version: String,
    pub lock_retry_delay: Duration,
    pub lock_timeout: Duration,
}

impl BatchConfig {
    pub fn new(install_dir: &Path, temp_dir: &Path, current_version: &str) -> Self {
        Self {
            install_dir: install_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            lock_dir: install_dir.join("locks"),
            current_version: current_version.to_string(),
            lock_retry_delay: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: Vec<u64>,
    /// Patches whose version gate did not match the running version; they
    /// are reported invalid rather than applied out of order.
    pub skipped: Vec<u64>,
    /// Retryable failures from the first patch that did not complete.
    pub failures: Vec<FailedReplacement>,
    pub final_version: String,
}

/// Apply an ordered list of patch containers. Takes the updater lock for
/// the whole session; a patch that leaves retryable failures stops the
/// batch (the version did not advance, so later patches cannot match).
pub fn apply_batch(
    containers: &[PathBuf],
    config: &BatchConfig,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<BatchOutcome> {
    let locks = LockCoordinator::new(&config.lock_dir)
        .with_timing(config.lock_retry_delay, config.lock_timeout);
    let _updater = locks.acquire_updater()?;

    let mut outcome = BatchOutcome {
        final_version: config.current_version.clone(),
        ..BatchOutcome::default()
    };
    let mut redirects = DestinationMap::default();
    let count = containers.len().max(1);

    for (slot, container) in containers.iter().enumerate() {
        cancel.checkpoint()?;
        let descriptor = ContainerReader::open(container)?.descriptor().clone();
        let base = (slot * 100 / count) as f64;

        if !version_admits(&descriptor, &outcome.final_version) {
            warn!(
                patch_id = descriptor.id,
                current = %outcome.final_version,
                wants = descriptor.from_label(),
                "patch does not apply to the running version, skipping"
            );
            outcome.skipped.push(descriptor.id);
            progress.report(base as u8, &format!("patch {} skipped", descriptor.id));
            continue;
        }

        let mut weighted = WeightedProgress {
            inner: progress,
            base,
            share: 100.0 / count as f64,
        };
        let failures = apply_patch(
            container,
            descriptor.id,
            &config.install_dir,
            &config.temp_dir,
            &redirects,
            &mut weighted,
            cancel,
        )?;
        if !failures.is_empty() {
            outcome.failures = failures;
            break;
        }

        redirects.merge_from(&descriptor);
        outcome.final_version = descriptor.version_to.clone();
        outcome.applied.push(descriptor.id);
        info!(
            patch_id = descriptor.id,
            version = %outcome.final_version,
            "batch advanced"
        );
    }
    Ok(outcome)
}

/// Does this patch upgrade the version currently installed?
fn version_admits(descriptor: &PatchDescriptor, current: &str) -> bool {
    if descriptor.version_to == current {
        return false;
    }
    if let Some(from) = &descriptor.version_from {
        return from == current;
    }
    if let Some(floor) = &descriptor.version_from_subsequent {
        return compare_versions(current, floor) != std::cmp::Ordering::Less;
    }
    true
}

/// Dotted-numeric version comparison; non-numeric segments fall back to
/// lexicographic order.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.cmp(y),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Rescales a patch's 0-100 progress into this patch's share of the batch:
/// `base + pct/100 × share`.
struct WeightedProgress<'a> {
    inner: &'a mut dyn ProgressSink,
    base: f64,
    share: f64,
}

impl ProgressSink for WeightedProgress<'_> {
    fn report(&mut self, percent: u8, message: &str) {
        let overall = self.base + f64::from(percent) / 100.0 * self.share;
        self.inner.report(overall.round().min(100.0) as u8, message);
    }

    fn cancel_allowed(&mut self, allowed: bool) {
        self.inner.cancel_allowed(allowed);
    }
}
