//! Best-effort persistence of finished log entries.
//!
//! Each execution can be written as a YAML snapshot
//! (`<resultsDir>/<title>.<startUnix>.<trackingID>.yaml`) and as a plain-text
//! output file (`<outputDir>/<title>.<startUnix>.<trackingID>.log`). Write
//! failures are logged and swallowed; the in-memory entry is never rolled back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{InternalLogEntry, SaveLogs};

fn first_non_empty<'a>(one: &'a str, two: &'a str) -> &'a str {
    if !one.is_empty() {
        one
    } else {
        two
    }
}

/// Directories resolved from per-action and global settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDirectories {
    pub results: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl LogDirectories {
    /// Per-action directories win over the global ones
    pub fn resolve(action: &SaveLogs, global: &SaveLogs) -> Self {
        let pick = |a: &str, g: &str| {
            let dir = first_non_empty(a, g);
            (!dir.is_empty()).then(|| PathBuf::from(dir))
        };

        Self {
            results: pick(&action.results_directory, &global.results_directory),
            output: pick(&action.output_directory, &global.output_directory),
        }
    }
}

/// Write whichever snapshots are configured. Never fails.
pub async fn save_log(entry: &InternalLogEntry, dirs: &LogDirectories) {
    let stem = entry.file_stem();

    if let Some(dir) = &dirs.results {
        if let Err(e) = save_log_results(entry, dir, &stem).await {
            warn!(tracking_id = %entry.execution_tracking_id, error = %e, "Failed to save log results");
        }
    }

    if let Some(dir) = &dirs.output {
        if let Err(e) = save_log_output(entry, dir, &stem).await {
            warn!(tracking_id = %entry.execution_tracking_id, error = %e, "Failed to save log output");
        }
    }
}

/// Write the YAML snapshot of an entry
pub async fn save_log_results(entry: &InternalLogEntry, dir: &Path, stem: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{}.yaml", stem));
    let yaml = entry.to_yaml()?;

    fs::write(&path, yaml)
        .await
        .with_context(|| format!("Failed to write log results: {}", path.display()))?;

    debug!(path = %path.display(), "Saved log results");
    Ok(path)
}

/// Write the plain-text output of an entry
pub async fn save_log_output(entry: &InternalLogEntry, dir: &Path, stem: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{}.log", stem));

    fs::write(&path, &entry.output)
        .await
        .with_context(|| format!("Failed to write log output: {}", path.display()))?;

    debug!(path = %path.display(), "Saved log output");
    Ok(path)
}

/// Reload a YAML snapshot written by `save_log_results`
pub async fn load_log_results(path: &Path) -> Result<InternalLogEntry> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read log results: {}", path.display()))?;

    InternalLogEntry::from_yaml(&content)
}
