//! Debounced file watcher for configuration hot reload.
//!
//! Watches the directory containing a file (editors often replace a file
//! rather than write it in place) and invokes a callback at most once per
//! debounce window when that file changes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the watch loop checks for a stop request
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Not a file path: {0}")]
    InvalidPath(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Watch task failed: {0}")]
    Task(String),
}

/// Handle to a running watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher and wait for it to exit
    pub async fn stop(self) -> Result<(), WatchError> {
        let _ = self.stop_tx.send(()).await;
        self.task
            .await
            .map_err(|e| WatchError::Task(e.to_string()))
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, OsString), WatchError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| WatchError::InvalidPath(path.to_path_buf()))?
        .to_os_string();

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    Ok((dir, file_name))
}

/// Call `on_change` whenever `path` is written, coalescing bursts of events
/// within `delay` into one call. Must be called within a Tokio runtime.
pub fn watch_file_write<F>(path: &Path, delay: Duration, on_change: F) -> Result<WatchHandle, WatchError>
where
    F: Fn() + Send + 'static,
{
    let (dir, file_name) = split_path(path)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(delay, tx)?;
    debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;

    info!(path = %path.display(), "Watching for changes");

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let task = tokio::task::spawn_blocking(move || {
        // Keep the debouncer alive for as long as the loop runs
        let _debouncer = debouncer;

        loop {
            if stop_rx.try_recv().is_ok() {
                debug!("Watcher stopping");
                break;
            }

            match rx.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(Ok(events)) => {
                    let touched = events
                        .iter()
                        .any(|event| event.path.file_name() == Some(file_name.as_os_str()));

                    if touched {
                        debug!(file = ?file_name, "File changed");
                        on_change();
                    }
                }
                Ok(Err(e)) => {
                    warn!("Watcher error: {:?}", e);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Watcher channel disconnected");
                    break;
                }
            }
        }
    });

    Ok(WatchHandle { stop_tx, task })
}
