//! Hot reload of the runtime-tunable settings.
//!
//! Only `executor.max_concurrent` and `scheduler.enabled` are applied to a
//! live runtime. Other edits take effect on the next start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentcron_cron::CronRuntime;

const DEBOUNCE: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a reload did with the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReloadOutcome {
    Applied,
    /// Parsed, but the runtime kept its current settings.
    Rejected,
    Unreadable,
}

/// Watch `config_path` and apply its tunable settings whenever it changes.
///
/// Returns `None` when the file's directory does not exist yet.
pub fn start_config_watcher(
    runtime: Arc<CronRuntime>,
    config_path: PathBuf,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let dir = config_path.parent()?.to_path_buf();
    if !dir.is_dir() {
        info!(dir = %dir.display(), "Config directory missing; hot reload disabled");
        return None;
    }

    let handle = Handle::current();
    Some(tokio::task::spawn_blocking(move || {
        if let Err(e) = watch(&dir, &config_path, &runtime, &handle, &shutdown) {
            warn!(dir = %dir.display(), error = %e, "Config watcher stopped");
        }
    }))
}

fn watch(
    dir: &Path,
    config_path: &Path,
    runtime: &Arc<CronRuntime>,
    handle: &Handle,
    shutdown: &CancellationToken,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(DEBOUNCE, tx)?;
    debouncer
        .watcher()
        .watch(dir, notify::RecursiveMode::NonRecursive)?;
    info!(path = %config_path.display(), "Watching config for changes");

    while !shutdown.is_cancelled() {
        let events = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                warn!(error = ?e, "Config watch event error");
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if touches(&events, config_path) {
            let runtime = runtime.clone();
            let path = config_path.to_path_buf();
            handle.spawn(async move {
                reload(&runtime, &path).await;
            });
        }
    }
    debug!("Config watcher exiting");
    Ok(())
}

fn touches(events: &[DebouncedEvent], config_path: &Path) -> bool {
    events
        .iter()
        .any(|event| event.kind == DebouncedEventKind::Any && event.path == config_path)
}

/// Re-read `config_path` and push its tunable settings into `runtime`.
///
/// A file that parses but fails validation leaves the runtime untouched.
pub(crate) async fn reload(runtime: &CronRuntime, config_path: &Path) -> ReloadOutcome {
    let config = match agentcron_config::read_config_from(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path.display(), error = %e, "Config reload failed to parse");
            return ReloadOutcome::Unreadable;
        }
    };

    let max_concurrent = config.executor.max_concurrent;
    let scheduler_enabled = config.scheduler.enabled;
    let applied = match config.validate() {
        Ok(()) => runtime.apply_config(&config).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match applied {
        Ok(()) => {
            info!(max_concurrent, scheduler_enabled, "Config reloaded");
            ReloadOutcome::Applied
        }
        Err(error) => {
            warn!(
                max_concurrent,
                scheduler_enabled,
                error = %error,
                "Config reload rejected; keeping current settings"
            );
            ReloadOutcome::Rejected
        }
    }
}
