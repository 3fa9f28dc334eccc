//! Hot reload of the configuration file in server mode.
//!
//! The parent directory is watched rather than the file itself: editors
//! that save by rename would otherwise detach the watch after the first
//! write. Events for other files in that directory are ignored, and a
//! reload that yields byte-identical content is dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::EnsembleConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches one configuration file and emits validated replacements.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<EnsembleConfig>,
    last_content: Mutex<Option<String>>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of its updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<EnsembleConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            updates,
            last_content: Mutex::new(fs::read_to_string(path).ok()),
        };
        (watcher, rx)
    }

    fn concerns(&self, event: &Event) -> bool {
        (event.kind.is_modify() || event.kind.is_create())
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }

    /// Reload the file if its content changed since the last reload.
    /// Invalid files are logged and skipped; the running config stays.
    fn reload(&self) -> Option<EnsembleConfig> {
        let content = fs::read_to_string(&self.path).ok()?;
        {
            let mut last = self
                .last_content
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.as_deref() == Some(content.as_str()) {
                return None;
            }
            *last = Some(content);
        }

        match load_config(Some(&self.path)) {
            Ok(config) => {
                tracing::info!(
                    path = %self.path.display(),
                    models = config.models.len(),
                    refinement_model = config.refinement_model().unwrap_or("-"),
                    "Configuration reloaded"
                );
                Some(config)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                None
            }
        }
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let directory = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if self.concerns(&event) => {
                    if let Some(config) = self.reload() {
                        let _ = self.updates.send(config);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}
