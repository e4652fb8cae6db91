//! File-backed configuration provider.
//!
//! Loads and validates the configuration file, and reports on-disk edits
//! through a coalescing channel. The watcher observes the parent directory
//! rather than the file itself: most editors save by writing a temp file and
//! renaming it over the original, which would silently detach a watch on the
//! file's inode.
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Result, eyre};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::Config, validation::ConfigValidator},
    ports::config_provider::ConfigProvider,
};

pub struct FileConfigProvider {
    path: PathBuf,
    file_name: OsString,
    /// Keeps the active watcher alive; a later `watch` call replaces it and
    /// retires the previous channel.
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| eyre!("config path '{}' has no file name", path.display()))?
            .to_owned();

        Ok(Self {
            path,
            file_name,
            watcher: Mutex::new(None),
        })
    }

    /// Whether a filesystem event concerns the config file. Create and
    /// remove count alongside modify so rename-over-save and restore-from-
    /// backup sequences both surface as changes.
    fn concerns_config(event: &Event, file_name: &OsString) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
    }

    fn watch_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    /// Load and validate the file. An unparseable or invalid config is an
    /// error here, so the reload worker never hands the gateway a bad one.
    async fn load_config(&self) -> Result<Config> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre!("config path '{}' is not valid UTF-8", self.path.display()))?;
        let config = load_config(path)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Start watching the config file and return the change channel.
    ///
    /// The channel has capacity 1: an editor's burst of events collapses
    /// into a single pending reload, and the reload worker drains stragglers
    /// after its debounce. Watcher setup failures are logged and yield a
    /// channel that never fires; the gateway keeps running on its current
    /// config, reloadable via SIGHUP.
    fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let file_name = self.file_name.clone();

        let built = notify::recommended_watcher(move |outcome: notify::Result<Event>| {
            match outcome {
                Ok(event) if Self::concerns_config(&event, &file_name) => {
                    tracing::debug!(
                        kind = ?event.kind,
                        paths = ?event.paths,
                        "config file changed on disk"
                    );
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "config watch error"),
            }
        });

        let mut watcher = match built {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!(error = %e, "failed to create config watcher");
                return rx;
            }
        };

        let dir = self.watch_dir();
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            tracing::error!(
                error = %e,
                dir = %dir.display(),
                "failed to watch config directory"
            );
            return rx;
        }

        if let Ok(mut active) = self.watcher.lock() {
            *active = Some(watcher);
        }
        rx
    }
}
