use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{Config, load_config},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider backed by a local file, with change notification
/// through a filesystem watcher.
///
/// The watcher observes the file's parent directory (editors often replace
/// the file rather than write in place) and filters events by file name.
pub struct FileConfigProvider {
    path: PathBuf,
    // The watcher only needs to stay alive; events flow through the channel.
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    // Taken once by `watch()`.
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };
        provider.init_watcher()?;
        Ok(provider)
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("config path has no file name: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify() || event.kind.is_create())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&file_name))
                        {
                            tracing::debug!(kind = ?event.kind, "config file changed");
                            // Capacity 1: a pending update replaces an older
                            // pending update.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!(error = ?e, "config watch error"),
                }
            })?;

        let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("failed to watch config directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load(&self) -> Result<Config> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("non-UTF-8 config path: {}", self.path.display()))?;
        load_config(path)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        self.update_rx
            .lock()
            .expect("update_rx mutex poisoned")
            .take()
            .expect("watch may only be called once")
    }
}
