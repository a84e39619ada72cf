use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::Config;

/// Port for configuration sources that can signal changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load, parse and validate the current configuration.
    async fn load(&self) -> Result<Config>;

    /// Receive a `()` ping whenever the underlying source changes. The
    /// channel has capacity 1 so a burst of writes collapses into a single
    /// pending notification. May only be called once.
    fn watch(&self) -> mpsc::Receiver<()>;
}
