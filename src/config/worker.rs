use crate::api::config::ConfigKey;
use crate::api::error::Result;
use crate::common::scheduler::RefreshSource;
use crate::common::transport::Transport;
use crate::config::cache::ConfigCache;
use std::sync::Arc;

/// Pulls config from the server into the cache.
pub(crate) struct ConfigWorker {
    transport: Arc<dyn Transport>,
    cache: Arc<ConfigCache>,
}

impl ConfigWorker {
    pub(crate) fn new(transport: Arc<dyn Transport>, cache: Arc<ConfigCache>) -> Self {
        ConfigWorker { transport, cache }
    }
}

#[async_trait::async_trait]
impl RefreshSource for ConfigWorker {
    type Key = ConfigKey;

    async fn refresh(&self, key: &ConfigKey) -> Result<bool> {
        let stamp = self.cache.stamp(key);
        let fetched = self.transport.fetch_config(key).await?;
        Ok(self.cache.apply_fetched(key, fetched, stamp))
    }
}
