mod cache;
mod worker;

use crate::api::client_config::ClientConfig;
use crate::api::config::{ConfigKey, ConfigResponse, ConfigSnapshot};
use crate::api::constants::DEFAULT_GROUP;
use crate::api::error::{Error, Result};
use crate::api::events::{ChangeEvent, Listener, ListenerError, SubscriptionKey};
use crate::common::scheduler::{RefreshReason, RefreshScheduler, SchedulerSettings};
use crate::common::subscription::{EventSender, SubscriptionManager};
use crate::common::transport::Transport;
use crate::config::cache::{CacheSlot, ConfigCache};
use crate::config::worker::ConfigWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub(crate) struct NacosConfigService {
    namespace: String,
    transport: Arc<dyn Transport>,
    cache: Arc<ConfigCache>,
    scheduler: RefreshScheduler<ConfigKey>,
    subscriptions: Arc<SubscriptionManager>,
}

impl NacosConfigService {
    pub(crate) fn new(
        client_config: &ClientConfig,
        transport: Arc<dyn Transport>,
        events: EventSender,
        subscriptions: Arc<SubscriptionManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cache = Arc::new(ConfigCache::new(events));
        let worker = Arc::new(ConfigWorker::new(transport.clone(), cache.clone()));
        let scheduler = RefreshScheduler::spawn(
            "config",
            worker,
            SchedulerSettings::from_config(client_config),
            shutdown,
        );
        NacosConfigService {
            namespace: client_config.namespace.clone(),
            transport,
            cache,
            scheduler,
            subscriptions,
        }
    }

    /// Cached content, or the server's content within `timeout_ms`. The key
    /// is kept fresh from its first read on.
    pub(crate) async fn get_config(&self, data_id: &str, group: &str, timeout_ms: u64) -> Result<String> {
        let key = config_key(data_id, group)?;
        match self.cache.get(&key) {
            Some(CacheSlot::Present(data)) => return Ok(data.content),
            Some(CacheSlot::Absent { .. }) => return Err(not_found(&key)),
            None => {}
        }

        let loaded = self
            .scheduler
            .request(key.clone(), RefreshReason::ColdRead, true)?;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), loaded).await {
            Err(_) => {
                tracing::warn!(config = %key, timeout_ms, "get config timed out");
                Err(Error::ConfigTimeout {
                    data_id: key.data_id,
                    group: key.group,
                    timeout_ms,
                })
            }
            Ok(Err(_)) => Err(Error::ClientShutdown),
            Ok(Ok(Err(e))) => self.cache.content(&key).ok_or(e),
            Ok(Ok(Ok(()))) => self.cache.content(&key).ok_or_else(|| not_found(&key)),
        }
    }

    /// Write-through publish. An accepted value is visible locally at once
    /// and replaced if the server later reports different content.
    pub(crate) async fn publish_config(&self, data_id: &str, group: &str, content: &str) -> Result<bool> {
        let key = config_key(data_id, group)?;
        if content.trim().is_empty() {
            return Err(Error::InvalidArgument("content must not be blank".to_string()));
        }
        let accepted = self.transport.publish_config(&key, content).await?;
        if accepted {
            self.cache.upsert_local(&key, content);
        }
        tracing::info!(config = %key, accepted, "config published");
        Ok(accepted)
    }

    /// Write-through removal. The cached value goes away once the server
    /// confirms, through push or the refresh triggered here.
    pub(crate) async fn remove_config(&self, data_id: &str, group: &str) -> Result<bool> {
        let key = config_key(data_id, group)?;
        let accepted = self.transport.remove_config(&key).await?;
        if accepted && self.cache.get(&key).is_some() {
            self.scheduler.trigger(key.clone(), RefreshReason::Confirm);
        }
        tracing::info!(config = %key, accepted, "config removed");
        Ok(accepted)
    }

    pub(crate) fn add_listener(&self, data_id: &str, group: &str, listener: Arc<dyn Listener>) -> Result<()> {
        let key = config_key(data_id, group)?;
        self.subscriptions
            .subscribe(SubscriptionKey::Config(key.clone()), listener);
        self.scheduler.track(key);
        Ok(())
    }

    pub(crate) fn remove_listener(&self, data_id: &str, group: &str, listener: &Arc<dyn Listener>) -> Result<()> {
        let key = config_key(data_id, group)?;
        self.subscriptions
            .unsubscribe(&SubscriptionKey::Config(key), listener);
        Ok(())
    }

    /// Changes of one config as a stream. Removal yields empty content.
    pub(crate) fn listen_config(
        &self,
        data_id: &str,
        group: &str,
    ) -> Result<UnboundedReceiverStream<ConfigResponse>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let namespace = self.namespace.clone();
        let listener: Arc<dyn Listener> = Arc::new(
            move |event: &ChangeEvent| -> std::result::Result<(), ListenerError> {
                if let ChangeEvent::ConfigChanged {
                    data_id,
                    group,
                    content,
                    ..
                } = event
                {
                    tx.send(ConfigResponse::new(
                        namespace.clone(),
                        data_id.clone(),
                        group.clone(),
                        content.clone().unwrap_or_default(),
                    ))
                    .map_err(|_| "config stream closed")?;
                }
                Ok(())
            },
        );
        self.add_listener(data_id, group, listener)?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Apply a config pushed by the server.
    pub(crate) fn apply_push(&self, key: &ConfigKey, snapshot: Option<ConfigSnapshot>) {
        tracing::debug!(config = %key, removed = snapshot.is_none(), "config push received");
        match snapshot {
            Some(snapshot) => {
                self.cache.upsert(key, snapshot);
            }
            None => {
                self.cache.remove(key);
            }
        }
    }

    /// The server announced a change without content.
    pub(crate) fn notify_change(&self, key: ConfigKey) {
        tracing::debug!(config = %key, "config change notified");
        self.scheduler.trigger(key, RefreshReason::Push);
    }

    pub(crate) async fn join(&self) {
        self.scheduler.join().await;
    }
}

fn config_key(data_id: &str, group: &str) -> Result<ConfigKey> {
    if data_id.trim().is_empty() {
        return Err(Error::InvalidArgument("dataId must not be blank".to_string()));
    }
    let group = if group.trim().is_empty() {
        DEFAULT_GROUP
    } else {
        group
    };
    Ok(ConfigKey::new(data_id, group))
}

fn not_found(key: &ConfigKey) -> Error {
    Error::ConfigNotFound {
        data_id: key.data_id.clone(),
        group: key.group.clone(),
    }
}
