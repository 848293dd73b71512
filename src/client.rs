use crate::api::client_config::ClientConfig;
use crate::api::error::{Error, Result};
use crate::api::events::Listener;
use crate::common::subscription::SubscriptionManager;
use crate::common::transport::{PushEvent, PushReceiver, Transport};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(feature = "config")]
use crate::api::config::{ConfigResponse, ConfigService};
#[cfg(feature = "config")]
use crate::config::NacosConfigService;
#[cfg(feature = "naming")]
use crate::api::naming::{Instance, NamingService};
#[cfg(feature = "naming")]
use crate::naming::NacosNamingService;
#[cfg(feature = "config")]
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Entry point of the client. Owns the caches, the refresh loops and the
/// listener table. Build one with [`crate::ClientBuilder`].
///
/// Call [`NacosClient::shutdown`] before dropping it to let in-flight work
/// finish; dropping it only stops the background tasks.
pub struct NacosClient {
    client_config: ClientConfig,
    #[cfg(feature = "naming")]
    naming: Arc<NacosNamingService>,
    #[cfg(feature = "config")]
    config: Arc<NacosConfigService>,
    subscriptions: Arc<SubscriptionManager>,
    shutdown: watch::Sender<bool>,
    router_stop: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl NacosClient {
    pub(crate) fn start(
        client_config: ClientConfig,
        transport: Arc<dyn Transport>,
        push: Option<PushReceiver>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (router_stop, router_stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let subscriptions = Arc::new(SubscriptionManager::new());
        let router = subscriptions.spawn_router(events_rx, router_stop_rx);

        #[cfg(feature = "naming")]
        let naming = Arc::new(NacosNamingService::new(
            &client_config,
            transport.clone(),
            events_tx.clone(),
            subscriptions.clone(),
            shutdown_rx.clone(),
        ));
        #[cfg(feature = "config")]
        let config = Arc::new(NacosConfigService::new(
            &client_config,
            transport.clone(),
            events_tx.clone(),
            subscriptions.clone(),
            shutdown_rx.clone(),
        ));
        drop(events_tx);

        let pump = push.map(|push| {
            let handler = PushHandler {
                #[cfg(feature = "naming")]
                naming: naming.clone(),
                #[cfg(feature = "config")]
                config: config.clone(),
            };
            tokio::spawn(handler.run(push, shutdown_rx.clone()))
        });
        if pump.is_none() {
            info!("no push channel, relying on polling");
        }
        info!(
            server_addr = %client_config.server_addr,
            namespace = %client_config.namespace,
            client_ip = %client_config.client_ip,
            "nacos client started"
        );

        NacosClient {
            client_config,
            #[cfg(feature = "naming")]
            naming,
            #[cfg(feature = "config")]
            config,
            subscriptions,
            shutdown,
            router_stop,
            pump: Mutex::new(pump),
            router: Mutex::new(Some(router)),
        }
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the client. Refreshes in flight get the shutdown timeout to
    /// finish, and changes they produce still reach listeners. Afterwards
    /// every operation fails with [`Error::ClientShutdown`].
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            debug!("nacos client already shut down");
            return;
        }
        info!("nacos client shutting down");

        #[cfg(feature = "config")]
        self.config.join().await;
        #[cfg(feature = "naming")]
        self.naming.join().await;
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("push pump ended abnormally: {}", e);
            }
        }

        // caches are quiet now, flush what they published
        self.router_stop.send_replace(true);
        let router = self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(router) = router {
            if let Err(e) = router.await {
                warn!("event router ended abnormally: {}", e);
            }
        }
        self.subscriptions
            .shutdown(self.client_config.shutdown_timeout_duration())
            .await;
        info!("nacos client shut down");
    }

    /// Changes of one config as a stream, see [`ConfigService::add_listener`].
    #[cfg(feature = "config")]
    pub fn listen_config(
        &self,
        data_id: &str,
        group: &str,
    ) -> Result<UnboundedReceiverStream<ConfigResponse>> {
        self.ensure_running()?;
        self.config.listen_config(data_id, group)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::ClientShutdown);
        }
        Ok(())
    }
}

#[cfg(feature = "naming")]
#[async_trait::async_trait]
impl NamingService for NacosClient {
    async fn register_instance(&self, service_name: &str, group: &str, instance: Instance) -> Result<()> {
        self.ensure_running()?;
        self.naming
            .register_instance(service_name, group, instance)
            .await
    }

    async fn deregister_instance(
        &self,
        service_name: &str,
        group: &str,
        ip: &str,
        port: u16,
        cluster_name: &str,
    ) -> Result<()> {
        self.ensure_running()?;
        self.naming
            .deregister_instance(service_name, group, ip, port, cluster_name)
            .await
    }

    async fn get_all_instances(&self, service_name: &str, group: &str, subscribe: bool) -> Result<Vec<Instance>> {
        self.ensure_running()?;
        self.naming
            .get_all_instances(service_name, group, subscribe)
            .await
    }

    async fn select_instances(
        &self,
        service_name: &str,
        group: &str,
        clusters: &[String],
        healthy: bool,
        subscribe: bool,
    ) -> Result<Vec<Instance>> {
        self.ensure_running()?;
        self.naming
            .select_instances(service_name, group, clusters, healthy, subscribe)
            .await
    }

    async fn select_one_healthy_instance(&self, service_name: &str, group: &str) -> Result<Instance> {
        self.ensure_running()?;
        self.naming
            .select_one_healthy_instance(service_name, group)
            .await
    }

    async fn subscribe(&self, service_name: &str, group: &str, listener: Arc<dyn Listener>) -> Result<()> {
        self.ensure_running()?;
        self.naming.subscribe(service_name, group, listener)
    }

    async fn unsubscribe(&self, service_name: &str, group: &str, listener: &Arc<dyn Listener>) -> Result<()> {
        self.ensure_running()?;
        self.naming.unsubscribe(service_name, group, listener)
    }
}

#[cfg(feature = "config")]
#[async_trait::async_trait]
impl ConfigService for NacosClient {
    async fn get_config(&self, data_id: &str, group: &str, timeout_ms: u64) -> Result<String> {
        self.ensure_running()?;
        self.config.get_config(data_id, group, timeout_ms).await
    }

    async fn publish_config(&self, data_id: &str, group: &str, content: &str) -> Result<bool> {
        self.ensure_running()?;
        self.config.publish_config(data_id, group, content).await
    }

    async fn remove_config(&self, data_id: &str, group: &str) -> Result<bool> {
        self.ensure_running()?;
        self.config.remove_config(data_id, group).await
    }

    async fn add_listener(&self, data_id: &str, group: &str, listener: Arc<dyn Listener>) -> Result<()> {
        self.ensure_running()?;
        self.config.add_listener(data_id, group, listener)
    }

    async fn remove_listener(&self, data_id: &str, group: &str, listener: &Arc<dyn Listener>) -> Result<()> {
        self.ensure_running()?;
        self.config.remove_listener(data_id, group, listener)
    }
}

/// Feeds server pushes into the caches.
struct PushHandler {
    #[cfg(feature = "naming")]
    naming: Arc<NacosNamingService>,
    #[cfg(feature = "config")]
    config: Arc<NacosConfigService>,
}

impl PushHandler {
    async fn run(self, mut push: PushReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! { biased;
                _ = shutdown.changed() => break,
                event = push.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        warn!("push channel closed, relying on polling");
                        break;
                    }
                },
            }
        }
        debug!("push pump stopped");
    }

    fn handle(&self, event: PushEvent) {
        match event {
            PushEvent::Instances { view } => {
                #[cfg(feature = "naming")]
                self.naming.apply_push(view);
                #[cfg(not(feature = "naming"))]
                debug!(service = %view.key(), "service push ignored");
            }
            PushEvent::Config { key, snapshot } => {
                #[cfg(feature = "config")]
                self.config.apply_push(&key, snapshot);
                #[cfg(not(feature = "config"))]
                debug!(config = %key, removed = snapshot.is_none(), "config push ignored");
            }
            PushEvent::ConfigNotify { key } => {
                #[cfg(feature = "config")]
                self.config.notify_change(key);
                #[cfg(not(feature = "config"))]
                debug!(config = %key, "config notify ignored");
            }
        }
    }
}
