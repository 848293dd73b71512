mod beat;
mod registry;
mod worker;

use crate::api::client_config::ClientConfig;
use crate::api::constants::{DEFAULT_CLUSTER_NAME, DEFAULT_GROUP};
use crate::api::error::{Error, Result};
use crate::api::events::{Listener, SubscriptionKey};
use crate::api::naming::{Instance, InstanceKey, ServiceKey, ServiceView};
use crate::common::scheduler::{RefreshReason, RefreshScheduler, SchedulerSettings};
use crate::common::subscription::{EventSender, SubscriptionManager};
use crate::common::transport::Transport;
use crate::naming::beat::BeatReactor;
use crate::naming::registry::InstanceRegistry;
use crate::naming::worker::NamingWorker;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct NacosNamingService {
    transport: Arc<dyn Transport>,
    registry: Arc<InstanceRegistry>,
    scheduler: RefreshScheduler<ServiceKey>,
    beats: Arc<BeatReactor>,
    subscriptions: Arc<SubscriptionManager>,
    /// Services kept fresh on behalf of `subscribe = true` reads.
    warm: Mutex<HashSet<ServiceKey>>,
    client_ip: String,
    request_timeout: Duration,
    beat_task: Mutex<Option<JoinHandle<()>>>,
}

impl NacosNamingService {
    pub(crate) fn new(
        client_config: &ClientConfig,
        transport: Arc<dyn Transport>,
        events: EventSender,
        subscriptions: Arc<SubscriptionManager>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(events));
        let worker = Arc::new(NamingWorker::new(transport.clone(), registry.clone()));
        let scheduler = RefreshScheduler::spawn(
            "naming",
            worker,
            SchedulerSettings::from_config(client_config),
            shutdown.clone(),
        );
        let beats = Arc::new(BeatReactor::new(
            transport.clone(),
            client_config.heartbeat_interval_duration(),
        ));
        let beat_task = beats.spawn(shutdown);
        NacosNamingService {
            transport,
            registry,
            scheduler,
            beats,
            subscriptions,
            warm: Mutex::new(HashSet::new()),
            client_ip: client_config.client_ip.clone(),
            request_timeout: client_config.request_timeout_duration(),
            beat_task: Mutex::new(Some(beat_task)),
        }
    }

    /// Write-through registration. The local view is left to the server's
    /// confirmation. A blank ip stands for the client's own.
    pub(crate) async fn register_instance(&self, service_name: &str, group: &str, mut instance: Instance) -> Result<()> {
        let key = service_key(service_name, group)?;
        if instance.ip.trim().is_empty() {
            instance.ip = self.client_ip.clone();
        }
        if instance.ip.trim().is_empty() || instance.port == 0 {
            return Err(Error::InvalidArgument(format!(
                "instance address {} is incomplete",
                instance.address()
            )));
        }
        if !instance.weight.is_finite() || instance.weight < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "instance weight {} must be a non-negative number",
                instance.weight
            )));
        }
        if instance.cluster_name.trim().is_empty() {
            instance.cluster_name = DEFAULT_CLUSTER_NAME.to_string();
        }
        instance.service_name = key.service_name.clone();

        self.transport
            .register_instance(&key, &instance)
            .await
            .map_err(|e| Error::RegistrationFailed {
                service_name: key.service_name.clone(),
                cause: e.to_string(),
            })?;
        info!(service = %key, instance = %instance.key(), "instance registered");
        if instance.ephemeral {
            self.beats.add(&key, instance);
        }
        Ok(())
    }

    pub(crate) async fn deregister_instance(
        &self,
        service_name: &str,
        group: &str,
        ip: &str,
        port: u16,
        cluster_name: &str,
    ) -> Result<()> {
        let key = service_key(service_name, group)?;
        let cluster_name = if cluster_name.trim().is_empty() {
            DEFAULT_CLUSTER_NAME
        } else {
            cluster_name
        };
        let instance = InstanceKey {
            cluster_name: cluster_name.to_string(),
            ip: ip.to_string(),
            port,
        };
        self.beats.remove(&key, &instance).await;
        self.transport.deregister_instance(&key, &instance).await?;
        info!(service = %key, %instance, "instance deregistered");
        Ok(())
    }

    pub(crate) async fn get_all_instances(&self, service_name: &str, group: &str, subscribe: bool) -> Result<Vec<Instance>> {
        let key = service_key(service_name, group)?;
        Ok(self.view(&key, subscribe).await?.instances)
    }

    pub(crate) async fn select_instances(
        &self,
        service_name: &str,
        group: &str,
        clusters: &[String],
        healthy: bool,
        subscribe: bool,
    ) -> Result<Vec<Instance>> {
        let key = service_key(service_name, group)?;
        let view = self.view(&key, subscribe).await?;
        Ok(view
            .in_clusters(clusters)
            .into_iter()
            .filter(|i| !healthy || i.is_available())
            .collect())
    }

    /// Served from the cache, which is kept fresh after the first call.
    pub(crate) async fn select_one_healthy_instance(&self, service_name: &str, group: &str) -> Result<Instance> {
        let key = service_key(service_name, group)?;
        self.view(&key, true).await?;
        self.registry.select_healthy(&key)
    }

    pub(crate) fn subscribe(&self, service_name: &str, group: &str, listener: Arc<dyn Listener>) -> Result<()> {
        let key = service_key(service_name, group)?;
        self.subscriptions
            .subscribe(SubscriptionKey::Service(key.clone()), listener);
        self.scheduler.track(key);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, service_name: &str, group: &str, listener: &Arc<dyn Listener>) -> Result<()> {
        let key = service_key(service_name, group)?;
        let subscription = SubscriptionKey::Service(key.clone());
        self.subscriptions.unsubscribe(&subscription, listener);
        if !self.subscriptions.has_listeners(&subscription) {
            // a later subscribing read warms it again
            self.lock_warm().remove(&key);
            self.scheduler.untrack(key);
        }
        Ok(())
    }

    /// Apply a service view pushed by the server.
    pub(crate) fn apply_push(&self, view: ServiceView) {
        let key = view.key();
        debug!(service = %key, version = view.version, "service push received");
        self.registry.upsert(&key, view.instances, view.version);
    }

    /// With `subscribe` the cached view is served and the service stays
    /// tracked; otherwise the server is asked, falling back to the cache
    /// when it cannot answer.
    async fn view(&self, key: &ServiceKey, subscribe: bool) -> Result<ServiceView> {
        if subscribe {
            let newly = self.lock_warm().insert(key.clone());
            if newly {
                self.scheduler.track(key.clone());
            }
            if let Some(view) = self.registry.get(key, None) {
                return Ok(view);
            }
        }

        let loaded = self
            .scheduler
            .request(key.clone(), RefreshReason::ColdRead, false)?;
        let outcome = match tokio::time::timeout(self.request_timeout, loaded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(Error::ClientShutdown),
            Err(_) => Err(Error::transport(format!(
                "no answer for {} within {:?}",
                key, self.request_timeout
            ))),
        };
        match (outcome, self.registry.get(key, None)) {
            (_, Some(view)) => Ok(view),
            (Ok(()), None) => Ok(ServiceView::empty(key)),
            (Err(e), None) => {
                warn!(service = %key, error = %e, "service unavailable and not cached");
                Err(e)
            }
        }
    }

    pub(crate) async fn join(&self) {
        self.scheduler.join().await;
        let beat_task = self.beat_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = beat_task {
            let _ = task.await;
        }
    }

    fn lock_warm(&self) -> std::sync::MutexGuard<'_, HashSet<ServiceKey>> {
        self.warm.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn service_key(service_name: &str, group: &str) -> Result<ServiceKey> {
    if service_name.trim().is_empty() {
        return Err(Error::InvalidArgument("serviceName must not be blank".to_string()));
    }
    let group = if group.trim().is_empty() {
        DEFAULT_GROUP
    } else {
        group
    };
    Ok(ServiceKey::new(service_name, group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::events::{ChangeEvent, ListenerError};
    use crate::common::memory::MemoryTransport;
    use tokio::sync::mpsc;

    fn service(transport: Arc<MemoryTransport>) -> (NacosNamingService, watch::Sender<bool>) {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ClientConfig::new()
            .client_ip("10.0.0.7")
            .jitter_fraction(0.0)
            .request_timeout(Duration::from_millis(500));
        let service = NacosNamingService::new(
            &config,
            transport,
            events_tx,
            Arc::new(SubscriptionManager::new()),
            shutdown_rx,
        );
        (service, shutdown_tx)
    }

    #[tokio::test]
    async fn test_registration_waits_for_confirmation() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport.clone());
        service
            .register_instance("demo-svc1", DEFAULT_GROUP, Instance::new("127.0.0.1", 9999))
            .await
            .unwrap();

        // no push wired here: nothing cached until the server is asked
        let key = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        assert!(service.registry.get(&key, None).is_none());
        let instances = service
            .get_all_instances("demo-svc1", DEFAULT_GROUP, false)
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].service_name, "demo-svc1");
    }

    #[tokio::test]
    async fn test_registration_failure() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport.clone());
        transport.fail_next(1);
        let err = service
            .register_instance("demo-svc1", DEFAULT_GROUP, Instance::new("127.0.0.1", 9999))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistrationFailed { .. }));
        assert_eq!(transport.instance_count(&ServiceKey::new("demo-svc1", DEFAULT_GROUP)), 0);
    }

    #[tokio::test]
    async fn test_invalid_instances_are_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport);
        for instance in [
            Instance::new("127.0.0.1", 0),
            Instance::new("127.0.0.1", 9999).weight(-1.0),
        ] {
            assert!(matches!(
                service.register_instance("demo-svc1", DEFAULT_GROUP, instance).await,
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_deregister_absent_instance_succeeds() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport);
        service
            .deregister_instance("demo-svc1", "", "127.0.0.1", 9999, "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_view_served_when_server_unreachable() {
        let transport = Arc::new(MemoryTransport::new());
        let key = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        transport
            .register_instance(&key, &Instance::new("127.0.0.1", 9999))
            .await
            .unwrap();
        let (service, _shutdown) = service(transport.clone());
        assert_eq!(
            service.get_all_instances("demo-svc1", DEFAULT_GROUP, false).await.unwrap().len(),
            1
        );

        transport.fail_next(1);
        let stale = service
            .get_all_instances("demo-svc1", DEFAULT_GROUP, false)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        transport.fail_next(1);
        assert!(service
            .get_all_instances("unknown", DEFAULT_GROUP, false)
            .await
            .unwrap_err()
            .is_transport());
    }

    #[tokio::test]
    async fn test_select_instances_filters() {
        let transport = Arc::new(MemoryTransport::new());
        let key = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        for instance in [
            Instance::new("10.0.0.1", 80),
            Instance::new("10.0.0.2", 80).healthy(false),
            Instance::new("10.0.0.3", 80).cluster("EDGE"),
        ] {
            transport.register_instance(&key, &instance).await.unwrap();
        }
        let (service, _shutdown) = service(transport);

        let healthy = service
            .select_instances("demo-svc1", DEFAULT_GROUP, &[], true, false)
            .await
            .unwrap();
        assert_eq!(healthy.len(), 2);
        let edge = service
            .select_instances("demo-svc1", DEFAULT_GROUP, &["EDGE".to_string()], false, true)
            .await
            .unwrap();
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].ip, "10.0.0.3");
    }

    #[tokio::test]
    async fn test_blank_ip_registers_client_ip() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport.clone());
        service
            .register_instance("demo-svc1", DEFAULT_GROUP, Instance::new("", 9999))
            .await
            .unwrap();
        let instances = service
            .get_all_instances("demo-svc1", DEFAULT_GROUP, false)
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address(), "10.0.0.7:9999");
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_warm_service() {
        let transport = Arc::new(MemoryTransport::new());
        let (service, _shutdown) = service(transport);
        let key = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        service
            .get_all_instances("demo-svc1", DEFAULT_GROUP, true)
            .await
            .unwrap();
        assert!(service.lock_warm().contains(&key));

        let listener: Arc<dyn Listener> =
            Arc::new(|_: &ChangeEvent| -> std::result::Result<(), ListenerError> { Ok(()) });
        service
            .subscribe("demo-svc1", DEFAULT_GROUP, listener.clone())
            .unwrap();
        service
            .unsubscribe("demo-svc1", DEFAULT_GROUP, &listener)
            .unwrap();
        assert!(!service.lock_warm().contains(&key));

        service
            .get_all_instances("demo-svc1", DEFAULT_GROUP, true)
            .await
            .unwrap();
        assert!(service.lock_warm().contains(&key));
    }
}
