//! An in-process control plane.
//!
//! `MemoryTransport` keeps services and configs the way a server would:
//! every membership change bumps the service version, every publish bumps
//! the modification marker, and changes are pushed to the connected client.
//! Faults and latency can be injected to exercise the client's retry paths.

use crate::api::config::{ConfigKey, ConfigSnapshot};
use crate::api::error::{Error, Result};
use crate::api::naming::{Instance, InstanceKey, ServiceKey, ServiceView};
use crate::common::transport::{PushEvent, PushReceiver, PushSender, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct StoredService {
    version: u64,
    instances: HashMap<InstanceKey, (Instance, Instant)>,
}

#[derive(Default)]
struct Authority {
    services: HashMap<ServiceKey, StoredService>,
    configs: HashMap<ConfigKey, ConfigSnapshot>,
    revision: i64,
}

impl Authority {
    fn view(&self, key: &ServiceKey) -> ServiceView {
        match self.services.get(key) {
            Some(stored) => {
                let mut instances: Vec<Instance> =
                    stored.instances.values().map(|(i, _)| i.clone()).collect();
                instances.sort_by_key(|i| i.key());
                ServiceView {
                    service_name: key.service_name.clone(),
                    group: key.group.clone(),
                    version: stored.version,
                    instances,
                }
            }
            None => ServiceView::empty(key),
        }
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    authority: Mutex<Authority>,
    push: Mutex<Option<PushSender>>,
    push_paused: AtomicBool,
    fail_next: AtomicU32,
    fetch_delay_ms: AtomicU32,
    heartbeat_lag_ms: AtomicU32,
    fetches: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Connect a client; pushes go to the most recently connected one.
    pub fn connect(&self) -> PushReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock_push() = Some(tx);
        rx
    }

    /// Stop or resume server pushes, leaving the client to poll.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.push_paused.store(!enabled, Ordering::SeqCst);
    }

    /// Fail the next `count` requests with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Answer heartbeats only `lag` after they were checked.
    pub fn set_heartbeat_lag(&self, lag: Duration) {
        self.heartbeat_lag_ms
            .store(lag.as_millis() as u32, Ordering::SeqCst);
    }

    /// Number of fetches served, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Report a health transition of a registered instance.
    pub fn set_instance_health(&self, service: &ServiceKey, instance: &InstanceKey, healthy: bool) -> bool {
        let view = {
            let mut authority = self.lock_authority();
            let Some(stored) = authority.services.get_mut(service) else {
                return false;
            };
            let Some((current, _)) = stored.instances.get_mut(instance) else {
                return false;
            };
            if current.healthy == healthy {
                return false;
            }
            current.healthy = healthy;
            stored.version += 1;
            authority.view(service)
        };
        self.push(PushEvent::Instances { view });
        true
    }

    /// Drop ephemeral instances without a heartbeat for `ttl`, returns how
    /// many expired.
    pub fn expire_ephemeral(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut views = Vec::new();
        let mut expired = 0;
        {
            let mut authority = self.lock_authority();
            let keys: Vec<ServiceKey> = authority.services.keys().cloned().collect();
            for key in keys {
                let Some(stored) = authority.services.get_mut(&key) else {
                    continue;
                };
                let before = stored.instances.len();
                stored
                    .instances
                    .retain(|_, (i, last_beat)| !i.ephemeral || now.duration_since(*last_beat) < ttl);
                let removed = before - stored.instances.len();
                if removed > 0 {
                    expired += removed;
                    stored.version += 1;
                    views.push(authority.view(&key));
                }
            }
        }
        for view in views {
            tracing::info!(service = %view.key(), "expired ephemeral instances");
            self.push(PushEvent::Instances { view });
        }
        expired
    }

    pub fn instance_count(&self, service: &ServiceKey) -> usize {
        self.lock_authority()
            .services
            .get(service)
            .map(|s| s.instances.len())
            .unwrap_or(0)
    }

    fn lock_authority(&self) -> std::sync::MutexGuard<'_, Authority> {
        self.authority.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_push(&self) -> std::sync::MutexGuard<'_, Option<PushSender>> {
        self.push.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, event: PushEvent) {
        if self.push_paused.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.lock_push().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn check_fault(&self, op: &str) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transport(format!("{} failed: connection refused", op)));
        }
        Ok(())
    }

    async fn before_fetch(&self, op: &str) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.check_fault(op)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn fetch_instances(&self, service: &ServiceKey) -> Result<ServiceView> {
        self.before_fetch("fetch instances").await?;
        Ok(self.lock_authority().view(service))
    }

    async fn fetch_config(&self, key: &ConfigKey) -> Result<Option<ConfigSnapshot>> {
        self.before_fetch("fetch config").await?;
        Ok(self.lock_authority().configs.get(key).cloned())
    }

    async fn register_instance(&self, service: &ServiceKey, instance: &Instance) -> Result<()> {
        self.check_fault("register instance")?;
        let view = {
            let mut authority = self.lock_authority();
            let stored = authority.services.entry(service.clone()).or_default();
            let mut instance = instance.clone();
            instance.service_name = service.service_name.clone();
            stored
                .instances
                .insert(instance.key(), (instance, Instant::now()));
            stored.version += 1;
            authority.view(service)
        };
        self.push(PushEvent::Instances { view });
        Ok(())
    }

    async fn deregister_instance(&self, service: &ServiceKey, instance: &InstanceKey) -> Result<()> {
        self.check_fault("deregister instance")?;
        let view = {
            let mut authority = self.lock_authority();
            let Some(stored) = authority.services.get_mut(service) else {
                return Ok(());
            };
            if stored.instances.remove(instance).is_none() {
                return Ok(());
            }
            stored.version += 1;
            authority.view(service)
        };
        self.push(PushEvent::Instances { view });
        Ok(())
    }

    async fn publish_config(&self, key: &ConfigKey, content: &str) -> Result<bool> {
        self.check_fault("publish config")?;
        let snapshot = {
            let mut authority = self.lock_authority();
            authority.revision += 1;
            let snapshot = ConfigSnapshot::new(content, authority.revision);
            authority.configs.insert(key.clone(), snapshot.clone());
            snapshot
        };
        self.push(PushEvent::Config {
            key: key.clone(),
            snapshot: Some(snapshot),
        });
        Ok(true)
    }

    async fn remove_config(&self, key: &ConfigKey) -> Result<bool> {
        self.check_fault("remove config")?;
        let removed = self.lock_authority().configs.remove(key).is_some();
        if removed {
            self.push(PushEvent::Config {
                key: key.clone(),
                snapshot: None,
            });
        }
        Ok(true)
    }

    async fn send_heartbeat(&self, service: &ServiceKey, instance: &Instance) -> Result<bool> {
        self.check_fault("send heartbeat")?;
        let known = {
            let mut authority = self.lock_authority();
            let beat = authority
                .services
                .get_mut(service)
                .and_then(|s| s.instances.get_mut(&instance.key()));
            match beat {
                Some((_, last_beat)) => {
                    *last_beat = Instant::now();
                    true
                }
                None => false,
            }
        };
        let lag = self.heartbeat_lag_ms.load(Ordering::SeqCst);
        if lag > 0 {
            tokio::time::sleep(Duration::from_millis(lag as u64)).await;
        }
        Ok(known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::constants::DEFAULT_GROUP;

    #[tokio::test]
    async fn test_register_bumps_version_and_pushes() {
        let transport = MemoryTransport::new();
        let mut push = transport.connect();
        let service = ServiceKey::new("demo-svc1", DEFAULT_GROUP);

        transport
            .register_instance(&service, &Instance::new("127.0.0.1", 9999))
            .await
            .unwrap();

        match push.try_recv().unwrap() {
            PushEvent::Instances { view } => {
                assert_eq!(view.version, 1);
                assert_eq!(view.instances[0].service_name, "demo-svc1");
            }
            other => panic!("unexpected push {:?}", other),
        }

        // absent instance: no error, no version bump
        let absent = Instance::new("127.0.0.1", 1).key();
        transport.deregister_instance(&service, &absent).await.unwrap();
        assert!(push.try_recv().is_err());
        assert_eq!(transport.fetch_instances(&service).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_fail_next_injects_transport_errors() {
        let transport = MemoryTransport::new();
        let key = ConfigKey::new("demo-dataid", "demo-group");
        transport.fail_next(1);
        assert!(transport.fetch_config(&key).await.unwrap_err().is_transport());
        assert_eq!(transport.fetch_config(&key).await.unwrap(), None);
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_ephemeral_keeps_persistent_instances() {
        let transport = MemoryTransport::new();
        let service = ServiceKey::new("svc", DEFAULT_GROUP);
        transport
            .register_instance(&service, &Instance::new("10.0.0.1", 80))
            .await
            .unwrap();
        transport
            .register_instance(&service, &Instance::new("10.0.0.2", 80).ephemeral(false))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(transport.expire_ephemeral(Duration::from_secs(15)), 1);
        assert_eq!(transport.instance_count(&service), 1);
    }
}
