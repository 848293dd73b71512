//! Heartbeats for ephemeral instances registered by this client.
//!
//! The server expires ephemeral instances that stop beating. When a beat is
//! answered with "unknown instance" (the server expired it, or restarted),
//! the instance is registered again, unless it was deregistered meanwhile.

use crate::api::naming::{Instance, InstanceKey, ServiceKey};
use crate::common::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct BeatReactor {
    transport: Arc<dyn Transport>,
    interval: Duration,
    beats: Mutex<HashMap<(ServiceKey, InstanceKey), Instance>>,
    /// Held across a re-register, and by `remove` so a deregistration
    /// never lands before it.
    redo: tokio::sync::Mutex<()>,
}

impl BeatReactor {
    pub(crate) fn new(transport: Arc<dyn Transport>, interval: Duration) -> Self {
        BeatReactor {
            transport,
            interval,
            beats: Mutex::new(HashMap::new()),
            redo: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn add(&self, service: &ServiceKey, instance: Instance) {
        debug!(service = %service, instance = %instance.key(), "heartbeat added");
        self.lock_beats()
            .insert((service.clone(), instance.key()), instance);
    }

    /// Stop beating an instance. Waits for a re-register in flight.
    pub(crate) async fn remove(&self, service: &ServiceKey, instance: &InstanceKey) {
        let _redo = self.redo.lock().await;
        if self
            .lock_beats()
            .remove(&(service.clone(), instance.clone()))
            .is_some()
        {
            debug!(service = %service, %instance, "heartbeat removed");
        }
    }

    /// Beat every instance once, returns how many were registered again.
    pub(crate) async fn beat_once(&self) -> usize {
        let beats: Vec<(ServiceKey, Instance)> = self
            .lock_beats()
            .iter()
            .map(|((service, _), instance)| (service.clone(), instance.clone()))
            .collect();
        let mut redone = 0;
        for (service, instance) in beats {
            match self.transport.send_heartbeat(&service, &instance).await {
                Ok(true) => {}
                Ok(false) => {
                    let _redo = self.redo.lock().await;
                    let key = (service.clone(), instance.key());
                    if !self.lock_beats().contains_key(&key) {
                        debug!(service = %service, instance = %key.1, "instance deregistered meanwhile, not registering again");
                        continue;
                    }
                    info!(service = %service, instance = %key.1, "instance unknown to server, registering again");
                    match self.transport.register_instance(&service, &instance).await {
                        Ok(()) => redone += 1,
                        Err(e) => warn!(service = %service, error = %e, "re-register failed"),
                    }
                }
                Err(e) => warn!(service = %service, instance = %instance.key(), error = %e, "heartbeat failed"),
            }
        }
        redone
    }

    pub(crate) fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reactor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(reactor.interval) => {
                        reactor.beat_once().await;
                    }
                }
            }
            debug!("heartbeat loop stopped");
        })
    }

    fn lock_beats(&self) -> MutexGuard<'_, HashMap<(ServiceKey, InstanceKey), Instance>> {
        self.beats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::constants::DEFAULT_GROUP;
    use crate::common::memory::MemoryTransport;

    #[tokio::test(start_paused = true)]
    async fn test_expired_instance_registers_again() {
        let transport = Arc::new(MemoryTransport::new());
        let service = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        let instance = Instance::new("127.0.0.1", 9999);
        transport.register_instance(&service, &instance).await.unwrap();

        let reactor = BeatReactor::new(transport.clone(), Duration::from_secs(5));
        reactor.add(&service, instance.clone());
        assert_eq!(reactor.beat_once().await, 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(transport.expire_ephemeral(Duration::from_secs(15)), 1);
        assert_eq!(transport.instance_count(&service), 0);

        assert_eq!(reactor.beat_once().await, 1);
        assert_eq!(transport.instance_count(&service), 1);

        reactor.remove(&service, &instance.key()).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        transport.expire_ephemeral(Duration::from_secs(15));
        assert_eq!(reactor.beat_once().await, 0);
        assert_eq!(transport.instance_count(&service), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregistered_instance_is_not_registered_again() {
        let transport = Arc::new(MemoryTransport::new());
        let service = ServiceKey::new("demo-svc1", DEFAULT_GROUP);
        let instance = Instance::new("127.0.0.1", 9999);
        let reactor = Arc::new(BeatReactor::new(transport.clone(), Duration::from_secs(5)));
        reactor.add(&service, instance.clone());
        // the server never saw it, and answers the beat late
        transport.set_heartbeat_lag(Duration::from_millis(100));

        let beat = tokio::spawn({
            let reactor = reactor.clone();
            async move { reactor.beat_once().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        reactor.remove(&service, &instance.key()).await;
        transport
            .deregister_instance(&service, &instance.key())
            .await
            .unwrap();

        assert_eq!(beat.await.unwrap(), 0);
        assert_eq!(transport.instance_count(&service), 0);
    }
}
