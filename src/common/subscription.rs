//! Listener table and change delivery.
//!
//! Caches publish [`ChangeEvent`]s on an event bus. A router task drains
//! the bus and hands every event to the queue of each current listener of
//! its key. Every (key, listener) pair owns a delivery task that invokes
//! the callback on the blocking pool, one event at a time and in order.
//! A listener subscribed again while its previous delivery task still
//! drains starts only after that task finished.
//! No lock is held while a callback runs.

use crate::api::events::{ChangeEvent, Listener, SubscriptionKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type EventSender = mpsc::UnboundedSender<ChangeEvent>;

pub(crate) type EventReceiver = mpsc::UnboundedReceiver<ChangeEvent>;

/// Listeners are identified by their allocation.
fn listener_id(listener: &Arc<dyn Listener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

struct Subscriber {
    id: usize,
    queue: mpsc::UnboundedSender<ChangeEvent>,
}

type Deliveries = HashMap<(SubscriptionKey, usize), JoinHandle<()>>;

#[derive(Default)]
pub(crate) struct SubscriptionManager {
    table: Mutex<HashMap<SubscriptionKey, Vec<Subscriber>>>,
    /// Latest delivery task per (key, listener).
    deliveries: Mutex<Deliveries>,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        SubscriptionManager::default()
    }

    /// Returns false when the listener already listens to `key`.
    pub(crate) fn subscribe(&self, key: SubscriptionKey, listener: Arc<dyn Listener>) -> bool {
        let id = listener_id(&listener);
        let mut table = self.lock_table();
        let subscribers = table.entry(key.clone()).or_default();
        if subscribers.iter().any(|s| s.id == id) {
            debug!(%key, "listener already subscribed");
            return false;
        }
        let (queue, rx) = mpsc::unbounded_channel();
        subscribers.push(Subscriber { id, queue });

        // taken while the table is locked, so a concurrent resubscribe
        // cannot slip in between
        let mut deliveries = self.lock_deliveries();
        deliveries.retain(|_, d| !d.is_finished());
        let previous = deliveries.remove(&(key.clone(), id));
        let delivery = tokio::spawn(deliver(key.clone(), listener, rx, previous));
        deliveries.insert((key.clone(), id), delivery);
        drop(deliveries);
        drop(table);
        debug!(%key, "listener subscribed");
        true
    }

    /// Events routed after this returns are not delivered to the listener.
    /// Events already queued for it are still delivered.
    pub(crate) fn unsubscribe(&self, key: &SubscriptionKey, listener: &Arc<dyn Listener>) -> bool {
        let id = listener_id(listener);
        let mut table = self.lock_table();
        let Some(subscribers) = table.get_mut(key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() < before;
        if subscribers.is_empty() {
            table.remove(key);
        }
        if removed {
            debug!(%key, "listener unsubscribed");
        }
        removed
    }

    pub(crate) fn has_listeners(&self, key: &SubscriptionKey) -> bool {
        self.lock_table().contains_key(key)
    }

    /// Queue `event` for every current listener of `key`, returns how many.
    pub(crate) fn notify(&self, key: &SubscriptionKey, event: &ChangeEvent) -> usize {
        let table = self.lock_table();
        let Some(subscribers) = table.get(key) else {
            return 0;
        };
        subscribers
            .iter()
            .filter(|s| s.queue.send(event.clone()).is_ok())
            .count()
    }

    /// Route events from the bus until `stop` fires, then route what is
    /// still buffered.
    pub(crate) fn spawn_router(
        self: &Arc<Self>,
        mut events: EventReceiver,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            manager.route(event);
                        }
                        None => return,
                    },
                    _ = stop.changed() => break,
                }
            }
            events.close();
            while let Some(event) = events.recv().await {
                manager.route(event);
            }
        })
    }

    fn route(&self, event: ChangeEvent) {
        let key = event.key();
        let delivered = self.notify(&key, &event);
        debug!(%key, listeners = delivered, "change routed");
    }

    /// Drop every subscription and wait up to `timeout` for queued
    /// deliveries to finish.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        self.lock_table().clear();
        let deliveries: Vec<JoinHandle<()>> = self.lock_deliveries().drain().map(|(_, d)| d).collect();
        let pending = deliveries.len();
        if tokio::time::timeout(timeout, futures::future::join_all(deliveries))
            .await
            .is_err()
        {
            warn!(pending, "listener deliveries still running at shutdown");
        } else {
            info!(pending, "listener deliveries drained");
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Vec<Subscriber>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn deliver(
    key: SubscriptionKey,
    listener: Arc<dyn Listener>,
    mut queue: mpsc::UnboundedReceiver<ChangeEvent>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(%key, "previous delivery ended abnormally: {}", e);
        }
    }
    while let Some(event) = queue.recv().await {
        let listener = listener.clone();
        let outcome = tokio::task::spawn_blocking(move || listener.on_change(&event)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%key, error = %e, "listener failed to handle change"),
            Err(e) => error!(%key, "listener panicked: {}", e),
        }
    }
}
