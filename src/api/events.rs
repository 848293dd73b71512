use crate::api::config::ConfigKey;
use crate::api::naming::{Instance, ServiceKey};
use std::fmt;

/// Error type returned by listener callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// What a listener subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Service(ServiceKey),
    Config(ConfigKey),
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Service(key) => write!(f, "service:{}", key),
            SubscriptionKey::Config(key) => write!(f, "config:{}", key),
        }
    }
}

/// Instances added, removed and modified by one change, compared by
/// (cluster, ip, port).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstancesDiff {
    pub added: Vec<Instance>,
    pub removed: Vec<Instance>,
    pub modified: Vec<Instance>,
}

impl InstancesDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// A change delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    InstancesChanged {
        service_name: String,
        group: String,
        version: u64,
        /// Full membership after the change.
        instances: Vec<Instance>,
        diff: InstancesDiff,
    },
    ConfigChanged {
        data_id: String,
        group: String,
        /// `None` once the config was removed.
        content: Option<String>,
        fingerprint: Option<String>,
    },
}

impl ChangeEvent {
    pub fn key(&self) -> SubscriptionKey {
        match self {
            ChangeEvent::InstancesChanged {
                service_name,
                group,
                ..
            } => SubscriptionKey::Service(ServiceKey::new(service_name.clone(), group.clone())),
            ChangeEvent::ConfigChanged { data_id, group, .. } => {
                SubscriptionKey::Config(ConfigKey::new(data_id.clone(), group.clone()))
            }
        }
    }
}

/// Receives changes of the keys it is subscribed to.
///
/// Calls for one subscription never overlap and arrive in change order.
/// A returned error is logged and does not affect other listeners or
/// later deliveries.
pub trait Listener: Send + Sync + 'static {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

impl<F> Listener for F
where
    F: Fn(&ChangeEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        (self)(event)
    }
}
