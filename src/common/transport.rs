//! The port to the remote control plane.
//!
//! Requests go through [`Transport`]; unsolicited server pushes arrive on
//! a [`PushReceiver`] handed to the client builder.

use crate::api::config::{ConfigKey, ConfigSnapshot};
use crate::api::error::Result;
use crate::api::naming::{Instance, InstanceKey, ServiceKey, ServiceView};
use tokio::sync::mpsc;

/// Requests against the control plane. Failures are reported as
/// [`crate::Error::Transport`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current membership of a service. Unknown services yield an empty view.
    async fn fetch_instances(&self, service: &ServiceKey) -> Result<ServiceView>;

    /// Current config content, `None` when the server has no such config.
    async fn fetch_config(&self, key: &ConfigKey) -> Result<Option<ConfigSnapshot>>;

    async fn register_instance(&self, service: &ServiceKey, instance: &Instance) -> Result<()>;

    async fn deregister_instance(&self, service: &ServiceKey, instance: &InstanceKey) -> Result<()>;

    async fn publish_config(&self, key: &ConfigKey, content: &str) -> Result<bool>;

    async fn remove_config(&self, key: &ConfigKey) -> Result<bool>;

    /// Keep an ephemeral instance alive. `Ok(false)` means the server no
    /// longer knows the instance.
    async fn send_heartbeat(&self, service: &ServiceKey, instance: &Instance) -> Result<bool>;
}

/// Unsolicited notifications from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    /// New membership of a service.
    Instances { view: ServiceView },
    /// New config content, `None` once removed.
    Config {
        key: ConfigKey,
        snapshot: Option<ConfigSnapshot>,
    },
    /// The config changed; the content must be fetched.
    ConfigNotify { key: ConfigKey },
}

pub type PushSender = mpsc::UnboundedSender<PushEvent>;

pub type PushReceiver = mpsc::UnboundedReceiver<PushEvent>;
