pub mod client_config;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod naming;

use crate::client::NacosClient;
use crate::common::transport::{PushReceiver, Transport};
use std::sync::Arc;

/// Builds a [`NacosClient`] from its collaborators.
pub struct ClientBuilder {
    client_config: client_config::ClientConfig,
    transport: Arc<dyn Transport>,
    push: Option<PushReceiver>,
}

impl ClientBuilder {
    pub fn new(client_config: client_config::ClientConfig, transport: Arc<dyn Transport>) -> Self {
        ClientBuilder {
            client_config,
            transport,
            push: None,
        }
    }

    /// Server push channel. Without one the client relies on polling.
    pub fn push_channel(mut self, push: PushReceiver) -> Self {
        self.push = Some(push);
        self
    }

    /// Builds a new [`NacosClient`] and starts its background tasks on the
    /// current tokio runtime.
    pub async fn build(self) -> error::Result<NacosClient> {
        self.client_config.validate()?;
        Ok(NacosClient::start(
            self.client_config,
            self.transport,
            self.push,
        ))
    }
}
