use crate::api::error::Result;
use crate::api::naming::ServiceKey;
use crate::common::scheduler::RefreshSource;
use crate::common::transport::Transport;
use crate::naming::registry::InstanceRegistry;
use std::sync::Arc;

/// Pulls service membership from the server into the registry.
pub(crate) struct NamingWorker {
    transport: Arc<dyn Transport>,
    registry: Arc<InstanceRegistry>,
}

impl NamingWorker {
    pub(crate) fn new(transport: Arc<dyn Transport>, registry: Arc<InstanceRegistry>) -> Self {
        NamingWorker {
            transport,
            registry,
        }
    }
}

#[async_trait::async_trait]
impl RefreshSource for NamingWorker {
    type Key = ServiceKey;

    async fn refresh(&self, key: &ServiceKey) -> Result<bool> {
        let view = self.transport.fetch_instances(key).await?;
        Ok(self.registry.upsert(key, view.instances, view.version))
    }
}
