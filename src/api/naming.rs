use crate::api::constants::*;
use crate::api::error::Result;
use crate::api::events::Listener;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Key of a service view: (serviceName, group).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service_name: String,
    pub group: String,
}

impl ServiceKey {
    pub fn new(service_name: impl Into<String>, group: impl Into<String>) -> Self {
        ServiceKey {
            service_name: service_name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.group, SERVICE_INFO_SPLITER, self.service_name)
    }
}

/// Identity of an instance inside one service view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub cluster_name: String,
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.ip, self.port, self.cluster_name)
    }
}

/// A service instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: Option<String>,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    /// Ephemeral instances expire at the server without heartbeat.
    pub ephemeral: bool,
    pub cluster_name: String,
    pub service_name: String,
    pub metadata: HashMap<String, String>,
}

impl Default for Instance {
    fn default() -> Self {
        Instance {
            instance_id: None,
            ip: String::new(),
            port: 0,
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            service_name: String::new(),
            metadata: HashMap::new(),
        }
    }
}

impl Instance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Instance {
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            cluster_name: self.cluster_name.clone(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }

    /// Whether the instance may receive traffic.
    pub fn is_available(&self) -> bool {
        self.healthy && self.enabled
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Last-known membership of a service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceView {
    pub service_name: String,
    pub group: String,
    /// Strictly increases on any membership or health change.
    pub version: u64,
    pub instances: Vec<Instance>,
}

impl ServiceView {
    pub fn empty(key: &ServiceKey) -> Self {
        ServiceView {
            service_name: key.service_name.clone(),
            group: key.group.clone(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.service_name.clone(), self.group.clone())
    }

    /// Instances of the given clusters; all instances when `clusters` is empty.
    pub fn in_clusters(&self, clusters: &[String]) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|i| clusters.is_empty() || clusters.contains(&i.cluster_name))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
pub trait NamingService {
    /// Register an instance with the server. The local view only changes
    /// once the server confirms through push or poll.
    async fn register_instance(
        &self,
        service_name: &str,
        group: &str,
        instance: Instance,
    ) -> Result<()>;

    /// Deregister an instance. Deregistering an unknown instance succeeds.
    async fn deregister_instance(
        &self,
        service_name: &str,
        group: &str,
        ip: &str,
        port: u16,
        cluster_name: &str,
    ) -> Result<()>;

    /// All instances of a service. With `subscribe` the service is kept
    /// fresh in the background and later reads are served locally.
    async fn get_all_instances(
        &self,
        service_name: &str,
        group: &str,
        subscribe: bool,
    ) -> Result<Vec<Instance>>;

    /// Instances of the given clusters, only available ones when `healthy`.
    async fn select_instances(
        &self,
        service_name: &str,
        group: &str,
        clusters: &[String],
        healthy: bool,
        subscribe: bool,
    ) -> Result<Vec<Instance>>;

    /// One healthy and enabled instance, picked at random by weight.
    async fn select_one_healthy_instance(&self, service_name: &str, group: &str)
        -> Result<Instance>;

    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        listener: Arc<dyn Listener>,
    ) -> Result<()>;

    async fn unsubscribe(
        &self,
        service_name: &str,
        group: &str,
        listener: &Arc<dyn Listener>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key_display() {
        assert_eq!(
            ServiceKey::new("demo-svc1", DEFAULT_GROUP).to_string(),
            "DEFAULT_GROUP@@demo-svc1"
        );
    }

    #[test]
    fn test_instance_deserialize_camel_case() {
        let instance: Instance = serde_json::from_str(
            r#"{"ip":"127.0.0.1","port":9999,"weight":100,"clusterName":"DEFAULT","metadata":{"m1":"v1"}}"#,
        )
        .unwrap();
        assert_eq!(instance.address(), "127.0.0.1:9999");
        assert_eq!(instance.weight, 100.0);
        assert!(instance.healthy && instance.enabled && instance.ephemeral);
        assert_eq!(instance.metadata.get("m1").map(String::as_str), Some("v1"));
    }

    #[test]
    fn test_view_cluster_filter() {
        let view = ServiceView {
            service_name: "svc".into(),
            group: DEFAULT_GROUP.into(),
            version: 1,
            instances: vec![
                Instance::new("10.0.0.1", 80),
                Instance::new("10.0.0.2", 80).cluster("EDGE"),
            ],
        };
        assert_eq!(view.in_clusters(&[]).len(), 2);
        let edge = view.in_clusters(&["EDGE".to_string()]);
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].ip, "10.0.0.2");
    }
}
