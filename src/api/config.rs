use crate::api::constants::CONFIG_KEY_SPLITER;
use crate::api::error::{Error, Result};
use crate::api::events::Listener;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Key of a config entry: (dataId, group).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub data_id: String,
    pub group: String,
}

impl ConfigKey {
    pub fn new(data_id: impl Into<String>, group: impl Into<String>) -> Self {
        ConfigKey {
            data_id: data_id.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.data_id, CONFIG_KEY_SPLITER, self.group)
    }
}

/// Fingerprint of config content, the lower-case hex md5.
pub fn fingerprint(content: &str) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Config content as held by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub content: String,
    /// md5 of the content
    pub fingerprint: String,
    /// Server-side modification marker, never decreases for one key.
    pub last_modified: i64,
}

impl ConfigSnapshot {
    pub fn new(content: impl Into<String>, last_modified: i64) -> Self {
        let content = content.into();
        ConfigSnapshot {
            fingerprint: fingerprint(&content),
            content,
            last_modified,
        }
    }
}

#[async_trait::async_trait]
pub trait ConfigService {
    /// Get config, return the content.
    ///
    /// Served from the local cache when present; otherwise waits up to
    /// `timeout_ms` for the server.
    async fn get_config(&self, data_id: &str, group: &str, timeout_ms: u64) -> Result<String>;

    /// Publish config, return whether the server accepted it.
    async fn publish_config(&self, data_id: &str, group: &str, content: &str) -> Result<bool>;

    /// Remove config, return whether the server accepted it.
    async fn remove_config(&self, data_id: &str, group: &str) -> Result<bool>;

    /// Add listener of config change.
    async fn add_listener(
        &self,
        data_id: &str,
        group: &str,
        listener: Arc<dyn Listener>,
    ) -> Result<()>;

    /// Remove listener of config change.
    async fn remove_listener(
        &self,
        data_id: &str,
        group: &str,
        listener: &Arc<dyn Listener>,
    ) -> Result<()>;
}

/// A config value handed to stream consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigResponse {
    /// Namespace/Tenant
    namespace: String,
    /// DataId
    data_id: String,
    /// Group
    group: String,
    /// Content, empty once the config was removed
    content: String,
}

impl ConfigResponse {
    pub(crate) fn new(namespace: String, data_id: String, group: String, content: String) -> Self {
        ConfigResponse {
            namespace,
            data_id,
            group,
            content,
        }
    }

    pub fn get_namespace(&self) -> &String {
        &self.namespace
    }
    pub fn get_data_id(&self) -> &String {
        &self.data_id
    }
    pub fn get_group(&self) -> &String {
        &self.group
    }
    pub fn get_content(&self) -> &String {
        &self.content
    }

    /// Bind the JSON content to a typed options struct.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.content).map_err(|e| {
            Error::InvalidArgument(format!(
                "config {}+{} is not valid json: {}",
                self.data_id, self.group, e
            ))
        })
    }
}
