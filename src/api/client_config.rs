use crate::api::constants::*;
use crate::api::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client settings.
///
/// Built with chained setters, or deserialized from JSON where every
/// missing field falls back to its default:
///
/// ```
/// let config: nacos_client_core::ClientConfig =
///     serde_json::from_str(r#"{"namespace": "cs-test", "refreshIntervalMs": 5000}"#).unwrap();
/// assert_eq!(config.namespace, "cs-test");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Address of the control plane, handed to transports.
    pub server_addr: String,
    /// Namespace/Tenant
    pub namespace: String,
    pub app_name: Option<String>,
    /// Ip this client reports for itself, defaults to the first local address.
    /// Instances registered with a blank ip are registered on it.
    pub client_ip: String,
    /// Period of the background refresh of tracked keys.
    pub refresh_interval_ms: u64,
    /// First retry delay after a failed refresh.
    pub base_delay_ms: u64,
    /// Upper bound of the retry delay.
    pub max_delay_ms: u64,
    /// Random spread applied to delays and refresh periods, in `[0, 1]`.
    pub jitter_fraction: f64,
    pub heartbeat_interval_ms: u64,
    /// How long reads wait for the control plane on a cold key.
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            app_name: None,
            client_ip: local_ipaddress::get().unwrap_or_else(|| "127.0.0.1".to_string()),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }

    pub fn server_addr(mut self, server_addr: impl Into<String>) -> Self {
        self.server_addr = server_addr.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = client_ip.into();
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Retry delays: `base × 2^attempt`, capped at `max`.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn jitter_fraction(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(Error::InvalidArgument(format!(
                "jitterFraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        if self.refresh_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "refresh and heartbeat intervals must be positive".to_string(),
            ));
        }
        if self.base_delay_ms == 0 || self.base_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidArgument(format!(
                "backoff requires 0 < baseDelayMs <= maxDelayMs, got {} and {}",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    pub(crate) fn refresh_interval_duration(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub(crate) fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub(crate) fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub(crate) fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
