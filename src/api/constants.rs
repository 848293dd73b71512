pub const DEFAULT_NAMESPACE: &str = "public";

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

pub const DEFAULT_CLUSTER_NAME: &str = "DEFAULT";

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8848";

/// Separator of the grouped service name, `group@@service`.
pub const SERVICE_INFO_SPLITER: &str = "@@";

/// Separator of the config group key, `dataId+group`.
pub const CONFIG_KEY_SPLITER: &str = "+";

pub(crate) const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
pub(crate) const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub(crate) const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub(crate) const DEFAULT_JITTER_FRACTION: f64 = 0.2;
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3_000;
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
