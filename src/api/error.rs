use thiserror::Error;

/// Errors surfaced by the client.
///
/// Transport failures met while refreshing caches in the background are
/// retried internally and only reach callers when no cached value exists.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("transport error: {cause}")]
    Transport { cause: String },

    #[error("no healthy instance for service {group}@@{service_name}")]
    NoHealthyInstance { service_name: String, group: String },

    #[error("config {data_id}+{group} not available within {timeout_ms}ms")]
    ConfigTimeout {
        data_id: String,
        group: String,
        timeout_ms: u64,
    },

    #[error("config {data_id}+{group} does not exist")]
    ConfigNotFound { data_id: String, group: String },

    #[error("failed to register instance of {service_name}: {cause}")]
    RegistrationFailed { service_name: String, cause: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("client is shut down")]
    ClientShutdown,
}

impl Error {
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Error::Transport {
            cause: cause.to_string(),
        }
    }

    /// Whether the error came from the remote side being unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
