pub(crate) mod backoff;
pub mod memory;
pub(crate) mod scheduler;
pub(crate) mod subscription;
pub mod transport;
