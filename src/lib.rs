//! A client-side service registry and dynamic configuration core for
//! Nacos-style control planes.
//!
//! The client keeps a local, eventually-consistent view of remote service
//! instances and configuration values. Views are refreshed by server push
//! and by periodic polling, and every change fans out to subscribed
//! listeners exactly once.
//!
//! ```text
//! NacosClient (facade)
//!   ├── NamingService ── InstanceRegistry ─┐
//!   ├── ConfigService ── ConfigCache ──────┼── event bus ── SubscriptionManager ── listeners
//!   ├── RefreshScheduler (per key family) ─┘
//!   └── Transport (consumed) + push channel
//! ```
//!
//! The wire transport is not part of this crate; implement
//! [`common::transport::Transport`] for your protocol, or use
//! [`common::memory::MemoryTransport`] to run without a server.

pub mod api;
mod client;
pub mod common;
#[cfg(feature = "config")]
mod config;
#[cfg(feature = "naming")]
mod naming;

pub use api::client_config::ClientConfig;
pub use api::error::{Error, Result};
pub use api::events::{ChangeEvent, InstancesDiff, Listener, ListenerError, SubscriptionKey};
pub use api::ClientBuilder;
pub use client::NacosClient;
