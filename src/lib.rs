//! # A3S Config Service
//!
//! Remote configuration distribution for the A3S ecosystem: a hosting-side
//! service that watches configuration resources and publishes change
//! notifications, and a client that merges local and remote configuration
//! into one live key/value view.
//!
//! ## Architecture
//!
//! ```text
//! Provider → Distribution (hash gate) → Publisher ─┐
//!    │                                             │ Redis / RabbitMQ / in-memory
//!    └── Fetch endpoint ◄── RemoteConfiguration ◄──┘
//! ```
//!
//! ## Core Features
//!
//! - **Hash-gated publishing**: SHA-256 content hashes suppress no-op notifications
//! - **Pluggable transports**: Redis pub/sub, RabbitMQ fanout exchange, in-process broker
//! - **Layered client view**: local files then remote resources, later layers win
//! - **Live reload**: only the notified resource is re-fetched; failed reloads keep the last good view
//! - **Parsers**: JSON and INI flattened to `:`-delimited keys, extensible through a registry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_config_service::{ParserRegistry, RemoteConfiguration};
//! use a3s_config_service::config::RemoteClientSettings;
//!
//! #[tokio::main]
//! async fn main() -> a3s_config_service::Result<()> {
//!     let settings = RemoteClientSettings::from_file("client.hcl").await?;
//!     let config = RemoteConfiguration::connect(settings, ParserRegistry::default()).await?;
//!     println!("{:?}", config.get("Logging:LogLevel:Default"));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod distribution;
pub mod entrypoint;
pub mod error;
pub mod hash;
pub mod parser;
pub mod provider;
pub mod server;
pub mod transport;

// Re-export main types
pub use client::RemoteConfiguration;
pub use distribution::ConfigurationDistributionService;
pub use error::{ConfigServiceError, Result};
pub use parser::{ConfigMap, ConfigurationParser, ParserRegistry};
pub use server::ConfigServer;

use serde::{Deserialize, Serialize};

/// Hosting service runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Created but not yet started
    #[default]
    Created,
    /// Distributing initial configuration and binding the endpoint
    Starting,
    /// Watching, publishing and serving
    Running,
    /// Draining in-flight publishes
    Stopping,
    /// Fully stopped
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
